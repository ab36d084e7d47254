pub mod generator;
pub mod loader;
pub mod pipeline;

pub use generator::{Generator, GeneratorConfig, InpaintModel};
pub use loader::{load_generator, shared_generator, ModelLoadError};
pub use pipeline::{inpaint, InferenceError, InpaintOutput, Iterations, IMAGE_SIZE};
