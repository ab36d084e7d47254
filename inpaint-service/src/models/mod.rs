pub mod inpaint_result;

pub use inpaint_result::{content_type_for_key, BlobKind, InpaintResult, NewInpaintResult};
