pub mod results;

pub use results::{InpaintResultListResponse, InpaintResultResponse, ResultListParams};
