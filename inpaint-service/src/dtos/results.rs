use crate::models::InpaintResult;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIST_LIMIT: i64 = 10;
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct InpaintResultResponse {
    pub id: String,
    pub iterations: i32,
    pub created_at: String,
    pub original_url: String,
    pub mask_url: String,
    pub result_url: String,
}

impl From<InpaintResult> for InpaintResultResponse {
    fn from(result: InpaintResult) -> Self {
        let base = format!("/inpaint/results/{}", result.id);
        Self {
            id: result.id.to_string(),
            iterations: result.iterations,
            created_at: result.created_utc.to_rfc3339(),
            original_url: format!("{}/original", base),
            mask_url: format!("{}/mask", base),
            result_url: format!("{}/result", base),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultListParams {
    pub limit: Option<i64>,
}

impl ResultListParams {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InpaintResultListResponse {
    pub results: Vec<InpaintResultResponse>,
    pub count: usize,
}
