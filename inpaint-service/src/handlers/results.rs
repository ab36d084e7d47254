use crate::dtos::{InpaintResultListResponse, InpaintResultResponse, ResultListParams};
use crate::models::{content_type_for_key, BlobKind, InpaintResult};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

async fn find_result(state: &AppState, id: Uuid) -> Result<InpaintResult, AppError> {
    state
        .db
        .get_inpaint_result(id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Inpaint result not found: {}", id)))
}

/// `GET /inpaint/results`: newest first.
pub async fn list_results(
    State(state): State<AppState>,
    Query(params): Query<ResultListParams>,
) -> Result<Json<InpaintResultListResponse>, AppError> {
    let records = state
        .db
        .list_inpaint_results(params.effective_limit())
        .await?;

    let results: Vec<InpaintResultResponse> = records.into_iter().map(Into::into).collect();
    Ok(Json(InpaintResultListResponse {
        count: results.len(),
        results,
    }))
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InpaintResultResponse>, AppError> {
    let record = find_result(&state, id).await?;

    Ok(Json(record.into()))
}

/// Streams one of the stored images back with its content type.
pub async fn download_blob(
    State(state): State<AppState>,
    Path((id, kind)): Path<(Uuid, BlobKind)>,
) -> Result<impl IntoResponse, AppError> {
    let record = find_result(&state, id).await?;

    let key = record.blob_key(kind);
    let data = state.storage.download(key).await?;

    tracing::debug!(result_id = %id, storage_key = %key, size = data.len(), "Serving stored image");

    Ok(([(header::CONTENT_TYPE, content_type_for_key(key))], data))
}
