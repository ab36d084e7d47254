use crate::inference::pipeline::InvalidIterations;
use crate::inference::{self, Iterations};
use crate::models::{BlobKind, InpaintResult, NewInpaintResult};
use crate::services::metrics::{INFERENCE_DURATION, ITERATIONS, REQUESTS_TOTAL};
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use service_core::error::AppError;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

pub const RESULT_ID_HEADER: &str = "x-inpaint-result-id";
pub const ITERATIONS_HEADER: &str = "x-inpaint-iterations";

/// Failures of `POST /inpaint/`, rendered as plain text.
#[derive(Debug, Error)]
pub enum InpaintError {
    #[error("Both 'image' and 'mask' must be uploaded. Got: {0:?}")]
    MissingFiles(Vec<String>),

    #[error("{0}")]
    BadRequest(String),

    #[error("Server error: {0:#}")]
    Processing(anyhow::Error),
}

impl From<MultipartError> for InpaintError {
    fn from(err: MultipartError) -> Self {
        InpaintError::BadRequest(format!("Malformed multipart body: {}", err.body_text()))
    }
}

impl From<AppError> for InpaintError {
    fn from(err: AppError) -> Self {
        InpaintError::Processing(anyhow::Error::new(err))
    }
}

impl IntoResponse for InpaintError {
    fn into_response(self) -> Response {
        let (status, outcome) = match &self {
            InpaintError::MissingFiles(received) => {
                tracing::warn!(received = ?received, "Inpaint request missing image or mask");
                (StatusCode::BAD_REQUEST, "client_error")
            }
            InpaintError::BadRequest(message) => {
                tracing::warn!(%message, "Rejected inpaint request");
                (StatusCode::BAD_REQUEST, "client_error")
            }
            InpaintError::Processing(err) => {
                tracing::error!(error = ?err, "Inpainting failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        };
        metrics::counter!(REQUESTS_TOTAL, "outcome" => outcome).increment(1);

        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone)]
struct UploadedFile {
    file_name: Option<String>,
    data: Bytes,
}

#[derive(Debug)]
struct InpaintForm {
    image: Option<UploadedFile>,
    mask: Option<UploadedFile>,
    /// Checked only once both files are present.
    iterations: Result<Iterations, InvalidIterations>,
    /// Distinct file field names in arrival order, for the missing-file message.
    received: Vec<String>,
}

impl InpaintForm {
    fn new() -> Self {
        Self {
            image: None,
            mask: None,
            iterations: Ok(Iterations::default()),
            received: Vec::new(),
        }
    }

    fn note_file(&mut self, name: &str) {
        if !self.received.iter().any(|seen| seen == name) {
            self.received.push(name.to_string());
        }
    }
}

async fn read_form(multipart: &mut Multipart) -> Result<InpaintForm, InpaintError> {
    let mut form = InpaintForm::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(ToString::to_string);

        match name.as_str() {
            "iterations" if file_name.is_none() => {
                let raw = field.text().await?;
                form.iterations = Iterations::parse(&raw);
            }
            "image" | "mask" => {
                let upload = UploadedFile {
                    file_name,
                    data: field.bytes().await?,
                };
                form.note_file(&name);
                if name == "image" {
                    form.image = Some(upload);
                } else {
                    form.mask = Some(upload);
                }
            }
            _ => {
                if file_name.is_some() {
                    form.note_file(&name);
                }
                // Drain so the next field can be read.
                field.bytes().await?;
            }
        }
    }

    Ok(form)
}

/// Writes the three blobs and the record. Blobs already written are removed
/// again if a later step fails.
async fn persist(
    state: &AppState,
    image: &UploadedFile,
    mask: &UploadedFile,
    result_png: Vec<u8>,
    iterations: Iterations,
) -> Result<InpaintResult, AppError> {
    let id = Uuid::new_v4();
    let record = NewInpaintResult {
        id,
        original_image: BlobKind::Original.storage_key(id, image.file_name.as_deref()),
        mask_image: BlobKind::Mask.storage_key(id, mask.file_name.as_deref()),
        result_image: BlobKind::Result.storage_key(id, None),
        iterations,
    };

    let blobs = [
        (&record.original_image, image.data.to_vec()),
        (&record.mask_image, mask.data.to_vec()),
        (&record.result_image, result_png),
    ];

    let mut written: Vec<&String> = Vec::with_capacity(blobs.len());
    let mut outcome = Ok(());
    for (key, data) in blobs {
        if let Err(e) = state.storage.upload(key, data).await {
            tracing::error!(storage_key = %key, "Failed to store blob: {}", e);
            outcome = Err(e);
            break;
        }
        written.push(key);
    }

    let outcome = match outcome {
        Ok(()) => state.db.insert_inpaint_result(&record).await,
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        for key in written {
            if let Err(e) = state.storage.delete(key).await {
                tracing::warn!(storage_key = %key, "Failed to remove orphaned blob: {}", e);
            }
        }
    }

    outcome
}

/// `POST /inpaint/`: multipart `image`, `mask` and optional `iterations`.
/// Responds with the composited PNG.
pub async fn inpaint(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, InpaintError> {
    // A body that is not multipart carries no files at all.
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!(reason = %rejection.body_text(), "Request body is not multipart");
        InpaintError::MissingFiles(Vec::new())
    })?;
    let form = read_form(&mut multipart).await?;

    let (image, mask) = match (form.image, form.mask) {
        (Some(image), Some(mask)) => (image, mask),
        _ => return Err(InpaintError::MissingFiles(form.received)),
    };
    let iterations = form
        .iterations
        .map_err(|e| InpaintError::BadRequest(e.to_string()))?;

    tracing::info!(
        image_bytes = image.data.len(),
        mask_bytes = mask.data.len(),
        iterations = iterations.get(),
        "Inpaint request received"
    );

    let model = state.model.clone();
    let image_bytes = image.data.clone();
    let mask_bytes = mask.data.clone();
    let start = Instant::now();

    let output = tokio::task::spawn_blocking(move || {
        inference::inpaint(model.as_ref(), &image_bytes, &mask_bytes, iterations)
    })
    .await
    .map_err(|e| InpaintError::Processing(anyhow::anyhow!("Inference task failed: {}", e)))?
    .map_err(|e| InpaintError::Processing(e.into()))?;

    let elapsed = start.elapsed();
    metrics::histogram!(INFERENCE_DURATION).record(elapsed.as_secs_f64());
    metrics::histogram!(ITERATIONS).record(iterations.get() as f64);

    let record = persist(&state, &image, &mask, output.png.clone(), iterations).await?;

    tracing::info!(
        result_id = %record.id,
        iterations = iterations.get(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Inpainting completed"
    );
    metrics::counter!(REQUESTS_TOTAL, "outcome" => "success").increment(1);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::HeaderName::from_static(RESULT_ID_HEADER), record.id.to_string()),
            (
                header::HeaderName::from_static(ITERATIONS_HEADER),
                iterations.get().to_string(),
            ),
        ],
        output.png,
    )
        .into_response())
}

/// Any other method on the inpaint route.
pub async fn method_hint() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        "Use POST with 'image' and 'mask' files",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn missing_files_lists_received_fields() {
        let response = InpaintError::MissingFiles(vec!["image".to_string()]).into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            r#"Both 'image' and 'mask' must be uploaded. Got: ["image"]"#
        );
    }

    #[tokio::test]
    async fn processing_errors_expose_message_chain_only() {
        let err = anyhow::anyhow!("bad pixels").context("failed to decode image");
        let response = InpaintError::Processing(err).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(response).await,
            "Server error: failed to decode image: bad pixels"
        );
    }
}
