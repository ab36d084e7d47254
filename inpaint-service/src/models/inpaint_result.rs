//! Persisted record of one inpainting request.

use crate::inference::Iterations;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored blobs are referenced by storage key; the row never changes after
/// insert.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InpaintResult {
    pub id: Uuid,
    pub original_image: String,
    pub mask_image: String,
    pub result_image: String,
    pub iterations: i32,
    pub created_utc: DateTime<Utc>,
}

impl InpaintResult {
    pub fn blob_key(&self, kind: BlobKind) -> &str {
        match kind {
            BlobKind::Original => &self.original_image,
            BlobKind::Mask => &self.mask_image,
            BlobKind::Result => &self.result_image,
        }
    }
}

/// Input for inserting a record. `iterations` is the count actually used for
/// inference.
#[derive(Debug, Clone)]
pub struct NewInpaintResult {
    pub id: Uuid,
    pub original_image: String,
    pub mask_image: String,
    pub result_image: String,
    pub iterations: Iterations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Original,
    Mask,
    Result,
}

impl BlobKind {
    fn prefix(self) -> &'static str {
        match self {
            BlobKind::Original => "inpaint/originals",
            BlobKind::Mask => "inpaint/masks",
            BlobKind::Result => "inpaint/results",
        }
    }

    /// `<prefix>/<id>.<ext>`, taking the extension from the uploaded file name.
    /// Results are always PNG.
    pub fn storage_key(self, id: Uuid, file_name: Option<&str>) -> String {
        let extension = match self {
            BlobKind::Result => "png".to_string(),
            _ => file_name
                .and_then(|name| std::path::Path::new(name).extension())
                .and_then(|ext| ext.to_str())
                .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "png".to_string()),
        };
        format!("{}/{}.{}", self.prefix(), id, extension)
    }
}

/// Content type for a stored blob, from its key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    match std::path::Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_use_upload_extension() {
        let id = Uuid::nil();
        assert_eq!(
            BlobKind::Original.storage_key(id, Some("holiday.JPG")),
            format!("inpaint/originals/{id}.jpg")
        );
        assert_eq!(
            BlobKind::Mask.storage_key(id, None),
            format!("inpaint/masks/{id}.png")
        );
        assert_eq!(
            BlobKind::Mask.storage_key(id, Some("mask.p/ng")),
            format!("inpaint/masks/{id}.png")
        );
        assert_eq!(
            BlobKind::Result.storage_key(id, Some("whatever.jpeg")),
            format!("inpaint/results/{id}.png")
        );
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for_key("inpaint/results/x.png"), "image/png");
        assert_eq!(content_type_for_key("inpaint/originals/x.JPEG"), "image/jpeg");
        assert_eq!(
            content_type_for_key("inpaint/masks/x"),
            "application/octet-stream"
        );
    }
}
