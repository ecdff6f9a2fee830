use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Multipart field carrying the person photo. Required.
pub const USER_PHOTO_FIELD: &str = "userPhoto";
/// Multipart field carrying the garment photo. Optional.
pub const CLOTHING_PHOTO_FIELD: &str = "clothingPhoto";
/// Mime type assumed for an upload that did not declare one.
pub const DEFAULT_UPLOAD_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoUpload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: Option<String>,
}

impl PhotoUpload {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        self.file_name = if file_name.trim().is_empty() {
            None
        } else {
            Some(file_name)
        };
        self
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = mime_for_path(path).unwrap_or_default();
        let upload = Self::new(bytes, mime);
        Ok(match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => upload.with_file_name(name),
            None => upload,
        })
    }

    /// Mime type sent to a backend: the declared one, or [`DEFAULT_UPLOAD_MIME`].
    pub fn effective_mime(&self) -> &str {
        let declared = self.mime_type.trim();
        if declared.is_empty() {
            DEFAULT_UPLOAD_MIME
        } else {
            declared
        }
    }

    pub fn declares_image(&self) -> bool {
        self.mime_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("image/")
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One try-on submission. Lives only for the duration of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryOnRequest {
    pub user_photo: PhotoUpload,
    pub clothing_photo: Option<PhotoUpload>,
}

impl TryOnRequest {
    pub fn new(user_photo: PhotoUpload) -> Self {
        Self {
            user_photo,
            clothing_photo: None,
        }
    }

    pub fn with_clothing(mut self, clothing_photo: Option<PhotoUpload>) -> Self {
        self.clothing_photo = clothing_photo.filter(|photo| !photo.is_empty());
        self
    }

    /// Photos in the order backends expect them: person first, garment second.
    pub fn photos(&self) -> impl Iterator<Item = &PhotoUpload> {
        std::iter::once(&self.user_photo).chain(self.clothing_photo.as_ref())
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "avif" => Some("image/avif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}
