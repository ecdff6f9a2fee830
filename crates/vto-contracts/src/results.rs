use serde::{Deserialize, Serialize};

/// Outcome of one backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendResult {
    Success {
        mime_type: String,
        image_bytes: Vec<u8>,
    },
    Failure {
        message: String,
    },
}

impl BackendResult {
    pub fn success(mime_type: impl Into<String>, image_bytes: impl Into<Vec<u8>>) -> Self {
        Self::Success {
            mime_type: mime_type.into(),
            image_bytes: image_bytes.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }
}

/// The single JSON error shape the try-on endpoint emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Human-readable line combining `error` and `detail`.
    pub fn message(&self) -> String {
        match self.detail.as_deref().map(str::trim) {
            Some(detail) if !detail.is_empty() => format!("{}: {}", self.error, detail),
            _ => self.error.clone(),
        }
    }
}
