use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use vto_contracts::ErrorBody;
use vto_engine::error_chain_text;

const DETAIL_MAX_CHARS: usize = 2000;

/// Every way a try-on request can fail. Each variant renders as JSON.
#[derive(Debug, Error)]
pub enum TryOnError {
    #[error("{0}")]
    MissingInput(String),
    #[error("{0}")]
    NoImageInResponse(String),
    #[error("upload exceeds the {limit_bytes} byte limit")]
    UploadTooLarge { limit_bytes: usize },
    #[error("Try-on failed: {detail}")]
    UnexpectedFault { detail: String },
}

impl TryOnError {
    pub fn missing_user_photo() -> Self {
        Self::MissingInput("userPhoto is required".to_string())
    }

    pub fn no_image(message: &str) -> Self {
        let message = message.trim();
        if message.is_empty() {
            Self::NoImageInResponse("No image.".to_string())
        } else {
            Self::NoImageInResponse(message.to_string())
        }
    }

    pub fn unexpected(err: &anyhow::Error) -> Self {
        Self::UnexpectedFault {
            detail: error_chain_text(err, DETAIL_MAX_CHARS),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingInput(_) => StatusCode::BAD_REQUEST,
            Self::NoImageInResponse(_) => StatusCode::BAD_GATEWAY,
            Self::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnexpectedFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            Self::MissingInput(message) | Self::NoImageInResponse(message) => {
                ErrorBody::new(message.clone())
            }
            Self::UploadTooLarge { .. } => ErrorBody::new(self.to_string()),
            Self::UnexpectedFault { detail } => {
                ErrorBody::new("Try-on failed").with_detail(detail.clone())
            }
        }
    }
}

impl IntoResponse for TryOnError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CACHE_CONTROL, "no-store")],
            Json(self.body()),
        )
            .into_response()
    }
}
