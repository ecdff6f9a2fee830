use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use uuid::Uuid;
use vto_contracts::photos::{CLOTHING_PHOTO_FIELD, USER_PHOTO_FIELD};
use vto_contracts::{BackendResult, ErrorBody, PhotoUpload, TryOnRequest};
use vto_engine::truncate_text;

use crate::{AppState, TryOnError};

/// 1x1 PNG served by the connectivity probe.
const TEST_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR4nGNgYAAAAAMAASsJTYQAAAAASUVORK5CYII=";

pub async fn try_on(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, TryOnError> {
    let started = Instant::now();
    let request_id = Uuid::new_v4();
    let backend_name = state.backend.name().to_string();

    let request = read_try_on_form(multipart, state.max_upload_bytes).await?;
    tracing::debug!(
        %request_id,
        backend = %backend_name,
        user_bytes = request.user_photo.bytes.len(),
        clothing = request.clothing_photo.is_some(),
        "try-on request validated"
    );

    let backend = Arc::clone(&state.backend);
    let outcome = tokio::task::spawn_blocking(move || backend.generate(&request)).await;
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            tracing::error!(%request_id, backend = %backend_name, "try-on failed: {err:#}");
            return Err(TryOnError::unexpected(&err));
        }
        Err(join_err) => {
            tracing::error!(%request_id, backend = %backend_name, "try-on task aborted: {join_err}");
            return Err(TryOnError::UnexpectedFault {
                detail: format!("backend task aborted: {join_err}"),
            });
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        BackendResult::Success {
            mime_type,
            image_bytes,
        } => {
            tracing::info!(
                %request_id,
                backend = %backend_name,
                bytes = image_bytes.len(),
                ms = elapsed_ms,
                "try-on ok"
            );
            image_response(&mime_type, image_bytes)
        }
        BackendResult::Failure { message } => {
            tracing::warn!(
                %request_id,
                backend = %backend_name,
                ms = elapsed_ms,
                "try-on returned no image: {}",
                truncate_text(&message, 200)
            );
            Err(TryOnError::no_image(&message))
        }
    }
}

pub async fn test_image() -> Result<Response, TryOnError> {
    let bytes = BASE64
        .decode(TEST_PNG_BASE64)
        .map_err(|err| TryOnError::UnexpectedFault {
            detail: format!("test image decode failed: {err}"),
        })?;
    image_response("image/png", bytes)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "backend": state.backend_name()}))
}

pub async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("Not found")))
}

pub async fn method_not_allowed() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(ErrorBody::new("Method not allowed")),
    )
}

fn image_response(mime_type: &str, bytes: Vec<u8>) -> Result<Response, TryOnError> {
    let content_type =
        HeaderValue::from_str(mime_type).map_err(|_| TryOnError::UnexpectedFault {
            detail: format!("backend reported an invalid content type: {mime_type:?}"),
        })?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        bytes,
    )
        .into_response())
}

/// A request that is not multipart cannot carry `userPhoto`, so it is
/// answered like any other request missing it. Only the first occurrence of
/// each field counts.
async fn read_try_on_form(
    multipart: Result<Multipart, MultipartRejection>,
    limit_bytes: usize,
) -> Result<TryOnRequest, TryOnError> {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!("rejecting non-multipart try-on request: {rejection}");
            return Err(TryOnError::missing_user_photo());
        }
    };

    let mut user_photo: Option<PhotoUpload> = None;
    let mut clothing_photo: Option<PhotoUpload> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, limit_bytes))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(USER_PHOTO_FIELD) if user_photo.is_none() => {
                user_photo = Some(read_photo(field, limit_bytes).await?);
            }
            Some(CLOTHING_PHOTO_FIELD) if clothing_photo.is_none() => {
                clothing_photo = Some(read_photo(field, limit_bytes).await?);
            }
            _ => {}
        }
    }

    let user_photo = user_photo
        .filter(|photo| !photo.is_empty())
        .ok_or_else(TryOnError::missing_user_photo)?;
    Ok(TryOnRequest::new(user_photo).with_clothing(clothing_photo))
}

async fn read_photo(field: Field<'_>, limit_bytes: usize) -> Result<PhotoUpload, TryOnError> {
    let mime_type = field.content_type().unwrap_or_default().to_string();
    let file_name = field.file_name().unwrap_or_default().to_string();
    let bytes = field
        .bytes()
        .await
        .map_err(|err| multipart_error(err, limit_bytes))?;
    Ok(PhotoUpload::new(bytes.to_vec(), mime_type).with_file_name(file_name))
}

fn multipart_error(err: MultipartError, limit_bytes: usize) -> TryOnError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return TryOnError::UploadTooLarge { limit_bytes };
    }
    TryOnError::UnexpectedFault {
        detail: format!("multipart read failed: {}", err.body_text()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use vto_contracts::{BackendResult, TryOnRequest};
    use vto_engine::{select_backend, BackendConfig, TryOnBackend};

    use crate::{router, AppState, TEST_IMAGE_ROUTE, TRY_ON_ROUTE};

    const BOUNDARY: &str = "vto-test-boundary";

    #[derive(Clone)]
    enum Behavior {
        Image(&'static str, Vec<u8>),
        Text(&'static str),
        Error(&'static str),
        Panic,
    }

    struct FakeBackend {
        behavior: Behavior,
        seen: Mutex<Vec<TryOnRequest>>,
    }

    impl TryOnBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn generate(&self, request: &TryOnRequest) -> anyhow::Result<BackendResult> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.clone());
            }
            match &self.behavior {
                Behavior::Image(mime, bytes) => Ok(BackendResult::success(*mime, bytes.clone())),
                Behavior::Text(message) => Ok(BackendResult::failure(*message)),
                Behavior::Error(message) => {
                    Err(anyhow::anyhow!(*message).context("Gemini request failed"))
                }
                Behavior::Panic => panic!("adapter exploded"),
            }
        }
    }

    fn app_with(behavior: Behavior) -> (Router, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend {
            behavior,
            seen: Mutex::new(Vec::new()),
        });
        let state = AppState::new(backend.clone());
        (router(state), backend)
    }

    struct FilePart<'a> {
        name: &'a str,
        file_name: &'a str,
        mime: &'a str,
        bytes: &'a [u8],
    }

    fn multipart_body(parts: &[FilePart<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    part.name, part.file_name, part.mime
                )
                .as_bytes(),
            );
            body.extend_from_slice(part.bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post_parts(parts: &[FilePart<'_>]) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri(TRY_ON_ROUTE)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))?)
    }

    fn user_photo(bytes: &[u8]) -> FilePart<'_> {
        FilePart {
            name: "userPhoto",
            file_name: "me.jpg",
            mime: "image/jpeg",
            bytes,
        }
    }

    fn clothing_photo(bytes: &[u8]) -> FilePart<'_> {
        FilePart {
            name: "clothingPhoto",
            file_name: "shirt.png",
            mime: "image/png",
            bytes,
        }
    }

    struct Captured {
        status: StatusCode,
        content_type: String,
        cache_control: String,
        body: Vec<u8>,
    }

    impl Captured {
        fn json(&self) -> anyhow::Result<Value> {
            Ok(serde_json::from_slice(&self.body)?)
        }
    }

    async fn send(app: Router, request: Request<Body>) -> anyhow::Result<Captured> {
        let response = app.oneshot(request).await?;
        let header_text = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let status = response.status();
        let content_type = header_text(header::CONTENT_TYPE);
        let cache_control = header_text(header::CACHE_CONTROL);
        let body = to_bytes(response.into_body(), usize::MAX).await?.to_vec();
        Ok(Captured {
            status,
            content_type,
            cache_control,
            body,
        })
    }

    #[tokio::test]
    async fn inline_png_round_trips_unchanged() -> anyhow::Result<()> {
        let png = vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3, 255];
        let (app, backend) = app_with(Behavior::Image("image/png", png.clone()));

        let captured = send(app, post_parts(&[user_photo(b"\xff\xd8\xffjpeg")])?).await?;
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(captured.content_type, "image/png");
        assert_eq!(captured.cache_control, "no-store");
        assert_eq!(captured.body, png);

        let seen = backend.seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user_photo.bytes, b"\xff\xd8\xffjpeg");
        assert_eq!(seen[0].user_photo.mime_type, "image/jpeg");
        assert_eq!(seen[0].user_photo.file_name.as_deref(), Some("me.jpg"));
        assert!(seen[0].clothing_photo.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reported_mime_type_is_passed_through() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Image("image/webp", b"webp".to_vec()));
        let captured = send(
            app,
            post_parts(&[user_photo(b"me"), clothing_photo(b"shirt")])?,
        )
        .await?;
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(captured.content_type, "image/webp");
        assert_eq!(captured.body, b"webp");
        Ok(())
    }

    #[tokio::test]
    async fn clothing_photo_reaches_backend() -> anyhow::Result<()> {
        let (app, backend) = app_with(Behavior::Image("image/png", b"ok".to_vec()));
        send(
            app,
            post_parts(&[clothing_photo(b"shirt"), user_photo(b"me")])?,
        )
        .await?;

        let seen = backend.seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        let clothing = seen[0].clothing_photo.clone();
        assert_eq!(clothing.map(|photo| photo.bytes), Some(b"shirt".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn missing_user_photo_is_a_400_with_error() -> anyhow::Result<()> {
        let (app, backend) = app_with(Behavior::Image("image/png", b"never".to_vec()));
        let captured = send(app, post_parts(&[clothing_photo(b"shirt")])?).await?;
        assert_eq!(captured.status, StatusCode::BAD_REQUEST);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.json()?, json!({"error": "userPhoto is required"}));
        assert!(backend.seen.lock().map(|seen| seen.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn empty_form_and_empty_user_photo_are_rejected() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Image("image/png", b"never".to_vec()));
        let captured = send(app.clone(), post_parts(&[])?).await?;
        assert_eq!(captured.status, StatusCode::BAD_REQUEST);

        let captured = send(app, post_parts(&[user_photo(b"")])?).await?;
        assert_eq!(captured.status, StatusCode::BAD_REQUEST);
        assert!(!captured.json()?["error"]
            .as_str()
            .unwrap_or_default()
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn non_multipart_request_is_a_json_400() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Image("image/png", b"never".to_vec()));
        let request = Request::builder()
            .method("POST")
            .uri(TRY_ON_ROUTE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"userPhoto": "nope"}"#))?;
        let captured = send(app, request).await?;
        assert_eq!(captured.status, StatusCode::BAD_REQUEST);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.json()?["error"], json!("userPhoto is required"));
        Ok(())
    }

    #[tokio::test]
    async fn text_only_backend_reply_is_a_502() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Text("blocked by safety filter"));
        let captured = send(app, post_parts(&[user_photo(b"me")])?).await?;
        assert_eq!(captured.status, StatusCode::BAD_GATEWAY);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.body, br#"{"error":"blocked by safety filter"}"#);
        Ok(())
    }

    #[tokio::test]
    async fn generic_fallback_is_a_502() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Text("No image in response (Gemini)."));
        let captured = send(app, post_parts(&[user_photo(b"me")])?).await?;
        assert_eq!(captured.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            captured.json()?,
            json!({"error": "No image in response (Gemini)."})
        );
        Ok(())
    }

    #[tokio::test]
    async fn backend_error_is_a_json_500_with_detail() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Error("connection refused"));
        let captured = send(app, post_parts(&[user_photo(b"me")])?).await?;
        assert_eq!(captured.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(captured.content_type, "application/json");
        let body = captured.json()?;
        assert_eq!(body["error"], json!("Try-on failed"));
        let detail = body["detail"].as_str().unwrap_or_default();
        assert!(detail.contains("Gemini request failed"));
        assert!(detail.contains("connection refused"));
        Ok(())
    }

    // The blocking HTTP client is built and dropped outside the runtime.
    #[test]
    fn network_fault_detail_never_carries_api_key() -> anyhow::Result<()> {
        let config = BackendConfig::from_lookup(|key| match key {
            "GEMINI_API_KEY" => Some("SECRET-KEY-123".to_string()),
            "GEMINI_API_BASE" => Some("http://127.0.0.1:1/v1beta".to_string()),
            _ => None,
        });
        let backend = select_backend(&config)?;
        let app = router(AppState::new(Arc::clone(&backend)));
        let runtime = tokio::runtime::Runtime::new()?;

        let captured = runtime.block_on(send(app, post_parts(&[user_photo(b"me")])?))?;
        drop(runtime);
        assert_eq!(captured.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = captured.json()?;
        assert_eq!(body["error"], json!("Try-on failed"));
        let detail = body["detail"].as_str().unwrap_or_default();
        assert!(detail.contains("Gemini request failed"));
        assert!(!detail.contains("SECRET-KEY-123"));
        Ok(())
    }

    #[tokio::test]
    async fn backend_panic_is_still_a_json_500() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Panic);
        let captured = send(app, post_parts(&[user_photo(b"me")])?).await?;
        assert_eq!(captured.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.json()?["error"], json!("Try-on failed"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_mime_from_backend_is_a_json_500() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Image("image/png\nx-evil: 1", b"img".to_vec()));
        let captured = send(app, post_parts(&[user_photo(b"me")])?).await?;
        assert_eq!(captured.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(captured.content_type, "application/json");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_upload_is_a_json_413() -> anyhow::Result<()> {
        let backend = Arc::new(FakeBackend {
            behavior: Behavior::Image("image/png", b"never".to_vec()),
            seen: Mutex::new(Vec::new()),
        });
        let app = router(AppState::new(backend).with_max_upload_bytes(64));
        let big = vec![7u8; 4096];
        let captured = send(app, post_parts(&[user_photo(&big)])?).await?;
        assert_eq!(captured.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(captured.content_type, "application/json");
        Ok(())
    }

    #[tokio::test]
    async fn test_route_serves_one_pixel_png() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Error("unused"));
        let request = Request::builder()
            .uri(TEST_IMAGE_ROUTE)
            .body(Body::empty())?;
        let captured = send(app, request).await?;
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(captured.content_type, "image/png");
        assert_eq!(captured.cache_control, "no-store");
        assert!(captured.body.starts_with(b"\x89PNG\r\n\x1a\n"));
        Ok(())
    }

    #[tokio::test]
    async fn health_and_unknown_routes_answer_json() -> anyhow::Result<()> {
        let (app, _) = app_with(Behavior::Error("unused"));
        let request = Request::builder().uri("/health").body(Body::empty())?;
        let captured = send(app.clone(), request).await?;
        assert_eq!(captured.json()?, json!({"status": "ok", "backend": "fake"}));

        let request = Request::builder().uri("/api/nope").body(Body::empty())?;
        let captured = send(app, request).await?;
        assert_eq!(captured.status, StatusCode::NOT_FOUND);
        assert_eq!(captured.content_type, "application/json");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_method_is_a_json_405() -> anyhow::Result<()> {
        let (app, backend) = app_with(Behavior::Image("image/png", b"never".to_vec()));
        let request = Request::builder().uri(TRY_ON_ROUTE).body(Body::empty())?;
        let captured = send(app.clone(), request).await?;
        assert_eq!(captured.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.json()?, json!({"error": "Method not allowed"}));

        let request = Request::builder()
            .method("DELETE")
            .uri(TEST_IMAGE_ROUTE)
            .body(Body::empty())?;
        let captured = send(app, request).await?;
        assert_eq!(captured.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(captured.content_type, "application/json");
        assert!(backend.seen.lock().map(|seen| seen.is_empty()).unwrap_or(false));
        Ok(())
    }
}
