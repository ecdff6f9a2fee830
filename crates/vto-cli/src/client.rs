//! Upload client: photo selection, submission to the try-on endpoint,
//! response dispatch, and result notifications to the embedding host.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use url::Url;
use vto_contracts::notify::{
    EmbeddingContext, MessageTarget, NotificationPayload, OriginPolicy, TargetOrigin,
};
use vto_contracts::photos::{CLOTHING_PHOTO_FIELD, USER_PHOTO_FIELD};
use vto_contracts::{ErrorBody, PhotoUpload, TryOnRequest};
use vto_engine::truncate_text;

pub const GENERATED_FILE_NAME: &str = "virtual-try-on.png";
pub const MISSING_PHOTO_MESSAGE: &str = "Please upload your photo";
pub const TEXT_INSTEAD_OF_IMAGE_MESSAGE: &str = "Model returned a text message instead of an image";
const UNEXPECTED_MARKUP_PREFIX: &str = "Unexpected HTML response (probably a wrong /api URL). ";
const BODY_PREVIEW_CHARS: usize = 300;
const PREVIEW_EDGE: u32 = 128;

const TRY_ON_PATH: &str = "api/virtual-try-on";
const TEST_IMAGE_PATH: &str = "api/virtual-try-on/test";

/// A photo the user picked, with its preview.
#[derive(Debug, Clone)]
pub struct SelectedImage {
    pub photo: PhotoUpload,
    pub preview_data_url: String,
}

impl SelectedImage {
    fn from_upload(photo: PhotoUpload) -> Self {
        let preview_data_url = preview_data_url(&photo);
        Self {
            photo,
            preview_data_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// What came back over the wire, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub trait TryOnTransport {
    fn submit(&self, request: &TryOnRequest) -> Result<RawResponse>;
    fn fetch_test_image(&self) -> Result<RawResponse>;
}

/// Transport for notification-only sessions; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

impl TryOnTransport for OfflineTransport {
    fn submit(&self, _request: &TryOnRequest) -> Result<RawResponse> {
        bail!("no try-on server configured")
    }

    fn fetch_test_image(&self) -> Result<RawResponse> {
        bail!("no try-on server configured")
    }
}

/// Multipart transport against a running try-on server.
pub struct HttpTransport {
    try_on_url: Url,
    test_image_url: Url,
    http: HttpClient,
}

impl HttpTransport {
    /// `timeout` of `None` waits as long as the backend takes.
    pub fn new(server: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut base = Url::parse(server.trim())
            .with_context(|| format!("invalid server URL '{}'", server.trim()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            try_on_url: base.join(TRY_ON_PATH)?,
            test_image_url: base.join(TEST_IMAGE_PATH)?,
            http,
        })
    }

    pub fn try_on_url(&self) -> &Url {
        &self.try_on_url
    }

    fn read_response(response: reqwest::blocking::Response) -> Result<RawResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .context("failed to read response body")?
            .to_vec();
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

impl TryOnTransport for HttpTransport {
    fn submit(&self, request: &TryOnRequest) -> Result<RawResponse> {
        let mut form = MultipartForm::new().part(USER_PHOTO_FIELD, photo_part(&request.user_photo)?);
        if let Some(clothing) = &request.clothing_photo {
            form = form.part(CLOTHING_PHOTO_FIELD, photo_part(clothing)?);
        }
        let response = self
            .http
            .post(self.try_on_url.clone())
            .multipart(form)
            .send()
            .with_context(|| format!("request to {} failed", self.try_on_url))?;
        Self::read_response(response)
    }

    fn fetch_test_image(&self) -> Result<RawResponse> {
        let response = self
            .http
            .get(self.test_image_url.clone())
            .send()
            .with_context(|| format!("request to {} failed", self.test_image_url))?;
        Self::read_response(response)
    }
}

fn photo_part(photo: &PhotoUpload) -> Result<MultipartPart> {
    let file_name = photo
        .file_name
        .clone()
        .unwrap_or_else(|| "upload".to_string());
    MultipartPart::bytes(photo.bytes.clone())
        .file_name(file_name)
        .mime_str(photo.effective_mime())
        .with_context(|| format!("invalid mime type '{}'", photo.effective_mime()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Image,
    Json,
    Markup,
}

pub fn response_shape(content_type: &str) -> ResponseShape {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.starts_with("image/") {
        ResponseShape::Image
    } else if essence == "application/json" || essence.ends_with("+json") {
        ResponseShape::Json
    } else {
        ResponseShape::Markup
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Image(GeneratedImage),
    Failure(String),
}

/// Turns a raw endpoint response into either a renderable image or one
/// user-facing error line.
pub fn classify_response(response: &RawResponse) -> ResponseOutcome {
    let shape = response_shape(&response.content_type);
    if !response.is_success() {
        return ResponseOutcome::Failure(failure_message(response, shape));
    }
    match shape {
        ResponseShape::Image => {
            let mime_type = response
                .content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            ResponseOutcome::Image(GeneratedImage {
                mime_type,
                bytes: response.body.clone(),
            })
        }
        ResponseShape::Json => {
            let parsed: Option<Value> = serde_json::from_slice(&response.body).ok();
            let message = parsed.as_ref().and_then(|value| {
                ["message", "error"]
                    .iter()
                    .find_map(|key| non_empty_str(value.get(*key)))
            });
            ResponseOutcome::Failure(
                message.unwrap_or_else(|| TEXT_INSTEAD_OF_IMAGE_MESSAGE.to_string()),
            )
        }
        ResponseShape::Markup => ResponseOutcome::Failure(markup_diagnostic(response)),
    }
}

fn failure_message(response: &RawResponse, shape: ResponseShape) -> String {
    if let Ok(body) = serde_json::from_slice::<ErrorBody>(&response.body) {
        if !body.error.trim().is_empty() {
            return body.message();
        }
    }
    if shape == ResponseShape::Json && serde_json::from_slice::<Value>(&response.body).is_ok() {
        return format!("Request failed ({})", response.status);
    }
    let text = response.body_text();
    if shape == ResponseShape::Markup && looks_like_markup(&response.content_type, &text) {
        return markup_diagnostic(response);
    }
    let text = text.trim();
    if text.is_empty() {
        format!("Request failed ({})", response.status)
    } else {
        truncate_text(text, BODY_PREVIEW_CHARS)
    }
}

fn looks_like_markup(content_type: &str, text: &str) -> bool {
    content_type.to_ascii_lowercase().contains("html") || text.trim_start().starts_with('<')
}

fn markup_diagnostic(response: &RawResponse) -> String {
    let preview: String = response
        .body_text()
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect();
    format!("{UNEXPECTED_MARKUP_PREFIX}{preview}")
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// 128px thumbnail as a PNG data URL, or the raw bytes when the image
/// cannot be decoded.
pub fn preview_data_url(photo: &PhotoUpload) -> String {
    match thumbnail_png(&photo.bytes) {
        Ok(png) => format!("data:image/png;base64,{}", BASE64.encode(png)),
        Err(_) => format!(
            "data:{};base64,{}",
            photo.effective_mime(),
            BASE64.encode(&photo.bytes)
        ),
    }
}

fn thumbnail_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let thumb = image::load_from_memory(bytes)
        .context("failed to decode image for preview")?
        .thumbnail(PREVIEW_EDGE, PREVIEW_EDGE);
    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode preview")?;
    Ok(out.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent {
        payload: NotificationPayload,
        target_origin: TargetOrigin,
    },
    Withheld {
        reason: String,
    },
}

pub struct UploadClient<T: TryOnTransport> {
    transport: T,
    context: EmbeddingContext,
    origin_policy: OriginPolicy,
    user_photo: Option<SelectedImage>,
    clothing_photo: Option<SelectedImage>,
    generated: Option<GeneratedImage>,
    loading: bool,
    error: Option<String>,
    last_notification: Option<NotificationPayload>,
}

impl<T: TryOnTransport> UploadClient<T> {
    pub fn new(transport: T, context: EmbeddingContext) -> Self {
        Self {
            transport,
            context,
            origin_policy: OriginPolicy::default(),
            user_photo: None,
            clothing_photo: None,
            generated: None,
            loading: false,
            error: None,
            last_notification: None,
        }
    }

    pub fn with_origin_policy(mut self, origin_policy: OriginPolicy) -> Self {
        self.origin_policy = origin_policy;
        self
    }

    pub fn context(&self) -> &EmbeddingContext {
        &self.context
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        self.origin_policy
    }

    pub fn user_photo(&self) -> Option<&SelectedImage> {
        self.user_photo.as_ref()
    }

    pub fn clothing_photo(&self) -> Option<&SelectedImage> {
        self.clothing_photo.as_ref()
    }

    pub fn generated(&self) -> Option<&GeneratedImage> {
        self.generated.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_notification(&self) -> Option<&NotificationPayload> {
        self.last_notification.as_ref()
    }

    pub fn select_user_photo(&mut self, path: &Path) -> Result<()> {
        let selected = self.select(path)?;
        self.user_photo = Some(selected);
        Ok(())
    }

    pub fn select_clothing_photo(&mut self, path: &Path) -> Result<()> {
        let selected = self.select(path)?;
        self.clothing_photo = Some(selected);
        Ok(())
    }

    /// Non-image files leave the current selection untouched.
    pub fn select_upload(&mut self, photo: PhotoUpload, clothing: bool) -> Result<()> {
        if !photo.declares_image() {
            bail!("'{}' is not an image", photo.effective_mime());
        }
        let selected = SelectedImage::from_upload(photo);
        self.error = None;
        if clothing {
            self.clothing_photo = Some(selected);
        } else {
            self.user_photo = Some(selected);
        }
        Ok(())
    }

    fn select(&mut self, path: &Path) -> Result<SelectedImage> {
        let photo = PhotoUpload::from_path(path)?;
        if !photo.declares_image() {
            bail!("{} is not an image", path.display());
        }
        self.error = None;
        Ok(SelectedImage::from_upload(photo))
    }

    pub fn remove_user_photo(&mut self) {
        self.user_photo = None;
    }

    pub fn remove_clothing_photo(&mut self) {
        self.clothing_photo = None;
    }

    /// Submits the current selections. The outcome lands in `generated()` or
    /// `error()`; the return value is the rendered image, if any.
    pub fn generate(&mut self) -> Option<&GeneratedImage> {
        self.error = None;
        let Some(user_photo) = &self.user_photo else {
            self.error = Some(MISSING_PHOTO_MESSAGE.to_string());
            return None;
        };
        let request = TryOnRequest::new(user_photo.photo.clone()).with_clothing(
            self.clothing_photo
                .as_ref()
                .map(|selected| selected.photo.clone()),
        );

        self.loading = true;
        self.generated = None;
        let response = self.transport.submit(&request);
        self.loading = false;

        match response.map(|raw| classify_response(&raw)) {
            Ok(ResponseOutcome::Image(image)) => {
                self.generated = Some(image);
            }
            Ok(ResponseOutcome::Failure(message)) => {
                self.error = Some(message);
            }
            Err(err) => {
                self.error = Some(format!("{err:#}"));
            }
        }
        self.generated.as_ref()
    }

    pub fn reset(&mut self) {
        self.user_photo = None;
        self.clothing_photo = None;
        self.generated = None;
        self.error = None;
        self.loading = false;
    }

    /// Writes the generated image. A directory target gets the default
    /// file name.
    pub fn save_result(&self, path: &Path) -> Result<PathBuf> {
        let Some(generated) = &self.generated else {
            bail!("no generated image to save");
        };
        let target = if path.is_dir() {
            path.join(GENERATED_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, &generated.bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(target)
    }

    /// Posts the result notification for a rendered image that is now
    /// reachable at `result_url`.
    pub fn notify_result(
        &mut self,
        target: &dyn MessageTarget,
        result_url: &str,
    ) -> Result<NotifyOutcome> {
        if self.generated.is_none() {
            bail!("no generated image to announce");
        }
        let payload = self.context.result_notification(result_url);
        self.post(target, payload)
    }

    pub fn send_test_notification(&mut self, target: &dyn MessageTarget) -> Result<NotifyOutcome> {
        if !self.context.debug {
            bail!("test notifications require debug mode");
        }
        let payload = self.context.test_notification();
        self.post(target, payload)
    }

    fn post(
        &mut self,
        target: &dyn MessageTarget,
        payload: NotificationPayload,
    ) -> Result<NotifyOutcome> {
        let target_origin = match self.context.resolve_target_origin(self.origin_policy) {
            Ok(origin) => origin,
            Err(reason) => return Ok(NotifyOutcome::Withheld { reason }),
        };
        let message = serde_json::to_value(&payload)?;
        target.post_message(&message, &target_origin)?;
        self.last_notification = Some(payload.clone());
        Ok(NotifyOutcome::Sent {
            payload,
            target_origin,
        })
    }

    /// Checks the server is reachable and serving images.
    pub fn probe(&self) -> Result<GeneratedImage> {
        let response = self.transport.fetch_test_image()?;
        match classify_response(&response) {
            ResponseOutcome::Image(image) => Ok(image),
            ResponseOutcome::Failure(message) => bail!("probe failed: {message}"),
        }
    }
}
