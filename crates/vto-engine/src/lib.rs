use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use vto_contracts::{BackendKind, BackendResult, PhotoUpload, TryOnRequest};

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VERTEX_LOCATION: &str = "global";
/// Gemini API key travels in this header, never in the URL.
const GOOGLE_API_KEY_HEADER: &str = "x-goog-api-key";

pub const GEMINI_TRY_ON_PROMPT: &str = "Put the clothing from the second image onto the person in the first image. Make it look realistic and natural.";
pub const VERTEX_TRY_ON_PROMPT: &str = "Create a photorealistic virtual try-on image. Take the person from the first image and dress them in the clothing item from the second image. Preserve the person's face, body proportions, and natural lighting. The result should look like a professional product photo where the person is naturally wearing the garment.";

const GEMINI_NO_IMAGE_MESSAGE: &str = "No image in response (Gemini).";
const VERTEX_NO_IMAGE_MESSAGE: &str = "No image in response (Vertex).";
const DEFAULT_RESULT_MIME: &str = "image/png";

/// A generative service that turns a try-on request into an image or a
/// textual explanation of why it produced none.
pub trait TryOnBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &TryOnRequest) -> Result<BackendResult>;
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn TryOnBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: TryOnBackend + 'static>(&mut self, backend: B) {
        self.backends
            .insert(backend.name().to_string(), Arc::new(backend));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TryOnBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

pub fn default_backend_registry(config: &BackendConfig) -> Result<BackendRegistry> {
    let http = config.http_client()?;
    let mut backends = BackendRegistry::new();
    backends.register(GeminiBackend::new(config.gemini.clone(), http.clone()));
    backends.register(VertexBackend::new(config.vertex.clone(), http));
    Ok(backends)
}

/// Backend named by the `USE_GEMINI_API` flag.
pub fn select_backend(config: &BackendConfig) -> Result<Arc<dyn TryOnBackend>> {
    let registry = default_backend_registry(config)?;
    let name = config.backend.name();
    registry.get(name).with_context(|| {
        format!(
            "backend '{name}' not registered (available: {})",
            registry.names().join(", ")
        )
    })
}

#[derive(Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
}

#[derive(Clone)]
pub struct VertexSettings {
    pub project_id: Option<String>,
    pub location: String,
    pub access_token: Option<String>,
    pub api_base: Option<String>,
    pub model: String,
}

/// Process configuration for the backends. Credentials stay out of `Debug`
/// output; use [`BackendConfig::describe`] for log lines.
#[derive(Clone)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub gemini: GeminiSettings,
    pub vertex: VertexSettings,
    pub request_timeout: Option<Duration>,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let request_timeout = get("VTO_REQUEST_TIMEOUT_SECS")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        Self {
            backend: BackendKind::from_use_gemini_flag(get("USE_GEMINI_API").as_deref()),
            gemini: GeminiSettings {
                api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
                api_base: get("GEMINI_API_BASE")
                    .map(|value| value.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
                model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            },
            vertex: VertexSettings {
                project_id: get("GOOGLE_PROJECT_ID"),
                location: get("GOOGLE_LOCATION")
                    .unwrap_or_else(|| DEFAULT_VERTEX_LOCATION.to_string()),
                access_token: get("GOOGLE_ACCESS_TOKEN"),
                api_base: get("VERTEX_API_BASE")
                    .map(|value| value.trim_end_matches('/').to_string()),
                model: get("VERTEX_MODEL").unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            },
            request_timeout,
        }
    }

    /// Environment variables the selected backend needs but does not have.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self.backend {
            BackendKind::Gemini => {
                if self.gemini.api_key.is_none() {
                    missing.push("GEMINI_API_KEY");
                }
            }
            BackendKind::Vertex => {
                if self.vertex.project_id.is_none() {
                    missing.push("GOOGLE_PROJECT_ID");
                }
                if self.vertex.access_token.is_none() {
                    missing.push("GOOGLE_ACCESS_TOKEN");
                }
            }
        }
        missing
    }

    pub fn describe(&self) -> String {
        let (model, location) = match self.backend {
            BackendKind::Gemini => (self.gemini.model.as_str(), None),
            BackendKind::Vertex => (
                self.vertex.model.as_str(),
                Some(self.vertex.location.as_str()),
            ),
        };
        let timeout = self
            .request_timeout
            .map(|value| format!("{}s", value.as_secs_f64()))
            .unwrap_or_else(|| "none".to_string());
        match location {
            Some(location) => format!(
                "backend={} model={model} location={location} timeout={timeout}",
                self.backend
            ),
            None => format!("backend={} model={model} timeout={timeout}", self.backend),
        }
    }

    fn http_client(&self) -> Result<HttpClient> {
        HttpClient::builder()
            .timeout(self.request_timeout)
            .build()
            .context("failed to build backend HTTP client")
    }
}

pub struct GeminiBackend {
    settings: GeminiSettings,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new(settings: GeminiSettings, http: HttpClient) -> Self {
        Self { settings, http }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.settings.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.settings.api_base, model_path)
    }
}

impl TryOnBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &TryOnRequest) -> Result<BackendResult> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint();
        let payload = build_generate_content_payload(GEMINI_TRY_ON_PROMPT, request);
        tracing::debug!(%endpoint, images = request.photos().count(), "calling Gemini");

        let response = self
            .http
            .post(&endpoint)
            .header(GOOGLE_API_KEY_HEADER, api_key)
            .json(&payload)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        extract_backend_result(&response_payload, GEMINI_NO_IMAGE_MESSAGE)
    }
}

pub struct VertexBackend {
    settings: VertexSettings,
    http: HttpClient,
}

impl VertexBackend {
    pub fn new(settings: VertexSettings, http: HttpClient) -> Self {
        Self { settings, http }
    }

    fn api_base(&self) -> String {
        if let Some(api_base) = self.settings.api_base.as_deref() {
            return api_base.to_string();
        }
        let location = self.settings.location.trim();
        if location.is_empty() || location == DEFAULT_VERTEX_LOCATION {
            "https://aiplatform.googleapis.com/v1".to_string()
        } else {
            format!("https://{location}-aiplatform.googleapis.com/v1")
        }
    }

    fn endpoint(&self, project_id: &str) -> String {
        let location = match self.settings.location.trim() {
            "" => DEFAULT_VERTEX_LOCATION,
            other => other,
        };
        let model = self.settings.model.trim();
        let model = model.rsplit('/').next().unwrap_or(model);
        format!(
            "{}/projects/{project_id}/locations/{location}/publishers/google/models/{model}:generateContent",
            self.api_base()
        )
    }
}

impl TryOnBackend for VertexBackend {
    fn name(&self) -> &str {
        "vertex"
    }

    fn generate(&self, request: &TryOnRequest) -> Result<BackendResult> {
        let Some(project_id) = self.settings.project_id.as_deref() else {
            bail!("GOOGLE_PROJECT_ID not set");
        };
        let Some(access_token) = self.settings.access_token.as_deref() else {
            bail!("GOOGLE_ACCESS_TOKEN not set");
        };
        let endpoint = self.endpoint(project_id);
        let payload = build_generate_content_payload(VERTEX_TRY_ON_PROMPT, request);
        tracing::debug!(%endpoint, images = request.photos().count(), "calling Vertex");

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .json(&payload)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Vertex request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Vertex", response)?;
        extract_backend_result(&response_payload, VERTEX_NO_IMAGE_MESSAGE)
    }
}

/// `generateContent` body: one user turn holding the prompt followed by the
/// person photo and, when present, the garment photo.
pub fn build_generate_content_payload(prompt: &str, request: &TryOnRequest) -> Value {
    let mut parts = vec![json!({ "text": prompt })];
    parts.extend(request.photos().map(inline_image_part));
    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }]
    })
}

fn inline_image_part(photo: &PhotoUpload) -> Value {
    json!({
        "inlineData": {
            "mimeType": photo.effective_mime(),
            "data": BASE64.encode(&photo.bytes),
        }
    })
}

/// Reads the parts of the first candidate. The first part with inline image
/// data wins; otherwise the text parts become the failure message, and
/// `no_image_message` is used when there is no text either.
pub fn extract_backend_result(
    response_payload: &Value,
    no_image_message: &str,
) -> Result<BackendResult> {
    let candidate = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first());
    let parts = candidate
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for part in &parts {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let image_bytes = BASE64
            .decode(data.as_bytes())
            .context("inline image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_RESULT_MIME);
        return Ok(BackendResult::success(mime_type, image_bytes));
    }

    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join("\n");
    let text = text.trim_end();
    if !text.trim().is_empty() {
        return Ok(BackendResult::failure(text));
    }

    let finish_reason = candidate
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str);
    let block_reason = response_payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str);
    if finish_reason.is_some() || block_reason.is_some() {
        tracing::warn!(
            finish_reason = finish_reason.unwrap_or("-"),
            block_reason = block_reason.unwrap_or("-"),
            "backend returned neither image nor text"
        );
    }
    Ok(BackendResult::failure(no_image_message))
}

fn response_json_or_error(backend: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("{backend} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{backend} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{backend} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Flattens an error and its causes into one line, skipping repeats.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
