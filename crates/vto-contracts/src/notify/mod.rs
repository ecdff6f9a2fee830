//! Result notifications sent from the upload client to the page or
//! application that embeds it.

mod outbox;

use serde::{Deserialize, Serialize};
use url::Url;

pub use outbox::{MessageTarget, OutboxWriter};

/// Fixed `type` tag every notification carries.
pub const RESULT_MESSAGE_TYPE: &str = "VTO_RESULT";
pub const RESULT_SOURCE: &str = "virtual-try-on";
pub const DEBUG_TEST_SOURCE: &str = "debug-test";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub message_type: String,
    pub product_id: Option<String>,
    pub variant_id: Option<String>,
    pub result_url: String,
    pub source: String,
}

/// Parameters the client was launched with by its host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingContext {
    pub embedded: bool,
    pub parent_origin: Option<String>,
    pub product_id: Option<String>,
    pub variant_id: Option<String>,
    pub debug: bool,
}

impl EmbeddingContext {
    pub fn result_notification(&self, result_url: impl Into<String>) -> NotificationPayload {
        self.notification(result_url.into(), RESULT_SOURCE)
    }

    pub fn test_notification(&self) -> NotificationPayload {
        self.notification("about:blank#vto-debug-test".to_string(), DEBUG_TEST_SOURCE)
    }

    fn notification(&self, result_url: String, source: &str) -> NotificationPayload {
        NotificationPayload {
            message_type: RESULT_MESSAGE_TYPE.to_string(),
            product_id: self.product_id.clone(),
            variant_id: self.variant_id.clone(),
            result_url,
            source: source.to_string(),
        }
    }

    /// Serialized origin of the declared parent (`scheme://host[:port]`).
    /// Paths are stripped so a full referrer URL works too. Opaque origins
    /// and `*` do not count as declared.
    pub fn declared_origin(&self) -> Option<String> {
        let raw = self.parent_origin.as_deref().map(str::trim)?;
        if raw.is_empty() || raw == "*" {
            return None;
        }
        let origin = Url::parse(raw).ok()?.origin();
        if !origin.is_tuple() {
            return None;
        }
        Some(origin.ascii_serialization())
    }

    /// An embedded client only ever posts to its declared parent; `*` is
    /// reachable only outside an embedding context with the wildcard switch on.
    pub fn resolve_target_origin(&self, policy: OriginPolicy) -> Result<TargetOrigin, String> {
        if let Some(origin) = self.declared_origin() {
            return Ok(TargetOrigin::Origin(origin));
        }
        if self.embedded {
            return Err(
                "Embedding origin unknown; notification withheld instead of posting to '*'."
                    .to_string(),
            );
        }
        match policy {
            OriginPolicy::AllowWildcard => Ok(TargetOrigin::Any),
            OriginPolicy::Strict => Err(
                "Not embedded and wildcard target disabled; notification withheld.".to_string(),
            ),
        }
    }
}

/// Whether a notification may go to an unrestricted (`*`) target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    #[default]
    Strict,
    /// Development only: a standalone client with no known origin posts to `*`.
    AllowWildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOrigin {
    Origin(String),
    Any,
}

impl TargetOrigin {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Origin(origin) => origin.as_str(),
            Self::Any => "*",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn embedded(origin: Option<&str>) -> EmbeddingContext {
        EmbeddingContext {
            embedded: true,
            parent_origin: origin.map(str::to_string),
            product_id: Some("prod-9".to_string()),
            variant_id: Some("var-3".to_string()),
            debug: false,
        }
    }

    #[test]
    fn payload_serializes_with_type_tag_and_camel_case() -> anyhow::Result<()> {
        let payload = embedded(None).result_notification("file:///tmp/virtual-try-on.png");
        let value = serde_json::to_value(&payload)?;
        assert_eq!(
            value,
            json!({
                "type": "VTO_RESULT",
                "productId": "prod-9",
                "variantId": "var-3",
                "resultUrl": "file:///tmp/virtual-try-on.png",
                "source": "virtual-try-on",
            })
        );
        Ok(())
    }

    #[test]
    fn test_notification_is_tagged_as_debug() {
        let payload = EmbeddingContext::default().test_notification();
        assert_eq!(payload.message_type, RESULT_MESSAGE_TYPE);
        assert_eq!(payload.source, DEBUG_TEST_SOURCE);
        assert!(payload.product_id.is_none());
    }

    #[test]
    fn declared_origin_strips_path_and_rejects_opaque() {
        let context = embedded(Some("https://shop.example:8443/products/tee?x=1"));
        assert_eq!(
            context.declared_origin().as_deref(),
            Some("https://shop.example:8443")
        );
        assert!(embedded(Some("*")).declared_origin().is_none());
        assert!(embedded(Some("null")).declared_origin().is_none());
        assert!(embedded(Some("data:text/plain,hi")).declared_origin().is_none());
        assert!(embedded(Some("   ")).declared_origin().is_none());
    }

    #[test]
    fn embedded_with_origin_targets_that_origin_under_any_policy() {
        let context = embedded(Some("https://shop.example"));
        for policy in [OriginPolicy::Strict, OriginPolicy::AllowWildcard] {
            assert_eq!(
                context.resolve_target_origin(policy),
                Ok(TargetOrigin::Origin("https://shop.example".to_string()))
            );
        }
    }

    #[test]
    fn strict_policy_never_falls_back_to_wildcard() {
        let err = embedded(None)
            .resolve_target_origin(OriginPolicy::Strict)
            .err()
            .unwrap_or_default();
        assert!(err.contains("origin unknown"));

        let standalone = EmbeddingContext::default();
        assert!(standalone
            .resolve_target_origin(OriginPolicy::Strict)
            .is_err());
    }

    #[test]
    fn wildcard_policy_allows_unrestricted_target() {
        let standalone = EmbeddingContext::default();
        let target = standalone.resolve_target_origin(OriginPolicy::AllowWildcard);
        assert_eq!(target, Ok(TargetOrigin::Any));
        assert_eq!(TargetOrigin::Any.as_str(), "*");
    }

    #[test]
    fn wildcard_policy_never_applies_inside_an_embedding() {
        let err = embedded(None)
            .resolve_target_origin(OriginPolicy::AllowWildcard)
            .err()
            .unwrap_or_default();
        assert!(err.contains("origin unknown"));

        let opaque = embedded(Some("null"));
        assert!(opaque
            .resolve_target_origin(OriginPolicy::AllowWildcard)
            .is_err());
    }
}
