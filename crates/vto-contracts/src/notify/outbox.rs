use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::TargetOrigin;

/// Destination for messages addressed to the embedding context.
pub trait MessageTarget {
    fn post_message(&self, message: &Value, target_origin: &TargetOrigin) -> anyhow::Result<()>;
}

/// Append-only `messages.jsonl` outbox read by the hosting application.
///
/// Each line is one compact object with `target_origin`, `ts` and the
/// posted `message`.
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    inner: Arc<OutboxWriterInner>,
}

#[derive(Debug)]
struct OutboxWriterInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutboxWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(OutboxWriterInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(&self, message: &Value, target_origin: &TargetOrigin) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert(
            "target_origin".to_string(),
            Value::String(target_origin.as_str().to_string()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.insert("message".to_string(), message.clone());

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let raw = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("outbox writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(raw.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

impl MessageTarget for OutboxWriter {
    fn post_message(&self, message: &Value, target_origin: &TargetOrigin) -> anyhow::Result<()> {
        self.append(message, target_origin).map(|_| ())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
