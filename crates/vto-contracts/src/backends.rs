use serde::{Deserialize, Serialize};

/// The two interchangeable generative backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gemini,
    Vertex,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Vertex => "vertex",
        }
    }

    /// Reads the `USE_GEMINI_API` flag. Unset means Gemini; any value that is
    /// not a truthy word selects Vertex.
    pub fn from_use_gemini_flag(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Gemini;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Self::Gemini,
            _ => Self::Vertex,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
