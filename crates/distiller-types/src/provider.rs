use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// Remote lifecycle of an uploaded artifact, reported while `upload` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    Uploading,
    Processing,
    Active,
    Failed,
}

impl ArtifactState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UPLOADING" => Some(Self::Uploading),
            "PROCESSING" | "STATE_UNSPECIFIED" => Some(Self::Processing),
            "ACTIVE" => Some(Self::Active),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The user-supplied input document. Immutable once a run starts.
#[derive(Clone)]
pub struct SourceArtifact {
    pub display_name: String,
    pub mime_type: String,
    pub bytes: Arc<Vec<u8>>,
}

impl SourceArtifact {
    pub fn new(
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File name without its extension, used to name exports.
    pub fn stem(&self) -> &str {
        match self.display_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => self.display_name.as_str(),
        }
    }
}

impl std::fmt::Debug for SourceArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceArtifact")
            .field("display_name", &self.display_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Opaque reference to an artifact the remote service has finished processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileHandle {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response metadata delivered with the final event of a turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Provider payload with generated text removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_state_parses_remote_spellings() {
        assert_eq!(ArtifactState::parse("ACTIVE"), Some(ArtifactState::Active));
        assert_eq!(
            ArtifactState::parse("processing"),
            Some(ArtifactState::Processing)
        );
        assert_eq!(ArtifactState::parse("weird"), None);
    }

    #[test]
    fn artifact_stem_drops_extension_only() {
        let artifact = SourceArtifact::new("deep.work.pdf", "application/pdf", vec![1, 2]);
        assert_eq!(artifact.stem(), "deep.work");
        let bare = SourceArtifact::new("README", "text/plain", Vec::new());
        assert_eq!(bare.stem(), "README");
        assert!(bare.is_empty());
    }

    #[test]
    fn artifact_debug_omits_bytes() {
        let artifact = SourceArtifact::new("a.txt", "text/plain", vec![7; 64]);
        let rendered = format!("{artifact:?}");
        assert!(rendered.contains("len: 64"));
        assert!(!rendered.contains("7, 7"));
    }
}
