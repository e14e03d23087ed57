//! The adapter seam: one [`Provider`] implementation per upstream service.
//!
//! Adapters own payload shaping, HTTP, and parsing; the engine owns queueing,
//! credential selection, retries, plugins and fallbacks. An adapter declares
//! an operation unsupported by leaving the default method body in place.

pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::account::Key;
use crate::error::TrestleError;
use crate::plugins::PostHookRunner;
use crate::request::{ChatMessage, ModelParams, SpeechInput, TranscriptionInput};
use crate::response::{Response, ResponseStream};

/// Canonical provider tags. Serialized lowercase; `Display` matches the wire
/// form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Bedrock,
    Azure,
    Vertex,
    Cohere,
    Mistral,
    Ollama,
    Groq,
    Sglang,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Azure => "azure",
            ProviderKind::Vertex => "vertex",
            ProviderKind::Cohere => "cohere",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Groq => "groq",
            ProviderKind::Sglang => "sglang",
        }
    }

    /// Local inference servers run without credentials.
    pub fn requires_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama | ProviderKind::Sglang)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "bedrock" => Ok(ProviderKind::Bedrock),
            "azure" => Ok(ProviderKind::Azure),
            "vertex" => Ok(ProviderKind::Vertex),
            "cohere" => Ok(ProviderKind::Cohere),
            "mistral" => Ok(ProviderKind::Mistral),
            "ollama" => Ok(ProviderKind::Ollama),
            "groq" => Ok(ProviderKind::Groq),
            "sglang" => Ok(ProviderKind::Sglang),
            other => Err(anyhow::anyhow!("unsupported provider: {other}")),
        }
    }
}

/// Capability exposed by each provider adapter. Non-streaming operations
/// return a parsed [`Response`]; streaming operations return a stream of
/// deltas and must invoke the [`PostHookRunner`] exactly once per element
/// (see [`crate::plugins::wrap_stream`]).
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn text_completion(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        _key: &Key,
        _text: &str,
        _params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "text_completion"))
    }

    async fn chat_completion(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        _key: &Key,
        _messages: &[ChatMessage],
        _params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "chat_completion"))
    }

    async fn chat_completion_stream(
        &self,
        _cancel: CancellationToken,
        _runner: PostHookRunner,
        _model: &str,
        _key: &Key,
        _messages: &[ChatMessage],
        _params: Option<&ModelParams>,
    ) -> Result<ResponseStream, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "chat_completion_stream"))
    }

    async fn embedding(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        _key: &Key,
        _texts: &[String],
        _params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "embedding"))
    }

    async fn speech(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        _key: &Key,
        _input: &SpeechInput,
        _params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "speech"))
    }

    async fn speech_stream(
        &self,
        _cancel: CancellationToken,
        _runner: PostHookRunner,
        _model: &str,
        _key: &Key,
        _input: &SpeechInput,
        _params: Option<&ModelParams>,
    ) -> Result<ResponseStream, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "speech_stream"))
    }

    async fn transcription(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        _key: &Key,
        _input: &TranscriptionInput,
        _params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "transcription"))
    }

    async fn transcription_stream(
        &self,
        _cancel: CancellationToken,
        _runner: PostHookRunner,
        _model: &str,
        _key: &Key,
        _input: &TranscriptionInput,
        _params: Option<&ModelParams>,
    ) -> Result<ResponseStream, TrestleError> {
        Err(TrestleError::unsupported(self.kind(), "transcription_stream"))
    }
}

/// Builds adapters from provider configuration. Supplied by the embedding
/// application; the engine never constructs adapters itself.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        kind: ProviderKind,
        config: &crate::account::ProviderConfig,
    ) -> anyhow::Result<std::sync::Arc<dyn Provider>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Bedrock,
            ProviderKind::Azure,
            ProviderKind::Vertex,
            ProviderKind::Cohere,
            ProviderKind::Mistral,
            ProviderKind::Ollama,
            ProviderKind::Groq,
            ProviderKind::Sglang,
        ] {
            let parsed: ProviderKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn keyless_providers() {
        assert!(!ProviderKind::Ollama.requires_key());
        assert!(!ProviderKind::Sglang.requires_key());
        assert!(ProviderKind::OpenAi.requires_key());
        assert!(ProviderKind::Vertex.requires_key());
    }
}
