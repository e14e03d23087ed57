//! Typed request envelopes submitted to the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::ProviderKind;

/// The eight operations the engine routes. Streaming kinds deliver their
/// result as a channel of deltas instead of a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TextCompletion,
    ChatCompletion,
    ChatCompletionStream,
    Embedding,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
}

impl RequestKind {
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletionStream
                | RequestKind::SpeechStream
                | RequestKind::TranscriptionStream
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::TextCompletion => "text_completion",
            RequestKind::ChatCompletion => "chat_completion",
            RequestKind::ChatCompletionStream => "chat_completion_stream",
            RequestKind::Embedding => "embedding",
            RequestKind::Speech => "speech",
            RequestKind::SpeechStream => "speech_stream",
            RequestKind::Transcription => "transcription",
            RequestKind::TranscriptionStream => "transcription_stream",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One chat turn. Assistant turns may carry tool calls; tool turns carry the
/// id of the call they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Tool-result turn answering `tool_call_id`.
    pub fn tool_result(tool_call_id: Option<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id,
        }
    }
}

/// A function-style tool descriptor carried in request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl Tool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Tool {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// A tool invocation emitted by a model. `arguments` is the raw JSON text the
/// model produced; deltas may split the name across elements, hence `Option`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_tool_call_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_call_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

/// Optional sampling and tool parameters, passed through to the adapter.
/// Unknown provider-specific knobs ride in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Input for a speech (text-to-audio) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechInput {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Input for a transcription (audio-to-text) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionInput {
    pub file: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Exactly one input variant per request; the dispatcher validates that the
/// variant matches the public method used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestInput {
    TextCompletion(String),
    ChatCompletion(Vec<ChatMessage>),
    Embedding(Vec<String>),
    Speech(SpeechInput),
    Transcription(TranscriptionInput),
}

/// A (provider, model) pair tried in order after the primary fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: ProviderKind,
    pub model: String,
}

/// The request envelope. Immutable from the dispatcher's view once pre-hooks
/// have run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub provider: ProviderKind,
    pub model: String,
    pub input: RequestInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<ModelParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Fallback>,
}

impl Request {
    pub fn chat(provider: ProviderKind, model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Request {
            provider,
            model: model.into(),
            input: RequestInput::ChatCompletion(messages),
            params: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Fallback>) -> Self {
        self.fallbacks = fallbacks;
        self
    }
}
