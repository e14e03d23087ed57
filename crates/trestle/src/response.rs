//! Response and stream types returned by the engine.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::TrestleError;
use crate::request::ChatMessage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One completion choice. Non-streaming responses fill `message`; stream
/// deltas fill `delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechOutput {
    pub audio: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub text: String,
}

/// Provider response, already parsed by the adapter. The engine treats it as
/// opaque apart from handing it to plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<Vec<f32>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribe: Option<TranscriptionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Response {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Response {
            id: id.into(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Single-choice assistant response, the common case in tests and
    /// short-circuiting plugins.
    pub fn with_text(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        let mut response = Response::new(id, model);
        response.choices = vec![Choice {
            index: 0,
            message: Some(ChatMessage::assistant(text)),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }];
        response
    }
}

/// A lazy, finite, non-restartable sequence of deltas. The adapter owns the
/// underlying source and ends the stream after the terminal element.
pub type ResponseStream = BoxStream<'static, Result<Response, TrestleError>>;

/// Wraps an already-final response as a one-element stream, used when a
/// plugin short-circuits a streaming request.
pub fn single_response_stream(response: Response) -> ResponseStream {
    futures::stream::iter(vec![Ok(response)]).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_response_stream_yields_once() {
        let mut stream = single_response_stream(Response::with_text("r1", "m", "cached"));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "r1");
        assert!(stream.next().await.is_none());
    }
}
