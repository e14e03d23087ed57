//! Wire-surface error type returned to callers.
//!
//! Every error that leaves the engine is a [`TrestleError`]. The flags on it
//! drive the retry loop and the fallback cascade: `status_code` against the
//! retryable set, `error.kind == "request_cancelled"` to short-circuit both,
//! and `allow_fallbacks` to refuse the cascade outright.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::providers::retry::is_retryable_status;
use crate::providers::ProviderKind;

/// Error kind tag used when the caller's cancellation token fired.
pub const REQUEST_CANCELLED: &str = "request_cancelled";

/// Inner error payload: a type tag, a human-readable message, and an
/// optional source chain that never crosses the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorField {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(skip)]
    pub source: Option<Arc<anyhow::Error>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrestleError {
    /// True when the failure is infrastructural (marshalling, transport,
    /// engine internals) rather than a provider-reported error.
    pub is_trestle_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub error: ErrorField,
    /// `None` is treated as "fallbacks allowed".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_fallbacks: Option<bool>,
    /// Stamped with the provider that produced the error before it is
    /// surfaced to the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
}

impl TrestleError {
    /// Provider-reported error with no further classification.
    pub fn from_message(message: impl Into<String>) -> Self {
        TrestleError {
            error: ErrorField {
                message: message.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Infrastructural error wrapping an underlying cause.
    pub fn from_error(err: anyhow::Error) -> Self {
        TrestleError {
            is_trestle_error: true,
            error: ErrorField {
                message: err.to_string(),
                source: Some(Arc::new(err)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Infrastructural error from a plain message.
    pub fn internal(message: impl Into<String>) -> Self {
        TrestleError {
            is_trestle_error: true,
            error: ErrorField {
                message: message.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Error produced when the caller's cancellation token fires. Never
    /// retried, never cascaded to fallbacks.
    pub fn cancelled(message: impl Into<String>) -> Self {
        TrestleError {
            error: ErrorField {
                kind: Some(REQUEST_CANCELLED.to_string()),
                message: message.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Permanent "operation not supported by this adapter" error.
    pub fn unsupported(provider: ProviderKind, operation: &str) -> Self {
        TrestleError {
            error: ErrorField {
                kind: Some("unsupported_operation".to_string()),
                message: format!("{operation} is not supported by provider {provider}"),
                ..Default::default()
            },
            provider: Some(provider),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn without_fallbacks(mut self) -> Self {
        self.allow_fallbacks = Some(false);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.kind.as_deref() == Some(REQUEST_CANCELLED)
    }

    /// A worker retries only server-side failures: a retryable HTTP status
    /// on a request that was not cancelled.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancelled()
            && self
                .status_code
                .is_some_and(is_retryable_status)
    }

    /// An error with no status, no type, no message and no source carries no
    /// information; post-hook reconciliation treats it as recovered when a
    /// response is present.
    pub fn is_structurally_empty(&self) -> bool {
        self.status_code.is_none()
            && self.error.kind.is_none()
            && self.error.message.is_empty()
            && self.error.source.is_none()
    }
}

impl fmt::Display for TrestleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.provider, self.status_code) {
            (Some(provider), Some(status)) => {
                write!(f, "{provider} ({status}): {}", self.error.message)
            }
            (Some(provider), None) => write!(f, "{provider}: {}", self.error.message),
            (None, Some(status)) => write!(f, "({status}) {}", self.error.message),
            (None, None) => write!(f, "{}", self.error.message),
        }
    }
}

impl std::error::Error for TrestleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error
            .source
            .as_deref()
            .map(AsRef::<dyn std::error::Error + 'static>::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_errors_are_never_retryable() {
        let err = TrestleError::cancelled("caller gave up").with_status(503);
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(
                TrestleError::from_message("boom").with_status(status).is_retryable(),
                "status {status} should be retryable"
            );
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(
                !TrestleError::from_message("boom").with_status(status).is_retryable(),
                "status {status} should not be retryable"
            );
        }
        assert!(!TrestleError::from_message("no status").is_retryable());
    }

    #[test]
    fn structurally_empty_detection() {
        assert!(TrestleError::default().is_structurally_empty());
        assert!(!TrestleError::from_message("m").is_structurally_empty());
        assert!(!TrestleError::default().with_status(500).is_structurally_empty());
        assert!(!TrestleError::cancelled("").is_structurally_empty());
    }

    #[test]
    fn wire_shape_round_trip() {
        let err = TrestleError::from_message("rate limited")
            .with_status(429)
            .with_provider(ProviderKind::OpenAi);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status_code"], 429);
        assert_eq!(json["provider"], "openai");
        assert_eq!(json["error"]["message"], "rate limited");
        let back: TrestleError = serde_json::from_value(json).unwrap();
        assert_eq!(back.status_code, Some(429));
    }
}
