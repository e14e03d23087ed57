//! Configuration source consumed by the engine.
//!
//! The [`Account`] owns provider configuration and credentials; the engine
//! reads them per admission, so credential changes are picked up on the next
//! request without any coordination.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::providers::retry::RetryConfig;
use crate::providers::ProviderKind;

/// A provider credential. An empty `models` list means the key serves every
/// model. Weights drive the weighted-random selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub value: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Key {
    pub fn new(value: impl Into<String>, models: Vec<String>, weight: f64) -> Self {
        Key {
            value: value.into(),
            models,
            weight,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyAndBufferSize {
    /// Worker count for the provider's pool.
    pub concurrency: usize,
    /// Queue capacity; admissions beyond it block or drop.
    pub buffer_size: usize,
}

impl Default for ConcurrencyAndBufferSize {
    fn default() -> Self {
        ConcurrencyAndBufferSize {
            concurrency: 10,
            buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    pub default_request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            base_url: None,
            extra_headers: HashMap::new(),
            default_request_timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub concurrency_and_buffer_size: ConcurrencyAndBufferSize,
    /// Provider-specific settings the adapter interprets (deployment names,
    /// regions, project ids).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Configuration source. Implementations decide where configuration lives;
/// the engine only reads.
#[async_trait]
pub trait Account: Send + Sync {
    fn configured_providers(&self) -> anyhow::Result<Vec<ProviderKind>>;

    fn config_for_provider(&self, kind: ProviderKind) -> anyhow::Result<ProviderConfig>;

    async fn keys_for_provider(
        &self,
        cancel: &CancellationToken,
        kind: ProviderKind,
    ) -> anyhow::Result<Vec<Key>>;
}
