//! Shared mocks for engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use trestle::account::{Account, ConcurrencyAndBufferSize, Key, NetworkConfig, ProviderConfig};
use trestle::error::TrestleError;
use trestle::plugins::{wrap_stream, PostHookRunner};
use trestle::providers::retry::RetryConfig;
use trestle::providers::{Provider, ProviderFactory, ProviderKind};
use trestle::request::{ChatMessage, ModelParams};
use trestle::response::{Response, ResponseStream};
use trestle::{Trestle, TrestleConfig};

pub fn provider_config(concurrency: usize, buffer_size: usize, max_retries: usize) -> ProviderConfig {
    ProviderConfig {
        network: NetworkConfig {
            retry: RetryConfig {
                max_retries,
                initial_interval_ms: 1,
                backoff_multiplier: 2.0,
                max_interval_ms: 5,
            },
            ..Default::default()
        },
        concurrency_and_buffer_size: ConcurrencyAndBufferSize {
            concurrency,
            buffer_size,
        },
        metadata: None,
    }
}

#[derive(Default)]
pub struct MockAccount {
    configs: Mutex<HashMap<ProviderKind, ProviderConfig>>,
    keys: Mutex<HashMap<ProviderKind, Vec<Key>>>,
}

impl MockAccount {
    pub fn new() -> Arc<Self> {
        Arc::new(MockAccount::default())
    }

    pub fn with_provider(self: Arc<Self>, kind: ProviderKind, config: ProviderConfig) -> Arc<Self> {
        self.configs.lock().unwrap().insert(kind, config);
        self.keys
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(|| vec![Key::new("sk-test", Vec::new(), 1.0)]);
        self
    }

    pub fn with_keys(self: Arc<Self>, kind: ProviderKind, keys: Vec<Key>) -> Arc<Self> {
        self.keys.lock().unwrap().insert(kind, keys);
        self
    }

    /// Replaces a provider's config, as an operator would before a live
    /// concurrency update.
    pub fn set_config(&self, kind: ProviderKind, config: ProviderConfig) {
        self.configs.lock().unwrap().insert(kind, config);
    }
}

#[async_trait]
impl Account for MockAccount {
    fn configured_providers(&self) -> anyhow::Result<Vec<ProviderKind>> {
        Ok(self.configs.lock().unwrap().keys().copied().collect())
    }

    fn config_for_provider(&self, kind: ProviderKind) -> anyhow::Result<ProviderConfig> {
        self.configs
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no config for provider {kind}"))
    }

    async fn keys_for_provider(
        &self,
        _cancel: &CancellationToken,
        kind: ProviderKind,
    ) -> anyhow::Result<Vec<Key>> {
        Ok(self.keys.lock().unwrap().get(&kind).cloned().unwrap_or_default())
    }
}

/// Scripted adapter behavior, consumed one entry per adapter invocation.
pub enum Behavior {
    Respond(Response),
    Fail(TrestleError),
    Stream(Vec<Result<Response, TrestleError>>),
    Panic(&'static str),
}

pub struct MockProvider {
    kind: ProviderKind,
    behaviors: Mutex<VecDeque<Behavior>>,
    pub calls: AtomicUsize,
    delay: Option<Duration>,
    pub seen_params: Mutex<Vec<Option<ModelParams>>>,
    pub seen_keys: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(MockProvider {
            kind,
            behaviors: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: None,
            seen_params: Mutex::new(Vec::new()),
            seen_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(kind: ProviderKind, delay: Duration) -> Arc<Self> {
        Arc::new(MockProvider {
            kind,
            behaviors: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
            seen_params: Mutex::new(Vec::new()),
            seen_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, behavior: Behavior) -> &Self {
        self.behaviors.lock().unwrap().push_back(behavior);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_outcome(
        &self,
        key: &Key,
        params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        self.record(key, params).await;
        let behavior = self.behaviors.lock().unwrap().pop_front();
        match behavior {
            Some(Behavior::Respond(response)) => Ok(response),
            Some(Behavior::Fail(error)) => Err(error),
            Some(Behavior::Panic(message)) => panic!("{message}"),
            Some(Behavior::Stream(_)) => Err(TrestleError::internal(
                "stream behavior scripted for a non-streaming call",
            )),
            None => Ok(Response::with_text("default", "mock-model", "ok")),
        }
    }

    async fn record(&self, key: &Key, params: Option<&ModelParams>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_keys.lock().unwrap().push(key.value.clone());
        self.seen_params.lock().unwrap().push(params.cloned());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn chat_completion(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        key: &Key,
        _messages: &[ChatMessage],
        params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        self.next_outcome(key, params).await
    }

    async fn embedding(
        &self,
        _cancel: CancellationToken,
        _model: &str,
        key: &Key,
        _texts: &[String],
        params: Option<&ModelParams>,
    ) -> Result<Response, TrestleError> {
        self.next_outcome(key, params).await
    }

    async fn chat_completion_stream(
        &self,
        _cancel: CancellationToken,
        runner: PostHookRunner,
        _model: &str,
        key: &Key,
        _messages: &[ChatMessage],
        params: Option<&ModelParams>,
    ) -> Result<ResponseStream, TrestleError> {
        self.record(key, params).await;
        let behavior = self.behaviors.lock().unwrap().pop_front();
        match behavior {
            Some(Behavior::Stream(items)) => {
                let raw: ResponseStream = futures::stream::iter(items).boxed();
                Ok(wrap_stream(raw, runner))
            }
            Some(Behavior::Fail(error)) => Err(error),
            Some(Behavior::Panic(message)) => panic!("{message}"),
            Some(Behavior::Respond(_)) | None => Err(TrestleError::internal(
                "no stream behavior scripted",
            )),
        }
    }
}

#[derive(Default)]
pub struct MockFactory {
    providers: Mutex<HashMap<ProviderKind, Arc<MockProvider>>>,
}

impl MockFactory {
    pub fn with(providers: Vec<Arc<MockProvider>>) -> Arc<Self> {
        let factory = MockFactory::default();
        {
            let mut map = factory.providers.lock().unwrap();
            for provider in providers {
                map.insert(provider.kind, provider);
            }
        }
        Arc::new(factory)
    }
}

impl ProviderFactory for MockFactory {
    fn create(
        &self,
        kind: ProviderKind,
        _config: &ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        self.providers
            .lock()
            .unwrap()
            .get(&kind)
            .map(|provider| Arc::clone(provider) as Arc<dyn Provider>)
            .ok_or_else(|| anyhow::anyhow!("no mock adapter registered for {kind}"))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn build_engine(
    account: Arc<MockAccount>,
    factory: Arc<MockFactory>,
    plugins: Vec<Arc<dyn trestle::plugins::Plugin>>,
) -> Trestle {
    init_tracing();
    Trestle::init(TrestleConfig {
        account,
        factory,
        plugins,
        mcp: None,
        initial_pool_size: 4,
        drop_excess_requests: false,
    })
    .await
    .expect("engine init")
}
