//! The engine: public request methods, queue admission, the fallback
//! cascade, and live reconfiguration of provider pools.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::error::TrestleError;
use crate::mcp::{McpClientConfig, McpClientInfo, McpConfig, McpError, McpManager, ToolHandler};
use crate::plugins::{outcome_to_result, Plugin, PluginPipeline, PluginSet};
use crate::pool::Pool;
use crate::providers::{ProviderFactory, ProviderKind};
use crate::queue::{RequestQueue, TrySendError};
use crate::request::{ChatMessage, Request, RequestInput, RequestKind, Tool, ToolCall};
use crate::response::{single_response_stream, Response, ResponseStream};
use crate::workers::{spawn_workers, Admission, WorkerContext};

/// Buffered admissions that cannot be forwarded during reconfiguration wait
/// this long for space before their caller receives an error.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// An admission can observe a closed queue only while a reconfiguration swap
/// is in flight; one re-read under the provider lock resolves it. Bounded to
/// keep a broken provider from spinning the dispatcher.
const QUEUE_REACQUIRE_ATTEMPTS: usize = 3;

pub struct TrestleConfig {
    pub account: Arc<dyn Account>,
    pub factory: Arc<dyn ProviderFactory>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub mcp: Option<McpConfig>,
    /// Pipeline scratch objects allocated up front.
    pub initial_pool_size: usize,
    /// When true, admissions to a full queue fail instead of waiting.
    pub drop_excess_requests: bool,
}

struct ProviderRuntime {
    queue: RequestQueue<Admission>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

/// Per-provider slot. The inner lock gates structural changes: dispatchers
/// take it briefly for reading, reconfiguration holds it for writing.
struct ProviderSlot {
    runtime: RwLock<ProviderRuntime>,
}

pub struct Trestle {
    account: Arc<dyn Account>,
    factory: Arc<dyn ProviderFactory>,
    plugins: PluginSet,
    providers: StdRwLock<HashMap<ProviderKind, Arc<ProviderSlot>>>,
    pipeline_pool: Pool<PluginPipeline>,
    mcp: StdRwLock<Option<Arc<McpManager>>>,
    drop_excess_requests: AtomicBool,
}

impl Trestle {
    /// Builds the engine: prewarms pools, initializes MCP if configured, and
    /// prepares a worker pool for every provider the account reports. A
    /// provider whose configuration cannot be read is skipped with a warning
    /// and prepared lazily on first use instead.
    pub async fn init(config: TrestleConfig) -> anyhow::Result<Trestle> {
        let TrestleConfig {
            account,
            factory,
            plugins,
            mcp,
            initial_pool_size,
            drop_excess_requests,
        } = config;

        let engine = Trestle {
            account,
            factory,
            plugins: Arc::from(plugins),
            providers: StdRwLock::new(HashMap::new()),
            pipeline_pool: Pool::new(PluginPipeline::default, PluginPipeline::clear),
            mcp: StdRwLock::new(None),
            drop_excess_requests: AtomicBool::new(drop_excess_requests),
        };
        engine.pipeline_pool.prewarm(initial_pool_size);

        if let Some(mcp_config) = mcp {
            let manager = McpManager::from_config(mcp_config).await;
            *engine.mcp.write().unwrap() = Some(Arc::new(manager));
            info!("MCP integration initialized");
        }

        for kind in engine.account.configured_providers()? {
            let provider_config = match engine.account.config_for_provider(kind) {
                Ok(provider_config) => provider_config,
                Err(err) => {
                    warn!(provider = %kind, "failed to get config for provider, skipping init: {err:#}");
                    continue;
                }
            };
            let mut map = engine.providers.write().unwrap();
            match engine.build_runtime(kind, &provider_config) {
                Ok(runtime) => {
                    map.insert(
                        kind,
                        Arc::new(ProviderSlot {
                            runtime: RwLock::new(runtime),
                        }),
                    );
                }
                Err(err) => warn!(provider = %kind, "failed to prepare provider: {err:#}"),
            }
        }

        Ok(engine)
    }

    // PUBLIC REQUEST METHODS

    pub async fn text_completion(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Response, TrestleError> {
        if !matches!(request.input, RequestInput::TextCompletion(_)) {
            return Err(TrestleError::from_message(
                "text not provided for text completion request",
            )
            .with_provider(request.provider));
        }
        self.handle_request(&cancel, request, RequestKind::TextCompletion)
            .await
    }

    pub async fn chat_completion(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Response, TrestleError> {
        if !matches!(request.input, RequestInput::ChatCompletion(_)) {
            return Err(TrestleError::from_message(
                "chat messages not provided for chat completion request",
            )
            .with_provider(request.provider));
        }
        self.handle_request(&cancel, request, RequestKind::ChatCompletion)
            .await
    }

    pub async fn chat_completion_stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<ResponseStream, TrestleError> {
        if !matches!(request.input, RequestInput::ChatCompletion(_)) {
            return Err(TrestleError::from_message(
                "chat messages not provided for chat completion stream request",
            )
            .with_provider(request.provider));
        }
        self.handle_stream_request(&cancel, request, RequestKind::ChatCompletionStream)
            .await
    }

    pub async fn embedding(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Response, TrestleError> {
        if !matches!(request.input, RequestInput::Embedding(_)) {
            return Err(TrestleError::from_message(
                "embedding input not provided for embedding request",
            )
            .with_provider(request.provider));
        }
        self.handle_request(&cancel, request, RequestKind::Embedding)
            .await
    }

    pub async fn speech(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Response, TrestleError> {
        if !matches!(request.input, RequestInput::Speech(_)) {
            return Err(TrestleError::from_message(
                "speech input not provided for speech request",
            )
            .with_provider(request.provider));
        }
        self.handle_request(&cancel, request, RequestKind::Speech).await
    }

    pub async fn speech_stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<ResponseStream, TrestleError> {
        if !matches!(request.input, RequestInput::Speech(_)) {
            return Err(TrestleError::from_message(
                "speech input not provided for speech stream request",
            )
            .with_provider(request.provider));
        }
        self.handle_stream_request(&cancel, request, RequestKind::SpeechStream)
            .await
    }

    pub async fn transcription(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Response, TrestleError> {
        if !matches!(request.input, RequestInput::Transcription(_)) {
            return Err(TrestleError::from_message(
                "transcription input not provided for transcription request",
            )
            .with_provider(request.provider));
        }
        self.handle_request(&cancel, request, RequestKind::Transcription)
            .await
    }

    pub async fn transcription_stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<ResponseStream, TrestleError> {
        if !matches!(request.input, RequestInput::Transcription(_)) {
            return Err(TrestleError::from_message(
                "transcription input not provided for transcription stream request",
            )
            .with_provider(request.provider));
        }
        self.handle_stream_request(&cancel, request, RequestKind::TranscriptionStream)
            .await
    }

    // RUNTIME CONFIGURATION

    pub fn drop_excess_requests(&self) -> bool {
        self.drop_excess_requests.load(Ordering::Relaxed)
    }

    pub fn update_drop_excess_requests(&self, value: bool) {
        self.drop_excess_requests.store(value, Ordering::Relaxed);
        info!("drop_excess_requests updated to {value}");
    }

    /// Re-reads the provider's configuration and swaps in a queue and worker
    /// pool sized to it, without losing buffered or in-flight work. Buffered
    /// admissions move to the new queue; any that cannot be forwarded within
    /// [`TRANSFER_TIMEOUT`] receive an explicit error. Old workers finish
    /// their in-flight requests before the new pool starts.
    pub async fn update_provider_concurrency(&self, kind: ProviderKind) -> anyhow::Result<()> {
        info!(provider = %kind, "updating concurrency configuration");

        let provider_config = self
            .account
            .config_for_provider(kind)
            .map_err(|err| anyhow::anyhow!("failed to get updated config for provider {kind}: {err}"))?;

        let slot = self.providers.read().unwrap().get(&kind).cloned();
        let Some(slot) = slot else {
            debug!(provider = %kind, "provider not currently active, initializing with new configuration");
            let mut map = self.providers.write().unwrap();
            if !map.contains_key(&kind) {
                let runtime = self.build_runtime(kind, &provider_config)?;
                map.insert(
                    kind,
                    Arc::new(ProviderSlot {
                        runtime: RwLock::new(runtime),
                    }),
                );
            }
            return Ok(());
        };

        let mut runtime = slot.runtime.write().await;

        let sizes = provider_config.concurrency_and_buffer_size;
        let new_queue: RequestQueue<Admission> = RequestQueue::new(sizes.buffer_size);

        // Forward buffered work so no caller is silently dropped.
        let buffered = runtime.queue.drain();
        let mut transferred = 0usize;
        let mut transfers = Vec::new();
        for admission in buffered {
            match new_queue.try_send(admission) {
                Ok(()) => transferred += 1,
                Err(err) => {
                    let admission = err.into_inner();
                    let error_tx = admission.error_tx.clone();
                    let target = new_queue.clone();
                    transfers.push(tokio::spawn(async move {
                        tokio::select! {
                            sent = target.send(admission) => {
                                if sent.is_err() {
                                    warn!("new queue closed while transferring buffered request");
                                    let _ = error_tx.try_send(TrestleError::from_message(
                                        "request failed during provider concurrency update",
                                    ));
                                }
                            }
                            _ = tokio::time::sleep(TRANSFER_TIMEOUT) => {
                                warn!("failed to transfer buffered request to new queue within timeout");
                                let _ = error_tx.try_send(TrestleError::from_message(
                                    "request failed during provider concurrency update",
                                ));
                            }
                        }
                    }));
                }
            }
        }
        for transfer in transfers {
            let _ = transfer.await;
        }
        if transferred > 0 {
            info!(provider = %kind, transferred, "transferred buffered requests to new queue");
        }

        // Close the old queue, park the new one in its place, and let the old
        // workers finish what they already dequeued.
        runtime.queue.close();
        let old_workers = std::mem::take(&mut runtime.workers);
        runtime.queue = new_queue.clone();
        for worker in old_workers {
            let _ = worker.await;
        }
        debug!(provider = %kind, "all previous workers stopped");

        let provider = self.factory.create(kind, &provider_config)?;
        let context = Arc::new(WorkerContext {
            account: Arc::clone(&self.account),
            provider,
            plugins: Arc::clone(&self.plugins),
        });
        runtime.workers = spawn_workers(sizes.concurrency, context, new_queue);

        info!(
            provider = %kind,
            concurrency = sizes.concurrency,
            buffer_size = sizes.buffer_size,
            "concurrency configuration updated"
        );
        Ok(())
    }

    // MCP PUBLIC API

    /// Registers an in-process typed tool made available to all requests.
    pub async fn register_mcp_tool(
        &self,
        name: &str,
        handler: ToolHandler,
        descriptor: Tool,
    ) -> Result<(), McpError> {
        let manager = self.mcp_manager().ok_or(McpError::NotConfigured)?;
        manager.register_tool(name, handler, descriptor).await
    }

    /// Executes a tool call from an assistant message and returns the tool
    /// message to append to the conversation.
    pub async fn execute_mcp_tool(
        &self,
        cancel: CancellationToken,
        call: &ToolCall,
    ) -> Result<ChatMessage, TrestleError> {
        let Some(manager) = self.mcp_manager() else {
            return Err(TrestleError::from_message(
                "MCP is not configured in this engine instance",
            ));
        };
        manager
            .execute_tool(cancel, call)
            .await
            .map_err(|err| TrestleError::from_message(err.to_string()))
    }

    pub async fn get_mcp_clients(&self) -> Result<Vec<McpClientInfo>, McpError> {
        let manager = self.mcp_manager().ok_or(McpError::NotConfigured)?;
        Ok(manager.get_clients().await)
    }

    /// Adds an MCP client at runtime, bootstrapping the manager when MCP was
    /// not configured at init.
    pub async fn add_mcp_client(&self, config: McpClientConfig) -> Result<(), McpError> {
        let manager = {
            let mut guard = self.mcp.write().unwrap();
            Arc::clone(guard.get_or_insert_with(|| Arc::new(McpManager::new())))
        };
        manager.add_client(config).await
    }

    pub async fn remove_mcp_client(&self, name: &str) -> Result<(), McpError> {
        let manager = self.mcp_manager().ok_or(McpError::NotConfigured)?;
        manager.remove_client(name).await
    }

    pub async fn edit_mcp_client_tools(
        &self,
        name: &str,
        tools_to_add: Vec<String>,
        tools_to_remove: Vec<String>,
    ) -> Result<(), McpError> {
        let manager = self.mcp_manager().ok_or(McpError::NotConfigured)?;
        manager
            .edit_client_tools(name, tools_to_add, tools_to_remove)
            .await
    }

    pub async fn reconnect_mcp_client(&self, name: &str) -> Result<(), McpError> {
        let manager = self.mcp_manager().ok_or(McpError::NotConfigured)?;
        manager.reconnect_client(name).await
    }

    /// Closes every provider queue, waits for workers to finish in-flight
    /// work, then cleans up the MCP manager and each plugin.
    pub async fn cleanup(&self) {
        info!("graceful cleanup initiated, closing all request queues");

        let slots: Vec<Arc<ProviderSlot>> =
            self.providers.read().unwrap().values().cloned().collect();
        for slot in slots {
            let mut runtime = slot.runtime.write().await;
            runtime.queue.close();
            for worker in std::mem::take(&mut runtime.workers) {
                let _ = worker.await;
            }
        }

        if let Some(manager) = self.mcp_manager() {
            manager.cleanup().await;
        }

        for plugin in self.plugins.iter() {
            if let Err(err) = plugin.cleanup().await {
                warn!(plugin = plugin.name(), "error cleaning up plugin: {err:#}");
            }
        }

        info!("graceful cleanup completed");
    }

    // CORE INTERNALS

    fn mcp_manager(&self) -> Option<Arc<McpManager>> {
        self.mcp.read().unwrap().clone()
    }

    fn build_runtime(
        &self,
        kind: ProviderKind,
        config: &crate::account::ProviderConfig,
    ) -> anyhow::Result<ProviderRuntime> {
        let provider = self.factory.create(kind, config)?;
        let sizes = config.concurrency_and_buffer_size;
        let queue: RequestQueue<Admission> = RequestQueue::new(sizes.buffer_size);
        let context = Arc::new(WorkerContext {
            account: Arc::clone(&self.account),
            provider,
            plugins: Arc::clone(&self.plugins),
        });
        let workers = spawn_workers(sizes.concurrency, context, queue.clone());
        Ok(ProviderRuntime { queue, workers })
    }

    /// Returns the provider's slot, preparing queue and workers on first use
    /// (double-checked under the map write lock).
    fn provider_slot(&self, kind: ProviderKind) -> anyhow::Result<Arc<ProviderSlot>> {
        if let Some(slot) = self.providers.read().unwrap().get(&kind) {
            return Ok(Arc::clone(slot));
        }

        let mut map = self.providers.write().unwrap();
        if let Some(slot) = map.get(&kind) {
            return Ok(Arc::clone(slot));
        }

        debug!(provider = %kind, "creating request queue for provider at runtime");
        let config = self.account.config_for_provider(kind)?;
        let runtime = self.build_runtime(kind, &config)?;
        let slot = Arc::new(ProviderSlot {
            runtime: RwLock::new(runtime),
        });
        map.insert(kind, Arc::clone(&slot));
        Ok(slot)
    }

    fn acquire_pipeline(&self) -> PipelineGuard<'_> {
        let mut pipeline = self.pipeline_pool.get();
        pipeline.reset(Arc::clone(&self.plugins));
        PipelineGuard {
            pool: &self.pipeline_pool,
            pipeline: Some(pipeline),
        }
    }

    fn wants_tool_augmentation(kind: RequestKind) -> bool {
        !matches!(
            kind,
            RequestKind::Embedding
                | RequestKind::Speech
                | RequestKind::SpeechStream
                | RequestKind::TranscriptionStream
        )
    }

    /// Non-blocking admission first; a full queue either fails fast under
    /// the drop-excess policy or blocks until space, racing the caller's
    /// cancellation. A closed queue means a reconfiguration swap is in
    /// flight, so the queue is re-read under the provider lock.
    async fn admit(
        &self,
        slot: &ProviderSlot,
        admission: Admission,
        cancel: &CancellationToken,
    ) -> Result<(), TrestleError> {
        let mut admission = admission;
        for _ in 0..QUEUE_REACQUIRE_ATTEMPTS {
            let queue = slot.runtime.read().await.queue.clone();
            match queue.try_send(admission) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(item)) => {
                    admission = item;
                    continue;
                }
                Err(TrySendError::Full(item)) => {
                    if self.drop_excess_requests() {
                        warn!(
                            "request dropped: queue is full, increase the buffer size or disable drop_excess_requests"
                        );
                        return Err(TrestleError::from_message("request dropped: queue is full"));
                    }
                    admission = item;
                    tokio::select! {
                        sent = queue.send(admission) => match sent {
                            Ok(()) => return Ok(()),
                            Err(item) => {
                                admission = item;
                                continue;
                            }
                        },
                        _ = cancel.cancelled() => {
                            return Err(TrestleError::cancelled(
                                "request cancelled while waiting for queue space",
                            ));
                        }
                    }
                }
            }
        }
        Err(TrestleError::internal(
            "provider queue unavailable during reconfiguration",
        ))
    }

    /// One attempt against one provider: tool augmentation, pre-hooks (with
    /// short-circuit), admission, then exactly one outcome reconciled through
    /// the post-hooks.
    async fn try_request(
        &self,
        mut request: Request,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> Result<Response, TrestleError> {
        let slot = self
            .provider_slot(request.provider)
            .map_err(TrestleError::from_error)?;

        if Self::wants_tool_augmentation(kind) {
            if let Some(manager) = self.mcp_manager() {
                manager.add_tools_to_request(&mut request).await;
            }
        }

        let mut pipeline = self.acquire_pipeline();
        if let Some(short_circuit) = pipeline.run_pre_hooks(cancel, &mut request).await {
            let executed = pipeline.executed_pre_hooks();
            let (response, error) = pipeline
                .run_post_hooks(cancel, short_circuit.response, short_circuit.error, executed)
                .await;
            return outcome_to_result(response, error);
        }

        let (response_tx, mut response_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(1);
        let admission = Admission {
            request,
            kind,
            cancel: cancel.clone(),
            response_tx,
            error_tx,
            stream_tx: None,
        };
        self.admit(&slot, admission, cancel).await?;

        let total = pipeline.plugin_count();
        let (response, error) = tokio::select! {
            Some(response) = response_rx.recv() => {
                pipeline.run_post_hooks(cancel, Some(response), None, total).await
            }
            Some(error) = error_rx.recv() => {
                pipeline.run_post_hooks(cancel, None, Some(error), total).await
            }
            _ = cancel.cancelled() => {
                let cancelled = TrestleError::cancelled("request cancelled while waiting for result");
                pipeline.run_post_hooks(cancel, None, Some(cancelled), total).await
            }
        };
        outcome_to_result(response, error)
    }

    /// Streaming variant of [`Self::try_request`]: the worker hands back a
    /// delta stream already wrapped by the post-hook runner, so only the
    /// short-circuit path runs post-hooks here.
    async fn try_stream_request(
        &self,
        mut request: Request,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> Result<ResponseStream, TrestleError> {
        let slot = self
            .provider_slot(request.provider)
            .map_err(TrestleError::from_error)?;

        if Self::wants_tool_augmentation(kind) {
            if let Some(manager) = self.mcp_manager() {
                manager.add_tools_to_request(&mut request).await;
            }
        }

        let mut pipeline = self.acquire_pipeline();
        if let Some(short_circuit) = pipeline.run_pre_hooks(cancel, &mut request).await {
            let executed = pipeline.executed_pre_hooks();
            let (response, error) = pipeline
                .run_post_hooks(cancel, short_circuit.response, short_circuit.error, executed)
                .await;
            return outcome_to_result(response, error).map(single_response_stream);
        }

        let (response_tx, _response_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(1);
        let (stream_tx, mut stream_rx) = mpsc::channel(1);
        let admission = Admission {
            request,
            kind,
            cancel: cancel.clone(),
            response_tx,
            error_tx,
            stream_tx: Some(stream_tx),
        };
        self.admit(&slot, admission, cancel).await?;

        tokio::select! {
            Some(stream) = stream_rx.recv() => Ok(stream),
            Some(error) = error_rx.recv() => Err(error),
            _ = cancel.cancelled() => Err(TrestleError::cancelled(
                "request cancelled while waiting for stream",
            )),
        }
    }

    fn should_try_fallbacks(request: &Request, error: &TrestleError) -> bool {
        !error.is_cancelled()
            && error.allow_fallbacks != Some(false)
            && !request.fallbacks.is_empty()
    }

    fn fallback_request(&self, request: &Request, fallback: &crate::request::Fallback) -> Option<Request> {
        if let Err(err) = self.account.config_for_provider(fallback.provider) {
            warn!(
                provider = %fallback.provider,
                "config not found for fallback provider, skipping: {err:#}"
            );
            return None;
        }
        let mut fallback_request = request.clone();
        fallback_request.provider = fallback.provider;
        fallback_request.model = fallback.model.clone();
        Some(fallback_request)
    }

    async fn handle_request(
        &self,
        cancel: &CancellationToken,
        request: Request,
        kind: RequestKind,
    ) -> Result<Response, TrestleError> {
        if let Err(err) = validate_request(&request) {
            return Err(err.with_provider(request.provider));
        }

        let mut primary_error = match self.try_request(request.clone(), kind, cancel).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if !Self::should_try_fallbacks(&request, &primary_error) {
            primary_error.provider = primary_error.provider.or(Some(request.provider));
            return Err(primary_error);
        }

        for fallback in &request.fallbacks {
            let Some(fallback_request) = self.fallback_request(&request, fallback) else {
                continue;
            };
            match self.try_request(fallback_request, kind, cancel).await {
                Ok(response) => {
                    info!(
                        provider = %fallback.provider,
                        model = %fallback.model,
                        "successfully used fallback provider"
                    );
                    return Ok(response);
                }
                Err(mut fallback_error) => {
                    if fallback_error.is_cancelled()
                        || fallback_error.allow_fallbacks == Some(false)
                    {
                        fallback_error.provider =
                            fallback_error.provider.or(Some(fallback.provider));
                        return Err(fallback_error);
                    }
                    warn!(
                        provider = %fallback.provider,
                        "fallback provider failed: {}",
                        fallback_error.error.message
                    );
                }
            }
        }

        primary_error.provider = primary_error.provider.or(Some(request.provider));
        Err(primary_error)
    }

    async fn handle_stream_request(
        &self,
        cancel: &CancellationToken,
        request: Request,
        kind: RequestKind,
    ) -> Result<ResponseStream, TrestleError> {
        if let Err(err) = validate_request(&request) {
            return Err(err.with_provider(request.provider));
        }

        let mut primary_error = match self.try_stream_request(request.clone(), kind, cancel).await {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };

        if !Self::should_try_fallbacks(&request, &primary_error) {
            primary_error.provider = primary_error.provider.or(Some(request.provider));
            return Err(primary_error);
        }

        for fallback in &request.fallbacks {
            let Some(fallback_request) = self.fallback_request(&request, fallback) else {
                continue;
            };
            match self.try_stream_request(fallback_request, kind, cancel).await {
                Ok(stream) => {
                    info!(
                        provider = %fallback.provider,
                        model = %fallback.model,
                        "successfully used fallback provider"
                    );
                    return Ok(stream);
                }
                Err(mut fallback_error) => {
                    if fallback_error.is_cancelled()
                        || fallback_error.allow_fallbacks == Some(false)
                    {
                        fallback_error.provider =
                            fallback_error.provider.or(Some(fallback.provider));
                        return Err(fallback_error);
                    }
                    warn!(
                        provider = %fallback.provider,
                        "fallback provider failed: {}",
                        fallback_error.error.message
                    );
                }
            }
        }

        primary_error.provider = primary_error.provider.or(Some(request.provider));
        Err(primary_error)
    }
}

fn validate_request(request: &Request) -> Result<(), TrestleError> {
    if request.model.trim().is_empty() {
        return Err(TrestleError::from_message("model not provided in request"));
    }
    Ok(())
}

/// Checkout guard that returns the pipeline scratch to the pool, with its
/// plugin references dropped, when the dispatch path finishes.
struct PipelineGuard<'a> {
    pool: &'a Pool<PluginPipeline>,
    pipeline: Option<PluginPipeline>,
}

impl Deref for PipelineGuard<'_> {
    type Target = PluginPipeline;

    fn deref(&self) -> &PluginPipeline {
        self.pipeline.as_ref().expect("pipeline checked out")
    }
}

impl DerefMut for PipelineGuard<'_> {
    fn deref_mut(&mut self) -> &mut PluginPipeline {
        self.pipeline.as_mut().expect("pipeline checked out")
    }
}

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.clear();
            self.pool.put(pipeline);
        }
    }
}
