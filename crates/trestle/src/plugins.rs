//! Plugin pipeline: ordered pre-hooks, reverse-ordered post-hooks.
//!
//! The contract that everything else leans on: post-hooks run exactly once,
//! over exactly the prefix of plugins whose pre-hook ran, in reverse order —
//! whether the request short-circuited, succeeded, or failed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TrestleError;
use crate::request::Request;
use crate::response::{Response, ResponseStream};

/// A pre-hook decision to bypass the remaining pre-hooks and the provider
/// call, resolving the request with a response or an error.
#[derive(Debug, Clone, Default)]
pub struct ShortCircuit {
    pub response: Option<Response>,
    pub error: Option<TrestleError>,
}

impl ShortCircuit {
    pub fn with_response(response: Response) -> Self {
        ShortCircuit {
            response: Some(response),
            error: None,
        }
    }

    pub fn with_error(error: TrestleError) -> Self {
        ShortCircuit {
            response: None,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the provider call. May mutate the request in place,
    /// short-circuit with a response or error, or fail; a failure is logged
    /// and the pipeline continues.
    async fn pre_hook(
        &self,
        cancel: &CancellationToken,
        request: &mut Request,
    ) -> anyhow::Result<Option<ShortCircuit>>;

    /// Runs after the provider call (or short-circuit) in reverse order. May
    /// transform either value, recover from an error by filling `response`
    /// and clearing `error`, or invalidate a response by doing the opposite.
    async fn post_hook(
        &self,
        cancel: &CancellationToken,
        response: &mut Option<Response>,
        error: &mut Option<TrestleError>,
    ) -> anyhow::Result<()>;

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) type PluginSet = Arc<[Arc<dyn Plugin>]>;

/// Pooled scratch for one pipeline execution: tracks how many pre-hooks ran
/// and accumulates hook failures.
pub(crate) struct PluginPipeline {
    plugins: PluginSet,
    executed_pre_hooks: usize,
    pre_hook_errors: Vec<anyhow::Error>,
    post_hook_errors: Vec<anyhow::Error>,
}

impl Default for PluginPipeline {
    fn default() -> Self {
        PluginPipeline {
            plugins: Arc::from(Vec::new()),
            executed_pre_hooks: 0,
            pre_hook_errors: Vec::new(),
            post_hook_errors: Vec::new(),
        }
    }
}

impl PluginPipeline {
    pub(crate) fn reset(&mut self, plugins: PluginSet) {
        self.plugins = plugins;
        self.executed_pre_hooks = 0;
        self.pre_hook_errors.clear();
        self.post_hook_errors.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.reset(Arc::from(Vec::new()));
    }

    pub(crate) fn executed_pre_hooks(&self) -> usize {
        self.executed_pre_hooks
    }

    pub(crate) fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Runs pre-hooks in registration order, stopping at the first
    /// short-circuit.
    pub(crate) async fn run_pre_hooks(
        &mut self,
        cancel: &CancellationToken,
        request: &mut Request,
    ) -> Option<ShortCircuit> {
        let plugins = Arc::clone(&self.plugins);
        for (i, plugin) in plugins.iter().enumerate() {
            self.executed_pre_hooks = i + 1;
            match plugin.pre_hook(cancel, request).await {
                Ok(Some(short_circuit)) => return Some(short_circuit),
                Ok(None) => {}
                Err(err) => {
                    warn!(plugin = plugin.name(), "pre-hook failed: {err:#}");
                    self.pre_hook_errors.push(err);
                }
            }
        }
        None
    }

    /// Runs post-hooks in reverse order over the first `count` plugins, then
    /// reconciles: an error wins over a response unless the error is
    /// structurally empty, which counts as a recovery.
    pub(crate) async fn run_post_hooks(
        &mut self,
        cancel: &CancellationToken,
        mut response: Option<Response>,
        mut error: Option<TrestleError>,
        count: usize,
    ) -> (Option<Response>, Option<TrestleError>) {
        let plugins = Arc::clone(&self.plugins);
        let count = count.min(plugins.len());
        for plugin in plugins[..count].iter().rev() {
            if let Err(err) = plugin.post_hook(cancel, &mut response, &mut error).await {
                warn!(plugin = plugin.name(), "post-hook failed: {err:#}");
                self.post_hook_errors.push(err);
            }
        }

        match error {
            Some(err) if response.is_some() && err.is_structurally_empty() => (response, None),
            other => (response, other),
        }
    }
}

/// Maps a reconciled (response, error) pair onto the caller-facing result.
pub(crate) fn outcome_to_result(
    response: Option<Response>,
    error: Option<TrestleError>,
) -> Result<Response, TrestleError> {
    match (response, error) {
        (_, Some(err)) => Err(err),
        (Some(resp), None) => Ok(resp),
        (None, None) => Err(TrestleError::internal(
            "plugin pipeline produced neither a response nor an error",
        )),
    }
}

/// Post-hook execution handle passed to streaming adapters, invoked once per
/// delta. For streams every registered plugin's pre-hook ran, so the reverse
/// pass always covers the full set.
#[derive(Clone)]
pub struct PostHookRunner {
    plugins: PluginSet,
    cancel: CancellationToken,
}

impl PostHookRunner {
    pub(crate) fn new(plugins: PluginSet, cancel: CancellationToken) -> Self {
        PostHookRunner { plugins, cancel }
    }

    pub async fn run(
        &self,
        mut response: Option<Response>,
        mut error: Option<TrestleError>,
    ) -> (Option<Response>, Option<TrestleError>) {
        for plugin in self.plugins.iter().rev() {
            if let Err(err) = plugin
                .post_hook(&self.cancel, &mut response, &mut error)
                .await
            {
                warn!(plugin = plugin.name(), "post-hook failed on stream delta: {err:#}");
            }
        }
        match error {
            Some(err) if response.is_some() && err.is_structurally_empty() => (response, None),
            other => (response, other),
        }
    }
}

/// Applies `runner` to every element of a delta stream. Adapters that do not
/// need custom per-delta handling call this on their raw stream before
/// returning it.
pub fn wrap_stream(stream: ResponseStream, runner: PostHookRunner) -> ResponseStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            let (response, error) = match item {
                Ok(response) => runner.run(Some(response), None).await,
                Err(error) => runner.run(None, Some(error)).await,
            };
            if let Some(error) = error {
                yield Err(error);
            } else if let Some(response) = response {
                yield Ok(response);
            }
            // A post-hook may consume a delta entirely; nothing is yielded.
        }
    })
}
