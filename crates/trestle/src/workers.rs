//! Per-provider worker pool: dequeues admissions, selects credentials, runs
//! the retry loop around the adapter call, and publishes exactly one outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, Key};
use crate::error::TrestleError;
use crate::keys::select_key;
use crate::plugins::{PluginSet, PostHookRunner};
use crate::providers::retry::calculate_backoff;
use crate::providers::Provider;
use crate::queue::RequestQueue;
use crate::request::{Request, RequestInput, RequestKind};
use crate::response::{Response, ResponseStream};

/// Workers must never wedge on a vanished dispatcher; outcome publication is
/// abandoned after this long.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued request: the envelope plus the single-slot sinks the dispatcher
/// is waiting on. Exactly one of the sinks receives a value.
pub(crate) struct Admission {
    pub request: Request,
    pub kind: RequestKind,
    pub cancel: CancellationToken,
    pub response_tx: mpsc::Sender<Response>,
    pub error_tx: mpsc::Sender<TrestleError>,
    pub stream_tx: Option<mpsc::Sender<ResponseStream>>,
}

pub(crate) struct WorkerContext {
    pub account: Arc<dyn Account>,
    pub provider: Arc<dyn Provider>,
    pub plugins: PluginSet,
}

pub(crate) fn spawn_workers(
    count: usize,
    context: Arc<WorkerContext>,
    queue: RequestQueue<Admission>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|_| {
            let context = Arc::clone(&context);
            let queue = queue.clone();
            tokio::spawn(async move {
                worker_loop(context, queue).await;
            })
        })
        .collect()
}

async fn worker_loop(context: Arc<WorkerContext>, queue: RequestQueue<Admission>) {
    while let Some(admission) = queue.recv().await {
        process_admission(&context, admission).await;
    }
    debug!(provider = %context.provider.kind(), "worker exiting");
}

async fn process_admission(context: &WorkerContext, admission: Admission) {
    let kind = context.provider.kind();

    let key = if kind.requires_key() {
        let keys = match context
            .account
            .keys_for_provider(&admission.cancel, kind)
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                warn!(provider = %kind, "failed to load keys: {err:#}");
                publish_error(&admission, TrestleError::from_error(err)).await;
                return;
            }
        };
        match select_key(&keys, kind, &admission.request.model) {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    provider = %kind,
                    model = %admission.request.model,
                    "credential selection failed: {err}"
                );
                publish_error(&admission, TrestleError::from_message(err.to_string())).await;
                return;
            }
        }
    } else {
        Key::default()
    };

    let config = match context.account.config_for_provider(kind) {
        Ok(config) => config,
        Err(err) => {
            warn!(provider = %kind, "failed to load provider config: {err:#}");
            publish_error(&admission, TrestleError::from_error(err)).await;
            return;
        }
    };

    let retry = &config.network.retry;
    let mut attempts = 0usize;
    let mut last_error: Option<TrestleError> = None;
    let mut stream: Option<ResponseStream> = None;
    let mut response: Option<Response> = None;

    loop {
        if attempts > 0 {
            info!(
                provider = %kind,
                model = %admission.request.model,
                attempt = attempts,
                max_retries = retry.max_retries,
                "retrying request: {}",
                last_error
                    .as_ref()
                    .map(|err| err.error.message.as_str())
                    .unwrap_or("unknown error")
            );
            tokio::time::sleep(calculate_backoff(attempts - 1, retry)).await;
        }

        // A request cancelled before the first call never reaches the
        // adapter; mid-retry cancellation stops the loop the same way.
        if admission.cancel.is_cancelled() {
            last_error = Some(TrestleError::cancelled("request cancelled"));
            break;
        }

        // A panicking adapter must not take the worker down with it; the
        // panic surfaces to the caller as an infrastructural error.
        let err = if admission.kind.is_stream() {
            match AssertUnwindSafe(call_provider_stream(context, &admission, &key))
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => {
                    stream = Some(value);
                    last_error = None;
                    break;
                }
                Ok(Err(err)) => err,
                Err(panic) => panic_error(panic),
            }
        } else {
            match AssertUnwindSafe(call_provider(context, &admission, &key))
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => {
                    response = Some(value);
                    last_error = None;
                    break;
                }
                Ok(Err(err)) => err,
                Err(panic) => panic_error(panic),
            }
        };

        let retryable = err.is_retryable() && attempts < retry.max_retries;
        last_error = Some(err);
        if !retryable {
            break;
        }
        attempts += 1;
    }

    if let Some(mut err) = last_error {
        if attempts > 0 {
            warn!(
                provider = %kind,
                "request failed after {attempts} retr{}",
                if attempts == 1 { "y" } else { "ies" }
            );
        }
        err.provider = err.provider.or(Some(kind));
        publish_error(&admission, err).await;
    } else if let Some(stream) = stream {
        match admission.stream_tx.as_ref() {
            Some(sink) => publish(sink, stream, &admission.cancel, "stream").await,
            None => warn!(provider = %kind, "stream admission carried no stream sink"),
        }
    } else if let Some(response) = response {
        publish(&admission.response_tx, response, &admission.cancel, "response").await;
    }
}

async fn call_provider(
    context: &WorkerContext,
    admission: &Admission,
    key: &Key,
) -> Result<Response, TrestleError> {
    let request = &admission.request;
    let params = request.params.as_ref();
    let cancel = admission.cancel.clone();
    let provider = &context.provider;

    match (admission.kind, &request.input) {
        (RequestKind::TextCompletion, RequestInput::TextCompletion(text)) => {
            provider
                .text_completion(cancel, &request.model, key, text, params)
                .await
        }
        (RequestKind::ChatCompletion, RequestInput::ChatCompletion(messages)) => {
            provider
                .chat_completion(cancel, &request.model, key, messages, params)
                .await
        }
        (RequestKind::Embedding, RequestInput::Embedding(texts)) => {
            provider
                .embedding(cancel, &request.model, key, texts, params)
                .await
        }
        (RequestKind::Speech, RequestInput::Speech(input)) => {
            provider
                .speech(cancel, &request.model, key, input, params)
                .await
        }
        (RequestKind::Transcription, RequestInput::Transcription(input)) => {
            provider
                .transcription(cancel, &request.model, key, input, params)
                .await
        }
        (kind, _) => Err(TrestleError::internal(format!(
            "request input does not match request kind {kind}"
        ))),
    }
}

async fn call_provider_stream(
    context: &WorkerContext,
    admission: &Admission,
    key: &Key,
) -> Result<ResponseStream, TrestleError> {
    let request = &admission.request;
    let params = request.params.as_ref();
    let cancel = admission.cancel.clone();
    let provider = &context.provider;
    // Every registered plugin's pre-hook ran before admission, so the runner
    // covers the full set for each delta.
    let runner = PostHookRunner::new(Arc::clone(&context.plugins), admission.cancel.clone());

    match (admission.kind, &request.input) {
        (RequestKind::ChatCompletionStream, RequestInput::ChatCompletion(messages)) => {
            provider
                .chat_completion_stream(cancel, runner, &request.model, key, messages, params)
                .await
        }
        (RequestKind::SpeechStream, RequestInput::Speech(input)) => {
            provider
                .speech_stream(cancel, runner, &request.model, key, input, params)
                .await
        }
        (RequestKind::TranscriptionStream, RequestInput::Transcription(input)) => {
            provider
                .transcription_stream(cancel, runner, &request.model, key, input, params)
                .await
        }
        (kind, _) => Err(TrestleError::internal(format!(
            "request input does not match request kind {kind}"
        ))),
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> TrestleError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "adapter panicked".to_string());
    TrestleError::internal(format!("provider call panicked: {message}"))
}

async fn publish_error(admission: &Admission, error: TrestleError) {
    publish(&admission.error_tx, error, &admission.cancel, "error").await;
}

/// Publishes one outcome without ever blocking the worker indefinitely: the
/// sink is single-slot so the send normally completes immediately, and a
/// vanished or cancelled caller is logged and abandoned.
async fn publish<T>(sink: &mpsc::Sender<T>, value: T, cancel: &CancellationToken, what: &str) {
    tokio::select! {
        sent = sink.send(value) => {
            if sent.is_err() {
                debug!("caller dropped its {what} sink before delivery");
            }
        }
        _ = cancel.cancelled() => {
            debug!("caller cancelled while delivering {what}");
        }
        _ = tokio::time::sleep(PUBLISH_TIMEOUT) => {
            warn!("timed out delivering {what}; caller may have disconnected");
        }
    }
}
