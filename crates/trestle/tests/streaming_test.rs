//! Streaming contract: delta delivery, per-delta post-hooks, pre-stream
//! retry, and short-circuited streams.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use common::{build_engine, provider_config, Behavior, MockAccount, MockFactory, MockProvider};
use trestle::error::TrestleError;
use trestle::plugins::{Plugin, ShortCircuit};
use trestle::providers::ProviderKind;
use trestle::request::{ChatMessage, Request};
use trestle::response::Response;

fn chat_request(model: &str) -> Request {
    Request::chat(
        ProviderKind::OpenAi,
        model,
        vec![ChatMessage::user("stream it")],
    )
}

fn delta(id: &str, text: &str) -> Response {
    Response::with_text(id, "gpt-4o-mini", text)
}

#[tokio::test]
async fn stream_delivers_deltas_in_order_and_ends() {
    let provider = MockProvider::new(ProviderKind::OpenAi);
    provider.push(Behavior::Stream(vec![
        Ok(delta("d1", "hel")),
        Ok(delta("d2", "lo")),
    ]));

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 0),
    );
    let engine = build_engine(account, MockFactory::with(vec![provider.clone()]), Vec::new()).await;

    let mut stream = engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
        .unwrap();

    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().id);
    }
    assert_eq!(ids, vec!["d1", "d2"]);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn terminal_error_is_delivered_as_stream_element() {
    let provider = MockProvider::new(ProviderKind::OpenAi);
    provider.push(Behavior::Stream(vec![
        Ok(delta("d1", "partial")),
        Err(TrestleError::from_message("connection reset mid-stream")),
    ]));

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 3),
    );
    let engine = build_engine(account, MockFactory::with(vec![provider.clone()]), Vec::new()).await;

    let mut stream = engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
        .unwrap();

    assert!(stream.next().await.unwrap().is_ok());
    let terminal = stream.next().await.unwrap().unwrap_err();
    assert_eq!(terminal.error.message, "connection reset mid-stream");
    assert!(stream.next().await.is_none());
    // In-flight stream failures are not retried.
    assert_eq!(provider.call_count(), 1);
}

struct UppercasePlugin;

#[async_trait]
impl Plugin for UppercasePlugin {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn pre_hook(
        &self,
        _cancel: &CancellationToken,
        _request: &mut Request,
    ) -> anyhow::Result<Option<ShortCircuit>> {
        Ok(None)
    }

    async fn post_hook(
        &self,
        _cancel: &CancellationToken,
        response: &mut Option<Response>,
        _error: &mut Option<TrestleError>,
    ) -> anyhow::Result<()> {
        if let Some(response) = response {
            for choice in &mut response.choices {
                if let Some(message) = &mut choice.message {
                    if let Some(content) = &mut message.content {
                        *content = content.to_uppercase();
                    }
                }
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn post_hooks_transform_every_delta() {
    let provider = MockProvider::new(ProviderKind::OpenAi);
    provider.push(Behavior::Stream(vec![
        Ok(delta("d1", "one")),
        Ok(delta("d2", "two")),
    ]));

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 0),
    );
    let engine = build_engine(
        account,
        MockFactory::with(vec![provider]),
        vec![Arc::new(UppercasePlugin)],
    )
    .await;

    let mut stream = engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
        .unwrap();

    let mut contents = Vec::new();
    while let Some(item) = stream.next().await {
        let response = item.unwrap();
        contents.push(
            response.choices[0]
                .message
                .as_ref()
                .unwrap()
                .content
                .clone()
                .unwrap(),
        );
    }
    assert_eq!(contents, vec!["ONE", "TWO"]);
}

#[tokio::test]
async fn pre_stream_errors_are_retried_before_a_stream_exists() {
    let provider = MockProvider::new(ProviderKind::OpenAi);
    provider
        .push(Behavior::Fail(
            TrestleError::from_message("gateway timeout").with_status(504),
        ))
        .push(Behavior::Stream(vec![Ok(delta("d1", "recovered"))]));

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 1),
    );
    let engine = build_engine(account, MockFactory::with(vec![provider.clone()]), Vec::new()).await;

    let mut stream = engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().id, "d1");
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn non_retryable_pre_stream_error_is_returned() {
    let provider = MockProvider::new(ProviderKind::OpenAi);
    provider.push(Behavior::Fail(
        TrestleError::from_message("invalid api key").with_status(401),
    ));

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 2),
    );
    let engine = build_engine(account, MockFactory::with(vec![provider.clone()]), Vec::new()).await;

    let err = match engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
    {
        Ok(_) => panic!("expected chat_completion_stream to return an error"),
        Err(e) => e,
    };

    assert_eq!(err.status_code, Some(401));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn short_circuit_wraps_response_in_single_element_stream() {
    let provider = MockProvider::new(ProviderKind::OpenAi);

    struct CachePlugin;

    #[async_trait]
    impl Plugin for CachePlugin {
        fn name(&self) -> &str {
            "cache"
        }

        async fn pre_hook(
            &self,
            _cancel: &CancellationToken,
            _request: &mut Request,
        ) -> anyhow::Result<Option<ShortCircuit>> {
            Ok(Some(ShortCircuit::with_response(Response::with_text(
                "cached", "m", "hit",
            ))))
        }

        async fn post_hook(
            &self,
            _cancel: &CancellationToken,
            _response: &mut Option<Response>,
            _error: &mut Option<TrestleError>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let account = MockAccount::new().with_provider(
        ProviderKind::OpenAi,
        provider_config(1, 4, 0),
    );
    let engine = build_engine(
        account,
        MockFactory::with(vec![provider.clone()]),
        vec![Arc::new(CachePlugin)],
    )
    .await;

    let mut stream = engine
        .chat_completion_stream(CancellationToken::new(), chat_request("gpt-4o-mini"))
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().id, "cached");
    assert!(stream.next().await.is_none());
    assert_eq!(provider.call_count(), 0);
}
