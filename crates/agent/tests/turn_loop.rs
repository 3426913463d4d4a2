//! Scenario tests for the Requesting / Dispatching loop.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::*;
use termagent_agent::AgentError;
use termagent_core::error::ProviderError;
use termagent_core::{
    ApprovalPolicy, Capabilities, DangerClass, ImageRef, Message, Provider, ProviderRequest,
    ProviderResponse, Role, StreamChunk, ToolStatus,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn plain_text_reply_takes_one_request() {
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![text("Hello!")])).build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let outcome = h
        .orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text, "Hello!");
    assert_eq!(outcome.batches, 0);
    assert!(!outcome.cancelled);
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert_eq!(session.stats.turns, 1);
    assert_eq!(session.stats.usage.total_tokens, 15);
}

#[tokio::test]
async fn batch_results_follow_request_order() {
    let read = StubTool::new("read", DangerClass::Safe);
    let count = read.counter();
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[
            ("c1", "read", r#"{"value":"a"}"#),
            ("c2", "read", r#"{"value":"b"}"#),
            ("c3", "read", r#"{"value":"c"}"#),
        ]),
        text("done"),
    ]))
    .tool(read)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let outcome = h
        .orchestrator
        .run_turn(&mut session, Message::user("go"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.tool_calls, 3);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // user, assistant(calls), 3 results, final assistant
    assert_eq!(session.messages.len(), 6);
    let results: Vec<_> = session.messages[2..5]
        .iter()
        .map(|m| (m.tool_call_id.clone().unwrap(), m.content.clone()))
        .collect();
    assert_eq!(
        results,
        vec![
            ("c1".to_string(), "read:a".to_string()),
            ("c2".to_string(), "read:b".to_string()),
            ("c3".to_string(), "read:c".to_string()),
        ]
    );

    // The second request carried the results back to the model.
    let second = &h.provider.requests()[1];
    assert_eq!(second.messages.last().unwrap().tool_call_id.as_deref(), Some("c3"));
}

#[tokio::test]
async fn malformed_arguments_never_reach_the_tool() {
    let read = StubTool::new("read", DangerClass::Safe);
    let count = read.counter();
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[
            ("c1", "read", r#"{"value": 42}"#),
            ("c2", "read", "{not json"),
            ("c3", "missing_tool", "{}"),
        ]),
        text("sorry"),
    ]))
    .tool(read)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    h.orchestrator
        .run_turn(&mut session, Message::user("go"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    let results = &session.messages[2..5];
    assert!(results.iter().all(|m| m.tool_status == Some(ToolStatus::Error)));
    assert!(results[0].content.contains("$.value"), "{}", results[0].content);
    assert!(results[2].content.contains("missing_tool"));
}

#[tokio::test]
async fn endless_tool_calls_hit_the_batch_limit() {
    let read = StubTool::new("read", DangerClass::Safe);
    let count = read.counter();
    let h = HarnessBuilder::new(
        ScriptedProvider::replies(vec![tool_calls(&[("c1", "read", r#"{"value":"x"}"#)])])
            .repeating(),
    )
    .tool(read)
    .configure(|c| c.max_tool_batches = 3)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let err = h
        .orchestrator
        .run_turn(&mut session, Message::user("loop"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::TurnLimitExceeded { limit: 3 }));
    assert!(err.is_recoverable());
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(h.provider.calls(), 4);
    assert!(session.validate_append(&Message::user("next")).is_ok());
}

#[tokio::test]
async fn session_stays_usable_after_turn_limit() {
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[("c1", "read", r#"{"value":"x"}"#)]),
        tool_calls(&[("c2", "read", r#"{"value":"y"}"#)]),
        text("recovered"),
    ]))
    .tool(StubTool::new("read", DangerClass::Safe))
    .configure(|c| c.max_tool_batches = 1)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    let err = h
        .orchestrator
        .run_turn(&mut session, Message::user("one"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::TurnLimitExceeded { limit: 1 }));
    // The over-limit request is not recorded.
    assert_eq!(session.messages.len(), 3);

    let outcome = h
        .orchestrator
        .run_turn(&mut session, Message::user("two"), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.text, "recovered");
    assert_eq!(session.messages.len(), 5);
}

#[tokio::test]
async fn transport_failure_keeps_user_message_only() {
    let h = HarnessBuilder::new(ScriptedProvider::new(vec![
        Step::Fail(|| ProviderError::AuthenticationFailed("bad key".into())),
        Step::Reply(text("back online")),
    ]))
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    let err = h
        .orchestrator
        .run_turn(&mut session, Message::user("hello"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Transport(_)));
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.stats.turns, 0);

    let outcome = h
        .orchestrator
        .run_turn(&mut session, Message::user("again"), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.text, "back online");
    assert_eq!(session.messages.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_are_retried() {
    let h = HarnessBuilder::new(ScriptedProvider::new(vec![
        Step::Fail(|| ProviderError::Network("connection reset".into())),
        Step::Fail(|| ProviderError::RateLimited { retry_after_secs: 1 }),
        Step::Reply(text("third time lucky")),
    ]))
    .configure(|c| c.retry.max_retries = 2)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let outcome = h
        .orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, "third time lucky");
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_after_max_retries() {
    let h = HarnessBuilder::new(ScriptedProvider::new(vec![
        Step::Fail(|| ProviderError::Network("connection reset".into())),
        Step::Fail(|| ProviderError::Network("connection reset".into())),
        Step::Fail(|| ProviderError::Network("connection reset".into())),
        Step::Reply(text("never reached")),
    ]))
    .configure(|c| c.retry.max_retries = 2)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let err = h
        .orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Transport(ProviderError::Network(_))));
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].role, Role::User);
}

/// Streams part of an answer, then drops the connection.
#[derive(Default)]
struct BreaksMidAnswer {
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for BreaksMidAnswer {
    fn name(&self) -> &str {
        "breaks-mid-answer"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tools: true,
            vision: false,
            streaming: true,
        }
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::InvalidRequest("streaming only".into()))
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let chunk = StreamChunk {
            content: Some("The answer is".into()),
            ..Default::default()
        };
        let _ = tx.send(Ok(chunk)).await;
        let _ = tx
            .send(Err(ProviderError::Network("connection reset".into())))
            .await;
        Ok(rx)
    }
}

#[tokio::test(start_paused = true)]
async fn no_retry_once_text_reached_the_user() {
    let provider = Arc::new(BreaksMidAnswer::default());
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![]))
        .provider_impl(Arc::clone(&provider) as Arc<dyn Provider>)
        .configure(|c| c.retry.max_retries = 3)
        .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    let err = h
        .orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Transport(ProviderError::Network(_))));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages.len(), 1);
}

#[tokio::test]
async fn instructions_are_sent_but_not_stored() {
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![text("ok")]))
        .configure(|c| c.instructions = Some("Be brief.".into()))
        .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    h.orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap();

    let request = &h.provider.requests()[0];
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[0].content, "Be brief.");
    assert!(session.messages.iter().all(|m| m.role != Role::System));
}

#[tokio::test]
async fn tools_offered_only_when_supported() {
    let h = HarnessBuilder::new(
        ScriptedProvider::replies(vec![text("plain")]).with_capabilities(Capabilities {
            tools: false,
            vision: false,
            streaming: false,
        }),
    )
    .tool(StubTool::new("read", DangerClass::Safe))
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    h.orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(h.provider.requests()[0].tools.is_empty());

    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![text("plain")]))
        .tool(StubTool::new("read", DangerClass::Safe))
        .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    h.orchestrator
        .run_turn(&mut session, Message::user("hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.provider.requests()[0].tools.len(), 1);
}

#[tokio::test]
async fn image_input_uses_vision_model_without_tools() {
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        text("a cat"),
        text("plain again"),
    ]))
    .tool(StubTool::new("read", DangerClass::Safe))
    .configure(|c| {
        c.model.name = Some("chat-model".into());
        c.model.vision_model = Some("eye-model".into());
    })
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    let image = ImageRef::from_path("photo.png");
    h.orchestrator
        .run_turn(&mut session, Message::user_with_image("what is this?", image), &cancel)
        .await
        .unwrap();
    h.orchestrator
        .run_turn(&mut session, Message::user("thanks"), &cancel)
        .await
        .unwrap();

    let requests = h.provider.requests();
    assert_eq!(requests[0].model, "eye-model");
    assert!(requests[0].tools.is_empty());
    assert_eq!(requests[1].model, "chat-model");
    assert_eq!(requests[1].tools.len(), 1);
}

#[tokio::test]
async fn duplicate_call_ids_are_made_unique() {
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[
            ("dup", "read", r#"{"value":"a"}"#),
            ("dup", "read", r#"{"value":"b"}"#),
        ]),
        text("done"),
    ]))
    .tool(StubTool::new("read", DangerClass::Safe))
    .approval(ApprovalPolicy::Auto)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    h.orchestrator
        .run_turn(&mut session, Message::user("go"), &CancellationToken::new())
        .await
        .unwrap();

    let issued: Vec<_> = session.messages[1]
        .tool_calls
        .iter()
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(issued[0], "dup");
    assert_ne!(issued[1], "dup");
    assert_eq!(session.messages[3].tool_call_id.as_deref(), Some(issued[1].as_str()));
}
