//! Scenario tests for turns persisted through the file-backed store.

mod common;

use std::sync::Arc;

use common::*;
use termagent_core::{ApprovalPolicy, ApprovalResponse, DangerClass, Message, SessionStore};
use termagent_session::FileSessionStore;
use tokio_util::sync::CancellationToken;

fn file_store(dir: &tempfile::TempDir) -> Arc<FileSessionStore> {
    Arc::new(FileSessionStore::new(dir.path()))
}

#[tokio::test]
async fn checkpoint_resume_reconstructs_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[("c1", "read", r#"{"value":"a"}"#)]),
        text("read it"),
        text("after checkpoint"),
    ]))
    .tool(StubTool::new("read", DangerClass::Safe))
    .store(store.clone())
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    h.orchestrator
        .run_turn(&mut session, Message::user("one"), &cancel)
        .await
        .unwrap();
    let checkpoint = store.checkpoint(&session, Some("before-two")).await.unwrap();
    assert_eq!(checkpoint.message_count, 4);
    h.orchestrator
        .run_turn(&mut session, Message::user("two"), &cancel)
        .await
        .unwrap();

    // A fresh store over the same directory sees the same session.
    let reopened = FileSessionStore::new(dir.path());
    let resumed = reopened.resume(&session.id).await.unwrap();
    assert_eq!(resumed.messages, session.messages);
    assert_eq!(resumed.stats, session.stats);
    assert_eq!(resumed.stats.turns, 2);

    let restored = reopened.restore(&session.id, "before-two").await.unwrap();
    assert_eq!(restored.messages, session.messages[..4].to_vec());
}

#[tokio::test]
async fn auto_checkpoints_follow_turn_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        text("1"),
        text("2"),
        text("3"),
        text("4"),
    ]))
    .store(store.clone())
    .configure(|c| c.checkpoint_every_turns = 2)
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    for prompt in ["a", "b", "c", "d"] {
        h.orchestrator
            .run_turn(&mut session, Message::user(prompt), &cancel)
            .await
            .unwrap();
    }

    let checkpoints = store.checkpoints(&session.id).await.unwrap();
    let names: Vec<_> = checkpoints.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["checkpoint-001", "checkpoint-002"]);
    assert_eq!(checkpoints[0].message_count, 4);
    assert_eq!(checkpoints[1].message_count, 8);
}

#[tokio::test]
async fn session_approval_survives_resume() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let write = StubTool::new("write", DangerClass::RequiresApproval);
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![
        tool_calls(&[("c1", "write", r#"{"value":"a"}"#)]),
        text("done"),
    ]))
    .tool(write)
    .store(store.clone())
    .approval(ApprovalPolicy::OnRequest)
    .approver(ScriptedApprover::answering(vec![
        ApprovalResponse::ApproveAlwaysThisSession,
    ]))
    .build();
    let mut session = h.orchestrator.create_session().await.unwrap();

    h.orchestrator
        .run_turn(&mut session, Message::user("go"), &CancellationToken::new())
        .await
        .unwrap();

    let resumed = FileSessionStore::new(dir.path())
        .resume(&session.id)
        .await
        .unwrap();
    assert!(resumed.session_overrides().contains("write"));
    assert_eq!(resumed.approval, ApprovalPolicy::OnRequest);
}

#[tokio::test]
async fn cleared_history_stays_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let h = HarnessBuilder::new(ScriptedProvider::replies(vec![text("one"), text("two")]))
        .store(store.clone())
        .build();
    let mut session = h.orchestrator.create_session().await.unwrap();
    let cancel = CancellationToken::new();

    h.orchestrator
        .run_turn(&mut session, Message::user("first"), &cancel)
        .await
        .unwrap();
    store.truncate(&mut session, 0).await.unwrap();
    h.orchestrator
        .run_turn(&mut session, Message::user("second"), &cancel)
        .await
        .unwrap();

    // Only the post-clear exchange reaches the model and the log.
    let second = &h.provider.requests()[1];
    assert_eq!(second.messages.len(), 1);
    assert_eq!(second.messages[0].content, "second");
    let resumed = store.resume(&session.id).await.unwrap();
    assert_eq!(resumed.messages.len(), 2);
}
