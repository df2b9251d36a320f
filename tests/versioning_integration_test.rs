//! Version history integration
//!
//! Revert-then-continue flows, replay identity, and linearized concurrent
//! mutation, driven through the public agent surface.

use agent_runtime::{
    Agent, AgentConfig, HandlerOutcome, LanguageModel, ModelResponse, ScriptedModel,
    EVENT_AGENT_VERSION_CHANGE,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn config() -> AgentConfig {
    AgentConfig::builder().model("mock-model").build().unwrap()
}

fn agent_with(responses: Vec<ModelResponse>) -> (Agent, Arc<ScriptedModel>) {
    let model = Arc::new(ScriptedModel::new(responses));
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::clone(&model) as Arc<dyn LanguageModel>)
        .build()
        .unwrap();
    (agent, model)
}

/// Scenario: revert then continue.
///
/// After reverting past two turns, re-running with the same scripted reply
/// reproduces the originally observed assistant; the dropped messages stay
/// in the registry but are no longer referenced by the head.
#[tokio::test]
async fn revert_then_continue_reproduces_turn() {
    let (agent, model) = agent_with(vec![
        ModelResponse::text("mock-model", "first answer"),
        ModelResponse::text("mock-model", "second answer"),
    ]);
    agent.initialize().await.unwrap();

    agent.call(Some("turn one")).await.unwrap();
    let checkpoint = agent.version_id();
    let count_at_checkpoint = agent.messages().len();

    agent.call(Some("turn two")).await.unwrap();
    let dropped_ids: Vec<_> = agent
        .messages()
        .iter()
        .skip(count_at_checkpoint)
        .map(|m| m.id)
        .collect();
    assert!(!dropped_ids.is_empty());

    agent.revert_to_version(checkpoint).await.unwrap();
    assert_eq!(agent.messages().len(), count_at_checkpoint);

    // Same script as the original turn two.
    model.push_response(ModelResponse::text("mock-model", "second answer"));
    let replay = agent.call(Some("turn two")).await.unwrap();
    assert_eq!(replay.text(), "second answer");

    // The old turn-two messages survive in the registry, unreferenced.
    let head_ids = agent.versioning().head().message_ids.clone();
    for id in &dropped_ids {
        assert!(agent.store().registry().contains(*id));
        assert!(!head_ids.contains(id));
    }
}

/// Property: a reverted agent continues identically to a fresh agent built
/// from the same state and driven with the same script.
#[tokio::test]
async fn reverted_agent_matches_fresh_agent() {
    let (original, model) = agent_with(vec![
        ModelResponse::text("mock-model", "alpha"),
        ModelResponse::text("mock-model", "beta"),
    ]);
    original.initialize().await.unwrap();
    original.call(Some("one")).await.unwrap();
    let checkpoint = original.version_id();
    original.call(Some("two")).await.unwrap();
    original.revert_to_version(checkpoint).await.unwrap();

    // Fresh agent replaying the same pre-checkpoint conversation.
    let (fresh, fresh_model) = agent_with(vec![ModelResponse::text("mock-model", "alpha")]);
    fresh.initialize().await.unwrap();
    fresh.call(Some("one")).await.unwrap();

    // Drive both with identical scripts and inputs.
    model.push_response(ModelResponse::text("mock-model", "gamma"));
    fresh_model.push_response(ModelResponse::text("mock-model", "gamma"));
    let a = original.call(Some("three")).await.unwrap();
    let b = fresh.call(Some("three")).await.unwrap();

    assert_eq!(a.text(), b.text());
    let texts = |agent: &Agent| -> Vec<String> {
        agent.messages().iter().map(|m| m.text()).collect()
    };
    assert_eq!(texts(&original), texts(&fresh));
}

/// A revert to an unknown version fails without firing
/// `agent:version:change`; a successful revert fires it once with the real
/// new head.
#[tokio::test]
async fn failed_revert_fires_no_version_change() {
    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();
    agent.append_user("base").await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    agent.on(EVENT_AGENT_VERSION_CHANGE, move |ctx| {
        let seen = Arc::clone(&seen_clone);
        async move {
            seen.lock().unwrap().push(ctx.params.clone());
            Ok(HandlerOutcome::Continue)
        }
    });

    assert!(agent.revert_to_version(999).await.is_err());
    assert!(seen.lock().unwrap().is_empty());

    let new_head = agent.revert_to_version(0).await.unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["from"], json!(1));
    assert_eq!(seen[0]["to"], json!(0));
    assert_eq!(seen[0]["new_head"], json!(new_head));
}

/// Round-trip: `append; revert; append` mints a fresh ID for identical
/// content.
#[tokio::test]
async fn revert_append_mints_new_id() {
    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();

    agent.append_user("base").await.unwrap();
    let checkpoint = agent.version_id();

    let first = agent.append_user("again").await.unwrap();
    agent.revert_to_version(checkpoint).await.unwrap();
    let second = agent.append_user("again").await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.text(), second.text());
}

/// Property: concurrent mutating calls linearize; no partial mutation is
/// ever observable and nothing is lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_linearize() {
    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();

    let mut handles = Vec::new();
    for task in 0..4 {
        let agent = agent.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                agent.append_user(format!("t{task}-m{i}")).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(agent.messages().len(), 100);

    // Message IDs are strictly increasing in store order.
    let ids: Vec<_> = agent.messages().iter().map(|m| m.id).collect();
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0]);
    }

    // The version history is a linear order ending at the head.
    let history = agent.versioning().history();
    for pair in history.windows(2) {
        assert!(pair[1].id > pair[0].id);
    }
    assert_eq!(history.last().unwrap().message_ids.len(), 100);
}

/// Property: the materialized store always equals the replay of the head's
/// message IDs through the registry.
#[tokio::test]
async fn store_equals_head_replay() {
    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();

    agent.append_user("one").await.unwrap();
    agent.append_user("two").await.unwrap();
    agent
        .replace_at(0, agent_runtime::Message::user("one-rewritten"))
        .await
        .unwrap();
    agent.prepend(agent_runtime::Message::system("sys")).await.unwrap();

    let head = agent.versioning().head();
    let replayed = agent.store().registry().get_many(&head.message_ids).unwrap();
    let direct = agent.messages();

    assert_eq!(replayed.len(), direct.len());
    for (a, b) in replayed.iter().zip(direct.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.text(), b.text());
    }
}

/// `clear` commits an empty head; earlier versions stay materializable.
#[tokio::test]
async fn clear_keeps_history_materializable() {
    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();

    agent.append_user("kept in history").await.unwrap();
    let before_clear = agent.version_id();
    agent.clear().await.unwrap();

    assert!(agent.messages().is_empty());
    let old = agent.versioning().get(before_clear).unwrap();
    let replayed = agent.store().registry().get_many(&old.message_ids).unwrap();
    assert_eq!(replayed[0].text(), "kept in history");

    // And the old head can come back.
    agent.revert_to_version(before_clear).await.unwrap();
    assert_eq!(agent.messages().len(), 1);
}

/// Storage round-trip: serialize every message, reconstruct, and compare
/// rendered output.
#[tokio::test]
async fn storage_roundtrip_preserves_display() {
    use agent_runtime::{ContentPart, Message, PassthroughRenderer};

    let (agent, _model) = agent_with(vec![]);
    agent.initialize().await.unwrap();
    agent.set_context("user_name", json!("Ada"));

    agent.append_user("plain text").await.unwrap();
    agent
        .append(Message::user_with_parts(vec![ContentPart::template(
            "Hello {{user_name}}",
            vec!["user_name".to_string()],
            None,
        )]))
        .await
        .unwrap();

    for message in agent.messages() {
        let snapshot = message.serialize_for_storage().unwrap();
        let restored = Message::from_storage(snapshot).unwrap();
        assert_eq!(
            message.render(&PassthroughRenderer).unwrap(),
            restored.render(&PassthroughRenderer).unwrap()
        );
    }
}
