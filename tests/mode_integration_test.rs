//! Mode integration
//!
//! Isolation through the agent surface, model-driven transitions via the
//! synthetic enter tool, and switch application at iteration boundaries.

use agent_runtime::{
    Agent, AgentConfig, ExecuteOptions, IsolationLevel, ModeDefinition, ModelResponse,
    ScriptedModel, ToolCallRequest,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

fn config() -> AgentConfig {
    AgentConfig::builder().model("mock-model").build().unwrap()
}

fn noop_mode(name: &str) -> ModeDefinition {
    ModeDefinition::builder(name)
        .setup(|_ctx| async { Ok(()) })
        .cleanup(|_ctx| async { Ok(()) })
        .build()
        .unwrap()
}

/// Scenario: thread isolation.
///
/// `version_id` is V at entry; the mode appends three messages; on scope
/// exit `version_id` materializes to the pre-entry content.
#[tokio::test]
async fn thread_isolation_restores_conversation() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(noop_mode("scratch"))
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    agent.append_user("keep me").await.unwrap();
    let entry_version = agent.version_id();

    let guard = agent
        .mode_with("scratch", json!({}), IsolationLevel::Thread)
        .await
        .unwrap();
    agent.append_user("scratch 1").await.unwrap();
    agent.append_user("scratch 2").await.unwrap();
    agent.append_user("scratch 3").await.unwrap();
    assert_eq!(agent.messages().len(), 4);

    guard.exit().await.unwrap();

    let texts: Vec<String> = agent.messages().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["keep me"]);
    // Append-only history: same contents as the entry version, new head.
    let head = agent.versioning().head();
    assert_eq!(
        head.message_ids,
        agent.versioning().get(entry_version).unwrap().message_ids
    );
}

/// Config isolation restores model settings changed inside the mode.
#[tokio::test]
async fn config_isolation_restores_settings() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(
            ModeDefinition::builder("precise")
                .setup(|ctx| async move {
                    ctx.config.write().unwrap().set_temperature(0.0).unwrap();
                    Ok(())
                })
                .cleanup(|_ctx| async { Ok(()) })
                .isolation(IsolationLevel::Config)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let before = agent.config().temperature();
    let guard = agent.mode("precise", json!({})).await.unwrap();
    assert_eq!(agent.config().temperature(), 0.0);
    guard.exit().await.unwrap();
    assert_eq!(agent.config().temperature(), before);
}

/// An invokable mode's synthetic tool defers the switch until the iteration
/// boundary, where the execute loop applies it.
#[tokio::test]
async fn invokable_mode_switch_applied_by_execute() {
    let model = Arc::new(ScriptedModel::new(vec![
        // Round 1: the model asks to enter the mode.
        ModelResponse::with_tool_calls(
            "mock-model",
            "",
            vec![ToolCallRequest::new("t1", "enter_focus", json!({}))],
        ),
        // Round 2: inside the mode.
        ModelResponse::text("mock-model", "focused now"),
    ]));

    let agent = Agent::builder()
        .config(config())
        .language_model(model)
        .mode(
            ModeDefinition::builder("focus")
                .setup(|ctx| async move {
                    ctx.state.set("entered", json!(true));
                    Ok(())
                })
                .cleanup(|_ctx| async { Ok(()) })
                .invokable(true)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    agent.initialize().await.unwrap();
    agent.append_user("please focus").await.unwrap();

    let mut stream = agent.execute(ExecuteOptions::default());

    // Assistant requesting the tool; the transition is still pending.
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.has_tool_calls());

    let mut rest = Vec::new();
    while let Some(item) = stream.next().await {
        rest.push(item.unwrap());
    }
    drop(stream);

    // Tool response confirming the schedule, then the in-mode assistant.
    assert!(rest[0].text().contains("transition scheduled"));
    assert_eq!(rest.last().unwrap().text(), "focused now");

    // The mode was entered by the loop at the boundary.
    assert_eq!(agent.mode_stack(), vec!["focus".to_string()]);
    assert_eq!(
        agent.mode_state().unwrap().get("entered"),
        Some(json!(true))
    );
}

/// `mode_switch` requested mid-conversation is applied at the next
/// iteration and recorded in history; `mode_return_to_previous` unwinds it.
#[tokio::test]
async fn switch_and_return_use_history() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(noop_mode("first"))
        .mode(noop_mode("second"))
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let _guard = agent.mode("first", json!({"n": 1})).await.unwrap();
    agent.mode_switch("second", json!({"n": 2}));
    assert!(agent.pending_mode_transition().is_some());

    // Drive one empty execute to hit the iteration boundary.
    let mut stream = agent.execute(ExecuteOptions::with_max_iterations(1));
    while stream.next().await.is_some() {}
    drop(stream);

    assert_eq!(agent.mode_stack(), vec!["second".to_string()]);
    assert_eq!(agent.mode_history(), vec!["first".to_string()]);

    agent.mode_return_to_previous();
    let mut stream = agent.execute(ExecuteOptions::with_max_iterations(1));
    while stream.next().await.is_some() {}
    drop(stream);

    assert_eq!(agent.mode_stack(), vec!["first".to_string()]);
    assert!(agent.mode_history().is_empty());
}

/// Fork isolation: the mode runs on a fork; without an explicit merge the
/// parent conversation is untouched.
#[tokio::test]
async fn fork_isolation_discards_by_default() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(noop_mode("sandbox"))
        .build()
        .unwrap();
    agent.initialize().await.unwrap();
    agent.append_user("parent message").await.unwrap();

    let guard = agent
        .mode_with("sandbox", json!({}), IsolationLevel::Fork)
        .await
        .unwrap();
    let fork = guard.fork_agent().expect("fork isolation provides a fork");
    assert_eq!(fork.messages().len(), 1);
    fork.append_user("fork-only message").await.unwrap();
    guard.exit().await.unwrap();

    let texts: Vec<String> = agent.messages().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["parent message"]);
}

/// Fork isolation with `merge: true` in the frame state folds the fork's
/// new messages back into the parent.
#[tokio::test]
async fn fork_isolation_merges_on_request() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(noop_mode("sandbox"))
        .build()
        .unwrap();
    agent.initialize().await.unwrap();
    agent.append_user("parent message").await.unwrap();

    let guard = agent
        .mode_with("sandbox", json!({}), IsolationLevel::Fork)
        .await
        .unwrap();
    let fork = guard.fork_agent().unwrap();
    fork.append_user("from the fork").await.unwrap();
    guard.state().unwrap().set("merge", json!(true));
    guard.exit().await.unwrap();

    let texts: Vec<String> = agent.messages().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["parent message", "from the fork"]);
}

/// Setup failures propagate and leave no frame behind.
#[tokio::test]
async fn setup_failure_leaves_no_frame() {
    let agent = Agent::builder()
        .config(config())
        .language_model(Arc::new(ScriptedModel::new(vec![])))
        .mode(
            ModeDefinition::builder("broken")
                .setup(|_ctx| async { Err(agent_runtime::Error::other("nope")) })
                .cleanup(|_ctx| async { Ok(()) })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    assert!(agent.mode("broken", json!({})).await.is_err());
    assert!(agent.mode_stack().is_empty());
}
