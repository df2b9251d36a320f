//! # Agent Runtime
//!
//! A single-process orchestration kernel for LLM agents: versioned message
//! history, typed event routing, parallel tool execution with ordered
//! results, stackable behavior modes, and a pluggable language-model port.
//!
//! ## Overview
//!
//! The runtime drives multi-turn reasoning against any model implementing
//! the [`LanguageModel`] trait. Provider SDKs, retry routing, template
//! engines, and transport concerns stay outside; the value of the crate is
//! in how the kernel's subsystems interlock:
//!
//! - **Agent kernel** — lifecycle state machine, serialized-mutation guard,
//!   the single-turn [`Agent::call`] and streaming multi-turn
//!   [`Agent::execute`] drivers.
//! - **Event router** — typed pub/sub with interceptable and signal events,
//!   integer priorities, predicates, and sync/async bridging.
//! - **Message store** — ordered, versioned, role-filtered conversation log
//!   with tool-call pairing repair at materialization time.
//! - **Versioning** — O(1) snapshots as message-ID lists over a registry
//!   that owns every message; revert is append-only.
//! - **Tool executor** — parallel invocation with results emitted in call
//!   order, short-circuit and fallback hooks, failures captured as data.
//! - **Mode manager** — stackable named scopes with config/thread/fork
//!   isolation and deferred transitions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_runtime::{Agent, AgentConfig, ScriptedModel, ModelResponse};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> agent_runtime::Result<()> {
//!     let model = Arc::new(ScriptedModel::new(vec![
//!         ModelResponse::text("mock-model", "Paris"),
//!     ]));
//!
//!     let agent = Agent::builder()
//!         .system_prompt("You are a helpful assistant")
//!         .config(AgentConfig::builder().model("mock-model").build()?)
//!         .language_model(model)
//!         .build()?;
//!     agent.initialize().await?;
//!
//!     let reply = agent.call(Some("What's the capital of France?")).await?;
//!     println!("{}", reply.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Multi-turn with tools
//!
//! ```rust,no_run
//! use agent_runtime::{Agent, AgentConfig, ExecuteOptions, ScriptedModel, tool};
//! use futures::StreamExt;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> agent_runtime::Result<()> {
//! let model = Arc::new(ScriptedModel::tool_then_text(
//!     "call-1", "get_weather", json!({"city": "Oslo"}), "It's cold.",
//! ));
//! let weather = tool("get_weather", "Get the weather for a city")
//!     .param("city", "string")
//!     .build(|args| async move { Ok(json!({"temp": -3, "city": args["city"]})) });
//!
//! let agent = Agent::builder()
//!     .config(AgentConfig::builder().model("mock-model").build()?)
//!     .language_model(model)
//!     .tool(weather)
//!     .build()?;
//! agent.initialize().await?;
//! agent.append_user("How's Oslo?").await?;
//!
//! let mut stream = agent.execute(ExecuteOptions::default());
//! while let Some(message) = stream.next().await {
//!     let message = message?;
//!     println!("{}: {}", message.role, message.text());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Modules in leaves-first dependency order:
//!
//! - **error**: the `Error` enum and `Result` alias used across all APIs
//! - **render**: the content-rendering port for template parts
//! - **types**: messages, content parts, IDs, and the provider wire format
//! - **config**: the typed model configuration with a validating builder
//! - **events**: the event router
//! - **versioning**: message registry and append-only version history
//! - **store**: the conversation log
//! - **llm**: the language-model port and the scripted test model
//! - **tools**: tool definitions, registry, and the parallel executor
//! - **modes**: stackable behavior modes
//! - **agent**: the kernel tying everything together

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// The agent kernel: lifecycle, mutation guard, call/execute drivers,
/// forking, modes scope guard, and the cross-thread handle.
mod agent;

/// Typed model configuration with a validating builder and a free-form
/// extras map for provider-specific keys.
mod config;

/// Error types and conversions used throughout the runtime.
mod error;

/// Event router: interceptable and signal events, priorities, predicates,
/// and the sync/async dispatch forms.
mod events;

/// Language-model port, provider-neutral response types, and the scripted
/// mock used in tests.
mod llm;

/// Stackable modes with isolation levels and deferred transitions.
mod modes;

/// Content-rendering port for template content parts.
mod render;

/// The ordered, versioned conversation log with pairing repair.
mod store;

/// Tool definitions, the shared registry, and the parallel executor.
mod tools;

/// Core data model: message IDs, roles, content parts, wire format.
mod types;

/// Message registry and append-only version history.
mod versioning;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Agent kernel ---

pub use agent::{
    Agent, AgentBuilder, AgentHandle, AgentState, ContextProvider, ExecuteOptions, MessageStream,
    ModeGuard, TaskStats,
};

// --- Configuration ---

pub use config::{AgentConfig, AgentConfigBuilder};

// --- Errors ---

pub use error::{Error, Result};

// --- Events ---

pub use events::{
    AsyncEventHandler, EventContext, EventKind, EventPredicate, EventRouter, HandlerId,
    HandlerOptions, HandlerOutcome, LifecyclePhase, SyncEventHandler, classify,
    EVENT_AGENT_CLOSE_AFTER, EVENT_AGENT_CLOSE_BEFORE, EVENT_AGENT_STATE_CHANGE,
    EVENT_AGENT_VERSION_CHANGE, EVENT_EXECUTE_AFTER, EVENT_EXECUTE_BEFORE, EVENT_EXECUTE_ERROR,
    EVENT_EXECUTE_ITERATION_AFTER, EVENT_EXECUTE_ITERATION_BEFORE, EVENT_LLM_COMPLETE_AFTER,
    EVENT_LLM_COMPLETE_BEFORE, EVENT_LLM_COMPLETE_ERROR, EVENT_MESSAGE_APPEND_AFTER,
    EVENT_MESSAGE_APPEND_BEFORE, EVENT_MODE_ENTERED, EVENT_MODE_ENTERING, EVENT_MODE_ERROR,
    EVENT_MODE_EXITED, EVENT_MODE_EXITING, EVENT_MODE_TRANSITION, EVENT_TOOL_CALL_AFTER,
    EVENT_TOOL_CALL_BEFORE, EVENT_TOOL_CALL_ERROR,
};

// --- Language-model port ---

pub use llm::{
    ChunkStream, Choice, FailingModel, LanguageModel, ModelResponse, ResponseMessage,
    ResponseModel, ScriptedModel, StreamChunk,
};

// --- Modes ---

pub use modes::{
    IsolationLevel, ModeCallback, ModeContext, ModeDefinition, ModeDefinitionBuilder,
    ModeDefinitions, ModeFrame, ModeManager, ModeState, ModeTransition,
};

// --- Rendering port ---

pub use render::{ContentRenderer, PassthroughRenderer};

// --- Message store ---

pub use store::MessageStore;

// --- Tool system ---

pub use tools::{Tool, ToolBuilder, ToolExecutor, ToolHandler, ToolRegistry, ToolResponse, tool};

// --- Core types ---

pub use types::{
    ContentPart, FileSource, FormattedContent, FormattedFunction, FormattedImageUrl,
    FormattedMessage, FormattedPart, FormattedToolCall, ImageDetail, ImageSource, Message,
    MessageId, MessageRole, ToolCallRequest, Usage,
};

// --- Versioning ---

pub use versioning::{AgentBackRef, MessageRegistry, Version, VersioningManager};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types and functions. Import with
/// `use agent_runtime::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Agent, AgentConfig, ContentPart, Error, EventContext, ExecuteOptions, HandlerOutcome,
        IsolationLevel, LanguageModel, Message, MessageRole, ModeDefinition, ModelResponse,
        ResponseModel, Result, ScriptedModel, Tool, ToolCallRequest, ToolResponse, tool,
    };
}
