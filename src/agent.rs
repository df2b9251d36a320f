//! The agent kernel.
//!
//! [`Agent`] owns every other component — store, versioning, event router,
//! tool executor, mode manager — and exposes the two top-level verbs:
//! [`call`](Agent::call) for a single turn and [`execute`](Agent::execute)
//! for the multi-turn driver, which yields messages as a stream while
//! resolving tool calls and applying mode transitions between iterations.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready ⇄ Executing → Closing → Closed
//!                              (Errored reachable from any non-terminal)
//! ```
//!
//! Public mutating entry points refuse requests outside `Ready` and
//! `Executing`; anything after [`close`](Agent::close) fails with
//! [`Error::AgentClosed`].
//!
//! # Concurrency
//!
//! A single async mutex — the mutation guard — serializes public mutations
//! (`append`, `replace_at`, `prepend`, `clear`, mode entry/exit, revert).
//! The execute loop holds it only around its own commit points and releases
//! it across LLM and tool awaits, so handlers and other tasks can interact
//! with the agent mid-turn. Event handlers invoked under the guard must not
//! call the guarded entry points again; they mutate through the store and
//! config handles on their context, or schedule a task that takes the guard
//! later.
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_runtime::{Agent, AgentConfig, ScriptedModel, ModelResponse};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> agent_runtime::Result<()> {
//! let model = Arc::new(ScriptedModel::new(vec![ModelResponse::text("mock", "hi")]));
//! let agent = Agent::builder()
//!     .system_prompt("You are helpful")
//!     .config(AgentConfig::builder().model("mock").build()?)
//!     .language_model(model)
//!     .build()?;
//! agent.initialize().await?;
//!
//! let reply = agent.call(Some("hello")).await?;
//! assert_eq!(reply.text(), "hi");
//! # Ok(())
//! # }
//! ```

use crate::config::AgentConfig;
use crate::events::{
    EventContext, EventRouter, HandlerId, HandlerOptions, HandlerOutcome,
    EVENT_AGENT_CLOSE_AFTER, EVENT_AGENT_CLOSE_BEFORE, EVENT_AGENT_STATE_CHANGE,
    EVENT_AGENT_VERSION_CHANGE, EVENT_EXECUTE_AFTER, EVENT_EXECUTE_BEFORE, EVENT_EXECUTE_ERROR,
    EVENT_EXECUTE_ITERATION_AFTER, EVENT_EXECUTE_ITERATION_BEFORE, EVENT_LLM_COMPLETE_AFTER,
    EVENT_LLM_COMPLETE_BEFORE, EVENT_LLM_COMPLETE_ERROR, EVENT_MESSAGE_APPEND_AFTER,
    EVENT_MESSAGE_APPEND_BEFORE,
};
use crate::llm::{LanguageModel, ModelResponse, ResponseModel};
use crate::modes::{
    IsolationLevel, ModeDefinition, ModeManager, ModeState, ModeTransition,
};
use crate::render::{ContentRenderer, PassthroughRenderer};
use crate::store::MessageStore;
use crate::tools::{Tool, ToolExecutor, ToolRegistry, ToolResponse};
use crate::types::{ContentPart, Message, MessageRole};
use crate::versioning::{MessageRegistry, VersioningManager};
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Stream of messages produced by [`Agent::execute`].
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Arc<Message>>> + Send>>;

/// Provider of ambient rendering-context values, merged into the context
/// snapshot at capture time.
pub type ContextProvider = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Lifecycle states of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Constructed, components not yet wired
    Created,
    /// Components wiring up
    Initializing,
    /// Accepting mutations and turns
    Ready,
    /// A turn is in flight
    Executing,
    /// Tearing down
    Closing,
    /// Terminal; all operations fail with [`Error::AgentClosed`]
    Closed,
    /// Terminal failure state
    Errored,
}

impl AgentState {
    fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Executing => "executing",
            AgentState::Closing => "closing",
            AgentState::Closed => "closed",
            AgentState::Errored => "errored",
        }
    }
}

// ============================================================================
// EXECUTE OPTIONS
// ============================================================================

/// Options for one [`Agent::execute`] call.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Maximum loop iterations; `None` uses the default of 10.
    pub max_iterations: Option<u32>,
    /// When set, the final response is a structured extraction validating
    /// against this model.
    pub response_model: Option<ResponseModel>,
}

impl ExecuteOptions {
    /// Options with an explicit iteration cap.
    pub fn with_max_iterations(max_iterations: u32) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            response_model: None,
        }
    }
}

const DEFAULT_MAX_ITERATIONS: u32 = 10;

// ============================================================================
// TASKS
// ============================================================================

/// Counters over an agent's background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    /// Tasks ever created
    pub spawned: u64,
    /// Tasks joined to completion
    pub completed: u64,
    /// Tasks currently tracked (spawned, not yet joined)
    pub running: usize,
}

struct TaskSet {
    next_id: AtomicU64,
    spawned: AtomicU64,
    completed: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<Result<Value>>>>,
}

impl TaskSet {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn create<F>(&self, future: F) -> u64
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .expect("task set poisoned")
            .insert(id, tokio::spawn(future));
        id
    }

    async fn join(&self, id: u64) -> Result<Value> {
        let handle = self
            .tasks
            .lock()
            .expect("task set poisoned")
            .remove(&id)
            .ok_or_else(|| Error::invalid_input(format!("unknown task {id}")))?;
        let result = handle
            .await
            .map_err(|err| Error::other(format!("task {id} panicked: {err}")))?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn stats(&self) -> TaskStats {
        TaskStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            running: self.tasks.lock().expect("task set poisoned").len(),
        }
    }

    fn abort_all(&self) {
        for (_, handle) in self.tasks.lock().expect("task set poisoned").drain() {
            handle.abort();
        }
    }
}

// ============================================================================
// CORE
// ============================================================================

/// Shared interior of an agent. Everything an [`Agent`] hands out clones an
/// `Arc` of this; registered messages hold a weak back-reference to it.
pub(crate) struct AgentCore {
    id: Uuid,
    session_id: Uuid,
    name: Option<String>,
    state: RwLock<AgentState>,
    /// Serialized-mutation guard
    guard: tokio::sync::Mutex<()>,
    config: Arc<RwLock<AgentConfig>>,
    router: Arc<EventRouter>,
    registry: Arc<MessageRegistry>,
    versioning: Arc<VersioningManager>,
    store: MessageStore,
    tools: ToolRegistry,
    executor: ToolExecutor,
    modes: Arc<ModeManager>,
    llm: Arc<dyn LanguageModel>,
    renderer: Arc<dyn ContentRenderer>,
    context: RwLock<Map<String, Value>>,
    context_provider: RwLock<Option<ContextProvider>>,
    tasks: TaskSet,
}

impl AgentCore {
    fn state(&self) -> AgentState {
        *self.state.read().expect("agent state poisoned")
    }

    fn set_state(&self, next: AgentState) {
        let previous = {
            let mut state = self.state.write().expect("agent state poisoned");
            let previous = *state;
            *state = next;
            previous
        };
        if previous != next {
            self.router.dispatch(
                EVENT_AGENT_STATE_CHANGE,
                json!({
                    "agent_id": self.id.to_string(),
                    "from": previous.as_str(),
                    "to": next.as_str(),
                }),
            );
        }
    }

    /// Refuse mutations outside Ready/Executing.
    fn ensure_mutable(&self) -> Result<()> {
        match self.state() {
            AgentState::Ready | AgentState::Executing => Ok(()),
            AgentState::Closing | AgentState::Closed => Err(Error::AgentClosed),
            other => Err(Error::invariant(format!(
                "mutation refused in state '{}'",
                other.as_str()
            ))),
        }
    }

    /// Merge the base context map with the provider's ambient values.
    fn context_snapshot(&self) -> Map<String, Value> {
        let mut snapshot = self.context.read().expect("context poisoned").clone();
        if let Some(provider) = &*self.context_provider.read().expect("context poisoned") {
            for (key, value) in provider() {
                snapshot.entry(key).or_insert(value);
            }
        }
        snapshot
    }

    /// Fill template parts that carry no context snapshot with the agent's
    /// current rendering context, so render output stays reproducible.
    fn capture_context(&self, message: &mut Message) {
        let needs_context = message.content.iter().any(|part| {
            matches!(part, ContentPart::Template { context_snapshot: None, .. })
        });
        if !needs_context {
            return;
        }
        let snapshot = Value::Object(self.context_snapshot());
        for part in &mut message.content {
            if let ContentPart::Template { context_snapshot, .. } = part {
                if context_snapshot.is_none() {
                    *context_snapshot = Some(snapshot.clone());
                }
            }
        }
        if message.context_snapshot.is_none() {
            message.context_snapshot = Some(snapshot);
        }
    }

    /// Append with the full event flow; callers hold the guard (or own the
    /// turn).
    async fn append_internal(&self, mut message: Message) -> Result<Arc<Message>> {
        self.capture_context(&mut message);

        let ctx = self
            .router
            .apply(
                EVENT_MESSAGE_APPEND_BEFORE,
                json!({
                    "agent_id": self.id.to_string(),
                    "message": message.serialize_for_storage()?,
                }),
            )
            .await;
        if ctx.interrupted {
            return Err(Error::interrupted(ctx.interrupt_reason));
        }
        // Handlers may have replaced the serialized message.
        let message = Message::from_storage(ctx.params["message"].clone())?;
        let role = message.role;
        let appended = self.store.append(message);

        self.router
            .apply(
                EVENT_MESSAGE_APPEND_AFTER,
                json!({
                    "agent_id": self.id.to_string(),
                    "message_id": appended.id.to_string(),
                    "role": role.as_str(),
                }),
            )
            .await;
        Ok(appended)
    }
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("messages", &self.store.len())
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Agent`].
///
/// Required: `config` and `language_model`. Tools and modes may be
/// registered here or later through the agent's registries.
pub struct AgentBuilder {
    system_prompt: Option<String>,
    name: Option<String>,
    config: Option<AgentConfig>,
    llm: Option<Arc<dyn LanguageModel>>,
    renderer: Option<Arc<dyn ContentRenderer>>,
    tools: Vec<Tool>,
    modes: Vec<ModeDefinition>,
}

impl AgentBuilder {
    /// Sets the system prompt appended as the first message.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets a human-readable agent name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the model configuration (required).
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the language-model port (required).
    pub fn language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Sets the content renderer; defaults to [`PassthroughRenderer`].
    pub fn renderer(mut self, renderer: Arc<dyn ContentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Adds a tool; may be called multiple times.
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Adds a mode definition; may be called multiple times.
    pub fn mode(mut self, definition: ModeDefinition) -> Self {
        self.modes.push(definition);
        self
    }

    /// Wire the components and produce an agent in the `Initializing`
    /// state. Call [`Agent::initialize`] to reach `Ready`.
    pub fn build(self) -> Result<Agent> {
        let config = self.config.ok_or_else(|| Error::config("config is required"))?;
        let llm = self
            .llm
            .ok_or_else(|| Error::config("language_model is required"))?;
        let renderer: Arc<dyn ContentRenderer> =
            self.renderer.unwrap_or_else(|| Arc::new(PassthroughRenderer));

        let id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let router = Arc::new(EventRouter::new());
        let registry = Arc::new(MessageRegistry::new());
        let versioning = Arc::new(VersioningManager::new());
        let store = MessageStore::new(Arc::clone(&registry), Arc::clone(&versioning));
        let config = Arc::new(RwLock::new(config));
        let tools = ToolRegistry::new();
        let executor = ToolExecutor::new(
            tools.clone(),
            Arc::clone(&router),
            store.clone(),
            id.to_string(),
        );
        let modes = Arc::new(ModeManager::new(
            Arc::clone(&config),
            tools.clone(),
            store.clone(),
            Arc::clone(&router),
            id.to_string(),
        ));

        let core = Arc::new(AgentCore {
            id,
            session_id,
            name: self.name,
            state: RwLock::new(AgentState::Created),
            guard: tokio::sync::Mutex::new(()),
            config,
            router,
            registry,
            versioning,
            store,
            tools,
            executor,
            modes,
            llm,
            renderer,
            context: RwLock::new(Map::new()),
            context_provider: RwLock::new(None),
            tasks: TaskSet::new(),
        });

        // Registered messages point weakly back at the core.
        let any: Arc<dyn Any + Send + Sync> = Arc::clone(&core) as Arc<dyn Any + Send + Sync>;
        core.store.set_agent_backref(Arc::downgrade(&any));

        core.set_state(AgentState::Initializing);

        if let Some(prompt) = self.system_prompt {
            core.store.append(Message::system(prompt));
        }
        for tool in self.tools {
            core.tools.register(tool)?;
        }
        for definition in self.modes {
            core.modes.register(definition)?;
        }

        Ok(Agent { core })
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// The kernel instance owning a conversation, tool set, event router, modes,
/// and version history.
///
/// Cheap to clone; clones share the same core.
#[derive(Clone, Debug)]
pub struct Agent {
    core: Arc<AgentCore>,
}

impl Agent {
    /// Start building an agent.
    pub fn builder() -> AgentBuilder {
        AgentBuilder {
            system_prompt: None,
            name: None,
            config: None,
            llm: None,
            renderer: None,
            tools: Vec::new(),
            modes: Vec::new(),
        }
    }

    /// Construct with a config and model; sugar over [`Agent::builder`].
    pub fn new(config: AgentConfig, llm: Arc<dyn LanguageModel>) -> Result<Self> {
        Self::builder().config(config).language_model(llm).build()
    }

    /// Warm the components and move to `Ready`.
    ///
    /// Validates that the model supports the features the configuration
    /// implies. Idempotent once `Ready`.
    pub async fn initialize(&self) -> Result<()> {
        match self.core.state() {
            AgentState::Created | AgentState::Initializing => {}
            AgentState::Ready => return Ok(()),
            AgentState::Closing | AgentState::Closed => return Err(Error::AgentClosed),
            other => {
                return Err(Error::invariant(format!(
                    "initialize refused in state '{}'",
                    other.as_str()
                )));
            }
        }
        if !self.core.tools.is_empty() && !self.core.llm.supports_tools() {
            return Err(Error::config(
                "tools are registered but the model does not support tool calling",
            ));
        }
        self.core.set_state(AgentState::Ready);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    /// Stable agent identifier.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Session identifier; forks share it.
    pub fn session_id(&self) -> Uuid {
        self.core.session_id
    }

    /// Human-readable name, when one was set.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.core.state()
    }

    /// Whether the agent accepts work.
    pub fn is_ready(&self) -> bool {
        self.core.state() == AgentState::Ready
    }

    // ------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------

    /// Append a message under the mutation guard, with the
    /// `message:append:before`/`after` event flow.
    pub async fn append(&self, message: Message) -> Result<Arc<Message>> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;
        self.core.append_internal(message).await
    }

    /// Append user text.
    pub async fn append_user(&self, text: impl Into<String>) -> Result<Arc<Message>> {
        self.append(Message::user(text)).await
    }

    /// Append system text.
    pub async fn append_system(&self, text: impl Into<String>) -> Result<Arc<Message>> {
        self.append(Message::system(text)).await
    }

    /// Append assistant text (caller-supplied, not model-produced).
    pub async fn append_assistant(&self, text: impl Into<String>) -> Result<Arc<Message>> {
        self.append(Message::assistant(text)).await
    }

    /// Record a manually executed tool invocation as a tool message.
    pub async fn add_tool_invocation(&self, response: ToolResponse) -> Result<Arc<Message>> {
        self.append(Message::tool(
            response.tool_call_id,
            response.tool_name,
            response.content,
        ))
        .await
    }

    /// Replace the message at an index.
    pub async fn replace_at(&self, index: usize, message: Message) -> Result<Arc<Message>> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;
        self.core.store.replace_at(index, message)
    }

    /// Prepend a message.
    pub async fn prepend(&self, message: Message) -> Result<Arc<Message>> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;
        Ok(self.core.store.prepend(message))
    }

    /// Clear the conversation (a new empty version; history is retained).
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;
        self.core.store.clear();
        Ok(())
    }

    /// The current messages, oldest first.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.core.store.messages()
    }

    /// The conversation store.
    pub fn store(&self) -> &MessageStore {
        &self.core.store
    }

    /// User messages, in order.
    pub fn user(&self) -> Vec<Arc<Message>> {
        self.core.store.user()
    }

    /// Assistant messages, in order.
    pub fn assistant(&self) -> Vec<Arc<Message>> {
        self.core.store.assistant()
    }

    /// System messages, in order.
    pub fn system(&self) -> Vec<Arc<Message>> {
        self.core.store.system()
    }

    /// Tool messages, in order.
    pub fn tool(&self) -> Vec<Arc<Message>> {
        self.core.store.tool()
    }

    /// Advisory tool-pairing check; empty means clean.
    pub fn validate_message_sequence(&self) -> Vec<String> {
        self.core.store.validate_message_sequence()
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    /// The tool registry.
    pub fn tools(&self) -> &ToolRegistry {
        &self.core.tools
    }

    /// Invoke a single tool through the executor's event flow.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResponse> {
        self.core.executor.invoke(name, arguments, None).await
    }

    /// Invoke many tools concurrently; responses in input order.
    pub async fn invoke_many(
        &self,
        calls: Vec<crate::types::ToolCallRequest>,
    ) -> Vec<ToolResponse> {
        self.core.executor.invoke_many(calls).await
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Register an async event handler.
    pub fn on<F, Fut>(&self, event_name: &str, handler: F) -> HandlerId
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        self.core.router.on(event_name, handler)
    }

    /// Register an async event handler with priority/predicate/phase.
    pub fn on_with<F, Fut>(
        &self,
        event_name: &str,
        options: HandlerOptions,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        self.core.router.on_with(event_name, options, handler)
    }

    /// Async event emission; awaits every handler.
    pub async fn apply(&self, event_name: &str, params: Value) -> EventContext {
        self.core.router.apply(event_name, params).await
    }

    /// Sync event emission; async handlers are spawned, not awaited.
    pub fn dispatch(&self, event_name: &str, params: Value) -> EventContext {
        self.core.router.dispatch(event_name, params)
    }

    /// The event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.core.router
    }

    // ------------------------------------------------------------------
    // Config and context
    // ------------------------------------------------------------------

    /// Snapshot of the current configuration.
    pub fn config(&self) -> AgentConfig {
        self.core.config.read().expect("config poisoned").clone()
    }

    /// Apply an edit to the configuration.
    pub fn update_config(&self, f: impl FnOnce(&mut AgentConfig)) {
        f(&mut self.core.config.write().expect("config poisoned"));
    }

    /// The base rendering context merged with the provider's values.
    pub fn context(&self) -> Map<String, Value> {
        self.core.context_snapshot()
    }

    /// Set a rendering-context value.
    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        self.core
            .context
            .write()
            .expect("context poisoned")
            .insert(key.into(), value);
    }

    /// Register an ambient context provider; its values fill keys the base
    /// map does not define.
    pub fn context_provider<F>(&self, provider: F)
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        *self
            .core
            .context_provider
            .write()
            .expect("context poisoned") = Some(Arc::new(provider));
    }

    /// The context a fork would inherit (the base map, without provider
    /// overlay — forks install their own provider).
    pub fn fork_context(&self) -> Map<String, Value> {
        self.core.context.read().expect("context poisoned").clone()
    }

    /// The context of the current conversation thread: the merged context
    /// plus the innermost mode's state under `"mode"`.
    pub fn thread_context(&self) -> Map<String, Value> {
        let mut ctx = self.core.context_snapshot();
        if let Some(state) = self.core.modes.state() {
            ctx.insert("mode".to_string(), Value::Object(state.snapshot()));
        }
        ctx
    }

    // ------------------------------------------------------------------
    // Versioning
    // ------------------------------------------------------------------

    /// The current version head ID.
    pub fn version_id(&self) -> u64 {
        self.core.versioning.head_id()
    }

    /// The version history manager.
    pub fn versioning(&self) -> &Arc<VersioningManager> {
        &self.core.versioning
    }

    /// Revert the conversation to an earlier version.
    ///
    /// Commits a new head equal to the target (append-only history), then
    /// emits `agent:version:change`; an unknown version fails without
    /// firing the signal. Returns the new head ID.
    pub async fn revert_to_version(&self, version_id: u64) -> Result<u64> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;
        let from = self.core.versioning.head_id();
        // Revert first; an unknown version must not fire a change signal.
        let new_head = self.core.store.revert_to_version(version_id)?;
        self.core
            .router
            .apply(
                EVENT_AGENT_VERSION_CHANGE,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "from": from,
                    "to": version_id,
                    "new_head": new_head,
                }),
            )
            .await;
        Ok(new_head)
    }

    // ------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------

    /// Register a mode definition.
    pub fn register_mode(&self, definition: ModeDefinition) -> Result<()> {
        self.core.modes.register(definition)
    }

    /// Enter a mode with its default isolation; returns the scope guard.
    pub async fn mode(&self, name: &str, params: Value) -> Result<ModeGuard> {
        self.enter_mode(name, params, None).await
    }

    /// Enter a mode with explicit isolation.
    pub async fn mode_with(
        &self,
        name: &str,
        params: Value,
        isolation: IsolationLevel,
    ) -> Result<ModeGuard> {
        self.enter_mode(name, params, Some(isolation)).await
    }

    async fn enter_mode(
        &self,
        name: &str,
        params: Value,
        isolation: Option<IsolationLevel>,
    ) -> Result<ModeGuard> {
        let _guard = self.core.guard.lock().await;
        self.core.ensure_mutable()?;

        let definition = self
            .core
            .modes
            .get(name)
            .ok_or_else(|| Error::invalid_input(format!("unknown mode '{name}'")))?;
        let resolved = isolation.unwrap_or_else(|| definition.default_isolation());

        if resolved == IsolationLevel::Fork {
            // Fork isolation: the mode runs on a forked agent; the parent
            // is untouched until an explicit merge on exit.
            let fork = self.fork_internal()?;
            let base_len = fork.core.store.len();
            fork.core.modes.enter(name, params, Some(IsolationLevel::None)).await?;
            return Ok(ModeGuard {
                target: Some(ModeTarget::Fork {
                    parent: Arc::clone(&self.core),
                    fork,
                    base_len,
                }),
                exited: false,
            });
        }

        self.core.modes.enter(name, params, Some(resolved)).await?;
        Ok(ModeGuard {
            target: Some(ModeTarget::Local(Arc::clone(&self.core))),
            exited: false,
        })
    }

    /// State map of the innermost active mode.
    pub fn mode_state(&self) -> Option<ModeState> {
        self.core.modes.state()
    }

    /// The mode stack, innermost last.
    pub fn mode_stack(&self) -> Vec<String> {
        self.core.modes.stack().into_iter().map(|f| f.name).collect()
    }

    /// Names of modes exited by switches, oldest first.
    pub fn mode_history(&self) -> Vec<String> {
        self.core.modes.history()
    }

    /// Request a switch to another mode at the next iteration boundary.
    pub fn mode_switch(&self, name: &str, params: Value) {
        self.core.modes.request_switch(name, params);
    }

    /// Request a mode exit at the next iteration boundary.
    pub fn mode_exit(&self) {
        self.core.modes.request_exit();
    }

    /// Request a switch back to the most recently exited mode.
    pub fn mode_return_to_previous(&self) {
        self.core.modes.request_return_to_previous();
    }

    /// The queued mode transition, if any.
    pub fn pending_mode_transition(&self) -> Option<ModeTransition> {
        self.core.modes.pending()
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Spawn a tracked background task; returns its ID.
    pub fn create_task<F>(&self, future: F) -> u64
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        self.core.tasks.create(future)
    }

    /// Join a tracked task to completion.
    pub async fn join_task(&self, id: u64) -> Result<Value> {
        self.core.tasks.join(id).await
    }

    /// Counters over tracked tasks.
    pub fn task_stats(&self) -> TaskStats {
        self.core.tasks.stats()
    }

    /// Number of tasks currently tracked.
    pub fn task_count(&self) -> usize {
        self.core.tasks.stats().running
    }

    // ------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------

    /// Fork the agent: shared tool registry, shared event router, shared
    /// mode definitions, cloned message head on a fresh version chain.
    ///
    /// The fork gets its own ID (the session ID is shared) and starts
    /// `Ready`. Messages are shared structurally through the common
    /// registry; the fork's mutations never touch the parent's head.
    pub fn fork(&self) -> Result<Agent> {
        self.core.ensure_mutable()?;
        self.fork_internal()
    }

    fn fork_internal(&self) -> Result<Agent> {
        let id = Uuid::new_v4();
        let versioning = Arc::new(VersioningManager::new());
        versioning.commit(self.core.versioning.head().message_ids.clone());
        let store = MessageStore::new(Arc::clone(&self.core.registry), Arc::clone(&versioning));
        let config = Arc::new(RwLock::new(self.config()));
        let executor = ToolExecutor::new(
            self.core.tools.clone(),
            Arc::clone(&self.core.router),
            store.clone(),
            id.to_string(),
        );
        let modes = Arc::new(ModeManager::with_definitions(
            self.core.modes.definitions_handle(),
            Arc::clone(&config),
            self.core.tools.clone(),
            store.clone(),
            Arc::clone(&self.core.router),
            id.to_string(),
        ));

        let core = Arc::new(AgentCore {
            id,
            session_id: self.core.session_id,
            name: self.core.name.clone(),
            state: RwLock::new(AgentState::Ready),
            guard: tokio::sync::Mutex::new(()),
            config,
            router: Arc::clone(&self.core.router),
            registry: Arc::clone(&self.core.registry),
            versioning,
            store,
            tools: self.core.tools.clone(),
            executor,
            modes,
            llm: Arc::clone(&self.core.llm),
            renderer: Arc::clone(&self.core.renderer),
            context: RwLock::new(self.fork_context()),
            context_provider: RwLock::new(None),
            tasks: TaskSet::new(),
        });
        let any: Arc<dyn Any + Send + Sync> = Arc::clone(&core) as Arc<dyn Any + Send + Sync>;
        core.store.set_agent_backref(Arc::downgrade(&any));
        Ok(Agent { core })
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    /// Single turn: append the input (when given), drive one iteration,
    /// return the final assistant message.
    pub async fn call(&self, user_input: Option<&str>) -> Result<Arc<Message>> {
        if let Some(input) = user_input {
            self.append(Message::user(input)).await?;
        }
        let mut stream = self.execute(ExecuteOptions::with_max_iterations(1));
        let mut last_assistant = None;
        while let Some(item) = stream.next().await {
            let message = item?;
            if message.role == MessageRole::Assistant {
                last_assistant = Some(message);
            }
        }
        last_assistant.ok_or_else(|| Error::other("call produced no assistant message"))
    }

    /// Single turn with structured extraction; returns the validated
    /// payload.
    pub async fn call_structured(
        &self,
        user_input: Option<&str>,
        response_model: ResponseModel,
    ) -> Result<Value> {
        if let Some(input) = user_input {
            self.append(Message::user(input)).await?;
        }
        let mut stream = self.execute(ExecuteOptions {
            max_iterations: Some(1),
            response_model: Some(response_model),
        });
        let mut structured = None;
        while let Some(item) = stream.next().await {
            if let Some(payload) = &item?.structured {
                structured = Some(payload.clone());
            }
        }
        structured.ok_or_else(|| Error::other("call produced no structured payload"))
    }

    /// Multi-turn driver: a stream of messages as they are produced.
    ///
    /// Per iteration: resolve pending tool calls (yielding each tool
    /// message), apply any queued mode transition, round-trip the model,
    /// append and yield the assistant. The loop ends when the last
    /// assistant carries no tool calls and no transition is queued, or the
    /// iteration cap is reached. Dropping the stream cancels in-flight
    /// awaits and returns the agent to `Ready`; messages already appended
    /// remain.
    pub fn execute(&self, options: ExecuteOptions) -> MessageStream {
        let driver = ExecDriver::new(Arc::clone(&self.core), options);
        Box::pin(futures::stream::unfold(driver, |mut driver| async move {
            driver.next_item().await.map(|item| (item, driver))
        }))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close the agent: unwind modes, abort tracked tasks, reach `Closed`.
    ///
    /// Idempotent. Every subsequent mutation fails with
    /// [`Error::AgentClosed`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.core.guard.lock().await;
        if self.core.state() == AgentState::Closed {
            return Ok(());
        }
        self.core
            .router
            .apply(
                EVENT_AGENT_CLOSE_BEFORE,
                json!({"agent_id": self.core.id.to_string()}),
            )
            .await;
        self.core.set_state(AgentState::Closing);

        // Reverse install order: modes unwind first, then tasks die.
        // Cleanup that ignores cancellation only delays teardown up to the
        // configured timeout; past that the agent is Errored.
        let timeout = Duration::from_secs(self.config().timeout());
        if tokio::time::timeout(timeout, self.core.modes.unwind_all())
            .await
            .is_err()
        {
            log::warn!("mode cleanup exceeded {timeout:?} during close");
            self.core.tasks.abort_all();
            self.core.set_state(AgentState::Errored);
            return Err(Error::timeout());
        }
        self.core.tasks.abort_all();

        self.core
            .router
            .apply(
                EVENT_AGENT_CLOSE_AFTER,
                json!({"agent_id": self.core.id.to_string()}),
            )
            .await;
        self.core.set_state(AgentState::Closed);
        Ok(())
    }

    /// Thread-safe proxy for non-async callers.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            agent: self.clone(),
            runtime: tokio::runtime::Handle::current(),
        }
    }
}

// ============================================================================
// MODE GUARD
// ============================================================================

enum ModeTarget {
    Local(Arc<AgentCore>),
    Fork {
        parent: Arc<AgentCore>,
        fork: Agent,
        base_len: usize,
    },
}

/// Scope guard returned by [`Agent::mode`]. Call [`exit`](ModeGuard::exit)
/// to run cleanup and restore isolation; dropping without exiting logs a
/// warning (async teardown cannot run in `Drop`).
pub struct ModeGuard {
    target: Option<ModeTarget>,
    exited: bool,
}

impl ModeGuard {
    /// For fork isolation: the forked agent the mode runs on. `None` for
    /// local modes.
    pub fn fork_agent(&self) -> Option<&Agent> {
        match self.target.as_ref() {
            Some(ModeTarget::Fork { fork, .. }) => Some(fork),
            _ => None,
        }
    }

    /// The active frame's state map.
    pub fn state(&self) -> Option<ModeState> {
        match self.target.as_ref()? {
            ModeTarget::Local(core) => core.modes.state(),
            ModeTarget::Fork { fork, .. } => fork.core.modes.state(),
        }
    }

    /// Exit the mode: run cleanup, restore isolation, pop the frame.
    ///
    /// With fork isolation, the fork's new messages are merged into the
    /// parent when the handler set the frame-state key `"merge"` to `true`;
    /// otherwise they are discarded (they remain in the shared registry,
    /// unreferenced by the parent head).
    pub async fn exit(mut self) -> Result<()> {
        self.exited = true;
        match self.target.take() {
            None => Ok(()),
            Some(ModeTarget::Local(core)) => core.modes.exit_current().await,
            Some(ModeTarget::Fork {
                parent,
                fork,
                base_len,
            }) => {
                let merge = fork
                    .core
                    .modes
                    .state()
                    .and_then(|s| s.get("merge"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                fork.core.modes.exit_current().await?;
                if merge {
                    // Shared registry: re-appending by ID just extends the
                    // parent head with the fork's message IDs.
                    let messages = fork.core.store.messages();
                    for message in messages.iter().skip(base_len) {
                        parent.store.append((**message).clone());
                    }
                }
                fork.close().await
            }
        }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        if !self.exited {
            log::warn!("mode guard dropped without exit(); cleanup did not run");
        }
    }
}

// ============================================================================
// CROSS-THREAD HANDLE
// ============================================================================

/// Marshals agent operations from non-async threads onto the runtime.
#[derive(Clone)]
pub struct AgentHandle {
    agent: Agent,
    runtime: tokio::runtime::Handle,
}

impl AgentHandle {
    /// Blocking [`Agent::append`].
    pub fn append_blocking(&self, message: Message) -> Result<Arc<Message>> {
        let agent = self.agent.clone();
        self.runtime.block_on(async move { agent.append(message).await })
    }

    /// Blocking [`Agent::call`].
    pub fn call_blocking(&self, user_input: Option<&str>) -> Result<Arc<Message>> {
        let agent = self.agent.clone();
        self.runtime.block_on(async move { agent.call(user_input).await })
    }

    /// Blocking [`Agent::invoke`].
    pub fn invoke_blocking(&self, name: &str, arguments: Value) -> Result<ToolResponse> {
        let agent = self.agent.clone();
        self.runtime
            .block_on(async move { agent.invoke(name, arguments).await })
    }
}

// ============================================================================
// EXECUTE DRIVER
// ============================================================================

enum DriverPhase {
    NotStarted,
    /// Top of an iteration: stop-check, iteration:before, tool resolution
    IterationStart,
    /// Mode transitions, model round-trip, assistant append
    Completion,
    Done,
}

struct ExecDriver {
    core: Arc<AgentCore>,
    max_iterations: u32,
    response_model: Option<ResponseModel>,
    iteration: u32,
    entered_executing: bool,
    phase: DriverPhase,
    buffer: VecDeque<Result<Arc<Message>>>,
}

impl ExecDriver {
    fn new(core: Arc<AgentCore>, options: ExecuteOptions) -> Self {
        Self {
            core,
            max_iterations: options.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            response_model: options.response_model,
            iteration: 0,
            entered_executing: false,
            phase: DriverPhase::NotStarted,
            buffer: VecDeque::new(),
        }
    }

    async fn next_item(&mut self) -> Option<Result<Arc<Message>>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            match self.phase {
                DriverPhase::Done => return None,
                DriverPhase::NotStarted => {
                    if let Err(err) = self.start().await {
                        self.phase = DriverPhase::Done;
                        self.restore_state();
                        return Some(Err(err));
                    }
                    if self.max_iterations == 0 {
                        self.finish().await;
                        continue;
                    }
                    self.phase = DriverPhase::IterationStart;
                }
                DriverPhase::IterationStart => {
                    if self.should_stop() {
                        self.finish().await;
                        continue;
                    }
                    self.core
                        .router
                        .apply(
                            EVENT_EXECUTE_ITERATION_BEFORE,
                            json!({
                                "agent_id": self.core.id.to_string(),
                                "iteration": self.iteration,
                            }),
                        )
                        .await;
                    // Resolve pending tool calls, yielding each tool message
                    // before the next model round-trip.
                    if let Some((assistant, _)) = self.core.store.pending_tool_calls() {
                        let appended = self.core.executor.resolve_pending(&assistant).await;
                        for message in appended {
                            self.buffer.push_back(Ok(message));
                        }
                    }
                    self.phase = DriverPhase::Completion;
                }
                DriverPhase::Completion => {
                    match self.complete_iteration().await {
                        Ok(()) => {}
                        Err(err) => {
                            self.restore_state();
                            self.phase = DriverPhase::Done;
                            return Some(Err(err));
                        }
                    }
                }
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self.core.state() {
            AgentState::Ready => {
                self.core.set_state(AgentState::Executing);
                self.entered_executing = true;
            }
            // Nested iteration from within the same turn is permitted.
            AgentState::Executing => {}
            AgentState::Closing | AgentState::Closed => return Err(Error::AgentClosed),
            other => {
                return Err(Error::invariant(format!(
                    "execute refused in state '{}'",
                    other.as_str()
                )));
            }
        }

        if self.response_model.is_some() && !self.core.llm.supports_structured_output() {
            return Err(Error::config(
                "response_model requested but the model does not support structured output",
            ));
        }

        let ctx = self
            .core
            .router
            .apply(
                EVENT_EXECUTE_BEFORE,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "max_iterations": self.max_iterations,
                }),
            )
            .await;
        if ctx.interrupted {
            return Err(Error::interrupted(ctx.interrupt_reason));
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        if self.iteration >= self.max_iterations {
            return true;
        }
        if self.iteration == 0 {
            return false;
        }
        match self.core.store.last() {
            Some(last) => {
                last.role == MessageRole::Assistant
                    && !last.has_tool_calls()
                    && self.core.modes.pending().is_none()
            }
            None => false,
        }
    }

    /// Mode transitions, model round-trip, assistant append; one iteration's
    /// completion half.
    async fn complete_iteration(&mut self) -> Result<()> {
        if let Err(err) = self.core.modes.apply_pending().await {
            log::warn!("mode transition failed: {err}");
        }

        let wire = self.core.store.materialize_for_llm(self.core.renderer.as_ref())?;
        let has_tools = !self.core.tools.is_empty();
        let config = self
            .core
            .config
            .read()
            .expect("config poisoned")
            .snapshot_for_request(has_tools);

        let ctx = self
            .core
            .router
            .apply(
                EVENT_LLM_COMPLETE_BEFORE,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "model": config.model(),
                    "message_count": wire.len(),
                    "iteration": self.iteration,
                }),
            )
            .await;
        if ctx.interrupted {
            return Err(Error::interrupted(ctx.interrupt_reason));
        }

        let assistant = if let Some(response_model) = &self.response_model {
            // Structured extraction path. A before-handler output is the
            // payload itself; the provider is never consulted.
            let result = match ctx.output {
                Some(payload) => Ok(payload),
                None => tokio::time::timeout(
                    Duration::from_secs(config.timeout()),
                    self.core.llm.extract(&wire, response_model, &config),
                )
                .await
                .map_err(|_| Error::timeout())
                .and_then(|r| r),
            };
            match result {
                Ok(payload) => {
                    self.core
                        .router
                        .apply(
                            EVENT_LLM_COMPLETE_AFTER,
                            json!({
                                "agent_id": self.core.id.to_string(),
                                "model": config.model(),
                                "response_model": response_model.name.clone(),
                                "iteration": self.iteration,
                            }),
                        )
                        .await;
                    Message::assistant_structured("", payload)
                }
                Err(err) => return self.handle_llm_error(err).await,
            }
        } else {
            // A before-handler output short-circuits the provider entirely.
            let response = match ctx.output {
                Some(value) => serde_json::from_value::<ModelResponse>(value)
                    .map_err(|err| Error::invariant(format!("llm:complete:before output is not a ModelResponse: {err}"))),
                None => tokio::time::timeout(
                    Duration::from_secs(config.timeout()),
                    self.core.llm.complete(&wire, &config),
                )
                .await
                .map_err(|_| Error::timeout())
                .and_then(|r| r),
            };
            match response {
                Ok(response) => {
                    self.core
                        .router
                        .apply(
                            EVENT_LLM_COMPLETE_AFTER,
                            json!({
                                "agent_id": self.core.id.to_string(),
                                "model": response.model.clone(),
                                "response_id": response.id.clone(),
                                "iteration": self.iteration,
                            }),
                        )
                        .await;
                    response.into_assistant_message()?
                }
                Err(err) => return self.handle_llm_error(err).await,
            }
        };

        // Commit the assistant under the guard; this is a loop-owned
        // mutation point, everything around it runs guard-free.
        {
            let _guard = self.core.guard.lock().await;
            let appended = self.core.store.append(assistant);
            self.core.router.dispatch(
                EVENT_MESSAGE_APPEND_AFTER,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "message_id": appended.id.to_string(),
                    "role": "assistant",
                }),
            );
            self.buffer.push_back(Ok(appended));
        }

        self.core
            .router
            .apply(
                EVENT_EXECUTE_ITERATION_AFTER,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "iteration": self.iteration,
                }),
            )
            .await;
        self.iteration += 1;
        self.phase = DriverPhase::IterationStart;
        Ok(())
    }

    /// LLM failure policy: retryable errors re-enter the loop; otherwise
    /// `execute:error` may supply a fallback assistant, else the error is
    /// terminal.
    async fn handle_llm_error(&mut self, err: Error) -> Result<()> {
        self.core
            .router
            .apply(
                EVENT_LLM_COMPLETE_ERROR,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "error": err.to_string(),
                    "iteration": self.iteration,
                }),
            )
            .await;

        if err.is_retryable() && self.iteration + 1 < self.max_iterations {
            log::warn!("retryable LLM error, re-entering loop: {err}");
            self.iteration += 1;
            self.phase = DriverPhase::IterationStart;
            return Ok(());
        }

        let ctx = self
            .core
            .router
            .apply(
                EVENT_EXECUTE_ERROR,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "error": err.to_string(),
                }),
            )
            .await;
        match ctx.output {
            Some(fallback) => {
                let message = match fallback {
                    Value::String(text) => Message::assistant(text),
                    other => Message::assistant(other.to_string()),
                };
                let _guard = self.core.guard.lock().await;
                let appended = self.core.store.append(message);
                self.buffer.push_back(Ok(appended));
                drop(_guard);
                self.finish().await;
                Ok(())
            }
            None => Err(err),
        }
    }

    async fn finish(&mut self) {
        self.phase = DriverPhase::Done;
        self.core
            .router
            .apply(
                EVENT_EXECUTE_AFTER,
                json!({
                    "agent_id": self.core.id.to_string(),
                    "iterations": self.iteration,
                }),
            )
            .await;
        self.restore_state();
    }

    fn restore_state(&mut self) {
        if self.entered_executing {
            self.entered_executing = false;
            if self.core.state() == AgentState::Executing {
                self.core.set_state(AgentState::Ready);
            }
        }
    }
}

/// Cancellation path: a dropped stream returns the agent to `Ready`.
impl Drop for ExecDriver {
    fn drop(&mut self) {
        self.restore_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;

    fn scripted_agent(responses: Vec<ModelResponse>) -> Agent {
        Agent::builder()
            .system_prompt("You are helpful")
            .config(AgentConfig::builder().model("mock").build().unwrap())
            .language_model(Arc::new(ScriptedModel::new(responses)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_ready() {
        let agent = scripted_agent(vec![]);
        assert_eq!(agent.state(), AgentState::Initializing);
        agent.initialize().await.unwrap();
        assert!(agent.is_ready());
        // Idempotent
        agent.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutations_refused_before_ready() {
        let agent = scripted_agent(vec![]);
        let err = agent.append_user("too early").await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_close_refuses_further_mutations() {
        let agent = scripted_agent(vec![]);
        agent.initialize().await.unwrap();
        agent.close().await.unwrap();
        assert_eq!(agent.state(), AgentState::Closed);

        let err = agent.append_user("after close").await.unwrap_err();
        assert!(matches!(err, Error::AgentClosed));
        // close is idempotent
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_system_prompt_is_first_message() {
        let agent = scripted_agent(vec![]);
        agent.initialize().await.unwrap();
        let messages = agent.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].text(), "You are helpful");
    }

    #[tokio::test]
    async fn test_execute_zero_iterations_yields_nothing() {
        let agent = scripted_agent(vec![ModelResponse::text("mock", "unused")]);
        agent.initialize().await.unwrap();
        agent.append_user("hello").await.unwrap();

        let mut stream = agent.execute(ExecuteOptions::with_max_iterations(0));
        assert!(stream.next().await.is_none());
        assert!(agent.is_ready());
    }

    #[tokio::test]
    async fn test_call_returns_assistant() {
        let agent = scripted_agent(vec![ModelResponse::text("mock", "hi")]);
        agent.initialize().await.unwrap();

        let reply = agent.call(Some("hello")).await.unwrap();
        assert_eq!(reply.text(), "hi");
        assert!(agent.is_ready());
    }

    #[tokio::test]
    async fn test_fork_shares_head_but_not_future() {
        let agent = scripted_agent(vec![]);
        agent.initialize().await.unwrap();
        agent.append_user("shared").await.unwrap();

        let fork = agent.fork().unwrap();
        assert_eq!(fork.messages().len(), agent.messages().len());
        assert_ne!(fork.id(), agent.id());
        assert_eq!(fork.session_id(), agent.session_id());

        fork.append_user("fork only").await.unwrap();
        assert_eq!(fork.messages().len(), 2);
        assert_eq!(agent.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_context_fills_template_snapshots() {
        let agent = scripted_agent(vec![]);
        agent.initialize().await.unwrap();
        agent.set_context("name", json!("Ada"));

        let message = Message::user_with_parts(vec![ContentPart::template(
            "Hello {{name}}",
            vec!["name".to_string()],
            None,
        )]);
        let appended = agent.append(message).await.unwrap();
        let rendered = appended.render(&PassthroughRenderer).unwrap();
        assert_eq!(rendered, "Hello Ada");
    }

    #[tokio::test]
    async fn test_task_tracking() {
        let agent = scripted_agent(vec![]);
        agent.initialize().await.unwrap();

        let id = agent.create_task(async { Ok(json!(21 * 2)) });
        assert_eq!(agent.task_count(), 1);
        let value = agent.join_task(id).await.unwrap();
        assert_eq!(value, json!(42));
        let stats = agent.task_stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
    }
}
