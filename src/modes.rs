//! Stackable modes.
//!
//! A mode is a named scope that reshapes the agent while active: system
//! prompt additions, tool overrides, config overrides, per-mode state. The
//! original generator shape — an async handler that yields exactly once,
//! setup above the yield, cleanup below — is modeled as an explicit
//! `(setup, cleanup)` callback pair; the [`ModeDefinition`] builder rejects
//! a registration missing either half, which is the compile-shape analogue
//! of rejecting a handler that never yields or yields twice.
//!
//! # Isolation levels
//!
//! - [`IsolationLevel::None`] — mutations persist after exit.
//! - [`IsolationLevel::Config`] — the config is snapshotted on entry and
//!   restored on exit.
//! - [`IsolationLevel::Thread`] — `Config` plus the message-store head
//!   version; exit reverts the conversation to the entry snapshot.
//! - [`IsolationLevel::Fork`] — the mode runs on a forked agent; the kernel
//!   owns fork construction and merge/discard.
//!
//! # Transitions
//!
//! Handlers and tools never unwind the stack themselves; they *request* a
//! transition ([`ModeManager::request_switch`] and friends) and the execute
//! loop applies it at the next iteration boundary. A mode registered with
//! `invokable` gets a synthetic `enter_<mode>` tool so the model itself can
//! request the switch; the actual transition is likewise deferred.

use crate::config::AgentConfig;
use crate::events::{
    EventRouter, EVENT_MODE_ENTERED, EVENT_MODE_ENTERING, EVENT_MODE_ERROR, EVENT_MODE_EXITED,
    EVENT_MODE_EXITING, EVENT_MODE_TRANSITION,
};
use crate::store::MessageStore;
use crate::tools::{Tool, ToolRegistry};
use crate::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

/// How much of the agent a mode snapshots on entry and restores on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// No isolation; mutations persist
    #[default]
    None,
    /// Restore configuration on exit
    Config,
    /// Restore configuration and revert the conversation on exit
    Thread,
    /// Run the mode on a forked agent
    Fork,
}

/// What the mode handler sees: the pieces of the agent a mode may reshape,
/// plus its own frame.
#[derive(Clone)]
pub struct ModeContext {
    /// Name of the mode being driven
    pub name: String,
    /// Entry parameters
    pub params: Value,
    /// The frame's mutable state map
    pub state: ModeState,
    /// Agent configuration; isolation decides whether edits survive exit
    pub config: Arc<RwLock<AgentConfig>>,
    /// The shared tool registry
    pub tools: ToolRegistry,
    /// The conversation log
    pub store: MessageStore,
    /// The event router
    pub router: Arc<EventRouter>,
}

/// Shared handle to a frame's `state` map.
#[derive(Clone, Default)]
pub struct ModeState(Arc<Mutex<Map<String, Value>>>);

impl ModeState {
    /// Read a state value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().expect("mode state poisoned").get(key).cloned()
    }

    /// Write a state value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.0
            .lock()
            .expect("mode state poisoned")
            .insert(key.into(), value);
    }

    /// Snapshot the whole map.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.0.lock().expect("mode state poisoned").clone()
    }
}

impl std::fmt::Debug for ModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModeState").field(&self.snapshot()).finish()
    }
}

/// Setup/cleanup callback: async, receives the [`ModeContext`].
pub type ModeCallback = Arc<
    dyn Fn(ModeContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// A registered mode: name, the two lifecycle halves, and options.
#[derive(Clone)]
pub struct ModeDefinition {
    name: String,
    setup: ModeCallback,
    cleanup: ModeCallback,
    default_isolation: IsolationLevel,
    invokable: bool,
    params_schema: Option<Value>,
}

impl ModeDefinition {
    /// Start building a mode definition.
    pub fn builder(name: impl Into<String>) -> ModeDefinitionBuilder {
        ModeDefinitionBuilder {
            name: name.into(),
            setup: None,
            cleanup: None,
            default_isolation: IsolationLevel::default(),
            invokable: false,
            params_schema: None,
        }
    }

    /// The mode's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the model may request this mode through a synthetic tool.
    pub fn invokable(&self) -> bool {
        self.invokable
    }

    /// Isolation applied when entry does not specify one.
    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }
}

impl std::fmt::Debug for ModeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeDefinition")
            .field("name", &self.name)
            .field("isolation", &self.default_isolation)
            .field("invokable", &self.invokable)
            .finish()
    }
}

/// Builder for [`ModeDefinition`]. `build()` rejects a definition missing
/// either lifecycle half.
pub struct ModeDefinitionBuilder {
    name: String,
    setup: Option<ModeCallback>,
    cleanup: Option<ModeCallback>,
    default_isolation: IsolationLevel,
    invokable: bool,
    params_schema: Option<Value>,
}

impl ModeDefinitionBuilder {
    /// The setup half; runs while the mode is entering.
    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: Fn(ModeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.setup = Some(Arc::new(move |ctx| Box::pin(setup(ctx))));
        self
    }

    /// The cleanup half; runs on every exit path.
    pub fn cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: Fn(ModeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.cleanup = Some(Arc::new(move |ctx| Box::pin(cleanup(ctx))));
        self
    }

    /// Default isolation when entry does not specify one.
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Expose a synthetic `enter_<mode>` tool to the model.
    pub fn invokable(mut self, invokable: bool) -> Self {
        self.invokable = invokable;
        self
    }

    /// JSON schema of the entry parameters, validated on invokable entry.
    pub fn params_schema(mut self, schema: Value) -> Self {
        self.params_schema = Some(schema);
        self
    }

    /// Validate the handler shape and produce the definition.
    pub fn build(self) -> Result<ModeDefinition> {
        let setup = self
            .setup
            .ok_or_else(|| Error::mode_handler("setup", "mode handler has no setup half"))?;
        let cleanup = self
            .cleanup
            .ok_or_else(|| Error::mode_handler("cleanup", "mode handler has no cleanup half"))?;
        Ok(ModeDefinition {
            name: self.name,
            setup,
            cleanup,
            default_isolation: self.default_isolation,
            invokable: self.invokable,
            params_schema: self.params_schema,
        })
    }
}

/// A live entry on the mode stack.
#[derive(Clone)]
pub struct ModeFrame {
    /// Mode name
    pub name: String,
    /// Entry parameters
    pub params: Value,
    /// Per-frame mutable state
    pub state: ModeState,
    /// Isolation applied on entry
    pub isolation: IsolationLevel,
    /// Version head captured at entry (Thread isolation)
    entry_version: Option<u64>,
    /// Config captured at entry (Config and Thread isolation)
    config_snapshot: Option<AgentConfig>,
}

/// A requested transition, applied by the execute loop at the next
/// iteration boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeTransition {
    /// Exit the current mode and enter another
    Switch {
        /// Target mode
        name: String,
        /// Entry parameters
        params: Value,
    },
    /// Exit the current mode
    Exit,
    /// Switch back to the most recently exited mode
    ReturnToPrevious,
}

/// Shared mode-definition table; forks reuse the parent's registrations.
pub type ModeDefinitions = Arc<RwLock<HashMap<String, ModeDefinition>>>;

/// Registry, stack, and transition queue for an agent's modes.
pub struct ModeManager {
    definitions: ModeDefinitions,
    stack: Mutex<Vec<ModeFrame>>,
    /// `(name, params)` of frames exited by switches, for return_to_previous
    history: Mutex<Vec<(String, Value)>>,
    pending: Mutex<Option<ModeTransition>>,
    config: Arc<RwLock<AgentConfig>>,
    tools: ToolRegistry,
    store: MessageStore,
    router: Arc<EventRouter>,
    agent_id: String,
}

impl ModeManager {
    /// Create a manager wired to the agent's shared pieces.
    pub fn new(
        config: Arc<RwLock<AgentConfig>>,
        tools: ToolRegistry,
        store: MessageStore,
        router: Arc<EventRouter>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self::with_definitions(
            Arc::new(RwLock::new(HashMap::new())),
            config,
            tools,
            store,
            router,
            agent_id,
        )
    }

    /// Create a manager over an existing definition table (used when
    /// forking: the fork gets its own stack but the parent's definitions).
    pub fn with_definitions(
        definitions: ModeDefinitions,
        config: Arc<RwLock<AgentConfig>>,
        tools: ToolRegistry,
        store: MessageStore,
        router: Arc<EventRouter>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            definitions,
            stack: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            config,
            tools,
            store,
            router,
            agent_id: agent_id.into(),
        }
    }

    /// Handle to the shared definition table.
    pub fn definitions_handle(&self) -> ModeDefinitions {
        Arc::clone(&self.definitions)
    }

    /// Register a mode definition. Duplicate names are rejected.
    pub fn register(self: &Arc<Self>, definition: ModeDefinition) -> Result<()> {
        {
            let mut definitions = self.definitions.write().expect("mode registry poisoned");
            if definitions.contains_key(definition.name()) {
                return Err(Error::config(format!(
                    "mode '{}' is already registered",
                    definition.name()
                )));
            }
            definitions.insert(definition.name().to_string(), definition.clone());
        }
        if definition.invokable() {
            self.register_invokable_tool(&definition)?;
        }
        Ok(())
    }

    /// Synthetic `enter_<mode>` tool: validates parameters, emits
    /// `mode:transition`, and defers the switch to the iteration boundary.
    fn register_invokable_tool(self: &Arc<Self>, definition: &ModeDefinition) -> Result<()> {
        let manager = Arc::clone(self);
        let mode_name = definition.name().to_string();
        let schema = definition
            .params_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}, "required": []}));

        let tool = Tool::new(
            format!("enter_{mode_name}"),
            format!("Switch the agent into the '{mode_name}' mode"),
            schema,
            move |args| {
                let manager = Arc::clone(&manager);
                let mode_name = mode_name.clone();
                async move {
                    if !args.is_null() && !args.is_object() {
                        return Err(Error::tool_invalid(
                            "mode parameters must be a JSON object",
                        ));
                    }
                    let params = if args.is_null() { json!({}) } else { args };
                    manager.router.dispatch(
                        EVENT_MODE_TRANSITION,
                        json!({
                            "agent_id": manager.agent_id,
                            "to": mode_name,
                            "params": params,
                            "source": "tool",
                        }),
                    );
                    manager.request_switch(&mode_name, params.clone());
                    Ok(json!({
                        "status": "transition scheduled",
                        "mode": mode_name,
                    }))
                }
            },
        );
        self.tools.register(tool)
    }

    /// Look up a registered definition.
    pub fn get(&self, name: &str) -> Option<ModeDefinition> {
        self.definitions
            .read()
            .expect("mode registry poisoned")
            .get(name)
            .cloned()
    }

    /// Registered mode names.
    pub fn names(&self) -> Vec<String> {
        self.definitions
            .read()
            .expect("mode registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// The current mode stack, innermost last.
    pub fn stack(&self) -> Vec<ModeFrame> {
        self.stack.lock().expect("mode stack poisoned").clone()
    }

    /// The innermost active frame.
    pub fn current(&self) -> Option<ModeFrame> {
        self.stack.lock().expect("mode stack poisoned").last().cloned()
    }

    /// State map of the innermost active frame.
    pub fn state(&self) -> Option<ModeState> {
        self.current().map(|f| f.state)
    }

    /// Names of modes exited by switches, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .expect("mode history poisoned")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn context_for(&self, frame: &ModeFrame) -> ModeContext {
        ModeContext {
            name: frame.name.clone(),
            params: frame.params.clone(),
            state: frame.state.clone(),
            config: Arc::clone(&self.config),
            tools: self.tools.clone(),
            store: self.store.clone(),
            router: Arc::clone(&self.router),
        }
    }

    /// Enter a mode: push a frame, apply isolation, drive setup.
    ///
    /// A setup failure pops the frame again, emits `mode:error` with
    /// `phase: "setup"`, and propagates — the mode is never half-entered.
    pub async fn enter(&self, name: &str, params: Value, isolation: Option<IsolationLevel>) -> Result<()> {
        let definition = self
            .get(name)
            .ok_or_else(|| Error::invalid_input(format!("unknown mode '{name}'")))?;
        let isolation = isolation.unwrap_or(definition.default_isolation);

        self.router
            .apply(
                EVENT_MODE_ENTERING,
                json!({
                    "agent_id": self.agent_id,
                    "mode": name,
                    "params": params.clone(),
                }),
            )
            .await;

        // Snapshot what the isolation level must restore.
        let config_snapshot = match isolation {
            IsolationLevel::Config | IsolationLevel::Thread => {
                Some(self.config.read().expect("config poisoned").clone())
            }
            _ => None,
        };
        let entry_version = match isolation {
            IsolationLevel::Thread => Some(self.store.versioning().head_id()),
            _ => None,
        };

        let frame = ModeFrame {
            name: name.to_string(),
            params,
            state: ModeState::default(),
            isolation,
            entry_version,
            config_snapshot,
        };
        self.stack.lock().expect("mode stack poisoned").push(frame.clone());

        let ctx = self.context_for(&frame);
        if let Err(err) = (definition.setup)(ctx).await {
            // Net effect of a failed setup: the frame was never pushed.
            self.stack.lock().expect("mode stack poisoned").pop();
            self.router
                .apply(
                    EVENT_MODE_ERROR,
                    json!({
                        "agent_id": self.agent_id,
                        "mode": name,
                        "phase": "setup",
                        "error": err.to_string(),
                    }),
                )
                .await;
            return Err(err);
        }

        self.router
            .apply(
                EVENT_MODE_ENTERED,
                json!({"agent_id": self.agent_id, "mode": name}),
            )
            .await;
        Ok(())
    }

    /// Exit the innermost mode: run cleanup, restore isolation, pop.
    ///
    /// Cleanup failures are logged and emitted as `mode:error` with
    /// `phase: "cleanup"`, but the frame always pops — a mode can never
    /// leak onto the stack.
    pub async fn exit_current(&self) -> Result<()> {
        let frame = self
            .current()
            .ok_or_else(|| Error::invalid_input("no active mode to exit"))?;
        let definition = self.get(&frame.name).ok_or_else(|| {
            Error::invariant(format!("active mode '{}' has no definition", frame.name))
        })?;

        self.router
            .apply(
                EVENT_MODE_EXITING,
                json!({"agent_id": self.agent_id, "mode": frame.name}),
            )
            .await;

        if let Err(err) = (definition.cleanup)(self.context_for(&frame)).await {
            log::warn!("mode '{}' cleanup failed: {err}", frame.name);
            self.router
                .apply(
                    EVENT_MODE_ERROR,
                    json!({
                        "agent_id": self.agent_id,
                        "mode": frame.name,
                        "phase": "cleanup",
                        "error": err.to_string(),
                    }),
                )
                .await;
        }

        // Restore per isolation level.
        if let Some(snapshot) = &frame.config_snapshot {
            *self.config.write().expect("config poisoned") = snapshot.clone();
        }
        if let Some(version) = frame.entry_version {
            self.store.revert_to_version(version)?;
        }

        self.stack.lock().expect("mode stack poisoned").pop();
        self.router
            .apply(
                EVENT_MODE_EXITED,
                json!({"agent_id": self.agent_id, "mode": frame.name}),
            )
            .await;
        Ok(())
    }

    /// Request a switch to another mode at the next iteration boundary.
    pub fn request_switch(&self, name: &str, params: Value) {
        *self.pending.lock().expect("mode pending poisoned") = Some(ModeTransition::Switch {
            name: name.to_string(),
            params,
        });
    }

    /// Request an exit at the next iteration boundary.
    pub fn request_exit(&self) {
        *self.pending.lock().expect("mode pending poisoned") = Some(ModeTransition::Exit);
    }

    /// Request a switch back to the most recently exited mode.
    pub fn request_return_to_previous(&self) {
        *self.pending.lock().expect("mode pending poisoned") =
            Some(ModeTransition::ReturnToPrevious);
    }

    /// The currently queued transition, if any.
    pub fn pending(&self) -> Option<ModeTransition> {
        self.pending.lock().expect("mode pending poisoned").clone()
    }

    fn take_pending(&self) -> Option<ModeTransition> {
        self.pending.lock().expect("mode pending poisoned").take()
    }

    /// Apply the queued transition, if any. Called by the execute loop at
    /// iteration boundaries. Returns whether a transition ran.
    pub async fn apply_pending(&self) -> Result<bool> {
        let Some(transition) = self.take_pending() else {
            return Ok(false);
        };
        self.router
            .apply(
                EVENT_MODE_TRANSITION,
                json!({
                    "agent_id": self.agent_id,
                    "transition": format!("{transition:?}"),
                }),
            )
            .await;

        match transition {
            ModeTransition::Switch { name, params } => {
                if let Some(current) = self.current() {
                    self.history
                        .lock()
                        .expect("mode history poisoned")
                        .push((current.name.clone(), current.params.clone()));
                    self.exit_current().await?;
                }
                self.enter(&name, params, None).await?;
            }
            ModeTransition::Exit => {
                if self.current().is_some() {
                    self.exit_current().await?;
                }
            }
            ModeTransition::ReturnToPrevious => {
                let previous = self.history.lock().expect("mode history poisoned").pop();
                match previous {
                    Some((name, params)) => {
                        if self.current().is_some() {
                            self.exit_current().await?;
                        }
                        self.enter(&name, params, None).await?;
                    }
                    None => {
                        if self.current().is_some() {
                            self.exit_current().await?;
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Unwind the whole stack (agent close). Cleanup failures are logged;
    /// unwinding continues.
    pub async fn unwind_all(&self) {
        while self.current().is_some() {
            if let Err(err) = self.exit_current().await {
                log::warn!("mode unwind failed: {err}");
                // exit_current pops even on cleanup failure; a hard failure
                // here means the stack is corrupt, so stop.
                break;
            }
        }
    }
}

impl std::fmt::Debug for ModeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeManager")
            .field("definitions", &self.names())
            .field("stack_depth", &self.stack.lock().expect("mode stack poisoned").len())
            .finish()
    }
}
