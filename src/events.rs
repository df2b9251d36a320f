//! Event router: typed pub/sub over the agent lifecycle.
//!
//! Every notable step of the kernel emits a named event. Names are
//! colon-delimited and stable: `<object>:<action>:<phase>` where the phase is
//! `before`, `after`, or `error` (state-change events use `<object>:<state>`).
//! Events come in two classes:
//!
//! - **Interceptable** (`*:before`): handlers may mutate the parameters,
//!   supply an output that short-circuits the operation, or interrupt the
//!   flow entirely.
//! - **Signal** (`*:after`, `*:error`, state changes): observation only;
//!   handler outcomes other than `Continue` are ignored.
//!
//! Handlers are registered with an integer priority and an optional
//! predicate. For one emission, execution order is deterministic: stable
//! sort by `(priority desc, registration order asc)`; predicates skip
//! without side effects. The router never holds its lock across a handler
//! body, so handlers may register further handlers while an emission is in
//! flight.
//!
//! Two dispatch forms exist, mirroring the sync/async split in the rest of
//! the runtime:
//!
//! - [`EventRouter::apply`] — async; awaits every handler, returns the final
//!   [`EventContext`].
//! - [`EventRouter::dispatch`] — sync; runs sync handlers inline and spawns
//!   async handlers onto the runtime without awaiting them. Use it from
//!   instrumentation paths where blocking is unacceptable, never where the
//!   handler outcome matters.
//!
//! # Example
//!
//! ```
//! use agent_runtime::{EventRouter, HandlerOutcome};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let router = EventRouter::new();
//!
//! router.on("tool:call:before", |ctx| async move {
//!     if ctx.params["name"] == "weather" {
//!         return Ok(HandlerOutcome::Output(json!({"temp": 20})));
//!     }
//!     Ok(HandlerOutcome::Continue)
//! });
//!
//! let ctx = router
//!     .apply("tool:call:before", json!({"name": "weather"}))
//!     .await;
//! assert_eq!(ctx.output, Some(json!({"temp": 20})));
//! # }
//! ```

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// ============================================================================
// EVENT NAME CONSTANTS
// ============================================================================

/// Interceptable: fired before a turn-driving `execute` starts.
pub const EVENT_EXECUTE_BEFORE: &str = "execute:before";
/// Signal: fired after `execute` finishes.
pub const EVENT_EXECUTE_AFTER: &str = "execute:after";
/// Interceptable: fired when an iteration fails; a handler may supply a
/// fallback assistant message as the output.
pub const EVENT_EXECUTE_ERROR: &str = "execute:error";
/// Signal: fired at the top of each execute iteration.
pub const EVENT_EXECUTE_ITERATION_BEFORE: &str = "execute:iteration:before";
/// Signal: fired at the end of each execute iteration.
pub const EVENT_EXECUTE_ITERATION_AFTER: &str = "execute:iteration:after";

/// Interceptable: fired before each language-model round-trip.
pub const EVENT_LLM_COMPLETE_BEFORE: &str = "llm:complete:before";
/// Signal: fired after each language-model round-trip.
pub const EVENT_LLM_COMPLETE_AFTER: &str = "llm:complete:after";
/// Signal: fired when the language model reports an error.
pub const EVENT_LLM_COMPLETE_ERROR: &str = "llm:complete:error";

/// Interceptable: fired before a tool runs; an output short-circuits the
/// tool with a synthetic response.
pub const EVENT_TOOL_CALL_BEFORE: &str = "tool:call:before";
/// Signal: fired after a tool response is produced.
pub const EVENT_TOOL_CALL_AFTER: &str = "tool:call:after";
/// Interceptable: fired when a tool fails; an output replaces the error
/// with a fallback response.
pub const EVENT_TOOL_CALL_ERROR: &str = "tool:call:error";

/// Interceptable: fired before a message is appended to the store.
pub const EVENT_MESSAGE_APPEND_BEFORE: &str = "message:append:before";
/// Signal: fired after a message is appended.
pub const EVENT_MESSAGE_APPEND_AFTER: &str = "message:append:after";

/// Signal: mode frame is being pushed.
pub const EVENT_MODE_ENTERING: &str = "mode:entering";
/// Signal: mode setup completed.
pub const EVENT_MODE_ENTERED: &str = "mode:entered";
/// Signal: mode cleanup is starting.
pub const EVENT_MODE_EXITING: &str = "mode:exiting";
/// Signal: mode frame popped.
pub const EVENT_MODE_EXITED: &str = "mode:exited";
/// Signal: a mode transition was requested.
pub const EVENT_MODE_TRANSITION: &str = "mode:transition";
/// Signal: a mode handler failed; params carry the phase.
pub const EVENT_MODE_ERROR: &str = "mode:error";

/// Signal: the versioning head moved.
pub const EVENT_AGENT_VERSION_CHANGE: &str = "agent:version:change";
/// Signal: the agent state machine transitioned.
pub const EVENT_AGENT_STATE_CHANGE: &str = "agent:state:change";
/// Signal: close() started.
pub const EVENT_AGENT_CLOSE_BEFORE: &str = "agent:close:before";
/// Signal: close() finished.
pub const EVENT_AGENT_CLOSE_AFTER: &str = "agent:close:after";

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Whether an event's handlers may steer the flow or only observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Before-phase event; handlers may mutate params, set an output, or
    /// interrupt.
    Interceptable,
    /// After/error/state-change event; observation only.
    Signal,
}

/// Registration phase of a handler within an interceptable emission.
///
/// `Before` handlers run first and are the only ones that may interrupt;
/// `Around` handlers run afterwards and may wrap or replace the pending
/// output. `After` and `Error` phases exist for signal emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecyclePhase {
    /// May mutate params or interrupt
    #[default]
    Before,
    /// May transform or set the output
    Around,
    /// Observation after the operation
    After,
    /// Observation of a failure
    Error,
}

/// Classify an event name by its suffix. Used for the default registration
/// phase and the error-propagation policy.
pub fn classify(event_name: &str) -> EventKind {
    // execute:error and tool:call:error are interceptable by contract:
    // their handlers may supply fallbacks.
    if event_name == EVENT_EXECUTE_ERROR || event_name == EVENT_TOOL_CALL_ERROR {
        return EventKind::Interceptable;
    }
    if event_name.ends_with(":before") {
        EventKind::Interceptable
    } else {
        EventKind::Signal
    }
}

fn default_phase(event_name: &str) -> LifecyclePhase {
    match classify(event_name) {
        EventKind::Interceptable => LifecyclePhase::Before,
        EventKind::Signal => {
            if event_name.ends_with(":error") {
                LifecyclePhase::Error
            } else {
                LifecyclePhase::After
            }
        }
    }
}

/// The `*:error` signal name paired with an interceptable event, when the
/// name follows the `<object>:<action>:<phase>` convention.
fn error_signal_for(event_name: &str) -> Option<String> {
    event_name
        .strip_suffix(":before")
        .map(|stem| format!("{stem}:error"))
}

// ============================================================================
// CONTEXT AND OUTCOMES
// ============================================================================

/// Mutable context threaded through one event emission.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// The event name
    pub name: String,
    /// Event parameters; before-phase handlers may replace them
    pub params: Value,
    /// Output supplied by a handler, short-circuiting the operation
    pub output: Option<Value>,
    /// Whether a handler interrupted the flow
    pub interrupted: bool,
    /// Explanation attached to the interrupt
    pub interrupt_reason: Option<String>,
}

impl EventContext {
    /// Fresh context for an emission.
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
            output: None,
            interrupted: false,
            interrupt_reason: None,
        }
    }
}

/// What a handler asks the router to do next.
///
/// Handlers communicate through this sum type rather than exceptions; real
/// errors are reserved for failures.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Proceed to the next handler
    Continue,
    /// Replace the event parameters (before phase of interceptable events
    /// only; ignored with a warning elsewhere)
    UpdateParams(Value),
    /// Set the context output; later handlers still run and may replace it
    Output(Value),
    /// Stop iteration and mark the context interrupted
    Interrupt(Option<String>),
}

/// Async handler: owns a clone of the context, returns an outcome.
pub type AsyncEventHandler = Arc<
    dyn Fn(EventContext) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome>> + Send>>
        + Send
        + Sync,
>;

/// Sync handler: borrows the context, returns an outcome immediately.
pub type SyncEventHandler = Arc<dyn Fn(&EventContext) -> Result<HandlerOutcome> + Send + Sync>;

/// Predicate evaluated against the parameters before a handler runs.
pub type EventPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

enum HandlerFn {
    Sync(SyncEventHandler),
    Async(AsyncEventHandler),
}

impl Clone for HandlerFn {
    fn clone(&self) -> Self {
        match self {
            HandlerFn::Sync(f) => HandlerFn::Sync(Arc::clone(f)),
            HandlerFn::Async(f) => HandlerFn::Async(Arc::clone(f)),
        }
    }
}

/// Identifier returned by registration; pass to [`EventRouter::off`].
pub type HandlerId = u64;

/// Registration options: priority, phase, predicate.
#[derive(Default)]
pub struct HandlerOptions {
    /// Higher priorities run first; equal priorities run in registration
    /// order. Defaults to 0.
    pub priority: i32,
    /// Lifecycle phase; defaults to the phase implied by the event name.
    pub phase: Option<LifecyclePhase>,
    /// Skip the handler when the predicate returns false.
    pub predicate: Option<EventPredicate>,
}

impl HandlerOptions {
    /// Options with the given priority.
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Set the lifecycle phase.
    pub fn with_phase(mut self, phase: LifecyclePhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Set the predicate.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

struct Registration {
    id: HandlerId,
    priority: i32,
    phase: LifecyclePhase,
    predicate: Option<EventPredicate>,
    handler: HandlerFn,
}

impl Clone for Registration {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            priority: self.priority,
            phase: self.phase,
            predicate: self.predicate.clone(),
            handler: self.handler.clone(),
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Routes named events to registered handlers in deterministic order.
///
/// Cheap to share: the router is used behind an `Arc` by the agent, the tool
/// executor, and the mode manager. The handler registry sits behind a
/// read-write lock scoped only around list reads and writes; handler bodies
/// always run outside it.
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an async handler with default options.
    pub fn on<F, Fut>(&self, event_name: &str, handler: F) -> HandlerId
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        self.on_with(event_name, HandlerOptions::default(), handler)
    }

    /// Register an async handler with explicit options.
    pub fn on_with<F, Fut>(&self, event_name: &str, options: HandlerOptions, handler: F) -> HandlerId
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        let boxed: AsyncEventHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.insert(event_name, options, HandlerFn::Async(boxed))
    }

    /// Register a sync handler with default options.
    ///
    /// Sync handlers run inline in both dispatch forms, which makes them the
    /// right choice for anything [`dispatch`](EventRouter::dispatch) must
    /// observe reliably.
    pub fn on_sync<F>(&self, event_name: &str, handler: F) -> HandlerId
    where
        F: Fn(&EventContext) -> Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.on_sync_with(event_name, HandlerOptions::default(), handler)
    }

    /// Register a sync handler with explicit options.
    pub fn on_sync_with<F>(&self, event_name: &str, options: HandlerOptions, handler: F) -> HandlerId
    where
        F: Fn(&EventContext) -> Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.insert(event_name, options, HandlerFn::Sync(Arc::new(handler)))
    }

    fn insert(&self, event_name: &str, options: HandlerOptions, handler: HandlerFn) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            priority: options.priority,
            phase: options.phase.unwrap_or_else(|| default_phase(event_name)),
            predicate: options.predicate,
            handler,
        };
        let mut handlers = self.handlers.write().expect("event registry poisoned");
        handlers
            .entry(event_name.to_string())
            .or_default()
            .push(registration);
        id
    }

    /// Remove a handler by registration id. Returns whether one was removed.
    pub fn off(&self, event_name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().expect("event registry poisoned");
        match handlers.get_mut(event_name) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r.id != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Number of handlers registered for an event name.
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .expect("event registry poisoned")
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Snapshot the handlers for one emission: matching phases, sorted by
    /// `(priority desc, registration order asc)`. The lock is released
    /// before any handler runs.
    fn snapshot(&self, event_name: &str, phases: &[LifecyclePhase]) -> Vec<Registration> {
        let handlers = self.handlers.read().expect("event registry poisoned");
        let mut list: Vec<Registration> = handlers
            .get(event_name)
            .map(|regs| {
                regs.iter()
                    .filter(|r| phases.contains(&r.phase))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        list
    }

    fn phases_for(event_name: &str) -> Vec<LifecyclePhase> {
        match classify(event_name) {
            // Before handlers run first and may interrupt; Around handlers
            // then wrap or replace the pending output.
            EventKind::Interceptable => vec![LifecyclePhase::Before, LifecyclePhase::Around],
            EventKind::Signal => vec![LifecyclePhase::After, LifecyclePhase::Error],
        }
    }

    /// Apply a handler outcome to the context. Returns false when iteration
    /// must stop.
    fn apply_outcome(
        ctx: &mut EventContext,
        outcome: HandlerOutcome,
        kind: EventKind,
        phase: LifecyclePhase,
    ) -> bool {
        match outcome {
            HandlerOutcome::Continue => true,
            HandlerOutcome::UpdateParams(params) => {
                if kind == EventKind::Interceptable && phase == LifecyclePhase::Before {
                    ctx.params = params;
                } else {
                    log::warn!(
                        "handler for '{}' tried to update params outside the before phase; ignored",
                        ctx.name
                    );
                }
                true
            }
            HandlerOutcome::Output(output) => {
                ctx.output = Some(output);
                true
            }
            HandlerOutcome::Interrupt(reason) => {
                ctx.interrupted = true;
                ctx.interrupt_reason = reason;
                false
            }
        }
    }

    /// Handle a handler failure per the propagation policy: interceptable
    /// emissions convert the error into an interrupt and fire the paired
    /// `*:error` signal; signal emissions log and move on. Returns false
    /// when iteration must stop.
    fn apply_error(
        &self,
        ctx: &mut EventContext,
        err: crate::Error,
        kind: EventKind,
    ) -> bool {
        match kind {
            EventKind::Interceptable => {
                let reason = err.to_string();
                log::warn!("handler for '{}' failed, interrupting: {reason}", ctx.name);
                ctx.interrupted = true;
                ctx.interrupt_reason = Some(reason.clone());
                if let Some(error_event) = error_signal_for(&ctx.name) {
                    self.dispatch(
                        &error_event,
                        serde_json::json!({
                            "source": ctx.name,
                            "error": reason,
                        }),
                    );
                }
                false
            }
            EventKind::Signal => {
                log::warn!("signal handler for '{}' failed: {err}", ctx.name);
                true
            }
        }
    }

    /// Async dispatch: run every matching handler, awaiting async ones.
    ///
    /// Returns the final context. Callers of interceptable events must check
    /// `interrupted` and `output`; signal emissions can discard the return
    /// value.
    pub async fn apply(&self, event_name: &str, params: Value) -> EventContext {
        let kind = classify(event_name);
        let mut ctx = EventContext::new(event_name, params);

        for registration in self.snapshot(event_name, &Self::phases_for(event_name)) {
            if let Some(predicate) = &registration.predicate {
                if !predicate(&ctx.params) {
                    continue;
                }
            }
            let result = match &registration.handler {
                HandlerFn::Sync(f) => f(&ctx),
                HandlerFn::Async(f) => f(ctx.clone()).await,
            };
            let proceed = match result {
                Ok(outcome) => Self::apply_outcome(&mut ctx, outcome, kind, registration.phase),
                Err(err) => self.apply_error(&mut ctx, err, kind),
            };
            if !proceed {
                break;
            }
        }
        ctx
    }

    /// Sync dispatch: run sync handlers inline, spawn async handlers onto
    /// the runtime without awaiting them.
    ///
    /// The returned context reflects sync handlers only; outcomes of spawned
    /// async handlers are discarded (their failures are logged). This form
    /// exists for instrumentation inside guarded sections where awaiting —
    /// and therefore re-entering the mutation guard — is not an option.
    pub fn dispatch(&self, event_name: &str, params: Value) -> EventContext {
        let kind = classify(event_name);
        let mut ctx = EventContext::new(event_name, params);

        for registration in self.snapshot(event_name, &Self::phases_for(event_name)) {
            if let Some(predicate) = &registration.predicate {
                if !predicate(&ctx.params) {
                    continue;
                }
            }
            match &registration.handler {
                HandlerFn::Sync(f) => {
                    let proceed = match f(&ctx) {
                        Ok(outcome) => {
                            Self::apply_outcome(&mut ctx, outcome, kind, registration.phase)
                        }
                        Err(err) => self.apply_error(&mut ctx, err, kind),
                    };
                    if !proceed {
                        break;
                    }
                }
                HandlerFn::Async(f) => {
                    // Fire-and-forget; the outcome cannot steer a sync caller.
                    let fut = f(ctx.clone());
                    let name = ctx.name.clone();
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            if let Err(err) = fut.await {
                                log::warn!("async handler for '{name}' failed in sync dispatch: {err}");
                            }
                        });
                    } else {
                        log::warn!(
                            "async handler for '{name}' skipped: sync dispatch outside a runtime"
                        );
                    }
                }
            }
        }
        ctx
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().expect("event registry poisoned");
        let total: usize = handlers.values().map(Vec::len).sum();
        f.debug_struct("EventRouter")
            .field("events", &handlers.len())
            .field("handlers", &total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("low", -5), ("mid", 0), ("high", 10)] {
            let order = Arc::clone(&order);
            router.on_with(
                "x:y:before",
                HandlerOptions::priority(priority),
                move |_ctx| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(label);
                        Ok(HandlerOutcome::Continue)
                    }
                },
            );
        }

        router.apply("x:y:before", json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_equal_priority_runs_in_registration_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            router.on("x:y:before", move |_ctx| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(label);
                    Ok(HandlerOutcome::Continue)
                }
            });
        }

        router.apply("x:y:before", json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_predicate_skips_without_side_effects() {
        let router = EventRouter::new();
        let fired = Arc::new(Mutex::new(0));
        let fired_clone = Arc::clone(&fired);

        router.on_with(
            "tool:call:before",
            HandlerOptions::default().with_predicate(|params| params["name"] == "weather"),
            move |_ctx| {
                let fired = Arc::clone(&fired_clone);
                async move {
                    *fired.lock().unwrap() += 1;
                    Ok(HandlerOutcome::Continue)
                }
            },
        );

        router
            .apply("tool:call:before", json!({"name": "calculator"}))
            .await;
        assert_eq!(*fired.lock().unwrap(), 0);

        router
            .apply("tool:call:before", json!({"name": "weather"}))
            .await;
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_params_visible_to_later_handlers() {
        let router = EventRouter::new();

        router.on_with("x:y:before", HandlerOptions::priority(10), |_ctx| async {
            Ok(HandlerOutcome::UpdateParams(json!({"value": 2})))
        });

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        router.on("x:y:before", move |ctx| {
            let seen = Arc::clone(&seen_clone);
            async move {
                *seen.lock().unwrap() = Some(ctx.params.clone());
                Ok(HandlerOutcome::Continue)
            }
        });

        let ctx = router.apply("x:y:before", json!({"value": 1})).await;
        assert_eq!(ctx.params, json!({"value": 2}));
        assert_eq!(seen.lock().unwrap().clone(), Some(json!({"value": 2})));
    }

    #[tokio::test]
    async fn test_interrupt_stops_iteration() {
        let router = EventRouter::new();
        let later_ran = Arc::new(Mutex::new(false));

        router.on_with("x:y:before", HandlerOptions::priority(10), |_ctx| async {
            Ok(HandlerOutcome::Interrupt(Some("blocked".to_string())))
        });

        let later = Arc::clone(&later_ran);
        router.on("x:y:before", move |_ctx| {
            let later = Arc::clone(&later);
            async move {
                *later.lock().unwrap() = true;
                Ok(HandlerOutcome::Continue)
            }
        });

        let ctx = router.apply("x:y:before", json!({})).await;
        assert!(ctx.interrupted);
        assert_eq!(ctx.interrupt_reason.as_deref(), Some("blocked"));
        assert!(!*later_ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_interrupt_on_interceptable() {
        let router = EventRouter::new();
        router.on("x:y:before", |_ctx| async {
            Err(crate::Error::other("handler exploded"))
        });

        let ctx = router.apply("x:y:before", json!({})).await;
        assert!(ctx.interrupted);
        assert!(ctx.interrupt_reason.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_handler_error_logged_on_signal() {
        let router = EventRouter::new();
        router.on("x:y:after", |_ctx| async {
            Err(crate::Error::other("observer exploded"))
        });
        let survived = Arc::new(Mutex::new(false));
        let survived_clone = Arc::clone(&survived);
        router.on("x:y:after", move |_ctx| {
            let survived = Arc::clone(&survived_clone);
            async move {
                *survived.lock().unwrap() = true;
                Ok(HandlerOutcome::Continue)
            }
        });

        let ctx = router.apply("x:y:after", json!({})).await;
        assert!(!ctx.interrupted);
        assert!(*survived.lock().unwrap());
    }

    #[tokio::test]
    async fn test_around_phase_can_replace_output() {
        let router = EventRouter::new();
        router.on("x:y:before", |_ctx| async {
            Ok(HandlerOutcome::Output(json!("draft")))
        });
        router.on_with(
            "x:y:before",
            HandlerOptions::default().with_phase(LifecyclePhase::Around),
            |ctx| async move {
                let wrapped = format!("wrapped:{}", ctx.output.unwrap().as_str().unwrap());
                Ok(HandlerOutcome::Output(json!(wrapped)))
            },
        );

        let ctx = router.apply("x:y:before", json!({})).await;
        assert_eq!(ctx.output, Some(json!("wrapped:draft")));
    }

    #[tokio::test]
    async fn test_sync_dispatch_runs_sync_handlers_inline() {
        let router = EventRouter::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);

        router.on_sync("x:y:after", move |_ctx| {
            *count_clone.lock().unwrap() += 1;
            Ok(HandlerOutcome::Continue)
        });

        router.dispatch("x:y:after", json!({}));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_dispatch_spawns_async_handlers() {
        let router = EventRouter::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        router.on("x:y:after", move |_ctx| {
            let tx = Arc::clone(&tx);
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(HandlerOutcome::Continue)
            }
        });

        router.dispatch("x:y:after", json!({}));
        // The spawned handler completes without the dispatcher awaiting it.
        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .expect("async handler never ran")
            .unwrap();
    }

    #[tokio::test]
    async fn test_registration_during_dispatch_is_safe() {
        let router = Arc::new(EventRouter::new());
        let router_clone = Arc::clone(&router);

        router.on("x:y:before", move |_ctx| {
            let router = Arc::clone(&router_clone);
            async move {
                // Registering while an emission is in flight must not deadlock.
                router.on("x:y:before", |_ctx| async { Ok(HandlerOutcome::Continue) });
                Ok(HandlerOutcome::Continue)
            }
        });

        router.apply("x:y:before", json!({})).await;
        assert_eq!(router.handler_count("x:y:before"), 2);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let router = EventRouter::new();
        let id = router.on("x:y:before", |_ctx| async { Ok(HandlerOutcome::Continue) });
        assert_eq!(router.handler_count("x:y:before"), 1);
        assert!(router.off("x:y:before", id));
        assert_eq!(router.handler_count("x:y:before"), 0);
        assert!(!router.off("x:y:before", id));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify("tool:call:before"), EventKind::Interceptable);
        assert_eq!(classify("tool:call:after"), EventKind::Signal);
        assert_eq!(classify("llm:complete:error"), EventKind::Signal);
        assert_eq!(classify("agent:version:change"), EventKind::Signal);
        // Error events with fallback contracts are interceptable.
        assert_eq!(classify(EVENT_EXECUTE_ERROR), EventKind::Interceptable);
        assert_eq!(classify(EVENT_TOOL_CALL_ERROR), EventKind::Interceptable);
    }
}
