//! Tool system: definitions, registry, and the parallel executor.
//!
//! The tool system has three layers:
//!
//! 1. **Definition** — [`Tool`] carries metadata (name, description, JSON
//!    schema) and an async handler. Schemas may be written in simple type
//!    notation, extended property notation, or full JSON Schema; all are
//!    normalized to the standard structure providers expect.
//!
//! 2. **Registry** — [`ToolRegistry`] is the shared, name-keyed tool set.
//!    Executors snapshot it at the start of a resolution pass, so dynamic
//!    registration never affects an in-flight resolve.
//!
//! 3. **Execution** — [`ToolExecutor`] invokes tools with the full event
//!    flow (`tool:call:before` may short-circuit, `tool:call:error` may
//!    supply a fallback, `tool:call:after` observes) and guarantees that
//!    responses are emitted in the order of the assistant's tool calls no
//!    matter which tool finishes first.
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_runtime::tool;
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a location")
//!     .param("location", "string")
//!     .optional_param("units", "string")
//!     .build(|args| async move {
//!         let location = args["location"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"location": location, "temperature": 22}))
//!     });
//! ```

use crate::events::{
    EventRouter, EVENT_TOOL_CALL_AFTER, EVENT_TOOL_CALL_BEFORE, EVENT_TOOL_CALL_ERROR,
};
use crate::store::MessageStore;
use crate::types::{Message, ToolCallRequest};
use crate::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

/// Type alias for tool handler functions.
///
/// Handlers take JSON arguments and return a pinned, boxed future producing
/// a JSON result. `Arc` makes tools cheap to clone into concurrent tasks;
/// `Send + Sync` bounds let them cross thread boundaries on a multi-threaded
/// runtime.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

// ============================================================================
// TOOL DEFINITION
// ============================================================================

/// A callable capability the model may invoke.
///
/// Tools are immutable once created: metadata and handler never change,
/// which keeps concurrent access lock-free. Cloning is cheap — strings plus
/// an `Arc` bump.
#[derive(Clone)]
pub struct Tool {
    /// Unique snake_case identifier the model calls the tool by.
    name: String,

    /// Description sent to the model; this is what drives tool selection,
    /// so it should state purpose and key parameters in a sentence or two.
    description: String,

    /// Normalized JSON Schema of the arguments.
    input_schema: Value,

    /// The async implementation.
    handler: ToolHandler,
}

impl Tool {
    /// Create a tool with flexible schema notation.
    ///
    /// Accepted schema forms, all normalized to full JSON Schema:
    ///
    /// - Simple: `{"location": "string"}` — every parameter required
    /// - Extended: `{"limit": {"type": "integer", "optional": true}}`
    /// - Full JSON Schema with `"type"` and `"properties"` — passed through
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use agent_runtime::Tool;
    /// use serde_json::json;
    ///
    /// let add = Tool::new(
    ///     "add",
    ///     "Add two numbers together",
    ///     json!({"a": "number", "b": "number"}),
    ///     |args| Box::pin(async move {
    ///         let a = args["a"].as_f64().unwrap_or(0.0);
    ///         let b = args["b"].as_f64().unwrap_or(0.0);
    ///         Ok(json!({"result": a + b}))
    ///     }),
    /// );
    /// ```
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_schema(input_schema),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Execute the tool with the provided arguments.
    pub async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    /// The wire-format definition sent to providers:
    /// `{"type":"function","function":{name, description, parameters}}`.
    pub fn definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema
            }
        })
    }

    /// Returns the tool's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tool's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a reference to the tool's input schema.
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

/// Handler intentionally omitted: closures have no useful debug form.
impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Normalize the accepted schema notations to full JSON Schema.
///
/// A parameter is required unless it carries `"optional": true`,
/// `"required": false`, or a `"default"` value.
fn normalize_schema(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({"type": "object", "properties": {}, "required": []});
    };
    if obj.contains_key("type") && obj.contains_key("properties") {
        // Already full JSON Schema
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        if let Some(type_str) = param_type.as_str() {
            // Simple notation always means required
            properties.insert(param_name.clone(), type_to_json_schema(type_str));
            required.push(param_name.clone());
        } else if param_type.is_object() {
            let mut prop = param_type.clone();
            let prop_obj = prop.as_object_mut().expect("checked is_object");

            // "optional"/"required" markers are not standard JSON Schema;
            // strip them and fold into the required array.
            let is_optional = prop_obj
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
            let has_default = prop_obj.contains_key("default");

            properties.insert(param_name.clone(), prop);

            if is_required == Some(true) {
                required.push(param_name.clone());
            } else if is_optional || is_required == Some(false) {
                // explicitly optional
            } else if !has_default {
                required.push(param_name.clone());
            }
        }
    }

    json!({"type": "object", "properties": properties, "required": required})
}

/// Map friendly type names to JSON Schema types. Unknown names fall back to
/// `"string"` rather than failing.
fn type_to_json_schema(type_str: &str) -> Value {
    let schema_type = match type_str {
        "string" | "str" => "string",
        "number" | "float" | "f32" | "f64" => "number",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({"type": schema_type})
}

// ============================================================================
// TOOL BUILDER
// ============================================================================

/// Fluent builder returned by [`tool()`].
pub struct ToolBuilder {
    name: String,
    description: String,
    params: serde_json::Map<String, Value>,
}

impl ToolBuilder {
    /// Add a required parameter with a simple type name.
    pub fn param(mut self, name: impl Into<String>, type_str: impl AsRef<str>) -> Self {
        self.params
            .insert(name.into(), type_to_json_schema(type_str.as_ref()));
        self
    }

    /// Add an optional parameter with a simple type name.
    pub fn optional_param(mut self, name: impl Into<String>, type_str: impl AsRef<str>) -> Self {
        let mut schema = type_to_json_schema(type_str.as_ref());
        schema["optional"] = json!(true);
        self.params.insert(name.into(), schema);
        self
    }

    /// Add a parameter with an explicit schema object.
    pub fn param_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.params.insert(name.into(), schema);
        self
    }

    /// Attach the handler and produce the [`Tool`].
    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(
            self.name,
            self.description,
            Value::Object(self.params),
            handler,
        )
    }
}

/// Start building a tool.
///
/// ```rust,no_run
/// use agent_runtime::tool;
/// use serde_json::json;
///
/// let calc = tool("calculate", "Evaluate a math expression")
///     .param("expression", "string")
///     .build(|args| async move { Ok(json!({"result": 42})) });
/// ```
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        params: serde_json::Map::new(),
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Shared, name-keyed tool set.
///
/// Registration order is preserved (it determines definition order in
/// requests). Executors snapshot the list per resolution pass, so mutations
/// during a pass affect only later passes.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<Vec<Arc<Tool>>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are rejected.
    pub fn register(&self, tool: Tool) -> Result<()> {
        let mut tools = self.tools.write().expect("tool registry poisoned");
        if tools.iter().any(|t| t.name() == tool.name()) {
            return Err(Error::config(format!(
                "tool '{}' is already registered",
                tool.name()
            )));
        }
        tools.push(Arc::new(tool));
        Ok(())
    }

    /// Remove a tool by name. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().expect("tool registry poisoned");
        let before = tools.len();
        tools.retain(|t| t.name() != name);
        before != tools.len()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Wire-format definitions for every registered tool.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .iter()
            .map(|t| t.definition())
            .collect()
    }

    /// Point-in-time copy of the tool list.
    pub fn snapshot(&self) -> Vec<Arc<Tool>> {
        self.tools.read().expect("tool registry poisoned").clone()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry poisoned").len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// The outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// The call this response answers
    pub tool_call_id: String,
    /// Tool that produced it
    pub tool_name: String,
    /// Result payload; error details when `is_error`
    pub content: Value,
    /// Whether the invocation failed (failure is data, not an exception)
    pub is_error: bool,
}

impl ToolResponse {
    fn success(call: &ToolCallRequest, content: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    fn failure(call: &ToolCallRequest, error: impl std::fmt::Display) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: json!({
                "error": error.to_string(),
                "tool": call.name,
                "tool_call_id": call.id,
            }),
            is_error: true,
        }
    }
}

/// Aborts still-running invocation tasks when an ordered join is dropped,
/// so cancelling a resolve cancels its outstanding tools.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Invokes tools with full event flow and ordered emission.
///
/// Cheap to clone; the agent hands one to its execute loop and exposes
/// another through its public surface.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    router: Arc<EventRouter>,
    store: MessageStore,
    agent_id: String,
}

impl ToolExecutor {
    /// Create an executor over the given registry, router, and store.
    pub fn new(
        registry: ToolRegistry,
        router: Arc<EventRouter>,
        store: MessageStore,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            agent_id: agent_id.into(),
        }
    }

    /// The registry this executor draws from.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invoke a single tool by name.
    ///
    /// Runs the full event flow: `tool:call:before` may rewrite arguments or
    /// short-circuit with a synthetic response; on failure,
    /// `tool:call:error` may substitute a fallback. `tool:call:after` fires
    /// once a response exists.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        tool_call_id: Option<String>,
    ) -> Result<ToolResponse> {
        let id =
            tool_call_id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        let call = ToolCallRequest::new(id, name, arguments);
        let snapshot = self.registry.snapshot();
        let response = self.invoke_inner(&snapshot, &call).await?;
        self.emit_after(&response).await;
        Ok(response)
    }

    /// Invoke many tools concurrently; responses come back in input order.
    ///
    /// All invocations start before the first is awaited, so total latency
    /// is the slowest call, not the sum. Failures are captured as error
    /// responses, never propagated. Dropping the future aborts whatever is
    /// still running.
    pub async fn invoke_many(&self, calls: Vec<ToolCallRequest>) -> Vec<ToolResponse> {
        let snapshot = Arc::new(self.registry.snapshot());
        let handles = self.spawn_all(&snapshot, &calls);
        let mut responses = Vec::with_capacity(calls.len());
        let mut ordered = OrderedJoin::new(handles);
        for call in &calls {
            let response = ordered.next(call).await;
            self.emit_after(&response).await;
            responses.push(response);
        }
        responses
    }

    /// Resolve the unanswered tool calls of a pending assistant message.
    ///
    /// Invocations run in parallel; a `Tool` message is appended to the
    /// store for each call **in the order of `assistant.tool_calls`**, as
    /// each response becomes available. Responses appended before a
    /// cancellation stay committed.
    pub async fn resolve_pending(&self, assistant: &Message) -> Vec<Arc<Message>> {
        let Some(calls) = assistant.tool_calls.as_ref().filter(|c| !c.is_empty()) else {
            return Vec::new();
        };

        // Only calls not already answered by tool messages after the
        // assistant are pending.
        let messages = self.store.messages();
        let answered: HashSet<String> = match messages.iter().position(|m| m.id == assistant.id) {
            Some(idx) => messages[idx + 1..]
                .iter()
                .filter_map(|m| m.tool_call_id.clone())
                .collect(),
            None => HashSet::new(),
        };
        let pending: Vec<ToolCallRequest> = calls
            .iter()
            .filter(|c| !answered.contains(&c.id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let snapshot = Arc::new(self.registry.snapshot());
        let handles = self.spawn_all(&snapshot, &pending);
        let mut appended = Vec::with_capacity(pending.len());
        let mut ordered = OrderedJoin::new(handles);
        for call in &pending {
            let response = ordered.next(call).await;
            // Commit before observing: a response that exists reaches the
            // store even if a later await is cancelled.
            let msg = self.store.append(Message::tool(
                response.tool_call_id.clone(),
                response.tool_name.clone(),
                response.content.clone(),
            ));
            self.emit_after(&response).await;
            appended.push(msg);
        }
        appended
    }

    /// Start one task per call; tasks run concurrently from the moment they
    /// are spawned.
    fn spawn_all(
        &self,
        snapshot: &Arc<Vec<Arc<Tool>>>,
        calls: &[ToolCallRequest],
    ) -> Vec<JoinHandle<ToolResponse>> {
        calls
            .iter()
            .map(|call| {
                let executor = self.clone();
                let snapshot = Arc::clone(snapshot);
                let call = call.clone();
                tokio::spawn(async move { executor.invoke_captured(&snapshot, &call).await })
            })
            .collect()
    }

    /// Invoke with failures captured as error responses.
    async fn invoke_captured(
        &self,
        snapshot: &[Arc<Tool>],
        call: &ToolCallRequest,
    ) -> ToolResponse {
        match self.invoke_inner(snapshot, call).await {
            Ok(response) => response,
            Err(err) => ToolResponse::failure(call, err),
        }
    }

    /// The event-wrapped invocation core, without the `after` signal.
    async fn invoke_inner(
        &self,
        snapshot: &[Arc<Tool>],
        call: &ToolCallRequest,
    ) -> Result<ToolResponse> {
        let ctx = self
            .router
            .apply(
                EVENT_TOOL_CALL_BEFORE,
                json!({
                    "agent_id": self.agent_id,
                    "name": call.name,
                    "arguments": call.arguments,
                    "tool_call_id": call.id,
                }),
            )
            .await;

        if ctx.interrupted {
            return Err(Error::interrupted(ctx.interrupt_reason));
        }
        // A before-handler output is the response; the tool never runs.
        if let Some(output) = ctx.output {
            return Ok(ToolResponse::success(call, output));
        }

        // Handlers may have rewritten name or arguments.
        let name = ctx.params["name"].as_str().unwrap_or(&call.name).to_string();
        let arguments = ctx.params["arguments"].clone();

        let result = match snapshot.iter().find(|t| t.name() == name) {
            Some(tool) => tool.execute(arguments).await,
            None => Err(Error::tool_not_found(&name)),
        };

        match result {
            Ok(content) => Ok(ToolResponse::success(call, content)),
            Err(err) => {
                let error_ctx = self
                    .router
                    .apply(
                        EVENT_TOOL_CALL_ERROR,
                        json!({
                            "agent_id": self.agent_id,
                            "name": name,
                            "tool_call_id": call.id,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                // An error-handler output replaces the failure.
                match error_ctx.output {
                    Some(fallback) => Ok(ToolResponse::success(call, fallback)),
                    None => Err(err),
                }
            }
        }
    }

    async fn emit_after(&self, response: &ToolResponse) {
        self.router
            .apply(
                EVENT_TOOL_CALL_AFTER,
                json!({
                    "agent_id": self.agent_id,
                    "name": response.tool_name,
                    "tool_call_id": response.tool_call_id,
                    "result": response.content,
                    "is_error": response.is_error,
                }),
            )
            .await;
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.registry.len())
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

/// Awaits spawned invocation tasks in submission order, aborting the rest
/// on drop.
struct OrderedJoin {
    handles: std::vec::IntoIter<JoinHandle<ToolResponse>>,
    _abort: AbortOnDrop,
}

impl OrderedJoin {
    fn new(handles: Vec<JoinHandle<ToolResponse>>) -> Self {
        let abort = AbortOnDrop(handles.iter().map(JoinHandle::abort_handle).collect());
        Self {
            handles: handles.into_iter(),
            _abort: abort,
        }
    }

    async fn next(&mut self, call: &ToolCallRequest) -> ToolResponse {
        match self.handles.next() {
            Some(handle) => match handle.await {
                Ok(response) => response,
                Err(err) if err.is_cancelled() => ToolResponse::failure(call, "cancelled"),
                Err(err) => ToolResponse::failure(call, format!("tool task panicked: {err}")),
            },
            None => ToolResponse::failure(call, "missing invocation task"),
        }
    }
}
