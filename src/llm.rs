//! Language-model port.
//!
//! Provider SDKs, retry routing, and cost accounting live outside the
//! kernel; the runtime only speaks to this trait. Implementations adapt the
//! wire-format messages produced by the store to whatever transport they
//! use and hand back a provider-neutral [`ModelResponse`].
//!
//! [`ScriptedModel`] is the deterministic in-process implementation used by
//! the test suite (and handy for callers' own tests): each `complete` call
//! pops the next canned response off a queue and records the request so
//! assertions can inspect exactly what the kernel sent.

use crate::config::AgentConfig;
use crate::types::{FormattedMessage, Message, ToolCallRequest, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Stream of incremental completion chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A piece of assistant text
    TextDelta(String),
    /// A complete tool call parsed out of the stream
    ToolCall(ToolCallRequest),
    /// Token accounting, typically last before `Done`
    Usage(Usage),
    /// End of the stream
    Done,
}

/// The message inside a completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    /// Role reported by the provider, normally `"assistant"`
    pub role: String,
    /// Assistant text, when any was produced
    pub content: Option<String>,
    /// Tool calls requested by the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Model reasoning trace, when the provider exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Refusal text, when the model declined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    /// The produced message
    pub message: ResponseMessage,
    /// Why generation stopped (`"stop"`, `"tool_calls"`, ...)
    pub finish_reason: Option<String>,
}

/// Provider-neutral completion response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    /// Provider response ID
    pub id: String,
    /// When the response was created
    pub created_at: DateTime<Utc>,
    /// Model that produced it
    pub model: String,
    /// Completion choices; the kernel uses the first
    pub choices: Vec<Choice>,
    /// Token accounting
    pub usage: Option<Usage>,
    /// Passthrough provider fields the kernel does not interpret
    #[serde(default)]
    pub raw: Map<String, Value>,
}

impl ModelResponse {
    /// Build a plain text response (test and adapter convenience).
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            created_at: Utc::now(),
            model: model.into(),
            choices: vec![Choice {
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(content.into()),
                    tool_calls: None,
                    reasoning: None,
                    refusal: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
            raw: Map::new(),
        }
    }

    /// Build a response whose assistant message requests tool calls.
    pub fn with_tool_calls(
        model: impl Into<String>,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let content = content.into();
        let mut response = Self::text(model, content.clone());
        let choice = &mut response.choices[0];
        choice.message.content = if content.is_empty() {
            None
        } else {
            Some(content)
        };
        choice.message.tool_calls = Some(tool_calls);
        choice.finish_reason = Some("tool_calls".to_string());
        response
    }

    /// Attach usage numbers.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Convert the first choice into an assistant [`Message`].
    pub fn into_assistant_message(self) -> Result<Message> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm("response contained no choices", None, false))?;

        let mut msg = match choice.message.tool_calls {
            Some(calls) if !calls.is_empty() => Message::assistant_with_tool_calls(
                choice.message.content.unwrap_or_default(),
                calls,
            ),
            _ => Message::assistant(choice.message.content.unwrap_or_default()),
        };
        msg.reasoning = choice.message.reasoning;
        msg.refusal = choice.message.refusal;
        msg.usage = self.usage;
        Ok(msg)
    }
}

/// Response model for structured extraction: a name and a JSON schema the
/// payload must validate against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseModel {
    /// Schema name shown to the provider
    pub name: String,
    /// JSON schema of the expected payload
    pub schema: Value,
}

impl ResponseModel {
    /// Create a response model.
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Port to a language model provider.
///
/// The kernel calls [`complete`](LanguageModel::complete) for normal turns
/// and [`extract`](LanguageModel::extract) when a response model was
/// requested. Capability probes let the kernel fail fast instead of sending
/// requests the provider will reject.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One completion round-trip.
    async fn complete(
        &self,
        messages: &[FormattedMessage],
        config: &AgentConfig,
    ) -> Result<ModelResponse>;

    /// Structured extraction: produce a value validating against the
    /// response model's schema.
    async fn extract(
        &self,
        messages: &[FormattedMessage],
        response_model: &ResponseModel,
        config: &AgentConfig,
    ) -> Result<Value> {
        let _ = (messages, response_model, config);
        Err(Error::config("model does not support structured output"))
    }

    /// Streamed completion.
    async fn stream(
        &self,
        messages: &[FormattedMessage],
        config: &AgentConfig,
    ) -> Result<ChunkStream> {
        let _ = (messages, config);
        Err(Error::config("model does not support streaming"))
    }

    /// Whether the provider accepts tool definitions.
    fn supports_tools(&self) -> bool {
        true
    }

    /// Whether [`extract`](LanguageModel::extract) is implemented.
    fn supports_structured_output(&self) -> bool {
        false
    }

    /// Whether [`stream`](LanguageModel::stream) is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }
}

// ============================================================================
// SCRIPTED MOCK
// ============================================================================

/// One canned reply in a [`ScriptedModel`] queue.
#[derive(Debug, Clone)]
enum Script {
    Response(ModelResponse),
    Structured(Value),
}

/// A pre-scripted language model. Each `complete` call pops the next
/// response from the front of the queue; each call also records the request
/// so tests can inspect what the kernel actually sent.
///
/// # Example
///
/// ```
/// use agent_runtime::{ScriptedModel, ModelResponse};
///
/// let model = ScriptedModel::new(vec![
///     ModelResponse::text("mock-model", "first reply"),
///     ModelResponse::text("mock-model", "second reply"),
/// ]);
/// ```
pub struct ScriptedModel {
    scripts: Mutex<Vec<Script>>,
    /// Reply used when the queue is exhausted.
    fallback: String,
    /// Requests seen so far, oldest first.
    requests: Arc<Mutex<Vec<Vec<FormattedMessage>>>>,
}

impl ScriptedModel {
    /// Build a model from an ordered list of responses.
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            scripts: Mutex::new(responses.into_iter().map(Script::Response).collect()),
            fallback: "[no more scripts]".to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: model that answers every call with the same text.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut model = Self::new(Vec::new());
        model.fallback = reply.into();
        model
    }

    /// Convenience: a tool call round followed by a text round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ModelResponse::with_tool_calls(
                "scripted-mock",
                "",
                vec![ToolCallRequest::new(tool_id, tool_name, arguments)],
            ),
            ModelResponse::text("scripted-mock", final_text),
        ])
    }

    /// Append a structured-extraction script consumed by `extract`.
    pub fn push_structured(&self, value: Value) {
        self.scripts.lock().unwrap().push(Script::Structured(value));
    }

    /// Append another completion script.
    pub fn push_response(&self, response: ModelResponse) {
        self.scripts.lock().unwrap().push(Script::Response(response));
    }

    /// All requests recorded so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<FormattedMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// The most recent request, when one was made.
    pub fn last_request(&self) -> Option<Vec<FormattedMessage>> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn record(&self, messages: &[FormattedMessage]) {
        self.requests.lock().unwrap().push(messages.to_vec());
    }

    fn pop(&self) -> Option<Script> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            None
        } else {
            Some(scripts.remove(0))
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[FormattedMessage],
        _config: &AgentConfig,
    ) -> Result<ModelResponse> {
        self.record(messages);
        match self.pop() {
            Some(Script::Response(response)) => Ok(response),
            Some(Script::Structured(_)) => Err(Error::llm(
                "next script is a structured extraction; call extract",
                None,
                false,
            )),
            // Default fallback when all scripts are consumed
            None => Ok(ModelResponse::text("scripted-mock", self.fallback.clone())),
        }
    }

    async fn extract(
        &self,
        messages: &[FormattedMessage],
        _response_model: &ResponseModel,
        _config: &AgentConfig,
    ) -> Result<Value> {
        self.record(messages);
        match self.pop() {
            Some(Script::Structured(value)) => Ok(value),
            Some(Script::Response(_)) => Err(Error::llm(
                "next script is a completion; call complete",
                None,
                false,
            )),
            None => Err(Error::llm("no structured script queued", None, false)),
        }
    }

    fn supports_structured_output(&self) -> bool {
        true
    }
}

/// A model that always fails; for exercising error paths.
pub struct FailingModel {
    message: String,
    retryable: bool,
}

impl FailingModel {
    /// Create a model whose `complete` always returns the given error.
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }
}

#[async_trait]
impl LanguageModel for FailingModel {
    async fn complete(
        &self,
        _messages: &[FormattedMessage],
        _config: &AgentConfig,
    ) -> Result<ModelResponse> {
        Err(Error::llm(self.message.clone(), None, self.retryable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> AgentConfig {
        AgentConfig::builder().model("scripted-mock").build().unwrap()
    }

    fn user_wire(text: &str) -> Vec<FormattedMessage> {
        vec![FormattedMessage {
            role: "user".to_string(),
            content: crate::types::FormattedContent::Text(text.to_string()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }]
    }

    #[tokio::test]
    async fn test_scripted_pops_in_order() {
        let model = ScriptedModel::new(vec![
            ModelResponse::text("m", "one"),
            ModelResponse::text("m", "two"),
        ]);

        let first = model.complete(&user_wire("hi"), &config()).await.unwrap();
        let second = model.complete(&user_wire("hi"), &config()).await.unwrap();
        assert_eq!(first.choices[0].message.content.as_deref(), Some("one"));
        assert_eq!(second.choices[0].message.content.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_scripted_fallback_when_exhausted() {
        let model = ScriptedModel::new(vec![]);
        let response = model.complete(&user_wire("hi"), &config()).await.unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("[no more scripts]")
        );
    }

    #[tokio::test]
    async fn test_scripted_records_requests() {
        let model = ScriptedModel::new(vec![ModelResponse::text("m", "ok")]);
        model.complete(&user_wire("inspect me"), &config()).await.unwrap();

        let last = model.last_request().unwrap();
        assert_eq!(last[0].content.as_text(), Some("inspect me"));
    }

    #[tokio::test]
    async fn test_scripted_structured_extraction() {
        let model = ScriptedModel::new(vec![]);
        model.push_structured(json!({"name": "Ada", "age": 36}));

        let response_model = ResponseModel::new("person", json!({"type": "object"}));
        let value = model
            .extract(&user_wire("who?"), &response_model, &config())
            .await
            .unwrap();
        assert_eq!(value["name"], "Ada");
    }

    #[tokio::test]
    async fn test_tool_then_text_two_rounds() {
        let model =
            ScriptedModel::tool_then_text("call-1", "shell", json!({"command": "ls"}), "done");

        let round1 = model.complete(&user_wire("go"), &config()).await.unwrap();
        let calls = round1.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].name, "shell");

        let round2 = model.complete(&user_wire("go"), &config()).await.unwrap();
        assert_eq!(round2.choices[0].message.content.as_deref(), Some("done"));
    }

    #[test]
    fn test_response_into_assistant_message() {
        let response = ModelResponse::with_tool_calls(
            "m",
            "checking",
            vec![ToolCallRequest::new("c1", "weather", json!({}))],
        )
        .with_usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });

        let msg = response.into_assistant_message().unwrap();
        assert!(msg.has_tool_calls());
        assert_eq!(msg.text(), "checking");
        assert_eq!(msg.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_response_without_choices_is_error() {
        let mut response = ModelResponse::text("m", "x");
        response.choices.clear();
        assert!(response.into_assistant_message().is_err());
    }

    #[tokio::test]
    async fn test_failing_model() {
        let model = FailingModel::new("boom", true);
        let err = model.complete(&user_wire("hi"), &config()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
