//! Core type definitions for the agent runtime.
//!
//! This module contains the fundamental data structures used throughout the
//! runtime. The type system is organized into three main categories:
//!
//! # Message System
//!
//! - [`Message`]: the unit of conversation, with a stable sortable [`MessageId`],
//!   a role, and a list of [`ContentPart`]s
//! - [`MessageRole`]: who produced the message (System, User, Assistant, Tool)
//! - [`ContentPart`]: typed content fragments (text, template, image, file)
//! - [`ToolCallRequest`]: an assistant's request to invoke a tool
//! - [`Usage`]: token accounting attached by the language-model port
//!
//! # Wire Format
//!
//! The runtime communicates with language models through a provider-neutral
//! wire format:
//!
//! - [`FormattedMessage`]: `{role, content, name?, tool_call_id?, tool_calls?}`
//! - [`FormattedContent`]: a plain string or an ordered array of part objects
//! - [`FormattedToolCall`]: function-call payload with JSON-encoded arguments
//!
//! Conversion happens in [`Message::format_for_wire`]; the synthetic
//! tool-pair repair pass that runs over the formatted list lives in the
//! message store.
//!
//! # Identity
//!
//! [`MessageId`] is a 128-bit lexicographically sortable identifier minted by
//! a per-process monotonic generator: IDs created later always compare
//! greater, even within the same millisecond, and are never reused.
//!
//! # Example
//!
//! ```
//! use agent_runtime::{Message, MessageRole};
//!
//! let msg = Message::user("Hello, how are you?");
//! assert_eq!(msg.role, MessageRole::User);
//! assert_eq!(msg.text(), "Hello, how are you?");
//! ```

use crate::render::ContentRenderer;
use crate::{Error, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

// ============================================================================
// MESSAGE IDENTITY
// ============================================================================

/// 128-bit lexicographically sortable message identifier.
///
/// Layout: 48 bits of unix-millisecond timestamp, 16 bits of per-process
/// sequence, 64 random bits. The `Display` form is 32 lowercase hex
/// characters, so string order equals numeric order equals creation order.
///
/// IDs are minted through a process-wide generator that enforces strict
/// monotonicity: an ID requested after another always compares greater,
/// regardless of clock resolution. IDs are never reused.
///
/// # Example
///
/// ```
/// use agent_runtime::MessageId;
///
/// let a = MessageId::generate();
/// let b = MessageId::generate();
/// assert!(b > a);
/// assert_eq!(a.to_string().len(), 32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u128);

/// Process-wide state backing [`MessageId::generate`].
///
/// Holds the last minted value; candidates that would not sort after it are
/// bumped to `last + 1`.
struct MessageIdGenerator {
    last: Mutex<u128>,
}

static ID_GENERATOR: OnceLock<MessageIdGenerator> = OnceLock::new();

impl MessageId {
    /// Mint a new globally monotonic ID.
    pub fn generate() -> Self {
        let generator = ID_GENERATOR.get_or_init(|| MessageIdGenerator {
            last: Mutex::new(0),
        });
        let millis = Utc::now().timestamp_millis().max(0) as u128;
        let entropy: u64 = rand::random();

        // 48-bit millis | 16-bit sequence (0 for fresh candidates) | 64-bit entropy
        let candidate = ((millis & 0xFFFF_FFFF_FFFF) << 80) | (entropy as u128);

        let mut last = generator.last.lock().expect("id generator poisoned");
        let id = if candidate > *last {
            candidate
        } else {
            // Same-millisecond collision or clock regression: bump into the
            // sequence bits so ordering still matches mint order.
            *last + 1
        };
        *last = id;
        MessageId(id)
    }

    /// The raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Construct from a raw value. Intended for deserialization; IDs built
    /// this way bypass the monotonic generator.
    pub fn from_u128(raw: u128) -> Self {
        MessageId(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(Error::invalid_input("message id must be 32 hex characters"));
        }
        let raw = u128::from_str_radix(s, 16)
            .map_err(|_| Error::invalid_input("message id is not valid hex"))?;
        Ok(MessageId(raw))
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// ROLES AND CONTENT PARTS
// ============================================================================

/// Identifies the sender/role of a message in the conversation.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, `"assistant"`,
/// `"tool"`) to match the wire format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Establishes agent behavior and context; typically first in a conversation.
    System,
    /// Input from the human or calling application.
    User,
    /// Response from the model; may carry tool calls.
    Assistant,
    /// Result of a tool execution, tied to an assistant tool call.
    Tool,
}

impl MessageRole {
    /// The lowercase wire name for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image detail level for vision-capable models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    /// Low resolution, fixed token cost
    Low,
    /// High resolution, variable token cost
    High,
    /// Model decides (default)
    #[default]
    Auto,
}

impl fmt::Display for ImageDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageDetail::Low => write!(f, "low"),
            ImageDetail::High => write!(f, "high"),
            ImageDetail::Auto => write!(f, "auto"),
        }
    }
}

/// Where image content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Remote or data URL
    Url {
        /// The image URL
        url: String,
    },
    /// Raw bytes, encoded to a data URI at materialization time
    Bytes {
        /// Raw image bytes
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// MIME type, e.g. `image/png`
        mime: String,
    },
}

impl ImageSource {
    /// Render as a URL the wire format accepts (data URI for raw bytes).
    pub fn to_url(&self) -> String {
        match self {
            ImageSource::Url { url } => url.clone(),
            ImageSource::Bytes { data, mime } => format!(
                "data:{};base64,{}",
                mime,
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
        }
    }
}

/// Where file content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSource {
    /// Path on the local filesystem; resolution is the caller's concern
    Path {
        /// Filesystem path
        path: String,
    },
    /// Inline bytes with a display name
    Bytes {
        /// Raw file bytes
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// File name shown to the model
        name: String,
    },
}

/// Serde helper: binary payloads as base64 strings in storage snapshots.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Typed content fragments that make up a message.
///
/// Uses serde's internally tagged format with a `"type"` field:
///
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "template", "template": "Hi {{name}}", "required_vars": ["name"]}
/// {"type": "image", "source": {"kind": "url", "url": "https://..."}, "detail": "auto"}
/// {"type": "file", "source": {"kind": "path", "path": "notes.md"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text content.
    Text {
        /// The text content
        text: String,
    },

    /// Deferred-render template content.
    ///
    /// The template string is rendered against the message's context snapshot
    /// when the message is materialized for the model or for display. The
    /// snapshot makes render output reproducible after storage round-trips.
    Template {
        /// Template source, `{{var}}` placeholders
        template: String,
        /// Variables the template needs; materialization fails if one is
        /// missing from the snapshot
        required_vars: Vec<String>,
        /// Variable values captured when the part was created
        #[serde(skip_serializing_if = "Option::is_none")]
        context_snapshot: Option<Value>,
    },

    /// Image content for vision-capable models.
    Image {
        /// URL or raw bytes
        source: ImageSource,
        /// Resolution hint
        #[serde(default)]
        detail: ImageDetail,
    },

    /// File attachment.
    File {
        /// Path or raw bytes
        source: FileSource,
    },
}

impl ContentPart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Create a template part with its context captured now.
    pub fn template(
        template: impl Into<String>,
        required_vars: Vec<String>,
        context_snapshot: Option<Value>,
    ) -> Self {
        ContentPart::Template {
            template: template.into(),
            required_vars,
            context_snapshot,
        }
    }

    /// Render this part to display text.
    ///
    /// Text renders as-is; templates render through the supplied renderer
    /// against their context snapshot; images and files render as short
    /// placeholders.
    pub fn render(&self, renderer: &dyn ContentRenderer) -> Result<String> {
        match self {
            ContentPart::Text { text } => Ok(text.clone()),
            ContentPart::Template {
                template,
                required_vars,
                context_snapshot,
            } => {
                let context = context_snapshot.clone().unwrap_or(Value::Null);
                for var in required_vars {
                    if context.get(var).is_none() {
                        return Err(Error::invalid_input(format!(
                            "template variable '{var}' missing from context snapshot"
                        )));
                    }
                }
                renderer.render(template, &context)
            }
            ContentPart::Image { source, .. } => Ok(format!("[image: {}]", source.to_url())),
            ContentPart::File { source } => match source {
                FileSource::Path { path } => Ok(format!("[file: {path}]")),
                FileSource::Bytes { name, .. } => Ok(format!("[file: {name}]")),
            },
        }
    }
}

// ============================================================================
// TOOL CALLS AND USAGE
// ============================================================================

/// An assistant's request to invoke a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Unique identifier for this call; tool responses echo it back
    pub id: String,
    /// Name of the tool to execute
    pub name: String,
    /// JSON arguments for the tool
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Create a new tool call request.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Token accounting reported by the language-model port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens generated in the completion
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens
    pub total_tokens: u32,
}

// ============================================================================
// MESSAGE
// ============================================================================

/// A complete message in a conversation.
///
/// Messages are the primary unit of the runtime. Every message has a stable
/// monotonic [`MessageId`], a UTC timestamp, a role, and one or more
/// [`ContentPart`]s. Role-specific fields (`tool_calls`, `reasoning`,
/// `tool_call_id`, ...) are optional and only populated by the matching
/// constructors, which keeps invalid combinations unrepresentable through
/// the public surface.
///
/// # Message Patterns
///
/// ```
/// use agent_runtime::{Message, ToolCallRequest};
/// use serde_json::json;
///
/// // Simple user input
/// let user = Message::user("What's the weather in Paris?");
///
/// // Assistant requesting a tool
/// let assistant = Message::assistant_with_tool_calls(
///     "Let me check.",
///     vec![ToolCallRequest::new("call_1", "get_weather", json!({"city": "Paris"}))],
/// );
///
/// // The paired tool response
/// let tool = Message::tool("call_1", "get_weather", json!({"temp": 18}));
/// assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable monotonic identifier
    pub id: MessageId,

    /// Who produced this message
    pub role: MessageRole,

    /// Creation time, UTC
    pub timestamp: DateTime<Utc>,

    /// Optional participant name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ordered content parts
    pub content: Vec<ContentPart>,

    /// Rendering-context snapshot captured at append time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<Value>,

    /// Token accounting, when the model reported it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Assistant only: ordered tool invocation requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    /// Assistant only: model reasoning trace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Assistant only: refusal text when the model declined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,

    /// Assistant only: source citations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Value>>,

    /// Assistant only: provider annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Value>>,

    /// Assistant only: validated structured payload when a response model
    /// was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,

    /// Tool only: ID of the assistant tool call this answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool only: name of the tool that produced this result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    fn base(role: MessageRole, content: Vec<ContentPart>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            timestamp: Utc::now(),
            name: None,
            content,
            context_snapshot: None,
            usage: None,
            tool_calls: None,
            reasoning: None,
            refusal: None,
            citations: None,
            annotations: None,
            structured: None,
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Create a system message with text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self::base(MessageRole::System, vec![ContentPart::text(text)])
    }

    /// Create a user message with text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self::base(MessageRole::User, vec![ContentPart::text(text)])
    }

    /// Create a user message from explicit content parts.
    pub fn user_with_parts(content: Vec<ContentPart>) -> Self {
        Self::base(MessageRole::User, content)
    }

    /// Create an assistant message with text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(MessageRole::Assistant, vec![ContentPart::text(text)])
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };
        let mut msg = Self::base(MessageRole::Assistant, content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Create an assistant message carrying a validated structured payload.
    pub fn assistant_structured(text: impl Into<String>, structured: Value) -> Self {
        let mut msg = Self::assistant(text);
        msg.structured = Some(structured);
        msg
    }

    /// Create a tool response message.
    ///
    /// The content value is stored as JSON text; non-string values are
    /// serialized, strings are kept verbatim.
    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Value,
    ) -> Self {
        let text = match content {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let mut msg = Self::base(MessageRole::Tool, vec![ContentPart::text(text)]);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// Create a message with an arbitrary role and content parts.
    pub fn with_role(role: MessageRole, content: Vec<ContentPart>) -> Self {
        Self::base(role, content)
    }

    /// Attach a participant name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach token usage.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attach a rendering-context snapshot.
    pub fn with_context_snapshot(mut self, snapshot: Value) -> Self {
        self.context_snapshot = Some(snapshot);
        self
    }

    /// Whether this assistant message requests any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Concatenated text of all plain-text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render all parts to display text through the given renderer.
    pub fn render(&self, renderer: &dyn ContentRenderer) -> Result<String> {
        let rendered: Result<Vec<String>> =
            self.content.iter().map(|p| p.render(renderer)).collect();
        Ok(rendered?.join("\n"))
    }

    /// JSON-compatible snapshot suitable for caller-driven persistence.
    ///
    /// The snapshot captures every content part, including template context
    /// snapshots, so a reconstructed message renders identically.
    pub fn serialize_for_storage(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reconstruct a message from a storage snapshot.
    pub fn from_storage(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Convert to the wire format the language model accepts.
    ///
    /// Templates render against their context snapshot. A message whose parts
    /// are all text collapses to a plain string `content`; multi-modal
    /// messages produce an ordered part array.
    pub fn format_for_wire(&self, renderer: &dyn ContentRenderer) -> Result<FormattedMessage> {
        let all_text = self
            .content
            .iter()
            .all(|p| matches!(p, ContentPart::Text { .. } | ContentPart::Template { .. }));

        let content = if all_text {
            FormattedContent::Text(self.render(renderer)?)
        } else {
            let mut parts = Vec::with_capacity(self.content.len());
            for part in &self.content {
                parts.push(match part {
                    ContentPart::Text { .. } | ContentPart::Template { .. } => {
                        FormattedPart::Text {
                            text: part.render(renderer)?,
                        }
                    }
                    ContentPart::Image { source, detail } => FormattedPart::ImageUrl {
                        image_url: FormattedImageUrl {
                            url: source.to_url(),
                            detail: *detail,
                        },
                    },
                    ContentPart::File { source } => FormattedPart::File {
                        file: match source {
                            FileSource::Path { path } => serde_json::json!({ "path": path }),
                            FileSource::Bytes { data, name } => serde_json::json!({
                                "name": name,
                                "data": base64::engine::general_purpose::STANDARD.encode(data),
                            }),
                        },
                    },
                });
            }
            FormattedContent::Parts(parts)
        };

        let tool_calls = self.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| FormattedToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: FormattedFunction {
                        name: c.name.clone(),
                        arguments: c.arguments.to_string(),
                    },
                })
                .collect()
        });

        Ok(FormattedMessage {
            role: self.role.as_str().to_string(),
            content,
            name: self.name.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls,
        })
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// Message content in the wire format: a plain string or an ordered array
/// of part objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FormattedContent {
    /// Plain string content
    Text(String),
    /// Multi-modal part array
    Parts(Vec<FormattedPart>),
}

impl FormattedContent {
    /// The string content, when this is the plain-text form.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormattedContent::Text(s) => Some(s),
            FormattedContent::Parts(_) => None,
        }
    }
}

/// A single wire-format content part object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormattedPart {
    /// `{"type":"text","text":...}`
    Text {
        /// The text content
        text: String,
    },
    /// `{"type":"image_url","image_url":{"url":...,"detail":...}}`
    ImageUrl {
        /// URL payload
        image_url: FormattedImageUrl,
    },
    /// `{"type":"file","file":{...}}`
    File {
        /// Provider-specific file object
        file: Value,
    },
}

/// URL + detail payload of an image part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedImageUrl {
    /// Image URL or data URI
    pub url: String,
    /// Resolution hint
    pub detail: ImageDetail,
}

/// Wire-format tool call attached to an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedToolCall {
    /// Call identifier, echoed by the paired tool message
    pub id: String,
    /// Always `"function"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Function name and JSON-encoded arguments
    pub function: FormattedFunction,
}

/// Function payload of a wire-format tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedFunction {
    /// Tool name
    pub name: String,
    /// Arguments as a JSON-encoded string
    pub arguments: String,
}

/// A fully rendered message in the wire format.
///
/// This is what [`crate::MessageStore::materialize_for_llm`] produces and what
/// the [`crate::LanguageModel`] port consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedMessage {
    /// Lowercase role name
    pub role: String,
    /// String or part-array content
    pub content: FormattedContent,
    /// Optional participant name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool messages: the call being answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant messages: requested calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<FormattedToolCall>>,
}

impl FormattedMessage {
    /// Synthetic tool response used by the pairing-repair pass.
    pub fn synthetic_tool_response(tool_call_id: impl Into<String>) -> Self {
        FormattedMessage {
            role: "tool".to_string(),
            content: FormattedContent::Text("{}".to_string()),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}
