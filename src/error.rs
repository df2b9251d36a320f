//! Error types for the agent runtime

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime
///
/// The variants fall into three propagation classes:
///
/// - **Fatal**: [`Config`](Error::Config), [`InvariantViolation`](Error::InvariantViolation),
///   [`AgentClosed`](Error::AgentClosed) — programmer or setup errors that abort the operation.
/// - **Captured as data**: [`ToolNotFound`](Error::ToolNotFound), [`ToolInvalid`](Error::ToolInvalid),
///   [`ToolFailed`](Error::ToolFailed) — surfaced as error content inside tool messages,
///   never propagated out of tool resolution.
/// - **Recoverable**: [`Llm`](Error::Llm) with `retryable=true` re-enters the execute loop;
///   everything else surfaces through the `execute:error` event, which may supply a fallback.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or missing model capability
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No tool registered under the requested name
    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    /// Tool arguments failed validation
    #[error("Invalid tool invocation: {0}")]
    ToolInvalid(String),

    /// Tool handler returned an error
    #[error("Tool execution failed: {0}")]
    ToolFailed(#[source] anyhow::Error),

    /// Error reported by the language-model port
    #[error("LLM error{}: {message}", .provider_code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Llm {
        /// Human-readable description from the provider
        message: String,
        /// Provider-specific error code, when one was reported
        provider_code: Option<String>,
        /// Whether the LLM port considers the call worth retrying
        retryable: bool,
    },

    /// Mode handler misbehaved during the named phase ("setup" or "cleanup")
    #[error("Mode handler error during {phase}: {message}")]
    ModeHandler {
        /// Which half of the mode lifecycle failed
        phase: &'static str,
        /// What went wrong
        message: String,
    },

    /// A runtime invariant was violated; this represents a bug in the caller or the kernel
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// An event handler interrupted the flow
    #[error("Interrupted{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Interrupted {
        /// Optional explanation supplied by the interrupting handler
        reason: Option<String>,
    },

    /// Any operation attempted on a closed agent
    #[error("Agent is closed")]
    AgentClosed,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a tool-not-found error
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Error::ToolNotFound(name.into())
    }

    /// Create an invalid-tool-invocation error
    pub fn tool_invalid(msg: impl Into<String>) -> Self {
        Error::ToolInvalid(msg.into())
    }

    /// Wrap a tool handler failure
    pub fn tool_failed(inner: impl Into<anyhow::Error>) -> Self {
        Error::ToolFailed(inner.into())
    }

    /// Create an LLM error
    pub fn llm(msg: impl Into<String>, provider_code: Option<String>, retryable: bool) -> Self {
        Error::Llm {
            message: msg.into(),
            provider_code,
            retryable,
        }
    }

    /// Create a mode handler error for the given phase
    pub fn mode_handler(phase: &'static str, msg: impl Into<String>) -> Self {
        Error::ModeHandler {
            phase,
            message: msg.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Create an interrupt error with an optional reason
    pub fn interrupted(reason: Option<String>) -> Self {
        Error::Interrupted { reason }
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether this error may be retried by the execute loop
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Llm { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("missing model");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: missing model");
    }

    #[test]
    fn test_error_tool_not_found() {
        let err = Error::tool_not_found("weather");
        assert!(matches!(err, Error::ToolNotFound(_)));
        assert_eq!(err.to_string(), "Tool 'weather' not found");
    }

    #[test]
    fn test_error_tool_failed_wraps_source() {
        let err = Error::tool_failed(anyhow::anyhow!("boom"));
        assert!(matches!(err, Error::ToolFailed(_)));
        assert_eq!(err.to_string(), "Tool execution failed: boom");
    }

    #[test]
    fn test_error_llm_with_code() {
        let err = Error::llm("rate limited", Some("429".to_string()), true);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "LLM error (429): rate limited");
    }

    #[test]
    fn test_error_llm_without_code() {
        let err = Error::llm("bad request", None, false);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "LLM error: bad request");
    }

    #[test]
    fn test_error_mode_handler() {
        let err = Error::mode_handler("setup", "handler panicked");
        assert_eq!(
            err.to_string(),
            "Mode handler error during setup: handler panicked"
        );
    }

    #[test]
    fn test_error_interrupted_with_reason() {
        let err = Error::interrupted(Some("blocked by policy".to_string()));
        assert_eq!(err.to_string(), "Interrupted: blocked by policy");
    }

    #[test]
    fn test_error_interrupted_without_reason() {
        let err = Error::interrupted(None);
        assert_eq!(err.to_string(), "Interrupted");
    }

    #[test]
    fn test_error_agent_closed() {
        let err = Error::AgentClosed;
        assert_eq!(err.to_string(), "Agent is closed");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_only_retryable_llm_errors_retry() {
        assert!(!Error::config("x").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::llm("x", None, false).is_retryable());
        assert!(Error::llm("x", None, true).is_retryable());
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
