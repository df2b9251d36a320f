//! Agent configuration.
//!
//! [`AgentConfig`] enumerates the model parameters the kernel understands;
//! anything provider-specific lives in the free-form `extras` map, which only
//! language-model port implementations consult. Construction goes through
//! [`AgentConfig::builder()`] so required fields and value ranges are
//! validated before an agent ever sees the config.
//!
//! # Example
//!
//! ```
//! use agent_runtime::AgentConfig;
//!
//! let config = AgentConfig::builder()
//!     .model("qwen2.5-32b-instruct")
//!     .temperature(0.2)
//!     .max_tokens(2048)
//!     .build()
//!     .expect("valid configuration");
//!
//! assert_eq!(config.model(), "qwen2.5-32b-instruct");
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Model and sampling configuration for an agent.
///
/// The execute loop snapshots this config per iteration; mode isolation
/// levels `config` and above restore the snapshot on scope exit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Model identifier handed to the language-model port.
    model: String,

    /// Sampling temperature, 0.0 to 2.0.
    temperature: f32,

    /// Maximum tokens to generate per response. `None` uses the provider
    /// default.
    max_tokens: Option<u32>,

    /// Nucleus sampling parameter, 0.0 to 1.0.
    top_p: Option<f32>,

    /// Per-call timeout in seconds, enforced around the LLM port.
    timeout: u64,

    /// Models to try, in order, when the primary model fails unretryably.
    /// Consulted only by LLM-port implementations.
    fallback_models: Vec<String>,

    /// Emit verbose dispatch logging.
    debug: bool,

    /// Whether the provider may execute tool calls in parallel. Stripped
    /// from the snapshot when no tools are in play; see
    /// [`AgentConfig::snapshot_for_request`].
    parallel_tool_calls: Option<bool>,

    /// Unrecognized provider-specific keys, passed through verbatim.
    extras: Map<String, Value>,
}

impl AgentConfig {
    /// Creates a new builder for constructing [`AgentConfig`].
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Returns the model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Returns the max-tokens setting.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// Returns the nucleus sampling parameter.
    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    /// Returns the per-call timeout in seconds.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// Returns the fallback model list.
    pub fn fallback_models(&self) -> &[String] {
        &self.fallback_models
    }

    /// Returns whether debug logging is enabled.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Returns the parallel-tool-calls flag.
    pub fn parallel_tool_calls(&self) -> Option<bool> {
        self.parallel_tool_calls
    }

    /// Returns the provider-specific extras map.
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    /// Mutable access to the extras map, for event handlers that tune
    /// provider behavior.
    pub fn extras_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extras
    }

    /// Replace the model identifier (mode config overrides use this).
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Replace the sampling temperature. Out-of-range values are rejected.
    pub fn set_temperature(&mut self, temperature: f32) -> Result<()> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::invalid_input(
                "temperature must be between 0.0 and 2.0",
            ));
        }
        self.temperature = temperature;
        Ok(())
    }

    /// Replace the max-tokens setting.
    pub fn set_max_tokens(&mut self, max_tokens: Option<u32>) {
        self.max_tokens = max_tokens;
    }

    /// Replace the parallel-tool-calls flag.
    pub fn set_parallel_tool_calls(&mut self, value: Option<bool>) {
        self.parallel_tool_calls = value;
    }

    /// Config snapshot handed to the LLM port for one request.
    ///
    /// When the request carries no tools, `parallel_tool_calls` is stripped:
    /// providers reject the flag on tool-less requests. An event handler may
    /// re-add the key through `extras`; that is honored but logged, since it
    /// usually indicates a handler operating on stale assumptions.
    pub fn snapshot_for_request(&self, has_tools: bool) -> AgentConfig {
        let mut snapshot = self.clone();
        if !has_tools {
            if snapshot.parallel_tool_calls.take().is_some() {
                log::debug!("stripping parallel_tool_calls from tool-less request");
            }
            if snapshot.extras.contains_key("parallel_tool_calls") {
                log::warn!(
                    "parallel_tool_calls present in extras on a tool-less request; passing through"
                );
            }
        }
        snapshot
    }
}

/// Defaults chosen for deterministic single-agent use.
impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // Empty string forces users to explicitly choose a model
            model: String::new(),
            // 0.7 balances creativity with consistency for general use
            temperature: 0.7,
            max_tokens: None,
            top_p: None,
            // 30 seconds handles most requests without timing out prematurely
            timeout: 30,
            fallback_models: Vec::new(),
            debug: false,
            parallel_tool_calls: None,
            extras: Map::new(),
        }
    }
}

/// Builder for constructing [`AgentConfig`] with validation.
///
/// # Required Fields
///
/// - `model`: the model identifier
///
/// All other fields have defaults.
///
/// # Example
///
/// ```
/// use agent_runtime::AgentConfig;
///
/// let config = AgentConfig::builder()
///     .model("qwen2.5-32b-instruct")
///     .timeout(120)
///     .fallback_model("qwen2.5-7b-instruct")
///     .build()
///     .expect("valid configuration");
/// ```
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    timeout: Option<u64>,
    fallback_models: Vec<String>,
    debug: Option<bool>,
    parallel_tool_calls: Option<bool>,
    extras: Map<String, Value>,
}

impl AgentConfigBuilder {
    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the maximum tokens to generate per response.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the nucleus sampling parameter.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Sets the per-call timeout in seconds.
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a fallback model; may be called multiple times.
    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_models.push(model.into());
        self
    }

    /// Enables verbose dispatch logging.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Sets the parallel-tool-calls flag.
    pub fn parallel_tool_calls(mut self, value: bool) -> Self {
        self.parallel_tool_calls = Some(value);
        self
    }

    /// Adds a provider-specific extra key.
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Validates configuration and builds the final [`AgentConfig`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `model` is missing or empty, or an
    /// invalid-input error for out-of-range `temperature`, `top_p`, or a
    /// zero `max_tokens`.
    pub fn build(self) -> Result<AgentConfig> {
        let model = self.model.ok_or_else(|| Error::config("model is required"))?;
        if model.trim().is_empty() {
            return Err(Error::invalid_input("model cannot be empty or whitespace"));
        }

        let temperature = self.temperature.unwrap_or(0.7);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::invalid_input(
                "temperature must be between 0.0 and 2.0",
            ));
        }

        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(Error::invalid_input("top_p must be between 0.0 and 1.0"));
            }
        }

        if let Some(tokens) = self.max_tokens {
            if tokens == 0 {
                return Err(Error::invalid_input("max_tokens must be greater than 0"));
            }
        }

        Ok(AgentConfig {
            model,
            temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            timeout: self.timeout.unwrap_or(30),
            fallback_models: self.fallback_models,
            debug: self.debug.unwrap_or(false),
            parallel_tool_calls: self.parallel_tool_calls,
            extras: self.extras,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_requires_model() {
        let result = AgentConfig::builder().build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_rejects_blank_model() {
        let result = AgentConfig::builder().model("   ").build();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_builder_defaults() {
        let config = AgentConfig::builder().model("m").build().unwrap();
        assert_eq!(config.temperature(), 0.7);
        assert_eq!(config.timeout(), 30);
        assert_eq!(config.max_tokens(), None);
        assert!(!config.debug());
        assert!(config.fallback_models().is_empty());
    }

    #[test]
    fn test_builder_validates_temperature() {
        assert!(AgentConfig::builder().model("m").temperature(2.5).build().is_err());
        assert!(AgentConfig::builder().model("m").temperature(-0.1).build().is_err());
        assert!(AgentConfig::builder().model("m").temperature(0.0).build().is_ok());
    }

    #[test]
    fn test_builder_validates_top_p() {
        assert!(AgentConfig::builder().model("m").top_p(1.5).build().is_err());
        assert!(AgentConfig::builder().model("m").top_p(0.9).build().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_max_tokens() {
        assert!(AgentConfig::builder().model("m").max_tokens(0).build().is_err());
    }

    #[test]
    fn test_extras_pass_through() {
        let config = AgentConfig::builder()
            .model("m")
            .extra("instructor_mode", json!("json"))
            .build()
            .unwrap();
        assert_eq!(config.extras()["instructor_mode"], json!("json"));
    }

    #[test]
    fn test_snapshot_strips_parallel_tool_calls_without_tools() {
        let config = AgentConfig::builder()
            .model("m")
            .parallel_tool_calls(true)
            .build()
            .unwrap();

        let without_tools = config.snapshot_for_request(false);
        assert_eq!(without_tools.parallel_tool_calls(), None);

        let with_tools = config.snapshot_for_request(true);
        assert_eq!(with_tools.parallel_tool_calls(), Some(true));
    }

    #[test]
    fn test_set_temperature_validates() {
        let mut config = AgentConfig::builder().model("m").build().unwrap();
        assert!(config.set_temperature(3.0).is_err());
        assert!(config.set_temperature(1.0).is_ok());
        assert_eq!(config.temperature(), 1.0);
    }
}
