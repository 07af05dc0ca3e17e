//! Agent configuration and turn results.

use std::time::Duration;

use conduit_config::RuntimeConfig;
use conduit_llm::{ToolDefinition, Usage};
use conduit_session::CapabilitySet;
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Agent Config
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for one agent runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Model identifier to use.
    pub model: String,
    /// System prompt to use.
    pub system_prompt: Option<String>,
    /// Maximum tokens for LLM responses.
    pub max_tokens: u32,
    /// Maximum LLM calls per turn.
    pub max_iterations: u32,
    /// Part of the cache key: read-only conversations never share answers
    /// with read-write ones.
    pub read_only: bool,
    /// How long a turn waits for a rate-limit token. Zero fails immediately.
    pub rate_limit_wait: Duration,
    /// Temperature for sampling.
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl AgentConfig {
    /// Create a config with the specified model and default limits.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Take the `[llm]` and `[agent]` sections of a runtime config.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            model: config.llm.model.clone(),
            system_prompt: config.agent.system_prompt.clone(),
            max_tokens: config.llm.max_tokens,
            max_iterations: config.agent.max_iterations.max(1),
            read_only: config.agent.read_only,
            rate_limit_wait: config.agent.rate_limit_wait(),
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn Results
// ─────────────────────────────────────────────────────────────────────────────

/// One tool call made during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    /// Tool-use id assigned by the model.
    pub id: String,
    /// Exposed tool name.
    pub name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    /// Text fed back to the model.
    pub content: String,
}

/// Result of [`AgentRuntime::chat`](crate::AgentRuntime::chat).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub text: String,
    /// Served from the response cache without calling the model.
    pub cached: bool,
    /// LLM calls made. Zero for cached answers.
    pub iterations: u32,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ChatResponse {
    pub(crate) fn cached(text: String) -> Self {
        Self {
            text,
            cached: true,
            iterations: 0,
            usage: Usage::default(),
            tool_calls: Vec::new(),
        }
    }
}

/// Model-facing definitions for every exposed tool.
pub fn tool_definitions(capabilities: &CapabilitySet) -> Vec<ToolDefinition> {
    capabilities
        .tools()
        .iter()
        .map(|tool| {
            ToolDefinition::new(
                tool.name.clone(),
                tool.descriptor.description.clone(),
                tool.descriptor.input_schema.clone(),
            )
        })
        .collect()
}
