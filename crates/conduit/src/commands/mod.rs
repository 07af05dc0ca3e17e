//! CLI command handlers.

pub mod chat;
pub mod repl;
pub mod servers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use conduit_config::{RuntimeConfig, ServerRegistry};
use conduit_llm::{OpenAiBackend, OpenAiConfig, SharedBackend};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Explicit config file from `--config` or `CONDUIT_CONFIG`.
    pub config_path: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Discover and load the runtime config.
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        RuntimeConfig::discover(self.config_path.as_deref()).context("failed to load config")
    }

    /// Load the server registry, bound to the config file so edits persist.
    pub fn load_registry(&self) -> Result<ServerRegistry> {
        let path = conduit_config::resolve_config_path(self.config_path.as_deref())
            .context("no config location: pass --config or set CONDUIT_CONFIG")?;
        ServerRegistry::load(&path)
            .with_context(|| format!("failed to load servers from {}", path.display()))
    }
}

/// OpenAI-compatible backend from the `[llm]` section.
pub fn build_backend(config: &RuntimeConfig) -> Result<SharedBackend> {
    let llm = &config.llm;
    let mut backend_config = OpenAiConfig::new(&llm.base_url)
        .with_model(&llm.model)
        .with_timeout(llm.timeout());
    if let Some(ref key) = llm.api_key {
        backend_config = backend_config.with_api_key(key);
    }
    let backend = OpenAiBackend::new(backend_config).context("failed to create LLM backend")?;
    Ok(Arc::new(backend))
}

/// Parse `KEY=VALUE` pairs.
pub fn parse_pairs(values: &[String], what: &str) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|v| {
            v.split_once('=')
                .map(|(k, val)| (k.trim().to_string(), val.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow::anyhow!("Invalid {} format: '{}'. Use KEY=VALUE.", what, v))
        })
        .collect()
}

/// Truncate a string for table display.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
