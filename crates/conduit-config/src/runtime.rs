//! Runtime configuration mapping to `conduit.toml`.
//!
//! ```toml
//! [llm]                          # inference backend
//! [agent]                        # turn loop settings
//! [session]                      # tool aggregation
//! [resilience.retry]             # backoff policy
//! [resilience.circuit_breaker]   # fail-fast guard
//! [resilience.cache]             # response cache
//! [resilience.rate_limit]        # token bucket
//! [[servers]]                    # tool server descriptors
//! ```
//!
//! Every section is optional and falls back to its `Default`. A loaded
//! [`RuntimeConfig`] is never mutated; [`RuntimeConfig::reload`] returns a
//! fresh value which callers propagate explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::ServerDescriptor;
use crate::env;
use crate::error::{ConfigError, Result};
use crate::registry::ServerRegistry;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";

/// Application name for platform directory resolution.
const APP_NAME: &str = "conduit";

/// Config filename inside the platform config directory.
const CONFIG_FILE: &str = "conduit.toml";

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Platform config directory for conduit (`~/.config/conduit` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Resolve the config file path.
///
/// Order: explicit path, then `CONDUIT_CONFIG`, then the platform default.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }
    config_dir().map(|d| d.join(CONFIG_FILE))
}

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub session: SessionSection,
    pub resilience: ResilienceConfig,
    /// Raw server descriptors. Use [`RuntimeConfig::registry`] for validated access.
    pub servers: Vec<ServerDescriptor>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Parse and validate a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: RuntimeConfig = toml::from_str(toml_str)?;
        config.llm = config.llm.expanded();
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file yields defaults bound to `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.is_file() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.display().to_string(),
                source: e,
            })?;
            Self::from_toml(&contents)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.source = Some(path.to_path_buf());
        tracing::debug!(
            path = %path.display(),
            servers = config.servers.len(),
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Resolve the path (see [`resolve_config_path`]) and load.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// File this config was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Re-read the source file and return a new value. `self` is left untouched.
    pub fn reload(&self) -> Result<Self> {
        match &self.source {
            Some(path) => Self::load(path),
            None => Ok(self.clone()),
        }
    }

    /// Build a validated registry from `[[servers]]`, bound to the source file.
    pub fn registry(&self) -> Result<ServerRegistry> {
        let registry = ServerRegistry::from_descriptors(self.servers.iter().cloned())?;
        Ok(match &self.source {
            Some(path) => registry.with_path(path.clone()),
            None => registry,
        })
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.resilience.validate()?;
        // Descriptor validation happens through the registry.
        ServerRegistry::from_descriptors(self.servers.iter().cloned())?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible backend settings. Defaults target a local Ollama.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    /// API key. `${VAR}` references are expanded on load.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            timeout_secs: 300,
            max_tokens: 4096,
        }
    }
}

impl LlmSection {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn expanded(self) -> Self {
        Self {
            base_url: env::substitute(&self.base_url),
            api_key: self
                .api_key
                .map(|k| env::substitute(&k))
                .filter(|k| !k.is_empty()),
            ..self
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// Turn loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSection {
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    /// Whether the conversation may only use read-only tools. Part of the cache key.
    pub read_only: bool,
    /// How long a turn waits for a rate-limit token.
    pub rate_limit_wait_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: 10,
            read_only: false,
            rate_limit_wait_ms: 0,
        }
    }
}

impl AgentSection {
    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid(
                "max_iterations",
                "[agent]",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// How tool name collisions across servers are resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The earlier server in registry order keeps the name.
    #[default]
    FirstWins,
    /// The later server in registry order keeps the name.
    LastWins,
    /// Colliding tools are exposed as `server__tool`.
    Prefix,
}

/// Session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    pub collision_policy: CollisionPolicy,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resilience
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the retry, breaker, cache, and rate limit policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetrySection,
    pub circuit_breaker: CircuitBreakerSection,
    pub cache: CacheSection,
    pub rate_limit: RateLimitSection,
}

impl ResilienceConfig {
    fn validate(&self) -> Result<()> {
        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_attempts",
                "[resilience.retry]",
                "must be at least 1",
            ));
        }
        if r.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                "[resilience.retry]",
                "must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(ConfigError::invalid(
                "jitter",
                "[resilience.retry]",
                "must be within 0.0..=1.0",
            ));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "[resilience.circuit_breaker]",
                "must be at least 1",
            ));
        }
        if cb.cooldown_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "cooldown_multiplier",
                "[resilience.circuit_breaker]",
                "must be >= 1.0",
            ));
        }
        if cb.max_cooldown_ms < cb.cooldown_ms {
            return Err(ConfigError::invalid(
                "max_cooldown_ms",
                "[resilience.circuit_breaker]",
                "must not be below cooldown_ms",
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::invalid(
                "max_entries",
                "[resilience.cache]",
                "must be at least 1",
            ));
        }

        let rl = &self.rate_limit;
        if rl.capacity == 0 || rl.refill_per_minute == 0 {
            return Err(ConfigError::invalid(
                "capacity",
                "[resilience.rate_limit]",
                "capacity and refill_per_minute must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retry backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay applied as random +/- jitter.
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            cooldown_multiplier: 2.0,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_secs: 3600,
        }
    }
}

/// Token bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    pub capacity: u32,
    pub refill_per_minute: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 30,
            refill_per_minute: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml("").unwrap();
        assert_eq!(config.llm, LlmSection::default());
        assert_eq!(config.session.collision_policy, CollisionPolicy::FirstWins);
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert!(config.servers.is_empty());
        assert!(config.source().is_none());
    }

    #[test]
    fn test_full_config() {
        let config = RuntimeConfig::from_toml(
            r#"
[llm]
model = "qwen2.5"
max_tokens = 1024

[agent]
max_iterations = 4
read_only = true

[session]
collision_policy = "prefix"

[resilience.retry]
max_attempts = 5

[resilience.circuit_breaker]
failure_threshold = 2
cooldown_ms = 100
max_cooldown_ms = 1000

[resilience.cache]
enabled = false

[resilience.rate_limit]
capacity = 3
refill_per_minute = 6

[[servers]]
name = "alpha"
command = "alpha-server"
"#,
        )
        .unwrap();

        assert_eq!(config.llm.model, "qwen2.5");
        assert_eq!(config.llm.base_url, LlmSection::default().base_url);
        assert_eq!(config.agent.max_iterations, 4);
        assert!(config.agent.read_only);
        assert_eq!(config.session.collision_policy, CollisionPolicy::Prefix);
        assert_eq!(config.resilience.retry.max_attempts, 5);
        assert_eq!(config.resilience.retry.initial_backoff_ms, 500);
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 2);
        assert!(!config.resilience.cache.enabled);
        assert_eq!(config.resilience.rate_limit.capacity, 3);
        assert_eq!(config.registry().unwrap().names(), vec!["alpha"]);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        for bad in [
            "[agent]\nmax_iterations = 0\n",
            "[resilience.retry]\nmax_attempts = 0\n",
            "[resilience.retry]\njitter = 1.5\n",
            "[resilience.circuit_breaker]\ncooldown_ms = 10\nmax_cooldown_ms = 5\n",
            "[resilience.rate_limit]\ncapacity = 0\n",
            "[resilience.cache]\nmax_entries = 0\n",
        ] {
            assert!(
                matches!(
                    RuntimeConfig::from_toml(bad),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_invalid_server_rejected() {
        let err = RuntimeConfig::from_toml("[[servers]]\nname = \"x\"\ntransport = \"http\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    #[serial]
    fn test_api_key_expanded() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var("CONDUIT_TEST_API_KEY", "sk-test") };
        let config =
            RuntimeConfig::from_toml("[llm]\napi_key = \"${CONDUIT_TEST_API_KEY}\"\n").unwrap();
        unsafe { std::env::remove_var("CONDUIT_TEST_API_KEY") };
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_reload_returns_new_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.toml");
        std::fs::write(&path, "[llm]\nmodel = \"first\"\n").unwrap();

        let original = RuntimeConfig::load(&path).unwrap();
        std::fs::write(&path, "[llm]\nmodel = \"second\"\n").unwrap();
        let reloaded = original.reload().unwrap();

        assert_eq!(original.llm.model, "first");
        assert_eq!(reloaded.llm.model, "second");
        assert_eq!(reloaded.source(), Some(path.as_path()));
    }

    #[test]
    fn test_registry_bound_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.toml");
        std::fs::write(&path, "[llm]\nmodel = \"m\"\n").unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        let mut registry = config.registry().unwrap();
        registry
            .add(ServerDescriptor::stdio("alpha", "alpha-server"))
            .unwrap();

        let reloaded = config.reload().unwrap();
        assert_eq!(reloaded.llm.model, "m");
        assert_eq!(reloaded.servers.len(), 1);
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_order() {
        let explicit = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(
            resolve_config_path(Some(&explicit)),
            Some(explicit.clone())
        );

        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var(CONFIG_ENV, "/tmp/from-env.toml") };
        assert_eq!(
            resolve_config_path(None),
            Some(PathBuf::from("/tmp/from-env.toml"))
        );
        unsafe { std::env::remove_var(CONFIG_ENV) };

        if let Some(path) = resolve_config_path(None) {
            assert!(path.ends_with("conduit/conduit.toml"));
        }
    }
}
