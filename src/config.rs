//! Environment-driven configuration (SPEC_FULL.md S6.1).
//!
//! Follows the small-typed-accessor-over-`std::env::var` pattern rather than a
//! reflection-based settings framework: every knob has its own parsing function with a
//! typed default, and `MiddlewareSettings::from_env()` assembles them in one call.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::rate_limit::RateLimitPair;
use crate::{Error, Result};

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{key}: invalid value '{raw}'"))),
    }
}

/// All runtime knobs for the middleware core, loaded from the process environment or
/// built programmatically via [`MiddlewareSettings::builder`].
#[derive(Debug, Clone)]
pub struct MiddlewareSettings {
    pub context_soft_limit_tokens: usize,
    pub context_hard_limit_tokens: usize,
    pub recent_messages_count: usize,

    pub memory_retrieval_top_k: usize,
    pub memory_similarity_threshold: f64,
    pub embedding_dimension: usize,

    pub rate_limit_default: RateLimitPair,
    pub rate_limit_chat: Option<RateLimitPair>,
    pub rate_limit_chat_stream: Option<RateLimitPair>,

    pub observer_agent_enabled: bool,
    pub anomaly_detection_enabled: bool,

    pub redis_url: String,
    pub vector_store_url: Option<String>,

    pub llm_base_url: String,
    pub llm_model_name: String,
    pub llm_api_key: Option<String>,
    pub llm_temperature: f64,
    pub llm_max_tokens: usize,

    pub breaker_overrides: Vec<(String, BreakerOverride)>,
}

/// Per-name circuit-breaker parameter override, parsed from
/// `BREAKER_<NAME>_FAILURE_THRESHOLD` / `BREAKER_<NAME>_RECOVERY_TIMEOUT_SECS`.
#[derive(Debug, Clone, Copy)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout: Option<Duration>,
}

const BREAKER_NAMES: &[&str] = &["llm", "vector_store", "external_api"];

impl MiddlewareSettings {
    /// Load all settings from the process environment, applying the documented defaults
    /// for anything unset. Returns `Error::Config` on a malformed (present but
    /// unparseable) value.
    pub fn from_env() -> Result<Self> {
        let rate_limit_default = RateLimitPair::new(
            parse_env("RATE_LIMIT_REQUESTS_PER_MINUTE", 30u32)?,
            parse_env("RATE_LIMIT_REQUESTS_PER_HOUR", 500u32)?,
        );

        let rate_limit_chat = read_route_override("RATE_LIMIT_CHAT")?;
        let rate_limit_chat_stream = read_route_override("RATE_LIMIT_CHAT_STREAM")?;

        let mut breaker_overrides = Vec::new();
        for name in BREAKER_NAMES {
            let upper = name.to_uppercase();
            let failure_threshold: Option<u32> =
                match env_var(&format!("BREAKER_{upper}_FAILURE_THRESHOLD")) {
                    None => None,
                    Some(raw) => Some(raw.parse().map_err(|_| {
                        Error::config(format!("BREAKER_{upper}_FAILURE_THRESHOLD: invalid value"))
                    })?),
                };
            let recovery_timeout: Option<Duration> =
                match env_var(&format!("BREAKER_{upper}_RECOVERY_TIMEOUT_SECS")) {
                    None => None,
                    Some(raw) => {
                        let secs: u64 = raw.parse().map_err(|_| {
                            Error::config(format!(
                                "BREAKER_{upper}_RECOVERY_TIMEOUT_SECS: invalid value"
                            ))
                        })?;
                        Some(Duration::from_secs(secs))
                    }
                };

            if failure_threshold.is_some() || recovery_timeout.is_some() {
                breaker_overrides.push((
                    (*name).to_string(),
                    BreakerOverride {
                        failure_threshold,
                        recovery_timeout,
                    },
                ));
            }
        }

        Ok(Self {
            context_soft_limit_tokens: parse_env("CONTEXT_SOFT_LIMIT_TOKENS", 6000usize)?,
            context_hard_limit_tokens: parse_env("CONTEXT_HARD_LIMIT_TOKENS", 8000usize)?,
            recent_messages_count: parse_env("RECENT_MESSAGES_COUNT", 20usize)?,

            memory_retrieval_top_k: parse_env("MEMORY_RETRIEVAL_TOP_K", 5usize)?,
            memory_similarity_threshold: parse_env("MEMORY_SIMILARITY_THRESHOLD", 0.7f64)?,
            embedding_dimension: parse_env("EMBEDDING_DIMENSION", 1536usize)?,

            rate_limit_default,
            rate_limit_chat,
            rate_limit_chat_stream,

            observer_agent_enabled: parse_env("OBSERVER_AGENT_ENABLED", true)?,
            anomaly_detection_enabled: parse_env("ANOMALY_DETECTION_ENABLED", true)?,

            redis_url: env_var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            vector_store_url: env_var("VECTOR_STORE_URL"),

            llm_base_url: env_var("LLM_BASE_URL")
                .unwrap_or_else(|| "http://localhost:1234/v1".to_string()),
            llm_model_name: env_var("LLM_MODEL_NAME").unwrap_or_else(|| "default-model".to_string()),
            llm_api_key: env_var("LLM_API_KEY"),
            llm_temperature: parse_env("LLM_TEMPERATURE", 0.7f64)?,
            llm_max_tokens: parse_env("LLM_MAX_TOKENS", 1024usize)?,

            breaker_overrides,
        })
    }

    pub fn builder() -> MiddlewareSettingsBuilder {
        MiddlewareSettingsBuilder::default()
    }

    pub fn breaker_override(&self, name: &str) -> Option<&BreakerOverride> {
        self.breaker_overrides
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }
}

fn read_route_override(prefix: &str) -> Result<Option<RateLimitPair>> {
    let per_minute = env_var(&format!("{prefix}_PER_MINUTE"));
    let per_hour = env_var(&format!("{prefix}_PER_HOUR"));

    match (per_minute, per_hour) {
        (None, None) => Ok(None),
        (minute, hour) => {
            let per_minute: u32 = minute
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| Error::config(format!("{prefix}_PER_MINUTE: invalid value")))?
                .unwrap_or(30);
            let per_hour: u32 = hour
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| Error::config(format!("{prefix}_PER_HOUR: invalid value")))?
                .unwrap_or(500);
            Ok(Some(RateLimitPair::new(per_minute, per_hour)))
        }
    }
}

/// Programmatic builder for [`MiddlewareSettings`], for tests and embedding contexts
/// that don't want to go through the environment at all.
#[derive(Debug, Clone)]
pub struct MiddlewareSettingsBuilder {
    settings: MiddlewareSettings,
}

impl Default for MiddlewareSettingsBuilder {
    fn default() -> Self {
        Self {
            settings: MiddlewareSettings {
                context_soft_limit_tokens: 6000,
                context_hard_limit_tokens: 8000,
                recent_messages_count: 20,
                memory_retrieval_top_k: 5,
                memory_similarity_threshold: 0.7,
                embedding_dimension: 1536,
                rate_limit_default: RateLimitPair::new(30, 500),
                rate_limit_chat: None,
                rate_limit_chat_stream: None,
                observer_agent_enabled: true,
                anomaly_detection_enabled: true,
                redis_url: "redis://127.0.0.1:6379".to_string(),
                vector_store_url: None,
                llm_base_url: "http://localhost:1234/v1".to_string(),
                llm_model_name: "default-model".to_string(),
                llm_api_key: None,
                llm_temperature: 0.7,
                llm_max_tokens: 1024,
                breaker_overrides: Vec::new(),
            },
        }
    }
}

impl MiddlewareSettingsBuilder {
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.settings.redis_url = url.into();
        self
    }

    pub fn llm_base_url(mut self, url: impl Into<String>) -> Self {
        self.settings.llm_base_url = url.into();
        self
    }

    pub fn llm_model_name(mut self, name: impl Into<String>) -> Self {
        self.settings.llm_model_name = name.into();
        self
    }

    pub fn context_limits(mut self, soft: usize, hard: usize) -> Self {
        self.settings.context_soft_limit_tokens = soft;
        self.settings.context_hard_limit_tokens = hard;
        self
    }

    pub fn rate_limit_default(mut self, limits: RateLimitPair) -> Self {
        self.settings.rate_limit_default = limits;
        self
    }

    pub fn observer_agent_enabled(mut self, enabled: bool) -> Self {
        self.settings.observer_agent_enabled = enabled;
        self
    }

    pub fn build(self) -> MiddlewareSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // serializes tests that mutate process environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "CONTEXT_SOFT_LIMIT_TOKENS",
            "RATE_LIMIT_REQUESTS_PER_MINUTE",
            "OBSERVER_AGENT_ENABLED",
        ] {
            unsafe { env::remove_var(key) };
        }

        let settings = MiddlewareSettings::from_env().unwrap();
        assert_eq!(settings.context_soft_limit_tokens, 6000);
        assert_eq!(settings.rate_limit_default.per_minute, 30);
        assert!(settings.observer_agent_enabled);
    }

    #[test]
    fn test_env_override_is_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("CONTEXT_SOFT_LIMIT_TOKENS", "1234") };
        let settings = MiddlewareSettings::from_env().unwrap();
        assert_eq!(settings.context_soft_limit_tokens, 1234);
        unsafe { env::remove_var("CONTEXT_SOFT_LIMIT_TOKENS") };
    }

    #[test]
    fn test_malformed_value_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("CONTEXT_SOFT_LIMIT_TOKENS", "not-a-number") };
        let result = MiddlewareSettings::from_env();
        assert!(result.is_err());
        unsafe { env::remove_var("CONTEXT_SOFT_LIMIT_TOKENS") };
    }

    #[test]
    fn test_route_override_requires_at_least_one_field() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::remove_var("RATE_LIMIT_CHAT_PER_MINUTE") };
        unsafe { env::remove_var("RATE_LIMIT_CHAT_PER_HOUR") };
        let settings = MiddlewareSettings::from_env().unwrap();
        assert!(settings.rate_limit_chat.is_none());
    }

    #[test]
    fn test_builder_produces_sane_defaults() {
        let settings = MiddlewareSettings::builder()
            .llm_model_name("qwen2.5-32b")
            .context_limits(100, 200)
            .build();

        assert_eq!(settings.llm_model_name, "qwen2.5-32b");
        assert_eq!(settings.context_soft_limit_tokens, 100);
        assert_eq!(settings.context_hard_limit_tokens, 200);
    }
}
