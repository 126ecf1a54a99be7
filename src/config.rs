//! Pipeline configuration
//!
//! `MemoryConfig` is built once and handed to [`crate::ObservationalMemory`];
//! nothing reads the environment unless the caller opts in with
//! [`MemoryConfig::from_env`].

use crate::error::{MemoryError, Result};
use crate::stats::CostModel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds, budgets and behaviour switches for the compression pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Raw-window size (tokens) above which the Observer runs
    #[serde(default = "default_observer_threshold")]
    pub observer_token_threshold: usize,

    /// Observation-log size (tokens) above which the Reflector runs
    #[serde(default = "default_reflector_threshold")]
    pub reflector_token_threshold: usize,

    /// Most recent messages always kept raw
    #[serde(default = "default_retention_count")]
    pub message_retention_count: usize,

    /// Soft cap on the recent block returned by `get_context`
    #[serde(default = "default_message_budget")]
    pub message_token_budget: usize,

    /// Upper bound on a single provider call
    #[serde(default = "default_provider_timeout", with = "duration_secs")]
    pub provider_timeout: Duration,

    /// Run the Observer automatically when the threshold is crossed
    #[serde(default = "default_true")]
    pub auto_observe: bool,

    /// Run the Reflector automatically after an Observer pass
    #[serde(default = "default_true")]
    pub auto_reflect: bool,

    /// Run triggered passes inside `add_message` instead of on a spawned task
    #[serde(default = "default_true")]
    pub blocking_mode: bool,

    /// Replace the Observer's extraction instructions
    #[serde(default)]
    pub observer_instructions: Option<String>,

    /// Replace the Reflector's merge/prune policy
    #[serde(default)]
    pub reflector_instructions: Option<String>,

    /// Keep running cost estimates in the thread stats
    #[serde(default = "default_true")]
    pub track_costs: bool,

    #[serde(default = "default_cost_per_1k_input")]
    pub cost_per_1k_input_tokens: f64,

    #[serde(default = "default_cost_per_1k_output")]
    pub cost_per_1k_output_tokens: f64,

    /// Fraction of the input price saved on cached observation tokens (0.0 - 1.0)
    #[serde(default = "default_cached_discount")]
    pub cached_token_discount: f64,
}

fn default_observer_threshold() -> usize {
    30_000
}

fn default_reflector_threshold() -> usize {
    40_000
}

fn default_retention_count() -> usize {
    5
}

fn default_message_budget() -> usize {
    10_000
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cost_per_1k_input() -> f64 {
    0.01
}

fn default_cost_per_1k_output() -> f64 {
    0.03
}

fn default_cached_discount() -> f64 {
    0.9
}

fn default_true() -> bool {
    true
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            observer_token_threshold: default_observer_threshold(),
            reflector_token_threshold: default_reflector_threshold(),
            message_retention_count: default_retention_count(),
            message_token_budget: default_message_budget(),
            provider_timeout: default_provider_timeout(),
            auto_observe: true,
            auto_reflect: true,
            blocking_mode: true,
            observer_instructions: None,
            reflector_instructions: None,
            track_costs: true,
            cost_per_1k_input_tokens: default_cost_per_1k_input(),
            cost_per_1k_output_tokens: default_cost_per_1k_output(),
            cached_token_discount: default_cached_discount(),
        }
    }
}

impl MemoryConfig {
    /// Low thresholds for demos and manual testing
    pub fn demo() -> Self {
        Self {
            observer_token_threshold: 2_000,
            reflector_token_threshold: 4_000,
            message_token_budget: 1_000,
            ..Self::default()
        }
    }

    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Pricing for the thread stats
    pub fn cost_model(&self) -> CostModel {
        CostModel {
            enabled: self.track_costs,
            cost_per_1k_input_tokens: self.cost_per_1k_input_tokens,
            cost_per_1k_output_tokens: self.cost_per_1k_output_tokens,
            cached_token_discount: self.cached_token_discount,
        }
    }

    /// Override fields from `OM_*` environment variables
    pub fn from_env(mut self) -> Self {
        if env_flag("OM_DEMO_MODE").unwrap_or(false) {
            let demo = Self::demo();
            self.observer_token_threshold = demo.observer_token_threshold;
            self.reflector_token_threshold = demo.reflector_token_threshold;
            self.message_token_budget = demo.message_token_budget;
        }

        if let Some(v) = env_parse("OM_OBSERVER_THRESHOLD") {
            self.observer_token_threshold = v;
        }
        if let Some(v) = env_parse("OM_REFLECTOR_THRESHOLD") {
            self.reflector_token_threshold = v;
        }
        if let Some(v) = env_parse("OM_MESSAGE_RETENTION") {
            self.message_retention_count = v;
        }
        if let Some(v) = env_parse("OM_MESSAGE_TOKEN_BUDGET") {
            self.message_token_budget = v;
        }
        if let Some(secs) = env_parse::<u64>("OM_PROVIDER_TIMEOUT_SECS") {
            self.provider_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_flag("OM_AUTO_OBSERVE") {
            self.auto_observe = v;
        }
        if let Some(v) = env_flag("OM_AUTO_REFLECT") {
            self.auto_reflect = v;
        }
        if let Some(v) = env_flag("OM_BLOCKING_MODE") {
            self.blocking_mode = v;
        }
        if let Some(v) = env_flag("OM_TRACK_COSTS") {
            self.track_costs = v;
        }
        if let Some(v) = env_parse("OM_COST_PER_1K_INPUT") {
            self.cost_per_1k_input_tokens = v;
        }
        if let Some(v) = env_parse("OM_COST_PER_1K_OUTPUT") {
            self.cost_per_1k_output_tokens = v;
        }
        if let Some(v) = env_parse("OM_CACHED_TOKEN_DISCOUNT") {
            self.cached_token_discount = v;
        }

        self
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.observer_token_threshold == 0 {
            return Err(MemoryError::Configuration(
                "observer_token_threshold must be greater than zero".into(),
            ));
        }
        if self.reflector_token_threshold == 0 {
            return Err(MemoryError::Configuration(
                "reflector_token_threshold must be greater than zero".into(),
            ));
        }
        if self.message_token_budget == 0 {
            return Err(MemoryError::Configuration(
                "message_token_budget must be greater than zero".into(),
            ));
        }
        if self.provider_timeout.is_zero() {
            return Err(MemoryError::Configuration(
                "provider_timeout must be non-zero".into(),
            ));
        }
        if !(self.cost_per_1k_input_tokens >= 0.0 && self.cost_per_1k_output_tokens >= 0.0) {
            return Err(MemoryError::Configuration(
                "token costs must be non-negative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cached_token_discount) {
            return Err(MemoryError::Configuration(format!(
                "cached_token_discount must be within 0.0..=1.0, got {}",
                self.cached_token_discount
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(val) => match val.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}", key, val);
                None
            }
        },
        Err(_) => None,
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Builder for memory config
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MemoryConfig::default(),
        }
    }

    pub fn observer_token_threshold(mut self, tokens: usize) -> Self {
        self.config.observer_token_threshold = tokens;
        self
    }

    pub fn reflector_token_threshold(mut self, tokens: usize) -> Self {
        self.config.reflector_token_threshold = tokens;
        self
    }

    pub fn message_retention_count(mut self, count: usize) -> Self {
        self.config.message_retention_count = count;
        self
    }

    pub fn message_token_budget(mut self, tokens: usize) -> Self {
        self.config.message_token_budget = tokens;
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout = timeout;
        self
    }

    pub fn auto_observe(mut self, enable: bool) -> Self {
        self.config.auto_observe = enable;
        self
    }

    pub fn auto_reflect(mut self, enable: bool) -> Self {
        self.config.auto_reflect = enable;
        self
    }

    pub fn blocking_mode(mut self, enable: bool) -> Self {
        self.config.blocking_mode = enable;
        self
    }

    pub fn observer_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.observer_instructions = Some(instructions.into());
        self
    }

    pub fn reflector_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.reflector_instructions = Some(instructions.into());
        self
    }

    pub fn track_costs(mut self, enable: bool) -> Self {
        self.config.track_costs = enable;
        self
    }

    /// Price per 1k input and output tokens
    pub fn token_costs(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.config.cost_per_1k_input_tokens = per_1k_input;
        self.config.cost_per_1k_output_tokens = per_1k_output;
        self
    }

    pub fn cached_token_discount(mut self, discount: f64) -> Self {
        self.config.cached_token_discount = discount;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<MemoryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MemoryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
