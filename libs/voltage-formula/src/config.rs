//! Engine configuration
//!
//! Loaded with figment. Priority (highest to lowest):
//! 1. `FORMULA_`-prefixed environment variables (`__` separates nested keys,
//!    e.g. `FORMULA_CIRCUIT_BREAKER__FAILURE_THRESHOLD=5`)
//! 2. `config/formula.yaml` / `config/formula.toml` / `config/formula.json`
//! 3. Default values

use crate::error::{FormulaError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "FORMULA_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of compiled expressions kept (LRU)
    pub compiled_cache_capacity: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub result_cache: ResultCacheConfig,
    /// Treat a transient outcome caused by the group's own subject as fatal
    pub subject_missing_is_fatal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiled_cache_capacity: 1024,
            circuit_breaker: CircuitBreakerConfig::default(),
            result_cache: ResultCacheConfig::default(),
            subject_missing_is_fatal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive fatal outcomes before a formula is skipped
    pub failure_threshold: u32,
    /// How long an open circuit skips the formula
    pub cooldown_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub enabled: bool,
    /// Maximum number of cached group reports
    pub capacity: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load from the default locations and the environment
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/formula.toml"))
            .merge(Yaml::file("config/formula.yaml"))
            .merge(Json::file("config/formula.json"))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Load from one file, with environment overrides on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| FormulaError::config("Config file must have an extension"))?;

        let figment = match extension {
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            "json" => Figment::new().merge(Json::file(path)),
            _ => {
                return Err(FormulaError::config(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| FormulaError::config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compiled_cache_capacity == 0 {
            return Err(FormulaError::config("compiled_cache_capacity must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(FormulaError::config(
                "circuit_breaker.failure_threshold must be > 0",
            ));
        }
        if self.result_cache.enabled && self.result_cache.capacity == 0 {
            return Err(FormulaError::config(
                "result_cache.capacity must be > 0 when the cache is enabled",
            ));
        }
        Ok(())
    }
}
