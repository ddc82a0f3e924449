use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::services::cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS};
use crate::services::plan_builder::{DEFAULT_MAX_PATH_DEPTH, DEFAULT_RANK_LIMIT};

pub const MAX_REFINEMENT_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub refinement: RefinementConfig,
    pub cache: CacheConfig,
    pub planner: PlannerConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Trial-execution target; validation is skipped without one
    #[serde(default)]
    pub url: Option<String>,
    pub dialect: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinementConfig {
    pub max_iterations: usize,
    pub trial_row_cap: u64,
    pub trial_timeout_secs: u64,
    pub corrector_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub shared_store_url: Option<String>,
    #[serde(default)]
    pub disk_dir: Option<String>,
    pub default_ttl_secs: u64,
    pub max_entries_per_category: usize,
    pub layer_timeout_ms: u64,
    /// `{category: ttl-seconds}` overrides
    #[serde(default)]
    pub ttl: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared_store_url: None,
            disk_dir: None,
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_entries_per_category: DEFAULT_MAX_ENTRIES,
            layer_timeout_ms: 200,
            ttl: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    pub max_path_depth: usize,
    pub default_rank_limit: u64,
    /// Rank alternative join paths with a penalty for deprecated tables
    pub avoid_deprecated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

/// Environment variable → config key
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("SQL_DIALECT", "database.dialect"),
    ("LLM_GATEWAY_URL", "llm.gateway_url"),
    ("LLM_API_KEY", "llm.api_key"),
    ("CACHE_SHARED_URL", "cache.shared_store_url"),
    ("CACHE_DISK_DIR", "cache.disk_dir"),
    ("SCHEMA_PATH", "schema.path"),
    ("RUST_LOG", "logging.level"),
    ("RUST_LOG_STYLE", "logging.style"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();
        Self::load(|name| env::var(name).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for each known
    /// environment variable.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("database.dialect", "postgresql")?
            .set_default("database.pool_size", 4)?
            .set_default("llm.timeout_secs", 30)?
            .set_default("llm.max_tokens", 1000)?
            .set_default("llm.temperature", 0.0)?
            .set_default("refinement.max_iterations", 3)?
            .set_default("refinement.trial_row_cap", 5)?
            .set_default("refinement.trial_timeout_secs", 10)?
            .set_default("refinement.corrector_timeout_secs", 30)?
            .set_default("cache.default_ttl_secs", DEFAULT_TTL_SECS)?
            .set_default("cache.max_entries_per_category", DEFAULT_MAX_ENTRIES as u64)?
            .set_default("cache.layer_timeout_ms", 200)?
            .set_default("planner.max_path_depth", DEFAULT_MAX_PATH_DEPTH as u64)?
            .set_default("planner.default_rank_limit", DEFAULT_RANK_LIMIT)?
            .set_default("planner.avoid_deprecated", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        if let Some(value) = lookup("REFINEMENT_MAX_ITERATIONS") {
            let iterations = value.trim().parse::<i64>().map_err(|e| {
                let message = format!("REFINEMENT_MAX_ITERATIONS '{}': {}", value, e);
                config::ConfigError::Message(message)
            })?;
            builder = builder.set_override("refinement.max_iterations", iterations)?;
        }

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.refinement.max_iterations =
            config.refinement.max_iterations.clamp(1, MAX_REFINEMENT_ITERATIONS);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::load(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = load_with(&[]);
        assert!(config.database.url.is_none());
        assert_eq!(config.database.dialect, "postgresql");
        assert_eq!(config.refinement.max_iterations, 3);
        assert_eq!(config.refinement.trial_row_cap, 5);
        assert_eq!(config.planner.default_rank_limit, 10);
        assert_eq!(config.cache.default_ttl_secs, DEFAULT_TTL_SECS);
        assert!(config.cache.ttl.is_empty());
        assert!(config.schema.path.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_environment_overrides() {
        let config = load_with(&[
            ("DATABASE_URL", "postgres://app:secret@db:5432/wealth"),
            ("SQL_DIALECT", "doris"),
            ("LLM_API_KEY", "sk-test"),
            ("CACHE_DISK_DIR", "/var/cache/sqlgen"),
            ("REFINEMENT_MAX_ITERATIONS", "5"),
        ]);
        assert_eq!(config.database.url.as_deref(), Some("postgres://app:secret@db:5432/wealth"));
        assert_eq!(config.database.dialect, "doris");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.cache.disk_dir.as_deref(), Some("/var/cache/sqlgen"));
        assert_eq!(config.refinement.max_iterations, 5);
    }

    #[test]
    fn test_iteration_cap_is_clamped() {
        assert_eq!(load_with(&[("REFINEMENT_MAX_ITERATIONS", "50")]).refinement.max_iterations, 10);
        assert_eq!(load_with(&[("REFINEMENT_MAX_ITERATIONS", "0")]).refinement.max_iterations, 1);
        let invalid =
            |name: &str| (name == "REFINEMENT_MAX_ITERATIONS").then(|| "many".to_string());
        assert!(Config::load(invalid).is_err());
    }
}
