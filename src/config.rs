use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::adapters::TransportConfig;
use crate::coordination::CircuitBreakerConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::{ConvoyError, Result};
use crate::persistence::PersistenceConfig;
use crate::supervisor::{HealthConfig, ResourceConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub health: HealthConfig,
    pub coordinator: CoordinatorConfig,
    pub resources: ResourceConfig,
    pub circuit: CircuitBreakerConfig,
    pub persistence: PersistenceConfig,
    pub transport: TransportConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Listen address for the HTTP API
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files; `CONVOY_LOG_DIR` wins when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONVOY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONVOY_HEALTH__CHECK_INTERVAL_SECS, etc.)
            .add_source(
                Environment::with_prefix("CONVOY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(ConvoyError::InvalidConfig(msg.to_string())) };

        let h = &self.health;
        if h.check_interval_secs == 0 {
            return invalid("health.check_interval_secs must be positive");
        }
        if !(h.degraded_after_misses >= 1
            && h.degraded_after_misses <= h.unhealthy_after_misses
            && h.unhealthy_after_misses <= h.evict_after_misses)
        {
            return invalid(
                "health miss thresholds must satisfy 1 <= degraded <= unhealthy <= evict",
            );
        }

        let r = &self.resources;
        if !(r.ewma_alpha > 0.0 && r.ewma_alpha <= 1.0) {
            return invalid("resources.ewma_alpha must be in (0, 1]");
        }
        if r.scale_down_utilization >= r.scale_up_utilization {
            return invalid("resources.scale_down_utilization must be below scale_up_utilization");
        }
        if r.step_multiplier <= 1.0 {
            return invalid("resources.step_multiplier must be greater than 1");
        }
        if r.scale_up_samples == 0 || r.scale_down_samples == 0 {
            return invalid("resources sample counts must be positive");
        }
        if r.memory_floor_mb == 0 || r.memory_floor_mb > r.memory_ceiling_mb {
            return invalid("resources.memory_floor_mb must be positive and <= memory_ceiling_mb");
        }
        if r.default_memory_min_mb > r.default_memory_max_mb {
            return invalid("resources.default_memory_min_mb must be <= default_memory_max_mb");
        }

        let c = &self.circuit;
        if c.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be positive");
        }
        if c.reset_timeout_secs == 0 || c.reset_timeout_secs > c.max_reset_timeout_secs {
            return invalid("circuit.reset_timeout_secs must be positive and <= max_reset_timeout_secs");
        }
        if c.call_timeout_ms == 0 {
            return invalid("circuit.call_timeout_ms must be positive");
        }

        if self.coordinator.default_max_attempts == 0 {
            return invalid("coordinator.default_max_attempts must be at least 1");
        }
        if self.coordinator.task_timeout_secs == 0 {
            return invalid("coordinator.task_timeout_secs must be positive");
        }

        if self.persistence.backend == crate::persistence::StorageBackend::Postgres
            && self.persistence.database_url.is_none()
        {
            return invalid("persistence.database_url is required for the postgres backend");
        }
        if self.api.enabled && self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            return invalid("api.bind must be a socket address");
        }
        Ok(())
    }
}
