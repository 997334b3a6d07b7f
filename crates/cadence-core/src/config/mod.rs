//! Configuration system for cadence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{CadenceError, CadenceResult};
use crate::types::{Feature, Plan};

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Relearning step after a lapse, in minutes.
    pub relearn_interval_minutes: u32,
    /// Interval (days) at which an item counts as mastered.
    pub mastery_interval_days: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            relearn_interval_minutes: 10,
            mastery_interval_days: 21.0,
        }
    }
}

impl SchedulerConfig {
    /// Relearning step expressed in days.
    pub fn relearn_interval_days(&self) -> f64 {
        self.relearn_interval_minutes as f64 / (24.0 * 60.0)
    }
}

/// Streak tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreakConfig {
    /// Hours before local midnight below which an idle streak is "at risk".
    pub risk_threshold_hours: f64,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            risk_threshold_hours: crate::streak::DEFAULT_RISK_THRESHOLD_HOURS,
        }
    }
}

/// Retry policy for remote tier pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

/// Write-coalescing queue for the remote tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// Flush once this many distinct keys are pending.
    pub max_batch: usize,
    /// Flush once the oldest pending key has waited this long.
    pub max_delay_secs: u64,
    /// Spawn a flush from the write path when a trigger fires. When false,
    /// only explicit `flush`/`reconcile` calls push to the remote tier.
    pub flush_in_background: bool,
    pub retry: RetryPolicy,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_batch: 25,
            max_delay_secs: 5,
            flush_in_background: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Quota for one plan × feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "per_day", rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Daily(u32),
    /// Feature is not part of the plan at all.
    Disabled,
}

/// Entitlement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Upper bound on how long a decision may be reused.
    pub cache_ttl_secs: u64,
    /// Limits per plan. Features missing from a plan's table are disabled.
    pub limits: BTreeMap<Plan, BTreeMap<Feature, Limit>>,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        use strum::IntoEnumIterator;

        let table = |limit: Limit| -> BTreeMap<Feature, Limit> {
            Feature::iter().map(|f| (f, limit)).collect()
        };

        let mut guest = table(Limit::Daily(3));
        guest.insert(Feature::CustomLists, Limit::Disabled);

        let mut limits = BTreeMap::new();
        limits.insert(Plan::Guest, guest);
        limits.insert(Plan::Free, table(Limit::Daily(10)));
        limits.insert(Plan::Premium, table(Limit::Unlimited));

        Self {
            cache_ttl_secs: 300,
            limits,
        }
    }
}

impl EntitlementConfig {
    /// The configured limit for a plan and feature.
    pub fn limit(&self, plan: Plan, feature: Feature) -> Limit {
        self.limits
            .get(&plan)
            .and_then(|features| features.get(&feature))
            .copied()
            .unwrap_or(Limit::Disabled)
    }
}

/// Background runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
    pub run_on_start: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            run_on_start: false,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifies this device as a counter origin.
    pub device_id: String,
    pub scheduler: SchedulerConfig,
    pub streak: StreakConfig,
    pub write_queue: WriteQueueConfig,
    pub entitlements: EntitlementConfig,
    pub runtime: RuntimeConfig,
    /// Device-local tier database. `None` keeps it in memory, losing local
    /// progress and unsent remote writes on restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_db_path: Option<PathBuf>,
    /// Durable remote tier database. `None` keeps it in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_db_path: Option<PathBuf>,
    /// Usage ledger and overrides database.
    pub entitlement_db_path: PathBuf,
    /// Audit log database.
    pub audit_db_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cadence_dir = dirs::home_dir()
            .map(|h| h.join(".cadence"))
            .unwrap_or_else(|| PathBuf::from(".cadence"));

        Self {
            device_id: "local".to_string(),
            scheduler: SchedulerConfig::default(),
            streak: StreakConfig::default(),
            write_queue: WriteQueueConfig::default(),
            entitlements: EntitlementConfig::default(),
            runtime: RuntimeConfig::default(),
            local_db_path: None,
            remote_db_path: None,
            entitlement_db_path: cadence_dir.join("entitlements.db"),
            audit_db_path: cadence_dir.join("audit.db"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<std::path::Path>) -> CadenceResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        let config: Self = match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| CadenceError::Configuration(e.to_string()))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| CadenceError::Configuration(e.to_string()))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| CadenceError::Configuration(e.to_string()))?,
            _ => {
                return Err(CadenceError::Configuration(
                    "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Reads:
    /// - `CADENCE_DEVICE_ID`
    /// - `CADENCE_LOCAL_DB_PATH`
    /// - `CADENCE_REMOTE_DB_PATH`
    /// - `CADENCE_ENTITLEMENT_DB_PATH`
    /// - `CADENCE_AUDIT_DB_PATH`
    /// - `CADENCE_RECONCILE_INTERVAL_SECS`
    /// - `CADENCE_FLUSH_MAX_BATCH`
    /// - `CADENCE_FLUSH_MAX_DELAY_SECS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(device) = std::env::var("CADENCE_DEVICE_ID") {
            config.device_id = device;
        }
        if let Ok(path) = std::env::var("CADENCE_LOCAL_DB_PATH") {
            config.local_db_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CADENCE_REMOTE_DB_PATH") {
            config.remote_db_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CADENCE_ENTITLEMENT_DB_PATH") {
            config.entitlement_db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CADENCE_AUDIT_DB_PATH") {
            config.audit_db_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("CADENCE_RECONCILE_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.runtime.reconcile_interval_secs = secs;
            }
        }
        if let Ok(batch) = std::env::var("CADENCE_FLUSH_MAX_BATCH") {
            if let Ok(batch) = batch.parse() {
                config.write_queue.max_batch = batch;
            }
        }
        if let Ok(secs) = std::env::var("CADENCE_FLUSH_MAX_DELAY_SECS") {
            if let Ok(secs) = secs.parse() {
                config.write_queue.max_delay_secs = secs;
            }
        }

        config
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(CadenceError::Configuration("device_id must not be empty".to_string()));
        }
        if self.write_queue.max_batch == 0 {
            return Err(CadenceError::Configuration(
                "write_queue.max_batch must be at least 1".to_string(),
            ));
        }
        if self.scheduler.mastery_interval_days < 1.0 {
            return Err(CadenceError::Configuration(
                "scheduler.mastery_interval_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the device id used as counter origin.
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.config.device_id = device_id.into();
        self
    }

    /// Set scheduler configuration.
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler = config;
        self
    }

    /// Set streak configuration.
    pub fn streak(mut self, config: StreakConfig) -> Self {
        self.config.streak = config;
        self
    }

    /// Set write queue configuration.
    pub fn write_queue(mut self, config: WriteQueueConfig) -> Self {
        self.config.write_queue = config;
        self
    }

    /// Set entitlement configuration.
    pub fn entitlements(mut self, config: EntitlementConfig) -> Self {
        self.config.entitlements = config;
        self
    }

    /// Set the local tier database path.
    pub fn local_db_path(mut self, path: PathBuf) -> Self {
        self.config.local_db_path = Some(path);
        self
    }

    /// Set the remote tier database path.
    pub fn remote_db_path(mut self, path: PathBuf) -> Self {
        self.config.remote_db_path = Some(path);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
