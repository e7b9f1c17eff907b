//! Settings loaded from TOML.
//!
//! ```toml
//! [scheduler]
//! zone = "+09:00"
//! task_lease_secs = 60
//!
//! [[catalog.jobs]]
//! name = "etl"
//! cron = "*/5 * * * *"
//! ```
//!
//! Every scheduler field has a default, so an empty file is a valid config.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::app::maintenance::{ReadyWindow, SweepOptions};
use crate::app::orchestrator::TickOptions;
use crate::app::retry::{FixedBackoff, RetryPolicy};
use crate::catalog::CatalogDef;
use crate::domain::WorkerId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub catalog: CatalogDef,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Parse and validate.
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.scheduler.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Offset cron fields are read in: `UTC` or `±HH:MM`.
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,
    #[serde(default = "default_task_lease_secs")]
    pub task_lease_secs: u64,
    #[serde(default = "default_max_claims_per_tick")]
    pub max_claims_per_tick: usize,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Total attempts per task run, including the first. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_finished_ttl_secs")]
    pub finished_ttl_secs: Option<u64>,
    #[serde(default = "default_ready_window_secs")]
    pub ready_window_past_secs: Option<u64>,
    #[serde(default = "default_ready_window_secs")]
    pub ready_window_future_secs: Option<u64>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "default_worker_slots")]
    pub worker_slots: u32,
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: Option<u64>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_zone() -> String {
    "UTC".to_string()
}

fn default_job_lease_secs() -> u64 {
    5
}

fn default_task_lease_secs() -> u64 {
    30
}

fn default_max_claims_per_tick() -> usize {
    10
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_finished_ttl_secs() -> Option<u64> {
    Some(30 * 24 * 60 * 60)
}

fn default_ready_window_secs() -> Option<u64> {
    Some(1800)
}

fn default_tick_interval_ms() -> u64 {
    3000
}

fn default_maintenance_interval_ms() -> u64 {
    10_000
}

fn default_worker_slots() -> u32 {
    4
}

fn default_run_deadline_secs() -> Option<u64> {
    Some(3600)
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            job_lease_secs: default_job_lease_secs(),
            task_lease_secs: default_task_lease_secs(),
            max_claims_per_tick: default_max_claims_per_tick(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_attempts: None,
            finished_ttl_secs: default_finished_ttl_secs(),
            ready_window_past_secs: default_ready_window_secs(),
            ready_window_future_secs: default_ready_window_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            worker_slots: default_worker_slots(),
            run_deadline_secs: default_run_deadline_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// `UTC`/`Z` or a fixed `±HH:MM` offset.
pub fn parse_zone(zone: &str) -> Option<FixedOffset> {
    let zone = zone.trim();
    if zone.eq_ignore_ascii_case("utc") || zone == "Z" {
        return Some(Utc.fix());
    }
    zone.parse::<FixedOffset>().ok()
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_zone(&self.zone).is_none() {
            return Err(ConfigError::invalid(
                "zone",
                format!("`{}` is neither UTC nor a ±HH:MM offset", self.zone),
            ));
        }
        let positive = [
            ("job_lease_secs", self.job_lease_secs),
            ("task_lease_secs", self.task_lease_secs),
            ("max_claims_per_tick", self.max_claims_per_tick as u64),
            ("tick_interval_ms", self.tick_interval_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            ("worker_slots", u64::from(self.worker_slots)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("max_attempts", "must allow at least one attempt"));
        }
        Ok(())
    }

    /// Falls back to UTC for an unparsable zone; `validate` rejects those.
    pub fn zone(&self) -> FixedOffset {
        parse_zone(&self.zone).unwrap_or_else(|| Utc.fix())
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn task_lease(&self) -> Duration {
        Duration::from_secs(self.task_lease_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        let policy = FixedBackoff::new(self.retry_backoff());
        match self.max_attempts {
            Some(max) => Arc::new(policy.with_max_attempts(max)),
            None => Arc::new(policy),
        }
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The availability clamp needs both bounds; unsetting either disables it.
    /// A zero `finished_ttl_secs` disables archiving.
    pub fn sweep_options(&self) -> SweepOptions {
        let ready_window = match (self.ready_window_past_secs, self.ready_window_future_secs) {
            (Some(past), Some(future)) => Some(ReadyWindow {
                past: Duration::from_secs(past),
                future: Duration::from_secs(future),
            }),
            _ => None,
        };
        SweepOptions {
            default_backoff: self.retry_backoff(),
            finished_ttl: self
                .finished_ttl_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            ready_window,
        }
    }

    pub fn tick_options(&self, worker_id: Option<WorkerId>) -> TickOptions {
        TickOptions {
            job_lease: self.job_lease(),
            task_lease: self.task_lease(),
            max_claims: self.max_claims_per_tick,
            worker_id,
        }
    }
}
