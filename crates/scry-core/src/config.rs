//! Runtime configuration.
//!
//! Stored as JSON. Every section has working defaults, so a missing file or a
//! partial one is fine.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::BridgeConfig;
use crate::error::Result;
use crate::memory::layout::timing;
use crate::mirror::MirrorLayout;
use crate::scheduler::ConfigStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScryConfig {
    pub scheduler: SchedulerConfig,
    pub bridge: BridgeConfig,
    pub mirror: MirrorLayout,
    /// Initial state of the write toggle
    pub writes_enabled: bool,
}

/// Feature scheduler timing, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub gate_backoff_ms: u64,
    pub error_backoff_ms: u64,
    pub slow_feature_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: timing::TICK_INTERVAL_MS,
            gate_backoff_ms: timing::GATE_BACKOFF_MS,
            error_backoff_ms: timing::ERROR_BACKOFF_MS,
            slow_feature_ms: timing::SLOW_FEATURE_MS,
            join_timeout_ms: timing::JOIN_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn gate_backoff(&self) -> Duration {
        Duration::from_millis(self.gate_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn slow_feature_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_feature_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn gate_backoff(mut self, backoff: Duration) -> Self {
        self.config.gate_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn slow_feature_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_feature_ms = threshold.as_millis() as u64;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

/// Load configuration from a JSON file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ScryConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let config = serde_json::from_str(&content)?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<ScryConfig> {
    match load_config(&path) {
        Ok(config) => Ok(config),
        Err(e) if e.is_not_found() => {
            info!(
                "No config at {}, using defaults",
                path.as_ref().display()
            );
            Ok(ScryConfig::default())
        }
        Err(e) => Err(e),
    }
}

pub fn save_config<P: AsRef<Path>>(path: P, config: &ScryConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

/// Runtime switch for all engineered writes.
///
/// Shared between whatever flips it (UI, hotkey, CLI) and the scheduler,
/// which reads it at the gate and again right before commit.
#[derive(Debug, Default)]
pub struct WriteToggle {
    enabled: AtomicBool,
}

impl WriteToggle {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Writes {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn get(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl ConfigStore for WriteToggle {
    fn writes_enabled(&self) -> bool {
        self.get()
    }
}
