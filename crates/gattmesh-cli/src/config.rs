//! Configuration file for the gattmesh CLI.
//!
//! Durations are written in milliseconds. Every section and field is
//! optional; missing values fall back to the transport defaults.

use gattmesh_transport::{
    FlowControlConfig, FragmentConfig, ReassemblyConfig, RetryConfig, SchedulerConfig,
    TransportConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// gattmesh configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Fragmentation
    pub fragment: FragmentSection,
    /// Inbound reassembly
    pub reassembly: ReassemblySection,
    /// Per-link permit pools
    pub flow_control: FlowControlSection,
    /// Scheduler worker
    pub scheduler: SchedulerSection,
    /// Failure handling
    pub retry: RetrySection,
    /// Logging
    pub logging: LoggingSection,
}

/// `[fragment]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentSection {
    /// Encoded size above which messages are split
    pub threshold: usize,
    /// Maximum chunk bytes per fragment
    pub max_chunk: usize,
    /// Pause between fragments of one transfer
    pub inter_fragment_delay_ms: u64,
}

/// `[reassembly]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySection {
    /// Age after which an incomplete set is discarded
    pub timeout_ms: u64,
    /// Sweep period
    pub sweep_interval_ms: u64,
    /// Maximum concurrent in-progress sets
    pub max_sets: usize,
}

/// `[flow_control]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlSection {
    /// Outstanding client writes per link
    pub permits: usize,
    /// Longest wait for a permit
    pub acquire_timeout_ms: u64,
    /// Client writes use write-without-response
    pub write_without_response: bool,
    /// Write-without-response permit auto-release delay
    pub wnr_release_ms: u64,
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// In-flight window per link
    pub window: usize,
    /// Units per rotation turn
    pub turn_budget: usize,
    /// Age after which an in-flight unit is written off
    pub inflight_timeout_ms: u64,
    /// Watchdog period
    pub watchdog_interval_ms: u64,
}

/// `[retry]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Park time after a synchronous rejection
    pub sync_delay_ms: u64,
    /// Park time after a failed completion
    pub async_delay_ms: u64,
    /// Failures tolerated per unit; 0 retries forever
    pub max_attempts: u32,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level, overridden by `RUST_LOG` and `-v`
    pub level: String,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for FragmentSection {
    fn default() -> Self {
        let d = FragmentConfig::default();
        Self {
            threshold: d.threshold,
            max_chunk: d.max_chunk,
            inter_fragment_delay_ms: millis(d.inter_fragment_delay),
        }
    }
}

impl Default for ReassemblySection {
    fn default() -> Self {
        let d = ReassemblyConfig::default();
        Self {
            timeout_ms: millis(d.timeout),
            sweep_interval_ms: millis(d.sweep_interval),
            max_sets: d.max_sets,
        }
    }
}

impl Default for FlowControlSection {
    fn default() -> Self {
        let d = FlowControlConfig::default();
        Self {
            permits: d.permits,
            acquire_timeout_ms: millis(d.acquire_timeout),
            write_without_response: d.write_without_response,
            wnr_release_ms: millis(d.wnr_release),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let d = SchedulerConfig::default();
        Self {
            window: d.window,
            turn_budget: d.turn_budget,
            inflight_timeout_ms: millis(d.inflight_timeout),
            watchdog_interval_ms: millis(d.watchdog_interval),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            sync_delay_ms: millis(d.sync_delay),
            async_delay_ms: millis(d.async_delay),
            max_attempts: d.max_attempts.unwrap_or(0),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("gattmesh/config.toml")
    }

    /// Load `path`, or the default path if present, or built-in defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file is missing or invalid.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Convert to the engine's configuration
    #[must_use]
    pub fn to_transport(&self) -> TransportConfig {
        TransportConfig {
            fragment: FragmentConfig {
                threshold: self.fragment.threshold,
                max_chunk: self.fragment.max_chunk,
                inter_fragment_delay: Duration::from_millis(self.fragment.inter_fragment_delay_ms),
            },
            reassembly: ReassemblyConfig {
                timeout: Duration::from_millis(self.reassembly.timeout_ms),
                sweep_interval: Duration::from_millis(self.reassembly.sweep_interval_ms),
                max_sets: self.reassembly.max_sets,
            },
            flow_control: FlowControlConfig {
                permits: self.flow_control.permits,
                acquire_timeout: Duration::from_millis(self.flow_control.acquire_timeout_ms),
                write_without_response: self.flow_control.write_without_response,
                wnr_release: Duration::from_millis(self.flow_control.wnr_release_ms),
            },
            scheduler: SchedulerConfig {
                window: self.scheduler.window,
                turn_budget: self.scheduler.turn_budget,
                inflight_timeout: Duration::from_millis(self.scheduler.inflight_timeout_ms),
                watchdog_interval: Duration::from_millis(self.scheduler.watchdog_interval_ms),
            },
            retry: RetryConfig {
                sync_delay: Duration::from_millis(self.retry.sync_delay_ms),
                async_delay: Duration::from_millis(self.retry.async_delay_ms),
                max_attempts: (self.retry.max_attempts > 0).then_some(self.retry.max_attempts),
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.to_transport().validate()?;
        Ok(())
    }
}
