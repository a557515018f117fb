//! Transport configuration

use crate::error::{Result, TransportError};
use crate::flow_control::FlowControlConfig;
use crate::retry::RetryConfig;
use gattmesh_core::{FRAGMENT_HEADER_SIZE, FragmentConfig, ReassemblyConfig};
use std::time::Duration;

/// Complete transport configuration
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Fragmentation
    pub fragment: FragmentConfig,

    /// Inbound reassembly
    pub reassembly: ReassemblyConfig,

    /// Per-link permit pools
    pub flow_control: FlowControlConfig,

    /// Scheduler worker
    pub scheduler: SchedulerConfig,

    /// Failure handling
    pub retry: RetryConfig,
}

impl TransportConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.fragment.max_chunk == 0 {
            return Err(TransportError::invalid_config(
                "fragment.max_chunk must be greater than zero",
            ));
        }
        if self.fragment.threshold < FRAGMENT_HEADER_SIZE {
            return Err(TransportError::invalid_config(
                "fragment.threshold must leave room for a fragment header",
            ));
        }
        if self.reassembly.max_sets == 0 {
            return Err(TransportError::invalid_config(
                "reassembly.max_sets must be greater than zero",
            ));
        }
        if self.reassembly.timeout.is_zero() || self.reassembly.sweep_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "reassembly timeout and sweep interval must be non-zero",
            ));
        }
        if self.flow_control.permits == 0 {
            return Err(TransportError::invalid_config(
                "flow_control.permits must be greater than zero",
            ));
        }
        if self.scheduler.window == 0 {
            return Err(TransportError::invalid_config(
                "scheduler.window must be greater than zero",
            ));
        }
        if self.scheduler.window > self.flow_control.permits {
            return Err(TransportError::InvalidConfig(
                format!(
                    "scheduler.window ({}) exceeds flow_control.permits ({})",
                    self.scheduler.window, self.flow_control.permits
                )
                .into(),
            ));
        }
        if self.scheduler.turn_budget == 0 {
            return Err(TransportError::invalid_config(
                "scheduler.turn_budget must be greater than zero",
            ));
        }
        if self.scheduler.watchdog_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "scheduler.watchdog_interval must be non-zero",
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(TransportError::invalid_config(
                "retry.max_attempts must be at least 1 (or unset for unbounded)",
            ));
        }
        Ok(())
    }
}

/// Scheduler worker configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum issued-but-uncompleted high-priority units per link
    pub window: usize,

    /// Units issued per rotation turn before the link yields to others
    pub turn_budget: usize,

    /// Age after which an in-flight unit is written off
    pub inflight_timeout: Duration,

    /// How often in-flight ages are checked
    pub watchdog_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window: 4,
            turn_budget: 16,
            inflight_timeout: Duration::from_millis(500),
            watchdog_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fragment.threshold, 512);
        assert_eq!(config.fragment.max_chunk, 469);
        assert_eq!(config.scheduler.window, 4);
        assert_eq!(config.flow_control.permits, 4);
        assert_eq!(config.reassembly.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_window_must_fit_permits() {
        let mut config = TransportConfig::default();
        config.scheduler.window = 8;
        let err = config.validate().unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = TransportConfig::default();
        config.fragment.max_chunk = 0;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.retry.max_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.retry.max_attempts = None;
        assert!(config.validate().is_ok());
    }
}
