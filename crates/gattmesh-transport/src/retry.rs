//! Failure-driven requeue policy.
//!
//! A failed unit goes back to the front of its link's queue straight away so
//! nothing newer overtakes it. The link is then parked for a short delay and
//! resumed by a timer; synchronous rejections (stack busy) get the shorter
//! delay, failed completions the longer one.
//!
//! Attempts are bounded by `max_attempts` so a unit that can never be sent
//! does not hold its link forever. `None` keeps retrying indefinitely.

use crate::link::LinkAddress;
use crate::scheduler::Command;
use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;

/// Retry parameters
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Park time after a synchronous write rejection
    pub sync_delay: Duration,

    /// Park time after a failed write completion
    pub async_delay: Duration,

    /// Failures tolerated per unit before it is dropped
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_millis(5),
            async_delay: Duration::from_millis(10),
            max_attempts: Some(16),
        }
    }
}

/// Where a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The write call itself rejected
    Sync,
    /// The completion callback reported failure
    Async,
}

/// What to do with a failed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue at the front and resume the link after `delay`
    Retry {
        /// Park time
        delay: Duration,
    },
    /// Attempts exhausted, drop the unit
    GiveUp,
}

/// Decides retry delays and schedules link resumption
pub struct RetryCoordinator {
    config: RetryConfig,
    commands: WeakUnboundedSender<Command>,
}

impl RetryCoordinator {
    pub(crate) fn new(config: RetryConfig, commands: WeakUnboundedSender<Command>) -> Self {
        Self { config, commands }
    }

    /// Decide for a unit that has now failed `attempts` times
    pub fn decide(&self, attempts: u32, kind: FailureKind) -> RetryDecision {
        decide(&self.config, attempts, kind)
    }

    /// Resume `address` after `delay` unless it was re-parked since
    pub(crate) fn schedule_resume(&self, address: LinkAddress, epoch: u64, delay: Duration) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Resume { address, epoch });
            }
        });
    }
}

fn decide(config: &RetryConfig, attempts: u32, kind: FailureKind) -> RetryDecision {
    if config.max_attempts.is_some_and(|max| attempts > max) {
        return RetryDecision::GiveUp;
    }
    let delay = match kind {
        FailureKind::Sync => config.sync_delay,
        FailureKind::Async => config.async_delay,
    };
    RetryDecision::Retry { delay }
}
