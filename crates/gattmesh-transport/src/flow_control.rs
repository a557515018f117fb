//! Per-link permit pools bounding outstanding client writes.
//!
//! Gating is best-effort: `acquire` waits at most the configured timeout and
//! the caller writes anyway when it expires, so a lost completion can slow a
//! link down but never stall it. Releases are capped at the pool size because
//! the completion callback and the write-without-response auto-release can
//! both fire for the same write.
//!
//! Pools are mutated from link callback threads, so each one sits behind its
//! own mutex rather than inside the scheduler worker.

use crate::link::LinkAddress;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Flow-control parameters
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Concurrent outstanding client writes per link
    pub permits: usize,

    /// Longest wait for a permit before writing anyway
    pub acquire_timeout: Duration,

    /// Client writes use write-without-response
    pub write_without_response: bool,

    /// Delay before a write-without-response permit is auto-released
    pub wnr_release: Duration,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            permits: 4,
            acquire_timeout: Duration::from_millis(20),
            write_without_response: true,
            wnr_release: Duration::from_millis(10),
        }
    }
}

#[derive(Debug)]
struct PermitPool {
    available: Mutex<usize>,
    capacity: usize,
    notify: Notify,
}

impl PermitPool {
    fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            capacity,
            notify: Notify::new(),
        }
    }

    fn try_take(&self) -> bool {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    fn give_back(&self) -> bool {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        if *available < self.capacity {
            *available += 1;
            drop(available);
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Permit pools keyed by link address
#[derive(Debug)]
pub struct FlowControlGate {
    pools: DashMap<LinkAddress, Arc<PermitPool>>,
    capacity: usize,
}

impl FlowControlGate {
    /// Create a gate whose pools hold `capacity` permits each
    pub fn new(capacity: usize) -> Self {
        Self {
            pools: DashMap::new(),
            capacity,
        }
    }

    fn pool(&self, address: &LinkAddress) -> Arc<PermitPool> {
        self.pools
            .entry(address.clone())
            .or_insert_with(|| Arc::new(PermitPool::new(self.capacity)))
            .clone()
    }

    /// Take one permit for `address`, waiting up to `timeout`
    ///
    /// Returns false on timeout. Callers proceed with the write either way.
    pub async fn acquire(&self, address: &LinkAddress, timeout: Duration) -> bool {
        let pool = self.pool(address);
        let wait = async {
            loop {
                if pool.try_take() {
                    return;
                }
                pool.notify.notified().await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    "Permit wait for {} timed out after {:?}, proceeding",
                    address,
                    timeout
                );
                false
            }
        }
    }

    /// Return one permit, never exceeding the pool size
    pub fn release(&self, address: &LinkAddress) {
        let Some(pool) = self.pools.get(address).map(|p| p.value().clone()) else {
            return;
        };
        if !pool.give_back() {
            tracing::trace!("Redundant permit release for {} ignored", address);
        }
    }

    /// Release one permit after `delay` (write-without-response auto-timeout)
    pub fn release_after(self: &Arc<Self>, address: LinkAddress, delay: Duration) {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            gate.release(&address);
        });
    }

    /// Discard the pool of a disconnected link
    pub fn drop_link(&self, address: &LinkAddress) {
        if let Some((_, pool)) = self.pools.remove(address) {
            pool.notify.notify_waiters();
        }
    }

    /// Free permits for a link, if it has a pool
    pub fn available(&self, address: &LinkAddress) -> Option<usize> {
        self.pools.get(address).map(|p| p.available())
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> LinkAddress {
        LinkAddress::from("AA:BB:CC:DD:EE:FF")
    }

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let gate = FlowControlGate::new(2);
        let timeout = Duration::from_millis(5);
        assert!(gate.acquire(&addr(), timeout).await);
        assert!(gate.acquire(&addr(), timeout).await);
        assert!(!gate.acquire(&addr(), timeout).await);
        assert_eq!(gate.available(&addr()), Some(0));
    }

    #[tokio::test]
    async fn test_release_is_capped() {
        let gate = FlowControlGate::new(2);
        assert!(gate.acquire(&addr(), Duration::from_millis(5)).await);
        gate.release(&addr());
        gate.release(&addr());
        gate.release(&addr());
        assert_eq!(gate.available(&addr()), Some(2));
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let gate = Arc::new(FlowControlGate::new(1));
        assert!(gate.acquire(&addr(), Duration::from_millis(5)).await);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(&addr(), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gate.release(&addr());

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_delay() {
        let gate = Arc::new(FlowControlGate::new(1));
        assert!(gate.acquire(&addr(), Duration::from_millis(5)).await);
        gate.release_after(addr(), Duration::from_millis(10));

        assert_eq!(gate.available(&addr()), Some(0));
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(gate.available(&addr()), Some(1));
    }

    #[tokio::test]
    async fn test_drop_link_discards_pool() {
        let gate = FlowControlGate::new(4);
        assert!(gate.acquire(&addr(), Duration::from_millis(5)).await);
        gate.drop_link(&addr());
        assert_eq!(gate.available(&addr()), None);
        // Release on a vanished link is a no-op
        gate.release(&addr());
        assert_eq!(gate.available(&addr()), None);
    }
}
