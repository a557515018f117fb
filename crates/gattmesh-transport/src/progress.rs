//! Transfer identity, progress events and cancellation handles.
//!
//! Progress counts units handed to the link layer, summed over every target
//! of the transfer. `Completed` therefore means "every unit was issued", not
//! "every unit was acknowledged": notifications carry no confirmation at all.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gattmesh_core::Message;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::link::LinkAddress;

/// Correlation id for a multi-unit transfer
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransferId(Arc<str>);

impl TransferId {
    /// Create from a caller-supplied string (e.g. a file hash)
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Generate a random 16-hex-digit id
    pub fn random() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()).into())
    }

    /// Id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self.0)
    }
}

/// Transfer lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Units were resolved and submission began
    Started {
        /// Transfer id
        id: TransferId,
        /// Units to issue across all targets
        total: usize,
    },
    /// One more unit was issued
    Progress {
        /// Transfer id
        id: TransferId,
        /// Units issued so far
        done: usize,
        /// Units to issue
        total: usize,
    },
    /// Every unit was issued
    Completed {
        /// Transfer id
        id: TransferId,
    },
    /// Submission stopped early
    Cancelled {
        /// Transfer id
        id: TransferId,
    },
}

/// Events delivered to the message source
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A whole or reassembled message arrived
    MessageReceived {
        /// The message
        message: Message,
        /// Link it arrived on (last fragment's link when reassembled)
        from: LinkAddress,
    },
    /// Outbound transfer progress
    Transfer(TransferEvent),
}

/// Handle to an outbound transfer
///
/// Cancellation is cooperative: units already inside scheduler queues are
/// still sent, the submitting task stops before its next unit.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    cancelled: Arc<AtomicBool>,
}

impl TransferHandle {
    pub(crate) fn new(id: TransferId, cancelled: Arc<AtomicBool>) -> Self {
        Self { id, cancelled }
    }

    /// Transfer id
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Stop submitting further units
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cancel flags of transfers that have not reached a terminal event
#[derive(Debug, Default)]
pub(crate) struct ActiveTransfers {
    flags: DashMap<TransferId, Arc<AtomicBool>>,
}

impl ActiveTransfers {
    /// Reserve `id`, or None while a transfer with that id is still running
    ///
    /// The id stays reserved until the returned claim is dropped.
    pub(crate) fn claim(self: &Arc<Self>, id: &TransferId) -> Option<TransferClaim> {
        match self.flags.entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let cancelled = Arc::new(AtomicBool::new(false));
                slot.insert(cancelled.clone());
                Some(TransferClaim {
                    id: id.clone(),
                    cancelled,
                    active: Arc::clone(self),
                })
            }
        }
    }

    /// Raise the cancel flag of a running transfer
    pub(crate) fn cancel(&self, id: &TransferId) -> bool {
        match self.flags.get(id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self, id: &TransferId) -> bool {
        self.flags.contains_key(id)
    }
}

/// Reservation of a transfer id, released on drop
#[derive(Debug)]
pub(crate) struct TransferClaim {
    id: TransferId,
    cancelled: Arc<AtomicBool>,
    active: Arc<ActiveTransfers>,
}

impl TransferClaim {
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Drop for TransferClaim {
    fn drop(&mut self) {
        self.active.flags.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_distinct() {
        let a = TransferId::random();
        let b = TransferId::random();
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_cancel_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = TransferHandle::new(TransferId::new("file-1"), flag.clone());
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_claim_rejects_running_id() {
        let active = Arc::new(ActiveTransfers::default());
        let id = TransferId::new("file-1");

        let claim = active.claim(&id).unwrap();
        assert!(active.claim(&id).is_none());
        assert!(active.is_active(&id));

        assert!(active.cancel(&id));
        assert!(claim.cancel_flag().load(Ordering::Acquire));

        drop(claim);
        assert!(!active.is_active(&id));
        assert!(!active.cancel(&id));
        assert!(active.claim(&id).is_some());
    }
}
