//! Scheduled send units.

use crate::link::LinkAddress;
use crate::progress::TransferId;
use gattmesh_core::Message;
use std::sync::Arc;

/// Priority class of a send unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Direct client write; windowed and acknowledged
    High,
    /// Server notification; no delivery confirmation
    Low,
}

/// One item scheduled on one link
#[derive(Debug, Clone)]
pub struct SendUnit {
    /// Destination link
    pub address: LinkAddress,
    /// Priority class
    pub priority: Priority,
    /// Message (whole or a fragment) to put on the link
    pub message: Arc<Message>,
    /// Transfer this unit belongs to
    pub transfer_id: Option<TransferId>,
    pub(crate) attempts: u32,
    pub(crate) counted: bool,
}

impl SendUnit {
    /// Create a unit
    pub fn new(address: LinkAddress, priority: Priority, message: Arc<Message>) -> Self {
        Self {
            address,
            priority,
            message,
            transfer_id: None,
            attempts: 0,
            counted: false,
        }
    }

    /// Tag the unit with a transfer id
    pub fn with_transfer(mut self, transfer_id: TransferId) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    /// Failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
