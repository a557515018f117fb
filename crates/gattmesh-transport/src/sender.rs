//! The scheduler's sender callback.
//!
//! [`UnitSender`] is the seam between the scheduler worker and the link
//! layer. [`GattSender`] is the production implementation: it encodes the
//! unit's message, gates client writes through the [`FlowControlGate`], and
//! maps priority classes onto `Link::write` / `Link::notify`.

use crate::error::LinkError;
use crate::flow_control::{FlowControlConfig, FlowControlGate};
use crate::link::{Link, LinkAddress};
use crate::unit::{Priority, SendUnit};
use async_trait::async_trait;
use gattmesh_core::EncodeError;
use std::sync::Arc;
use thiserror::Error;

/// Why a unit could not be handed to the link
#[derive(Debug, Error)]
pub enum SendError {
    /// Message could not be serialized; retrying will not help
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// Link layer rejected the write synchronously
    #[error("rejected: {0}")]
    Rejected(#[from] LinkError),
}

/// Issues one unit to the link layer
#[async_trait]
pub trait UnitSender: Send + Sync + 'static {
    /// Put `unit` on its link, reporting synchronous acceptance
    async fn send(&self, unit: &SendUnit) -> Result<(), SendError>;

    /// A write issued to `address` was written off without a completion
    fn expired(&self, _address: &LinkAddress) {}
}

/// Flow-controlled GATT sender
pub struct GattSender<L: Link> {
    link: Arc<L>,
    gate: Arc<FlowControlGate>,
    config: FlowControlConfig,
}

impl<L: Link> GattSender<L> {
    /// Create a sender over `link`
    pub fn new(link: Arc<L>, gate: Arc<FlowControlGate>, config: FlowControlConfig) -> Self {
        Self { link, gate, config }
    }
}

#[async_trait]
impl<L: Link> UnitSender for GattSender<L> {
    async fn send(&self, unit: &SendUnit) -> Result<(), SendError> {
        let bytes = unit.message.encode()?;

        match unit.priority {
            Priority::High => {
                // Timeout means "proceed anyway"
                let _ = self
                    .gate
                    .acquire(&unit.address, self.config.acquire_timeout)
                    .await;

                if let Err(e) = self.link.write(&unit.address, &bytes) {
                    self.gate.release(&unit.address);
                    return Err(e.into());
                }

                if self.config.write_without_response {
                    self.gate
                        .release_after(unit.address.clone(), self.config.wnr_release);
                }
            }
            Priority::Low => {
                self.link.notify(&unit.address, &bytes)?;
            }
        }

        tracing::trace!(
            "Issued {:?} unit ({} bytes) to {}",
            unit.priority,
            bytes.len(),
            unit.address
        );
        Ok(())
    }

    fn expired(&self, address: &LinkAddress) {
        // The completion that would have released this permit is lost
        self.gate.release(address);
    }
}
