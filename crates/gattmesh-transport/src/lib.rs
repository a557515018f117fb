//! # gattmesh Transport
//!
//! Mesh packet transport engine for BLE GATT links.
//!
//! A node is simultaneously a GATT client (writing to remote characteristics)
//! and a GATT server (notifying subscribed remotes). This crate turns that
//! pair of narrow, lossy pipes into ordered, priority-aware delivery:
//!
//! ```text
//! Message ──▶ TargetResolver ──▶ FragmentCodec::split ──▶ LinkScheduler
//!                                                              │
//!                          ┌───────────────────────────────────┘
//!                          ▼
//!                   GattSender ── FlowControlGate ──▶ Link::write / notify
//!                          ▲                                   │
//!                          └──── RetryCoordinator ◀── failures ┘
//!
//! Link bytes ──▶ MeshTransport::on_inbound ──▶ FragmentCodec::ingest ──▶ event
//! ```
//!
//! The scheduler is a single tokio task that owns all queue state; producers
//! and link callbacks reach it only through an unbounded command channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod flow_control;
pub mod link;
pub mod loopback;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod transport;
pub mod unit;

pub use config::{SchedulerConfig, TransportConfig};
pub use error::{LinkError, Result, TransportError};
pub use flow_control::{FlowControlConfig, FlowControlGate};
pub use link::{ConnectionRegistry, Link, LinkAddress, LinkInfo, LinkRole, LinkTable};
pub use loopback::{LoopbackLink, LoopbackNode};
pub use progress::{TransferEvent, TransferHandle, TransferId, TransportEvent};
pub use resolver::{Target, TargetKind, TargetResolver};
pub use retry::{FailureKind, RetryConfig, RetryCoordinator, RetryDecision};
pub use scheduler::{LinkQueueStats, LinkScheduler, SchedulerHandle, SchedulerStats};
pub use sender::{GattSender, SendError, UnitSender};
pub use transport::MeshTransport;
pub use unit::{Priority, SendUnit};

pub use gattmesh_core::{FragmentConfig, Message, MessageType, PeerId, ReassemblyConfig};
