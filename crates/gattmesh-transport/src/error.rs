//! Error types for the transport engine
//!
//! Failures inside the engine (rejected writes, failed completions, bad
//! fragments) are handled locally by retrying, dropping and logging. The errors
//! here are the few conditions a caller of the public API can observe.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed later (no route yet, transfer id still in use)
//! - **Permanent**: will not succeed without intervention (bad config, unencodable message)

use crate::progress::TransferId;
use gattmesh_core::{EncodeError, PeerId};
use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced by transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// No usable link reaches the peer
    #[error("No route to peer {0}")]
    NoRoute(PeerId),

    /// Message could not be encoded or split
    #[error("Codec error: {0}")]
    Codec(#[from] EncodeError),

    /// A transfer with this id has not finished yet
    #[error("Transfer {0} is still active")]
    TransferActive(TransferId),

    /// Scheduler command channel is closed
    #[error("Scheduler shut down")]
    Shutdown,

    /// Reply channel dropped before answering
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl TransportError {
    /// Returns true if this error may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NoRoute(_)
                | TransportError::TransferActive(_)
                | TransportError::Channel(_)
        )
    }

    /// Returns true if this error will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidConfig(_) | TransportError::Codec(_) | TransportError::Shutdown
        )
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        TransportError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        TransportError::Channel(Cow::Borrowed(context))
    }
}

/// Synchronous rejection reported by the link layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Stack busy, write not accepted
    #[error("link busy")]
    Busy,

    /// No connection for the address
    #[error("link not connected: {0}")]
    NotConnected(String),

    /// Platform-specific rejection
    #[error("link error: {0}")]
    Other(Cow<'static, str>),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
