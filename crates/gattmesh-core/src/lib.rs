//! # gattmesh Core
//!
//! Data model and codecs for the gattmesh packet transport.
//!
//! This crate provides:
//! - The `Message` envelope and its binary wire encoding
//! - Fragment header encoding and decoding (13-byte fixed header)
//! - Splitting oversized messages into bounded fragments
//! - Thread-safe reassembly of fragment sets with age-based eviction
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Message                                  │
//! │   (typed envelope: ttl, sender, recipient, payload, signature)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      FragmentCodec                               │
//! │   (split above threshold, ingest + reassemble on receive)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     ReassemblyStore                              │
//! │   (in-progress fragment sets keyed by random 8-byte id)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fragment;
pub mod message;
pub mod reassembly;

pub use error::{DecodeError, EncodeError, Error, FragmentError};
pub use fragment::{FragmentCodec, FragmentConfig, FragmentHeader, FragmentSetId, split_message};
pub use message::{Message, MessageType, PeerId};
pub use reassembly::{ReassemblyConfig, ReassemblyStore};

/// Fixed fragment header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Encoded messages at or below this size are sent unfragmented
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 512;

/// Maximum chunk bytes carried by one fragment
///
/// Full fragments plus the fragment header and the envelope fit under a
/// conservative link-layer MTU.
pub const DEFAULT_MAX_CHUNK: usize = 469;

/// Peer identifier size
pub const PEER_ID_SIZE: usize = 8;

/// Message signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Default hop budget for newly created messages
pub const DEFAULT_TTL: u8 = 7;
