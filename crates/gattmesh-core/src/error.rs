//! Error types for the gattmesh core codecs.

use thiserror::Error;

/// Core codec errors
#[derive(Debug, Error)]
pub enum Error {
    /// Message could not be serialized
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Bytes do not decode as a valid message
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Fragment could not be accepted
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),
}

/// Message serialization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload does not fit the widest length field
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Largest encodable payload
        max: usize,
    },

    /// Message would need more fragments than the header can count
    #[error("message needs {count} fragments (max {max})", max = u16::MAX)]
    TooManyFragments {
        /// Required fragment count
        count: usize,
    },

    /// Chunk size of zero
    #[error("fragment chunk size must be non-zero")]
    ZeroChunkSize,
}

/// Message deserialization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer too short to parse
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown envelope version
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type byte
    #[error("invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Declared payload length exceeds the buffer
    #[error("payload length exceeds buffer")]
    PayloadOverflow,

    /// Signature flag set but signature bytes missing
    #[error("truncated signature")]
    TruncatedSignature,
}

/// Fragment ingest errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Payload shorter than the fragment header
    #[error("fragment too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Index not below the declared total
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// Fragment index
        index: u16,
        /// Declared total
        total: u16,
    },

    /// Message handed to ingest is not a fragment
    #[error("not a fragment message: type 0x{0:02X}")]
    NotAFragment(u8),

    /// Fragment disagrees with the set it belongs to
    #[error("fragment set {set_id}: declared total {got}, set expects {expected}")]
    TotalMismatch {
        /// Hex fragment-set id
        set_id: String,
        /// Total the set was created with
        expected: u16,
        /// Total carried by this fragment
        got: u16,
    },

    /// Original message type byte is unknown
    #[error("invalid original message type: 0x{0:02X}")]
    InvalidOriginalType(u8),

    /// Fully reassembled bytes failed to decode
    #[error("reassembled message failed to decode: {0}")]
    Reassembly(#[from] DecodeError),
}
