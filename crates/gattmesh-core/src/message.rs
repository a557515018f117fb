//! Message envelope and wire encoding.
//!
//! All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//! version(1) | type(1) | ttl(1) | timestamp(8) | flags(1) | payload_len(2|4)
//! | sender(8) | [recipient(8)] | payload(N) | [signature(64)]
//! ```
//!
//! Version 1 carries a 2-byte payload length, version 2 a 4-byte one. The
//! encoder only emits version 2 when the payload does not fit in `u16`.

use crate::error::{DecodeError, EncodeError};
use crate::{DEFAULT_TTL, PEER_ID_SIZE, SIGNATURE_SIZE};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const VERSION_1: u8 = 1;
const VERSION_2: u8 = 2;

const FLAG_HAS_RECIPIENT: u8 = 0b0000_0001;
const FLAG_HAS_SIGNATURE: u8 = 0b0000_0010;

/// version + type + ttl + timestamp + flags
const FIXED_PREFIX: usize = 1 + 1 + 1 + 8 + 1;

/// 8-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Broadcast recipient sentinel
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);

    /// Create a peer id from raw bytes
    pub const fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Whether this is the broadcast sentinel
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Parse a 16-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; PEER_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl From<[u8; PEER_ID_SIZE]> for PeerId {
    fn from(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// Message types carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence announcement
    Announce = 0x01,
    /// Peer leaving the mesh
    Leave = 0x03,
    /// Chat message
    Message = 0x04,
    /// Noise handshake step
    NoiseHandshake = 0x10,
    /// Noise-encrypted payload
    NoiseEncrypted = 0x11,
    /// Fragment of a larger message
    Fragment = 0x20,
    /// Gossip sync request
    RequestSync = 0x21,
    /// File transfer payload
    FileTransfer = 0x22,
    /// Call signaling (invite/accept/hangup)
    CallSignal = 0x30,
    /// Encoded voice frame
    Voice = 0x31,
    /// Encoded video frame
    Video = 0x32,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x03 => Ok(Self::Leave),
            0x04 => Ok(Self::Message),
            0x10 => Ok(Self::NoiseHandshake),
            0x11 => Ok(Self::NoiseEncrypted),
            0x20 => Ok(Self::Fragment),
            0x21 => Ok(Self::RequestSync),
            0x22 => Ok(Self::FileTransfer),
            0x30 => Ok(Self::CallSignal),
            0x31 => Ok(Self::Voice),
            0x32 => Ok(Self::Video),
            _ => Err(DecodeError::InvalidMessageType(value)),
        }
    }
}

/// Application-level message
///
/// Immutable once built: the `with_*` methods consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    ttl: u8,
    timestamp: u64,
    sender: PeerId,
    recipient: Option<PeerId>,
    payload: Vec<u8>,
    signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Message {
    /// Create a broadcast message stamped with the current time
    pub fn new(msg_type: MessageType, sender: PeerId, payload: Vec<u8>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            msg_type,
            ttl: DEFAULT_TTL,
            timestamp,
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    /// Address the message to a single peer
    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Override the hop budget
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the timestamp (ms since UNIX epoch)
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: [u8; SIGNATURE_SIZE]) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Message type
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Remaining hop budget
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Creation timestamp in ms since UNIX epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Originating peer
    pub fn sender(&self) -> PeerId {
        self.sender
    }

    /// Recipient, if addressed
    pub fn recipient(&self) -> Option<PeerId> {
        self.recipient
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Signature bytes
    pub fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        self.signature.as_ref()
    }

    /// True when unaddressed or addressed to the broadcast sentinel
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none_or(|r| r.is_broadcast())
    }

    fn uses_wide_length(&self) -> bool {
        self.payload.len() > u16::MAX as usize
    }

    /// Size of the encoded message in bytes
    pub fn encoded_len(&self) -> usize {
        let length_field = if self.uses_wide_length() { 4 } else { 2 };
        let mut len = FIXED_PREFIX + length_field + PEER_ID_SIZE + self.payload.len();
        if self.recipient.is_some() {
            len += PEER_ID_SIZE;
        }
        if self.signature.is_some() {
            len += SIGNATURE_SIZE;
        }
        len
    }

    /// Serialize into wire format
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        if self.payload.len() > u32::MAX as usize {
            return Err(EncodeError::PayloadTooLarge {
                len: self.payload.len(),
                max: u32::MAX as usize,
            });
        }

        let wide = self.uses_wide_length();
        let mut flags = 0u8;
        if self.recipient.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(if wide { VERSION_2 } else { VERSION_1 });
        buf.push(self.msg_type as u8);
        buf.push(self.ttl);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.push(flags);
        if wide {
            buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        } else {
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        }
        buf.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            buf.extend_from_slice(recipient.as_bytes());
        }
        buf.extend_from_slice(&self.payload);
        if let Some(signature) = &self.signature {
            buf.extend_from_slice(signature);
        }

        Ok(buf)
    }

    /// Parse a message from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < FIXED_PREFIX + 2 + PEER_ID_SIZE {
            return Err(DecodeError::TooShort {
                expected: FIXED_PREFIX + 2 + PEER_ID_SIZE,
                actual: data.len(),
            });
        }

        let version = data[0];
        let length_field = match version {
            VERSION_1 => 2,
            VERSION_2 => 4,
            other => return Err(DecodeError::UnsupportedVersion(other)),
        };

        let msg_type = MessageType::try_from(data[1])?;
        let ttl = data[2];
        let timestamp = u64::from_be_bytes([
            data[3], data[4], data[5], data[6],
            data[7], data[8], data[9], data[10],
        ]);
        let flags = data[11];

        let header_len = FIXED_PREFIX + length_field + PEER_ID_SIZE;
        if data.len() < header_len {
            return Err(DecodeError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        let mut pos = FIXED_PREFIX;
        let payload_len = if length_field == 2 {
            u16::from_be_bytes([data[pos], data[pos + 1]]) as usize
        } else {
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize
        };
        pos += length_field;

        let sender = read_peer_id(data, pos);
        pos += PEER_ID_SIZE;

        let recipient = if flags & FLAG_HAS_RECIPIENT != 0 {
            if data.len() < pos + PEER_ID_SIZE {
                return Err(DecodeError::TooShort {
                    expected: pos + PEER_ID_SIZE,
                    actual: data.len(),
                });
            }
            let recipient = read_peer_id(data, pos);
            pos += PEER_ID_SIZE;
            Some(recipient)
        } else {
            None
        };

        let payload_end = pos
            .checked_add(payload_len)
            .ok_or(DecodeError::PayloadOverflow)?;
        if payload_end > data.len() {
            return Err(DecodeError::PayloadOverflow);
        }
        let payload = data[pos..payload_end].to_vec();
        pos = payload_end;

        let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
            let sig: [u8; SIGNATURE_SIZE] = data
                .get(pos..pos + SIGNATURE_SIZE)
                .and_then(|s| s.try_into().ok())
                .ok_or(DecodeError::TruncatedSignature)?;
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            msg_type,
            ttl,
            timestamp,
            sender,
            recipient,
            payload,
            signature,
        })
    }
}

fn read_peer_id(data: &[u8], pos: usize) -> PeerId {
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(&data[pos..pos + PEER_ID_SIZE]);
    PeerId(id)
}
