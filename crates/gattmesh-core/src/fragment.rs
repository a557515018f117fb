//! Message fragmentation and reassembly.
//!
//! A message whose encoding exceeds the fragmentation threshold is cut into
//! contiguous chunks. Each chunk travels as its own `Fragment` message whose
//! payload starts with a fixed 13-byte header:
//!
//! ```text
//! set_id(8) | index(2) | total(2) | original_type(1) | chunk(N)
//! ```
//!
//! `index` and `total` are big-endian. All fragments of one message share a
//! random `set_id`.

use crate::error::{EncodeError, Error, FragmentError};
use crate::message::{Message, MessageType};
use crate::reassembly::ReassemblyStore;
use crate::{DEFAULT_FRAGMENT_THRESHOLD, DEFAULT_MAX_CHUNK, FRAGMENT_HEADER_SIZE};
use std::fmt;
use std::time::{Duration, Instant};

/// Random identifier shared by all fragments of one message
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentSetId([u8; 8]);

impl FragmentSetId {
    /// Create from raw bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for FragmentSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FragmentSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentSetId({})", hex::encode(self.0))
    }
}

/// Fixed 13-byte fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    set_id: FragmentSetId,
    index: u16,
    total: u16,
    original_type: MessageType,
}

impl FragmentHeader {
    /// Create a header, enforcing `index < total`
    pub fn new(
        set_id: FragmentSetId,
        index: u16,
        total: u16,
        original_type: MessageType,
    ) -> Result<Self, FragmentError> {
        if index >= total {
            return Err(FragmentError::IndexOutOfRange { index, total });
        }
        Ok(Self {
            set_id,
            index,
            total,
            original_type,
        })
    }

    /// Fragment-set id
    pub fn set_id(&self) -> FragmentSetId {
        self.set_id
    }

    /// Position of this fragment
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of fragments in the set
    pub fn total(&self) -> u16 {
        self.total
    }

    /// Type of the message that was split
    pub fn original_type(&self) -> MessageType {
        self.original_type
    }

    /// Append the encoded header to `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.set_id.as_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.push(self.original_type as u8);
    }

    /// Parse a header from the start of a fragment payload
    ///
    /// Returns the header and the remaining chunk bytes.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), FragmentError> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[0..8]);
        let index = u16::from_be_bytes([data[8], data[9]]);
        let total = u16::from_be_bytes([data[10], data[11]]);
        let original_type = MessageType::try_from(data[12])
            .map_err(|_| FragmentError::InvalidOriginalType(data[12]))?;

        let header = Self::new(FragmentSetId(id), index, total, original_type)?;
        Ok((header, &data[FRAGMENT_HEADER_SIZE..]))
    }
}

/// Fragmentation parameters
#[derive(Debug, Clone)]
pub struct FragmentConfig {
    /// Encoded size above which messages are split
    pub threshold: usize,

    /// Maximum chunk bytes per fragment
    pub max_chunk: usize,

    /// Pause between submitting consecutive fragments of one transfer
    pub inter_fragment_delay: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FRAGMENT_THRESHOLD,
            max_chunk: DEFAULT_MAX_CHUNK,
            inter_fragment_delay: Duration::ZERO,
        }
    }
}

/// Split `message` into fragments when its encoding exceeds `threshold`
///
/// Small messages come back unchanged as a single-element vector. Fragments
/// copy the envelope fields (ttl, timestamp, sender, recipient) and carry no
/// signature.
pub fn split_message(
    message: &Message,
    threshold: usize,
    max_chunk: usize,
) -> Result<Vec<Message>, EncodeError> {
    if max_chunk == 0 {
        return Err(EncodeError::ZeroChunkSize);
    }

    let encoded = message.encode()?;
    if encoded.len() <= threshold {
        return Ok(vec![message.clone()]);
    }

    let count = encoded.len().div_ceil(max_chunk);
    let total = u16::try_from(count).map_err(|_| EncodeError::TooManyFragments { count })?;
    let set_id = FragmentSetId::random();

    tracing::debug!(
        "Fragmenting {} bytes into {} fragments (set {})",
        encoded.len(),
        total,
        set_id
    );

    let fragments = encoded
        .chunks(max_chunk)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader {
                set_id,
                index: index as u16,
                total,
                original_type: message.msg_type(),
            };
            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            header.write_to(&mut payload);
            payload.extend_from_slice(chunk);

            let fragment = Message::new(MessageType::Fragment, message.sender(), payload)
                .with_ttl(message.ttl())
                .with_timestamp(message.timestamp());
            match message.recipient() {
                Some(recipient) => fragment.with_recipient(recipient),
                None => fragment,
            }
        })
        .collect();

    Ok(fragments)
}

/// Splits outbound messages and reassembles inbound fragments
pub struct FragmentCodec {
    config: FragmentConfig,
    store: ReassemblyStore,
}

impl FragmentCodec {
    /// Create a codec over the given reassembly store
    pub fn new(config: FragmentConfig, store: ReassemblyStore) -> Self {
        Self { config, store }
    }

    /// Fragmentation parameters
    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    /// Underlying reassembly store
    pub fn store(&self) -> &ReassemblyStore {
        &self.store
    }

    /// Split using the configured threshold and chunk size
    pub fn split(&self, message: &Message) -> Result<Vec<Message>, EncodeError> {
        split_message(message, self.config.threshold, self.config.max_chunk)
    }

    /// Accept one inbound fragment
    ///
    /// Returns the reconstructed message once every index of its set has
    /// arrived. The reconstructed message has its TTL forced to zero so a
    /// relay layer never re-broadcasts it. A set whose bytes fail to decode
    /// is still evicted.
    pub fn ingest(&self, fragment: &Message) -> Result<Option<Message>, FragmentError> {
        self.ingest_at(fragment, Instant::now())
    }

    /// `ingest` with an explicit clock reading
    pub fn ingest_at(
        &self,
        fragment: &Message,
        now: Instant,
    ) -> Result<Option<Message>, FragmentError> {
        if fragment.msg_type() != MessageType::Fragment {
            return Err(FragmentError::NotAFragment(fragment.msg_type() as u8));
        }

        let (header, chunk) = FragmentHeader::parse(fragment.payload())?;

        let Some(bytes) = self.store.insert(&header, chunk, now)? else {
            return Ok(None);
        };

        let message = Message::decode(&bytes).map_err(|e| {
            tracing::warn!(
                "Reassembled set {} ({} bytes) failed to decode: {}",
                header.set_id(),
                bytes.len(),
                e
            );
            FragmentError::Reassembly(e)
        })?;

        tracing::debug!(
            "Reassembled set {} into {:?} message ({} bytes)",
            header.set_id(),
            message.msg_type(),
            bytes.len()
        );

        Ok(Some(message.with_ttl(0)))
    }

    /// Decode one inbound packet
    ///
    /// Whole messages pass straight through. Fragments are fed to the
    /// reassembly store and yield the rebuilt message once their set is
    /// complete.
    pub fn receive(&self, bytes: &[u8]) -> Result<Option<Message>, Error> {
        let message = Message::decode(bytes)?;
        if message.msg_type() != MessageType::Fragment {
            return Ok(Some(message));
        }
        Ok(self.ingest(&message)?)
    }

    /// Evict sets older than the reassembly timeout
    pub fn sweep(&self, now: Instant) -> usize {
        self.store.sweep(now)
    }
}
