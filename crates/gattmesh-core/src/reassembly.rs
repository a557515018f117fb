//! In-progress fragment sets.
//!
//! Sets are keyed by their random fragment-set id and live until either every
//! index has arrived or they age past the reassembly timeout. A hard cap on
//! concurrent sets bounds memory under senders that abandon transfers; when
//! the cap is reached the oldest set is evicted to make room.
//!
//! Uses `DashMap` so inbound fragments from different link callbacks can be
//! ingested concurrently without a global lock.

use crate::error::FragmentError;
use crate::fragment::{FragmentHeader, FragmentSetId};
use crate::message::MessageType;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Reassembly parameters
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Age after which an incomplete set is discarded
    pub timeout: Duration,

    /// How often the background sweep runs
    pub sweep_interval: Duration,

    /// Maximum concurrent in-progress sets
    pub max_sets: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            max_sets: 256,
        }
    }
}

#[derive(Debug)]
struct ReassemblySet {
    chunks: HashMap<u16, Vec<u8>>,
    total: u16,
    original_type: MessageType,
    created: Instant,
}

impl ReassemblySet {
    fn new(total: u16, original_type: MessageType, created: Instant) -> Self {
        Self {
            chunks: HashMap::with_capacity(total as usize),
            total,
            original_type,
            created,
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn assemble(mut self) -> Vec<u8> {
        let size = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(size);
        for index in 0..self.total {
            if let Some(chunk) = self.chunks.remove(&index) {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }
}

/// Thread-safe map of fragment-set id to in-progress set
pub struct ReassemblyStore {
    sets: DashMap<FragmentSetId, ReassemblySet>,
    config: ReassemblyConfig,
}

impl ReassemblyStore {
    /// Create an empty store
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            sets: DashMap::new(),
            config,
        }
    }

    /// Reassembly parameters
    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Insert one chunk
    ///
    /// Returns the concatenated bytes in index order when this chunk completes
    /// its set, which is evicted in the same step. A repeated index keeps the
    /// first copy.
    pub fn insert(
        &self,
        header: &FragmentHeader,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        let set_id = header.set_id();

        if !self.sets.contains_key(&set_id) && self.sets.len() >= self.config.max_sets {
            self.evict_oldest();
        }

        {
            let mut set = self.sets.entry(set_id).or_insert_with(|| {
                ReassemblySet::new(header.total(), header.original_type(), now)
            });

            if set.total != header.total() {
                return Err(FragmentError::TotalMismatch {
                    set_id: set_id.to_string(),
                    expected: set.total,
                    got: header.total(),
                });
            }
            if set.original_type != header.original_type() {
                return Err(FragmentError::InvalidOriginalType(
                    header.original_type() as u8,
                ));
            }

            if set.chunks.contains_key(&header.index()) {
                tracing::debug!(
                    "Duplicate fragment {}/{} for set {}",
                    header.index(),
                    header.total(),
                    set_id
                );
            } else {
                set.chunks.insert(header.index(), chunk.to_vec());
            }

            if !set.is_complete() {
                return Ok(None);
            }
        }

        Ok(self
            .sets
            .remove_if(&set_id, |_, set| set.is_complete())
            .map(|(_, set)| set.assemble()))
    }

    /// Remove every set older than the timeout
    ///
    /// Returns the number of sets removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.sets.len();
        let timeout = self.config.timeout;
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.created) <= timeout);
        let removed = before.saturating_sub(self.sets.len());
        if removed > 0 {
            tracing::debug!("Swept {} stale fragment sets", removed);
        }
        removed
    }

    fn evict_oldest(&self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|entry| entry.value().created)
            .map(|entry| *entry.key());

        if let Some(set_id) = oldest {
            tracing::warn!(
                "Reassembly store full ({} sets), evicting oldest set {}",
                self.config.max_sets,
                set_id
            );
            self.sets.remove(&set_id);
        }
    }

    /// Number of in-progress sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no set is in progress
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Chunks received so far for a set
    pub fn received(&self, set_id: &FragmentSetId) -> Option<usize> {
        self.sets.get(set_id).map(|set| set.chunks.len())
    }

    /// Drop every in-progress set
    pub fn clear(&self) {
        self.sets.clear();
    }
}

impl Default for ReassemblyStore {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}
