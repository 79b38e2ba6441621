//! Replay protection cache

use crate::address::Address;
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Highest (IV Index, SEQ) accepted from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplayRecord {
    // Field order gives the lexicographic ordering, IV Index first
    pub iv_index: u32,
    pub sequence: u32,
}

/// Persisted form of the replay cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub records: BTreeMap<Address, ReplayRecord>,
}

/// Per-source replay protection list
///
/// A PDU is accepted only if its (IV Index, SEQ) pair is strictly greater than
/// the last one accepted from the same source. The list is bounded: once it is
/// full, PDUs from sources it does not know are rejected.
#[derive(Debug)]
pub struct ReplayCache {
    records: HashMap<Address, ReplayRecord>,
    capacity: usize,
    dirty: bool,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            capacity,
            dirty: false,
        }
    }

    pub fn restore(snapshot: ReplaySnapshot, capacity: usize) -> Self {
        let records: HashMap<Address, ReplayRecord> = snapshot.records.into_iter().collect();
        if records.len() > capacity {
            // All records are kept: dropping one would reopen its replay window
            warn!(
                "Replay snapshot holds {} sources, more than the capacity of {}",
                records.len(),
                capacity
            );
        }
        Self {
            records,
            capacity,
            dirty: false,
        }
    }

    /// Check the pair against the stored record without recording it.
    pub fn check(&self, source: Address, iv_index: u32, sequence: u32) -> MeshResult<()> {
        let replayed = || MeshError::Replay {
            source_address: source,
            iv_index,
            sequence,
        };
        if !source.is_unicast() {
            return Err(replayed());
        }
        let candidate = ReplayRecord { iv_index, sequence };

        match self.records.get(&source) {
            Some(record) if candidate <= *record => {
                debug!(
                    src = %source,
                    iv_index,
                    seq = sequence,
                    last_seq = record.sequence,
                    "Replay rejected"
                );
                Err(replayed())
            }
            Some(_) => Ok(()),
            None if self.records.len() >= self.capacity => {
                warn!(
                    src = %source,
                    capacity = self.capacity,
                    "Replay cache full, rejecting unknown source"
                );
                Err(replayed())
            }
            None => Ok(()),
        }
    }

    /// Accept and record the pair if it is newer than the stored one.
    pub fn accept(&mut self, source: Address, iv_index: u32, sequence: u32) -> MeshResult<()> {
        self.check(source, iv_index, sequence)?;
        self.records.insert(source, ReplayRecord { iv_index, sequence });
        self.dirty = true;
        Ok(())
    }

    pub fn record(&self, source: Address) -> Option<ReplayRecord> {
        self.records.get(&source).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            records: self.records.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    /// Returns true once after every change since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
