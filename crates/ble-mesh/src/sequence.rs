//! IV Index state and per-source sequence number allocation

use crate::address::Address;
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Largest 24-bit sequence number
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

/// Largest IV Index increase accepted in one step (IV Index Recovery limit)
pub const MAX_IV_INDEX_STEP: u32 = 42;

/// Process-wide IV Index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    pub index: u32,
    pub update_active: bool,
}

impl IvIndex {
    pub fn new(index: u32, update_active: bool) -> Self {
        Self { index, update_active }
    }

    /// IV Index used to secure outgoing PDUs.
    pub fn transmit_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// IV Index of an incoming PDU carrying the given IVI bit.
    pub fn receive_index(&self, ivi: u8) -> Option<u32> {
        if self.index & 1 == u32::from(ivi & 1) {
            Some(self.index)
        } else {
            self.index.checked_sub(1)
        }
    }
}

/// Effect of an IV Index transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvIndexChange {
    /// In-flight segmented transactions must be aborted
    pub abort_transactions: bool,
    /// Sequence numbers restart from zero
    pub reset_sequences: bool,
}

impl IvIndexChange {
    pub fn validate(current: IvIndex, next: IvIndex) -> MeshResult<Self> {
        if next.index < current.index || next.transmit_index() < current.transmit_index() {
            return Err(MeshError::IvIndex(format!(
                "IV Index cannot decrease from {} to {}",
                current.index, next.index
            )));
        }
        if next.index - current.index > MAX_IV_INDEX_STEP {
            return Err(MeshError::IvIndex(format!(
                "IV Index step from {} to {} exceeds {}",
                current.index, next.index, MAX_IV_INDEX_STEP
            )));
        }
        Ok(Self {
            abort_transactions: next.index != current.index
                || next.transmit_index() != current.transmit_index(),
            reset_sequences: next.transmit_index() > current.transmit_index(),
        })
    }
}

/// Persisted sequence state: IV Index and per-source reservation high-water marks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub iv_index: IvIndex,
    pub reserved: BTreeMap<Address, u32>,
}

/// Hands out 24-bit sequence numbers per local source address
///
/// Sequence numbers are reserved in blocks: the persisted high-water mark is
/// moved ahead before any number of the next block is used, so that a restart
/// resumes above every number that may have been sent.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: HashMap<Address, u32>,
    reserved: HashMap<Address, u32>,
    block: u32,
    dirty: bool,
}

impl SequenceAllocator {
    pub fn new(block: u32) -> Self {
        Self {
            next: HashMap::new(),
            reserved: HashMap::new(),
            block: block.max(1),
            dirty: false,
        }
    }

    /// Resume from a snapshot; every previously reserved number is skipped.
    pub fn restore(reserved: &BTreeMap<Address, u32>, block: u32) -> Self {
        let mut allocator = Self::new(block);
        for (source, high_water) in reserved {
            allocator.next.insert(*source, *high_water);
            allocator.reserved.insert(*source, *high_water);
        }
        allocator
    }

    /// Next sequence number for `source`.
    pub fn allocate(&mut self, source: Address) -> MeshResult<u32> {
        let next = self.next.get(&source).copied().unwrap_or(0);
        if next > MAX_SEQUENCE {
            return Err(MeshError::SequenceExhausted(source));
        }

        let reserved = self.reserved.get(&source).copied().unwrap_or(0);
        if next >= reserved {
            let high_water = next.saturating_add(self.block).min(MAX_SEQUENCE + 1);
            self.reserved.insert(source, high_water);
            self.dirty = true;
            debug!(src = %source, high_water, "Reserved sequence block");
        }

        self.next.insert(source, next + 1);
        Ok(next)
    }

    /// Next sequence number that would be allocated, without allocating it.
    pub fn peek(&self, source: Address) -> u32 {
        self.next.get(&source).copied().unwrap_or(0)
    }

    /// Restart every source from zero after the IV Index moved up.
    pub fn reset(&mut self) {
        info!("Resetting sequence numbers of {} sources", self.next.len());
        self.next.clear();
        self.reserved.clear();
        self.dirty = true;
    }

    pub fn reserved(&self) -> BTreeMap<Address, u32> {
        self.reserved.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Returns true once after every reservation change since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Address = Address::new(0x0001);

    #[test]
    fn test_allocation_is_monotonic_per_source() {
        let mut allocator = SequenceAllocator::new(4);
        assert_eq!(allocator.allocate(SRC).unwrap(), 0);
        assert_eq!(allocator.allocate(SRC).unwrap(), 1);
        assert_eq!(allocator.allocate(Address::new(0x0002)).unwrap(), 0);
        assert_eq!(allocator.allocate(SRC).unwrap(), 2);
        assert_eq!(allocator.peek(SRC), 3);
    }

    #[test]
    fn test_reservation_blocks() {
        let mut allocator = SequenceAllocator::new(4);
        allocator.allocate(SRC).unwrap();
        assert!(allocator.take_dirty());
        assert_eq!(allocator.reserved()[&SRC], 4);

        for _ in 0..3 {
            allocator.allocate(SRC).unwrap();
        }
        assert!(!allocator.take_dirty());

        allocator.allocate(SRC).unwrap();
        assert!(allocator.take_dirty());
        assert_eq!(allocator.reserved()[&SRC], 8);
    }

    #[test]
    fn test_restore_skips_reserved_range() {
        let mut allocator = SequenceAllocator::new(16);
        allocator.allocate(SRC).unwrap();
        allocator.allocate(SRC).unwrap();

        let mut restored = SequenceAllocator::restore(&allocator.reserved(), 16);
        assert_eq!(restored.allocate(SRC).unwrap(), 16);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut reserved = BTreeMap::new();
        reserved.insert(SRC, MAX_SEQUENCE);
        let mut allocator = SequenceAllocator::restore(&reserved, 256);
        assert_eq!(allocator.allocate(SRC).unwrap(), MAX_SEQUENCE);
        assert!(matches!(allocator.allocate(SRC), Err(MeshError::SequenceExhausted(_))));
    }

    #[test]
    fn test_reset() {
        let mut allocator = SequenceAllocator::new(4);
        allocator.allocate(SRC).unwrap();
        allocator.reset();
        assert_eq!(allocator.allocate(SRC).unwrap(), 0);
    }

    #[test]
    fn test_transmit_and_receive_index() {
        let normal = IvIndex::new(0x12345678, false);
        assert_eq!(normal.transmit_index(), 0x12345678);
        assert_eq!(normal.receive_index(0), Some(0x12345678));
        assert_eq!(normal.receive_index(1), Some(0x12345677));

        let updating = IvIndex::new(0x12345679, true);
        assert_eq!(updating.transmit_index(), 0x12345678);
        assert_eq!(updating.receive_index(0), Some(0x12345678));

        assert_eq!(IvIndex::new(0, false).receive_index(1), None);
    }

    #[test]
    fn test_iv_index_transitions() {
        let normal = IvIndex::new(5, false);
        let updating = IvIndex::new(6, true);
        let done = IvIndex::new(6, false);

        let change = IvIndexChange::validate(normal, updating).unwrap();
        assert!(change.abort_transactions);
        assert!(!change.reset_sequences);

        let change = IvIndexChange::validate(updating, done).unwrap();
        assert!(change.reset_sequences);

        let change = IvIndexChange::validate(done, done).unwrap();
        assert!(!change.abort_transactions);

        assert!(IvIndexChange::validate(done, normal).is_err());
        assert!(IvIndexChange::validate(done, IvIndex::new(100, false)).is_err());
    }
}
