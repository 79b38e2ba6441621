//! Lower transport segmentation and reassembly
//!
//! Outbound, an upper transport PDU is split into at most 32 segments that share
//! one SeqZero. Inbound, segments are collected per source until every SegO up to
//! SegN has been seen; block acknowledgments report progress back to unicast
//! senders. Completed transactions are remembered so that late duplicates are
//! re-acknowledged and dropped instead of being delivered twice.

use crate::address::Address;
use crate::crypto::MicSize;
use crate::error::{MeshError, MeshResult};
use crate::keys::KeyIndex;
use crate::pdu::{
    AccessKeyId, LowerTransportPdu, SegmentAck, SegmentHeader, ACCESS_SEGMENT_SIZE, MAX_SEGMENTS,
};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Split an upper transport PDU into segmented access PDUs.
pub fn segment_access(
    upper_pdu: &[u8],
    key: AccessKeyId,
    mic: MicSize,
    seq_auth: u32,
) -> MeshResult<Vec<LowerTransportPdu>> {
    if upper_pdu.is_empty() {
        return Err(MeshError::Segmentation("empty upper transport PDU".to_string()));
    }
    let count = upper_pdu.len().div_ceil(ACCESS_SEGMENT_SIZE);
    if count > MAX_SEGMENTS {
        return Err(MeshError::Segmentation(format!(
            "upper transport PDU of {} bytes needs {} segments",
            upper_pdu.len(),
            count
        )));
    }

    let seq_zero = (seq_auth & 0x1FFF) as u16;
    let seg_n = (count - 1) as u8;
    Ok(upper_pdu
        .chunks(ACCESS_SEGMENT_SIZE)
        .enumerate()
        .map(|(seg_o, chunk)| LowerTransportPdu::SegmentedAccess {
            key,
            header: SegmentHeader {
                szmic: mic == MicSize::Long,
                seq_zero,
                seg_o: seg_o as u8,
                seg_n,
            },
            segment: chunk.to_vec(),
        })
        .collect())
}

/// Block acknowledgment value with every segment up to `seg_n` set.
pub fn full_block(seg_n: u8) -> u32 {
    if seg_n >= 31 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// Routes Segment Acknowledgments to the tasks sending segmented messages
#[derive(Debug, Default)]
pub struct OutgoingTransactions {
    entries: HashMap<(Address, u16), OutgoingEntry>,
}

#[derive(Debug)]
struct OutgoingEntry {
    peer: Address,
    acks: mpsc::UnboundedSender<SegmentAck>,
}

impl OutgoingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction from `source` to unicast `peer`.
    ///
    /// The receiver yields every acknowledgment for it and ends when the
    /// transaction is aborted.
    pub fn register(
        &mut self,
        source: Address,
        seq_zero: u16,
        peer: Address,
    ) -> MeshResult<mpsc::UnboundedReceiver<SegmentAck>> {
        let key = (source, seq_zero);
        if self.entries.contains_key(&key) {
            return Err(MeshError::Segmentation(format!(
                "transaction {} / SeqZero {} already in progress",
                source, seq_zero
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(key, OutgoingEntry { peer, acks: tx });
        Ok(rx)
    }

    /// Deliver an acknowledgment received from `ack_source` addressed to `ack_destination`.
    pub fn deliver(
        &mut self,
        ack_source: Address,
        ack_destination: Address,
        ack: SegmentAck,
    ) -> bool {
        let key = (ack_destination, ack.seq_zero);
        match self.entries.get(&key) {
            Some(entry) if entry.peer == ack_source => entry.acks.send(ack).is_ok(),
            _ => false,
        }
    }

    pub fn remove(&mut self, source: Address, seq_zero: u16) {
        self.entries.remove(&(source, seq_zero));
    }

    /// Drop every transaction; their senders observe a closed channel.
    pub fn abort_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reassembly limits and timers
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    pub max_transactions: usize,
    pub completed_memory: usize,
    pub incomplete_timeout: Duration,
    pub max_ack_retries: u32,
    pub ack_timer_base: Duration,
    pub ack_timer_per_hop: Duration,
}

impl ReassemblyConfig {
    pub fn from_transport(config: &shared::TransportConfig) -> Self {
        Self {
            max_transactions: config.max_incoming_transactions,
            completed_memory: config.completed_transaction_memory,
            incomplete_timeout: config.incomplete_timeout(),
            max_ack_retries: config.max_ack_retries,
            ack_timer_base: Duration::from_millis(config.ack_timer_base_ms),
            ack_timer_per_hop: Duration::from_millis(config.ack_timer_per_hop_ms),
        }
    }

    fn ack_timer(&self, ttl: u8) -> Duration {
        self.ack_timer_base + self.ack_timer_per_hop * u32::from(ttl)
    }
}

/// A received segment with the network context it arrived in
#[derive(Debug, Clone)]
pub struct IncomingSegment {
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub iv_index: u32,
    pub network_key: KeyIndex,
    pub seq_auth: u32,
    pub key: AccessKeyId,
    pub header: SegmentHeader,
    pub segment: Vec<u8>,
}

/// A fully reassembled upper transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub src: Address,
    pub dst: Address,
    pub iv_index: u32,
    pub network_key: KeyIndex,
    pub seq_auth: u32,
    pub key: AccessKeyId,
    pub mic: MicSize,
    pub upper_pdu: Vec<u8>,
}

/// Block acknowledgment to send back to a segment sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingAck {
    /// Local element the segments were addressed to
    pub src: Address,
    /// Sender of the segments
    pub dst: Address,
    pub network_key: KeyIndex,
    pub ack: SegmentAck,
}

/// What happened to a received segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Stored, transaction still incomplete
    Pending,
    /// Already received in the current transaction
    Repeated,
    /// Last missing segment: the message is complete
    Complete(ReassembledMessage),
    /// Belongs to a transaction that already completed
    AlreadyCompleted,
    /// Belongs to a transaction older than the one in progress
    Stale,
    /// No room for another transaction
    Busy,
}

/// Result of feeding one segment to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentResult {
    pub reassembly: Reassembly,
    pub ack: Option<OutgoingAck>,
}

/// What the periodic sweep decided
#[derive(Debug, Default)]
pub struct SweepResult {
    pub acks: Vec<OutgoingAck>,
    pub abandoned: usize,
    pub expired: usize,
}

#[derive(Debug)]
struct IncomingTransaction {
    dst: Address,
    iv_index: u32,
    network_key: KeyIndex,
    seq_auth: u32,
    key: AccessKeyId,
    szmic: bool,
    seg_n: u8,
    received: u32,
    segments: Vec<Option<Vec<u8>>>,
    ttl: u8,
    last_activity: Instant,
    ack_deadline: Option<Instant>,
    acks_without_progress: u32,
}

impl IncomingTransaction {
    fn is_complete(&self) -> bool {
        self.received == full_block(self.seg_n)
    }

    fn acknowledged(&self) -> bool {
        self.dst.is_unicast()
    }

    fn ack(&self, src: Address) -> OutgoingAck {
        OutgoingAck {
            src: self.dst,
            dst: src,
            network_key: self.network_key,
            ack: SegmentAck::new((self.seq_auth & 0x1FFF) as u16, self.received),
        }
    }

    fn assemble(&mut self, src: Address) -> MeshResult<ReassembledMessage> {
        let mut upper_pdu =
            Vec::with_capacity((usize::from(self.seg_n) + 1) * ACCESS_SEGMENT_SIZE);
        for segment in self.segments.iter_mut() {
            let segment = segment
                .take()
                .ok_or_else(|| MeshError::Segmentation("missing segment at assembly".to_string()))?;
            upper_pdu.extend_from_slice(&segment);
        }
        let mic = if self.szmic { MicSize::Long } else { MicSize::Short };
        if upper_pdu.len() <= mic.len() {
            return Err(MeshError::Segmentation(format!(
                "reassembled PDU of {} bytes cannot hold a {}-byte TransMIC",
                upper_pdu.len(),
                mic.len()
            )));
        }
        Ok(ReassembledMessage {
            src,
            dst: self.dst,
            iv_index: self.iv_index,
            network_key: self.network_key,
            seq_auth: self.seq_auth,
            key: self.key,
            mic,
            upper_pdu,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CompletedTransaction {
    dst: Address,
    network_key: KeyIndex,
    block_ack: u32,
}

/// Inbound reassembly state for every remote source
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblyConfig,
    incoming: HashMap<Address, IncomingTransaction>,
    /// Keyed by source and the full SeqAuth (IV Index then SEQ)
    completed: LruCache<(Address, u32, u32), CompletedTransaction>,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        let memory = NonZeroUsize::new(config.completed_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            incoming: HashMap::new(),
            completed: LruCache::new(memory),
        }
    }

    /// Feed one segment; `now` drives the acknowledgment and inactivity timers.
    pub fn receive(&mut self, segment: IncomingSegment, now: Instant) -> MeshResult<SegmentResult> {
        let IncomingSegment {
            src,
            dst,
            ttl,
            iv_index,
            network_key,
            seq_auth,
            key,
            header,
            segment: payload,
        } = segment;

        if header.seg_o < header.seg_n && payload.len() != ACCESS_SEGMENT_SIZE {
            return Err(MeshError::Segmentation(format!(
                "segment {} of {} from {} has {} bytes",
                header.seg_o, header.seg_n, src, payload.len()
            )));
        }

        if let Some(done) = self.completed.get(&(src, iv_index, seq_auth)) {
            debug!(src = %src, seq_auth, "Segment of completed transaction");
            let ack = dst.is_unicast().then(|| OutgoingAck {
                src: done.dst,
                dst: src,
                network_key: done.network_key,
                ack: SegmentAck::new(header.seq_zero, done.block_ack),
            });
            return Ok(SegmentResult {
                reassembly: Reassembly::AlreadyCompleted,
                ack,
            });
        }

        if let Some(existing) = self.incoming.get(&src) {
            let current = (existing.iv_index, existing.seq_auth);
            if (iv_index, seq_auth) < current {
                debug!(src = %src, seq_auth, current = existing.seq_auth, "Stale segment dropped");
                return Ok(SegmentResult {
                    reassembly: Reassembly::Stale,
                    ack: None,
                });
            }
            if (iv_index, seq_auth) > current {
                info!(
                    src = %src,
                    abandoned = existing.seq_auth,
                    seq_auth,
                    "Newer transaction abandons incomplete one"
                );
                self.incoming.remove(&src);
            }
        }

        if !self.incoming.contains_key(&src) {
            if self.incoming.len() >= self.config.max_transactions {
                warn!(src = %src, "Reassembly table full, rejecting transaction");
                let ack = dst.is_unicast().then(|| OutgoingAck {
                    src: dst,
                    dst: src,
                    network_key,
                    ack: SegmentAck::new(header.seq_zero, 0),
                });
                return Ok(SegmentResult {
                    reassembly: Reassembly::Busy,
                    ack,
                });
            }
            let ack_deadline = dst.is_unicast().then(|| now + self.config.ack_timer(ttl));
            self.incoming.insert(
                src,
                IncomingTransaction {
                    dst,
                    iv_index,
                    network_key,
                    seq_auth,
                    key,
                    szmic: header.szmic,
                    seg_n: header.seg_n,
                    received: 0,
                    segments: vec![None; usize::from(header.seg_n) + 1],
                    ttl,
                    last_activity: now,
                    ack_deadline,
                    acks_without_progress: 0,
                },
            );
            debug!(src = %src, seq_auth, seg_n = header.seg_n, "Started reassembly");
        }

        let transaction = self
            .incoming
            .get_mut(&src)
            .ok_or_else(|| MeshError::Segmentation("transaction vanished".to_string()))?;

        if transaction.seg_n != header.seg_n
            || transaction.szmic != header.szmic
            || transaction.key != key
            || transaction.dst != dst
            || transaction.iv_index != iv_index
        {
            return Err(MeshError::Segmentation(format!(
                "segment {} from {} does not match its transaction",
                header.seg_o, src
            )));
        }

        let bit = 1u32 << header.seg_o;
        if transaction.received & bit != 0 {
            return Ok(SegmentResult {
                reassembly: Reassembly::Repeated,
                ack: None,
            });
        }

        transaction.received |= bit;
        transaction.segments[usize::from(header.seg_o)] = Some(payload);
        transaction.last_activity = now;
        transaction.ttl = ttl;
        transaction.acks_without_progress = 0;
        if transaction.acknowledged() && transaction.ack_deadline.is_none() {
            transaction.ack_deadline = Some(now + self.config.ack_timer(ttl));
        }

        if transaction.is_complete() {
            let mut transaction = self
                .incoming
                .remove(&src)
                .ok_or_else(|| MeshError::Segmentation("transaction vanished".to_string()))?;
            let ack = transaction.acknowledged().then(|| transaction.ack(src));
            self.completed.put(
                (src, iv_index, seq_auth),
                CompletedTransaction {
                    dst,
                    network_key,
                    block_ack: transaction.received,
                },
            );
            let message = transaction.assemble(src)?;
            debug!(src = %src, seq_auth, len = message.upper_pdu.len(), "Reassembly complete");
            return Ok(SegmentResult {
                reassembly: Reassembly::Complete(message),
                ack,
            });
        }

        // The last segment arrived with gaps before it: report them right away
        let ack = if header.seg_o == header.seg_n && transaction.acknowledged() {
            transaction.ack_deadline = Some(now + self.config.ack_timer(ttl));
            Some(transaction.ack(src))
        } else {
            None
        };

        Ok(SegmentResult {
            reassembly: Reassembly::Pending,
            ack,
        })
    }

    /// Fire due acknowledgment timers and evict inactive transactions.
    pub fn sweep(&mut self, now: Instant) -> SweepResult {
        let mut result = SweepResult::default();
        let incomplete_timeout = self.config.incomplete_timeout;
        let max_ack_retries = self.config.max_ack_retries;
        let mut remove = Vec::new();

        for (src, transaction) in self.incoming.iter_mut() {
            if now.duration_since(transaction.last_activity) >= incomplete_timeout {
                debug!(
                    src = %src,
                    seq_auth = transaction.seq_auth,
                    "Incomplete transaction timed out"
                );
                remove.push(*src);
                result.expired += 1;
                continue;
            }
            let Some(deadline) = transaction.ack_deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            if transaction.acks_without_progress >= max_ack_retries {
                info!(
                    src = %src,
                    seq_auth = transaction.seq_auth,
                    "Transaction abandoned after ack retries"
                );
                remove.push(*src);
                result.abandoned += 1;
                continue;
            }
            transaction.acks_without_progress += 1;
            transaction.ack_deadline = Some(now + self.config.ack_timer(transaction.ttl));
            result.acks.push(transaction.ack(*src));
        }

        for src in remove {
            self.incoming.remove(&src);
        }
        result
    }

    /// Earliest instant at which `sweep` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.incoming
            .values()
            .flat_map(|transaction| {
                let expiry = transaction.last_activity + self.config.incomplete_timeout;
                std::iter::once(expiry).chain(transaction.ack_deadline)
            })
            .min()
    }

    /// Drop every incomplete transaction.
    pub fn abort_all(&mut self) -> usize {
        let count = self.incoming.len();
        self.incoming.clear();
        count
    }

    /// Forget completed transactions secured with an IV Index below `iv_index`.
    pub fn forget_completed_before(&mut self, iv_index: u32) -> usize {
        let stale: Vec<_> = self
            .completed
            .iter()
            .filter(|((_, completed_iv, _), _)| *completed_iv < iv_index)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            self.completed.pop(key);
        }
        stale.len()
    }

    pub fn in_progress(&self) -> usize {
        self.incoming.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SENDER: Address = Address::new(0x0100);
    const LOCAL: Address = Address::new(0x0001);

    fn config() -> ReassemblyConfig {
        ReassemblyConfig::from_transport(&shared::TransportConfig::default())
    }

    fn net_key() -> KeyIndex {
        KeyIndex::new(0).unwrap()
    }

    fn incoming(
        pdus: &[LowerTransportPdu],
        seq_auth: u32,
        index: usize,
        dst: Address,
    ) -> IncomingSegment {
        match &pdus[index] {
            LowerTransportPdu::SegmentedAccess { key, header, segment } => IncomingSegment {
                src: SENDER,
                dst,
                ttl: 4,
                iv_index: 0,
                network_key: net_key(),
                seq_auth,
                key: *key,
                header: *header,
                segment: segment.clone(),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    fn upper(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_segment_layout() {
        let pdus =
            segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 0x3129AB).unwrap();
        assert_eq!(pdus.len(), 3);
        for (i, pdu) in pdus.iter().enumerate() {
            match pdu {
                LowerTransportPdu::SegmentedAccess { header, segment, .. } => {
                    assert_eq!(header.seq_zero, 0x09AB);
                    assert_eq!(header.seg_o as usize, i);
                    assert_eq!(header.seg_n, 2);
                    assert_eq!(segment.len(), if i == 2 { 6 } else { 12 });
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_segment_limits() {
        assert!(segment_access(&upper(384), AccessKeyId::Device, MicSize::Short, 0).is_ok());
        assert!(segment_access(&upper(385), AccessKeyId::Device, MicSize::Short, 0).is_err());
        assert!(segment_access(&[], AccessKeyId::Device, MicSize::Short, 0).is_err());
    }

    #[test]
    fn test_full_block() {
        assert_eq!(full_block(0), 0b1);
        assert_eq!(full_block(2), 0b111);
        assert_eq!(full_block(31), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassembly_with_gap_acknowledges_missing() {
        let mut reassembler = Reassembler::new(config());
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 100).unwrap();
        let now = Instant::now();

        let first = reassembler.receive(incoming(&pdus, 100, 0, LOCAL), now).unwrap();
        assert_eq!(first.reassembly, Reassembly::Pending);
        assert!(first.ack.is_none());

        // Last segment with segment 1 missing
        let last = reassembler.receive(incoming(&pdus, 100, 2, LOCAL), now).unwrap();
        assert_eq!(last.reassembly, Reassembly::Pending);
        let ack = last.ack.unwrap();
        assert_eq!(ack.ack.block_ack, 0b101);
        assert_eq!(ack.dst, SENDER);
        assert_eq!(ack.src, LOCAL);

        let done = reassembler.receive(incoming(&pdus, 100, 1, LOCAL), now).unwrap();
        match done.reassembly {
            Reassembly::Complete(message) => assert_eq!(message.upper_pdu, upper(30)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(done.ack.unwrap().ack.block_ack, 0b111);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_transaction_is_reacknowledged_not_redelivered() {
        let mut reassembler = Reassembler::new(config());
        let pdus = segment_access(&upper(20), AccessKeyId::Device, MicSize::Short, 7).unwrap();
        let now = Instant::now();
        reassembler.receive(incoming(&pdus, 7, 0, LOCAL), now).unwrap();
        let done = reassembler.receive(incoming(&pdus, 7, 1, LOCAL), now).unwrap();
        assert!(matches!(done.reassembly, Reassembly::Complete(_)));

        let again = reassembler.receive(incoming(&pdus, 7, 1, LOCAL), now).unwrap();
        assert_eq!(again.reassembly, Reassembly::AlreadyCompleted);
        assert_eq!(again.ack.unwrap().ack.block_ack, 0b11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seq_under_new_iv_index_is_a_new_transaction() {
        let mut reassembler = Reassembler::new(config());
        let pdus = segment_access(&upper(20), AccessKeyId::Device, MicSize::Short, 0).unwrap();
        let now = Instant::now();
        for index in 0..2 {
            reassembler.receive(incoming(&pdus, 0, index, LOCAL), now).unwrap();
        }

        // The sender restarted SEQ at 0 after an IV Index update
        let mut first = incoming(&pdus, 0, 0, LOCAL);
        first.iv_index = 1;
        let result = reassembler.receive(first, now).unwrap();
        assert_eq!(result.reassembly, Reassembly::Pending);

        let mut last = incoming(&pdus, 0, 1, LOCAL);
        last.iv_index = 1;
        let done = reassembler.receive(last, now).unwrap();
        assert!(matches!(done.reassembly, Reassembly::Complete(_)));

        assert_eq!(reassembler.forget_completed_before(1), 1);
        assert_eq!(reassembler.forget_completed_before(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_iv_index_segment_is_stale() {
        let mut reassembler = Reassembler::new(config());
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 3).unwrap();
        let now = Instant::now();

        let mut newer = incoming(&pdus, 3, 0, LOCAL);
        newer.iv_index = 1;
        reassembler.receive(newer, now).unwrap();

        // Higher SEQ but lower IV Index: older in SeqAuth order
        let older = incoming(&pdus, 0x00FF_FFFF, 1, LOCAL);
        let result = reassembler.receive(older, now).unwrap();
        assert_eq!(result.reassembly, Reassembly::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_destination_never_acknowledged() {
        let mut reassembler = Reassembler::new(config());
        let group = Address::new(0xC001);
        let key = AccessKeyId::Application { aid: 3 };
        let pdus = segment_access(&upper(30), key, MicSize::Short, 9).unwrap();
        let now = Instant::now();
        for index in [2, 0, 1] {
            let result = reassembler.receive(incoming(&pdus, 9, index, group), now).unwrap();
            assert!(result.ack.is_none());
        }
        assert!(reassembler.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_seq_auth_abandons_older_transaction() {
        let mut reassembler = Reassembler::new(config());
        let old = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 10).unwrap();
        let new = segment_access(&upper(20), AccessKeyId::Device, MicSize::Short, 50).unwrap();
        let now = Instant::now();

        reassembler.receive(incoming(&old, 10, 0, LOCAL), now).unwrap();
        reassembler.receive(incoming(&new, 50, 0, LOCAL), now).unwrap();
        let stale = reassembler.receive(incoming(&old, 10, 1, LOCAL), now).unwrap();
        assert_eq!(stale.reassembly, Reassembly::Stale);

        let done = reassembler.receive(incoming(&new, 50, 1, LOCAL), now).unwrap();
        assert!(matches!(done.reassembly, Reassembly::Complete(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_eviction_then_fresh_start() {
        let config = config();
        let timeout = config.incomplete_timeout;
        let mut reassembler = Reassembler::new(config);
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 5).unwrap();
        let start = Instant::now();

        // Group destination: no ack timer, only inactivity
        let group = Address::new(0xC000);
        reassembler.receive(incoming(&pdus, 5, 0, group), start).unwrap();
        reassembler.receive(incoming(&pdus, 5, 1, group), start).unwrap();
        assert_eq!(reassembler.next_deadline(), Some(start + timeout));

        let sweep = reassembler.sweep(start + timeout);
        assert_eq!(sweep.expired, 1);
        assert_eq!(reassembler.in_progress(), 0);

        // The same SeqZero starts over instead of completing with stale segments
        let later = start + timeout + Duration::from_secs(1);
        let result = reassembler.receive(incoming(&pdus, 5, 2, group), later).unwrap();
        assert_eq!(result.reassembly, Reassembly::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timer_retries_then_abandons() {
        let config = config();
        let max_retries = config.max_ack_retries;
        let ack_timer = config.ack_timer(4);
        let mut reassembler = Reassembler::new(config);
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 5).unwrap();
        let mut now = Instant::now();

        reassembler.receive(incoming(&pdus, 5, 0, LOCAL), now).unwrap();
        for _ in 0..max_retries {
            now += ack_timer;
            let sweep = reassembler.sweep(now);
            assert_eq!(sweep.acks.len(), 1);
            assert_eq!(sweep.acks[0].ack.block_ack, 0b1);
        }
        now += ack_timer;
        let sweep = reassembler.sweep(now);
        assert!(sweep.acks.is_empty());
        assert_eq!(sweep.abandoned, 1);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_full_is_busy() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            max_transactions: 1,
            ..config()
        });
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 5).unwrap();
        let now = Instant::now();
        reassembler.receive(incoming(&pdus, 5, 0, LOCAL), now).unwrap();

        let mut other = incoming(&pdus, 5, 0, LOCAL);
        other.src = Address::new(0x0200);
        let result = reassembler.receive(other, now).unwrap();
        assert_eq!(result.reassembly, Reassembly::Busy);
        assert!(result.ack.unwrap().ack.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_middle_segment_rejected() {
        let mut reassembler = Reassembler::new(config());
        let pdus = segment_access(&upper(30), AccessKeyId::Device, MicSize::Short, 5).unwrap();
        let mut segment = incoming(&pdus, 5, 0, LOCAL);
        segment.segment.truncate(8);
        assert!(matches!(
            reassembler.receive(segment, Instant::now()),
            Err(MeshError::Segmentation(_))
        ));
    }

    #[test]
    fn test_outgoing_ack_routing() {
        let mut outgoing = OutgoingTransactions::new();
        let mut acks = outgoing.register(LOCAL, 0x0AB, SENDER).unwrap();
        assert!(outgoing.register(LOCAL, 0x0AB, SENDER).is_err());

        // Wrong peer is ignored
        assert!(!outgoing.deliver(Address::new(0x0999), LOCAL, SegmentAck::new(0x0AB, 1)));
        assert!(outgoing.deliver(SENDER, LOCAL, SegmentAck::new(0x0AB, 1)));
        assert_eq!(acks.try_recv().unwrap().block_ack, 1);

        assert_eq!(outgoing.abort_all(), 1);
        assert!(acks.try_recv().is_err());
        assert!(outgoing.is_empty());
    }

    proptest! {
        #[test]
        fn prop_reassembly_any_order_with_duplicates(
            len in 13usize..=384,
            order in proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
            long_mic in any::<bool>(),
        ) {
            let payload = upper(len);
            let mic = if long_mic { MicSize::Long } else { MicSize::Short };
            let pdus = segment_access(&payload, AccessKeyId::Device, mic, 0x1234).unwrap();
            let now = Instant::now();
            let mut reassembler = Reassembler::new(config());

            // Arbitrary prefix with duplicates, then every segment to guarantee completion
            let mut sequence: Vec<usize> =
                order.iter().map(|index| index.index(pdus.len())).collect();
            sequence.extend(0..pdus.len());

            let mut delivered = Vec::new();
            for index in sequence {
                let segment = incoming(&pdus, 0x1234, index, LOCAL);
                let result = reassembler.receive(segment, now).unwrap();
                if let Reassembly::Complete(message) = result.reassembly {
                    delivered.push(message);
                }
            }
            prop_assert_eq!(delivered.len(), 1);
            prop_assert_eq!(&delivered[0].upper_pdu, &payload);
            prop_assert_eq!(delivered[0].mic, mic);
        }
    }
}
