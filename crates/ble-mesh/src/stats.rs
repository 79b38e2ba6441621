use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Why an inbound PDU was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Could not be parsed at any layer
    Malformed,
    /// No network key authenticated the PDU
    NetworkAuthentication,
    /// Source address is not unicast
    InvalidSource,
    /// Sent by one of our own elements
    OwnEcho,
    Replay,
    /// Destination is neither a local element nor a subscribed group
    NotForUs,
    /// No application or device key authenticated the upper transport PDU
    UpperTransportAuthentication,
    /// Rejected by the reassembler
    Segmentation,
    /// Registered opcode with unparsable parameters
    MalformedMessage,
    /// Control message the engine does not handle
    Unsupported,
}

/// Counters of the engine pipelines
#[derive(Debug, Default)]
pub struct EngineStats {
    pdus_sent: AtomicU64,
    pdus_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    responses_matched: AtomicU64,
    segments_sent: AtomicU64,
    segment_retransmissions: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    reassemblies_completed: AtomicU64,
    reassemblies_abandoned: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    send_failures: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_network_authentication: AtomicU64,
    dropped_invalid_source: AtomicU64,
    dropped_own_echo: AtomicU64,
    dropped_replay: AtomicU64,
    dropped_not_for_us: AtomicU64,
    dropped_upper_transport_authentication: AtomicU64,
    dropped_segmentation: AtomicU64,
    dropped_malformed_message: AtomicU64,
    dropped_unsupported: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pdu_sent(&self) {
        bump(&self.pdus_sent);
    }

    pub fn record_pdu_received(&self) {
        bump(&self.pdus_received);
    }

    pub fn record_message_sent(&self) {
        bump(&self.messages_sent);
    }

    pub fn record_message_delivered(&self) {
        bump(&self.messages_delivered);
    }

    pub fn record_response_matched(&self) {
        bump(&self.responses_matched);
    }

    pub fn record_segment_sent(&self, retransmission: bool) {
        bump(&self.segments_sent);
        if retransmission {
            bump(&self.segment_retransmissions);
        }
    }

    pub fn record_ack_sent(&self) {
        bump(&self.acks_sent);
    }

    pub fn record_ack_received(&self) {
        bump(&self.acks_received);
    }

    pub fn record_reassembly_completed(&self) {
        bump(&self.reassemblies_completed);
    }

    pub fn record_reassemblies_abandoned(&self, count: usize) {
        self.reassemblies_abandoned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_cancellation(&self) {
        bump(&self.cancellations);
    }

    pub fn record_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::NetworkAuthentication => &self.dropped_network_authentication,
            DropReason::InvalidSource => &self.dropped_invalid_source,
            DropReason::OwnEcho => &self.dropped_own_echo,
            DropReason::Replay => &self.dropped_replay,
            DropReason::NotForUs => &self.dropped_not_for_us,
            DropReason::UpperTransportAuthentication => {
                &self.dropped_upper_transport_authentication
            }
            DropReason::Segmentation => &self.dropped_segmentation,
            DropReason::MalformedMessage => &self.dropped_malformed_message,
            DropReason::Unsupported => &self.dropped_unsupported,
        };
        bump(counter);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pdus_sent: read(&self.pdus_sent),
            pdus_received: read(&self.pdus_received),
            messages_sent: read(&self.messages_sent),
            messages_delivered: read(&self.messages_delivered),
            responses_matched: read(&self.responses_matched),
            segments_sent: read(&self.segments_sent),
            segment_retransmissions: read(&self.segment_retransmissions),
            acks_sent: read(&self.acks_sent),
            acks_received: read(&self.acks_received),
            reassemblies_completed: read(&self.reassemblies_completed),
            reassemblies_abandoned: read(&self.reassemblies_abandoned),
            timeouts: read(&self.timeouts),
            cancellations: read(&self.cancellations),
            send_failures: read(&self.send_failures),
            dropped: DropCounts {
                malformed: read(&self.dropped_malformed),
                network_authentication: read(&self.dropped_network_authentication),
                invalid_source: read(&self.dropped_invalid_source),
                own_echo: read(&self.dropped_own_echo),
                replay: read(&self.dropped_replay),
                not_for_us: read(&self.dropped_not_for_us),
                upper_transport_authentication: read(&self.dropped_upper_transport_authentication),
                segmentation: read(&self.dropped_segmentation),
                malformed_message: read(&self.dropped_malformed_message),
                unsupported: read(&self.dropped_unsupported),
            },
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    pub malformed: u64,
    pub network_authentication: u64,
    pub invalid_source: u64,
    pub own_echo: u64,
    pub replay: u64,
    pub not_for_us: u64,
    pub upper_transport_authentication: u64,
    pub segmentation: u64,
    pub malformed_message: u64,
    pub unsupported: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.malformed
            + self.network_authentication
            + self.invalid_source
            + self.own_echo
            + self.replay
            + self.not_for_us
            + self.upper_transport_authentication
            + self.segmentation
            + self.malformed_message
            + self.unsupported
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub responses_matched: u64,
    pub segments_sent: u64,
    pub segment_retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub reassemblies_completed: u64,
    pub reassemblies_abandoned: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub send_failures: u64,
    pub dropped: DropCounts,
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = EngineStats::new();
        stats.record_pdu_sent();
        stats.record_segment_sent(true);
        stats.record_drop(DropReason::Replay);
        stats.record_drop(DropReason::Replay);
        stats.record_drop(DropReason::OwnEcho);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pdus_sent, 1);
        assert_eq!(snapshot.segments_sent, 1);
        assert_eq!(snapshot.segment_retransmissions, 1);
        assert_eq!(snapshot.dropped.replay, 2);
        assert_eq!(snapshot.dropped.total(), 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["dropped"]["own_echo"], 1);
    }
}
