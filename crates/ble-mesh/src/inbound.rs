//! Inbound message pipeline
//!
//! Network PDUs are deobfuscated and authenticated, checked against the replay
//! cache, filtered by destination, reassembled when segmented and finally
//! decrypted and decoded. Nothing that goes wrong here reaches a caller: the PDU
//! is dropped, logged and counted.

use crate::address::{Address, AddressKind, MeshAddress};
use crate::crypto::{self, MicSize, UpperTransportContext, UpperTransportNonce};
use crate::engine::{EngineCore, EngineState};
use crate::keys::KeyIndex;
use crate::message::{AccessPdu, MessageKey, ReceivedMessage};
use crate::pdu::{self, AccessKeyId, LowerTransportPdu, NetworkPdu};
use crate::segmentation::{IncomingSegment, Reassembly};
use crate::stats::DropReason;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What processing one PDU produced
#[derive(Debug, Default)]
struct Processed {
    /// Sealed Segment Acknowledgments to transmit
    acks: Vec<Vec<u8>>,
    message: Option<ReceivedMessage>,
    /// A segment was dropped after its acknowledgment was produced
    dropped: Option<DropReason>,
    /// Reassembly timers may have moved
    timers_changed: bool,
}

/// Secured payload of a complete upper transport PDU
struct UpperTransport<'a> {
    src: Address,
    dst: Address,
    labels: &'a [Option<Uuid>],
    ttl: u8,
    iv_index: u32,
    network_key: KeyIndex,
    seq_auth: u32,
    key: AccessKeyId,
    mic: MicSize,
    upper_pdu: &'a [u8],
}

impl EngineCore {
    /// Run one Network PDU through the pipeline.
    pub(crate) async fn process_pdu(&self, data: &[u8]) {
        self.stats.record_pdu_received();
        let processed = {
            let mut state = self.state.lock().await;
            self.receive(&mut state, data)
        };

        let processed = match processed {
            Ok(processed) => processed,
            Err(reason) => {
                debug!(reason = ?reason, len = data.len(), "Dropped network PDU");
                self.stats.record_drop(reason);
                return;
            }
        };
        if let Some(reason) = processed.dropped {
            debug!(reason = ?reason, "Dropped reassembled message");
            self.stats.record_drop(reason);
        }
        if processed.timers_changed {
            self.wakeup.notify_one();
        }

        // Replay records and ack sequence numbers are stored before anything leaves
        if let Err(e) = self.persist_if_dirty().await {
            error!("Failed to persist inbound state, PDU withheld: {}", e);
            return;
        }
        self.send_acks(processed.acks).await;

        if let Some(message) = processed.message {
            self.deliver(message).await;
        }
    }

    pub(crate) async fn deliver(&self, message: ReceivedMessage) {
        let opcode = message.message.opcode();
        let matched = self.state.lock().await.correlator.resolve(
            message.source,
            message.destination.address,
            opcode,
            &message,
        );
        self.stats.record_message_delivered();
        if matched {
            self.stats.record_response_matched();
            return;
        }
        debug!(src = %message.source, opcode = %opcode, "Delivering unsolicited message");
        // No subscribers is not an error
        let _ = self.notifications.send(message);
    }

    fn receive(&self, state: &mut EngineState, data: &[u8]) -> Result<Processed, DropReason> {
        let (ivi, nid) = NetworkPdu::peek_ivi_nid(data).ok_or(DropReason::Malformed)?;
        let iv_index = state.iv_index.receive_index(ivi).ok_or(DropReason::Malformed)?;

        let (network_key, pdu) = state
            .keys
            .network_keys_by_nid(nid)
            .iter()
            .find_map(|candidate| {
                crypto::decrypt_network_pdu(&candidate.material, iv_index, data)
                    .ok()
                    .map(|pdu| (candidate.index, pdu))
            })
            .ok_or(DropReason::NetworkAuthentication)?;

        if !pdu.src.is_unicast() {
            warn!(src = %pdu.src, "Network PDU with non-unicast source");
            return Err(DropReason::InvalidSource);
        }
        if self.local.owns(pdu.src) {
            return Err(DropReason::OwnEcho);
        }
        if pdu.dst.is_unassigned() {
            return Err(DropReason::Malformed);
        }
        // Foreign traffic is filtered before it can occupy the replay cache
        let labels = self.accepted_destination(pdu.dst).ok_or(DropReason::NotForUs)?;
        if let Err(e) = state.replay.accept(pdu.src, iv_index, pdu.seq) {
            debug!("{}", e);
            return Err(DropReason::Replay);
        }

        let lower = LowerTransportPdu::decode(pdu.ctl, &pdu.transport_pdu).map_err(|e| {
            debug!(src = %pdu.src, "Malformed lower transport PDU: {}", e);
            DropReason::Malformed
        })?;

        match lower {
            LowerTransportPdu::SegmentAck(ack) => {
                if !state.outgoing.deliver(pdu.src, pdu.dst, ack) {
                    debug!(
                        src = %pdu.src,
                        seq_zero = ack.seq_zero,
                        "Acknowledgment for unknown transaction"
                    );
                }
                Ok(Processed::default())
            }
            LowerTransportPdu::UnsegmentedControl { opcode, .. }
            | LowerTransportPdu::SegmentedControl { opcode, .. } => {
                debug!(src = %pdu.src, opcode, "Unsupported transport control message");
                Err(DropReason::Unsupported)
            }
            LowerTransportPdu::UnsegmentedAccess { key, upper_pdu } => {
                let message = self.open(
                    state,
                    UpperTransport {
                        src: pdu.src,
                        dst: pdu.dst,
                        labels: &labels,
                        ttl: pdu.ttl,
                        iv_index,
                        network_key,
                        seq_auth: pdu.seq,
                        key,
                        mic: MicSize::Short,
                        upper_pdu: &upper_pdu,
                    },
                )?;
                Ok(Processed {
                    message: Some(message),
                    ..Processed::default()
                })
            }
            LowerTransportPdu::SegmentedAccess { key, header, segment } => {
                let seq_auth =
                    pdu::seq_auth(pdu.seq, header.seq_zero).ok_or(DropReason::Malformed)?;
                let result = state
                    .reassembler
                    .receive(
                        IncomingSegment {
                            src: pdu.src,
                            dst: pdu.dst,
                            ttl: pdu.ttl,
                            iv_index,
                            network_key,
                            seq_auth,
                            key,
                            header,
                            segment,
                        },
                        Instant::now(),
                    )
                    .map_err(|e| {
                        warn!(src = %pdu.src, "Segment rejected: {}", e);
                        DropReason::Segmentation
                    })?;

                let mut processed = Processed {
                    acks: result
                        .ack
                        .map(|ack| state.seal_acks(&[ack], self.config.default_ttl))
                        .unwrap_or_default(),
                    timers_changed: true,
                    ..Processed::default()
                };

                if let Reassembly::Complete(message) = result.reassembly {
                    self.stats.record_reassembly_completed();
                    let opened = self.open(
                        state,
                        UpperTransport {
                            src: message.src,
                            dst: message.dst,
                            labels: &labels,
                            ttl: pdu.ttl,
                            iv_index: message.iv_index,
                            network_key: message.network_key,
                            seq_auth: message.seq_auth,
                            key: message.key,
                            mic: message.mic,
                            upper_pdu: &message.upper_pdu,
                        },
                    );
                    match opened {
                        Ok(message) => processed.message = Some(message),
                        Err(reason) => processed.dropped = Some(reason),
                    }
                }
                Ok(processed)
            }
        }
    }

    /// Label candidates of an accepted destination; `None` if it is not for this node.
    fn accepted_destination(&self, dst: Address) -> Option<Vec<Option<Uuid>>> {
        match dst.classify() {
            AddressKind::Unicast => self.local.owns(dst).then(|| vec![None]),
            AddressKind::Group => {
                (dst == Address::ALL_NODES || self.network.is_subscribed(dst)).then(|| vec![None])
            }
            AddressKind::Virtual => {
                if !self.network.is_subscribed(dst) {
                    return None;
                }
                let labels: Vec<_> = self
                    .network
                    .virtual_labels()
                    .into_iter()
                    .filter(|label| crypto::virtual_address(label) == dst)
                    .map(Some)
                    .collect();
                (!labels.is_empty()).then_some(labels)
            }
            AddressKind::Unassigned | AddressKind::Invalid => None,
        }
    }

    /// Decrypt and decode a complete upper transport PDU.
    fn open(
        &self,
        state: &EngineState,
        upper: UpperTransport<'_>,
    ) -> Result<ReceivedMessage, DropReason> {
        let (key, label, access) = match upper.key {
            AccessKeyId::Application { aid } => {
                let candidates = state.keys.application_keys_by_aid(upper.network_key, aid);
                candidates
                    .iter()
                    .find_map(|candidate| {
                        upper.labels.iter().find_map(|label| {
                            let ctx = upper.context(
                                UpperTransportNonce::Application,
                                &candidate.key,
                                label.as_ref(),
                            );
                            crypto::decrypt_upper_transport(&ctx, upper.upper_pdu)
                                .ok()
                                .map(|access| {
                                    (MessageKey::Application(candidate.index), *label, access)
                                })
                        })
                    })
                    .ok_or(DropReason::UpperTransportAuthentication)?
            }
            AccessKeyId::Device => {
                if !upper.dst.is_unicast() {
                    return Err(DropReason::UpperTransportAuthentication);
                }
                // A device key message is secured with the server's key: ours for
                // requests, the sender's for its responses
                let mut owners = vec![self.local.primary];
                if let Some(node) = self.network.node(upper.src) {
                    owners.push(node.primary_address);
                }
                owners
                    .into_iter()
                    .find_map(|owner| {
                        let device_key = state.keys.device_key(owner).ok()?;
                        let ctx =
                            upper.context(UpperTransportNonce::Device, device_key.key(), None);
                        crypto::decrypt_upper_transport(&ctx, upper.upper_pdu)
                            .ok()
                            .map(|access| (MessageKey::Device(owner), None, access))
                    })
                    .ok_or(DropReason::UpperTransportAuthentication)?
            }
        };

        let access = AccessPdu::decode(&access).map_err(|e| {
            debug!(src = %upper.src, "Malformed access PDU: {}", e);
            DropReason::Malformed
        })?;
        let message = self.registry.decode(&access).map_err(|e| {
            warn!(src = %upper.src, "{}", e);
            DropReason::MalformedMessage
        })?;

        debug!(
            src = %upper.src,
            dst = %upper.dst,
            opcode = %access.opcode,
            "Access message received"
        );
        Ok(ReceivedMessage {
            message,
            source: upper.src,
            destination: MeshAddress {
                address: upper.dst,
                label,
            },
            key,
            network_key: upper.network_key,
            ttl: upper.ttl,
            received_at: Utc::now(),
        })
    }
}

impl UpperTransport<'_> {
    fn context<'k>(
        &self,
        nonce: UpperTransportNonce,
        key: &'k crypto::Key128,
        label: Option<&'k Uuid>,
    ) -> UpperTransportContext<'k> {
        UpperTransportContext {
            nonce,
            key,
            seq_auth: self.seq_auth,
            src: self.src,
            dst: self.dst,
            iv_index: self.iv_index,
            mic: self.mic,
            label,
        }
    }
}
