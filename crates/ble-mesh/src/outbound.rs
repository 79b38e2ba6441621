//! Outbound message pipeline
//!
//! A send is validated and encoded on the caller's task, then driven by its own
//! tokio task through segmentation, transmission, segment acknowledgment and the
//! acknowledged-message attempts. Progress is published on a `watch` channel and
//! the outcome resolves exactly once through a `oneshot`.

use crate::address::{Address, AddressKind, MeshAddress};
use crate::correlator::{RequestKey, RequestOutcome};
use crate::crypto::{self, MicSize, UpperTransportContext, UpperTransportNonce};
use crate::engine::{EngineCore, EngineState};
use crate::error::{MeshError, MeshResult};
use crate::keys::KeyIndex;
use crate::message::{AccessPdu, MeshMessage, MessageKey, MessageSecurity, Opcode, ReceivedMessage};
use crate::pdu::{
    AccessKeyId, LowerTransportPdu, SegmentAck, MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_PDU,
    MAX_UPPER_TRANSPORT_PDU,
};
use crate::segmentation::{full_block, segment_access};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest TTL a message may be sent with
pub const MAX_TTL: u8 = 127;

/// Segments of one transaction must stay within this distance of SeqAuth
const SEQ_ZERO_WINDOW: u32 = 8192;

/// Result of a send: the response of an acknowledged message, `None` otherwise
pub type SendOutcome = MeshResult<Option<ReceivedMessage>>;

/// Progress of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundState {
    Idle,
    Encoding,
    Encrypting,
    Segmenting,
    AwaitingAck { attempt: u32 },
    Completed,
    Failed(String),
    Cancelled,
}

impl OutboundState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Key securing the upper transport PDU of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendKey {
    Application(KeyIndex),
    /// Device key of the node with this primary address
    Device(Address),
}

/// Handle to an in-flight send
#[derive(Debug)]
pub struct MessageHandle {
    id: Uuid,
    opcode: Opcode,
    source: Address,
    destination: MeshAddress,
    state: watch::Receiver<OutboundState>,
    outcome: oneshot::Receiver<SendOutcome>,
    cancel: CancellationToken,
}

impl MessageHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn destination(&self) -> MeshAddress {
        self.destination
    }

    /// Current state of the pipeline.
    pub fn state(&self) -> OutboundState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<OutboundState> {
        self.state.clone()
    }

    /// Request cancellation; no PDU of this send reaches the bearer afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the send to finish.
    pub async fn outcome(self) -> SendOutcome {
        self.outcome.await.unwrap_or(Err(MeshError::Cancelled))
    }
}

/// A validated, encoded send
#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub id: Uuid,
    pub opcode: Opcode,
    pub security: MessageSecurity,
    pub force_segmented: bool,
    pub access: Vec<u8>,
    pub source: Address,
    pub destination: MeshAddress,
    pub ttl: u8,
    pub key: SendKey,
    pub network_key: KeyIndex,
    /// Destination is an element of the local node
    pub loopback: bool,
}

impl OutboundMessage {
    fn received_key(&self) -> MessageKey {
        match self.key {
            SendKey::Application(index) => MessageKey::Application(index),
            SendKey::Device(address) => MessageKey::Device(address),
        }
    }

    fn mic(&self) -> MicSize {
        match self.security {
            MessageSecurity::Low => MicSize::Short,
            MessageSecurity::High => MicSize::Long,
        }
    }

    fn is_segmented(&self) -> bool {
        self.security == MessageSecurity::High
            || self.force_segmented
            || self.access.len() + self.mic().len() > MAX_UNSEGMENTED_ACCESS_PDU
    }
}

enum Transfer {
    Unsegmented(Vec<u8>),
    Segmented {
        segments: Vec<LowerTransportPdu>,
        /// First transmission of every segment, already secured
        sealed: Vec<Vec<u8>>,
        /// Acknowledgments of a unicast transaction
        acks: Option<mpsc::UnboundedReceiver<SegmentAck>>,
    },
}

struct Prepared {
    iv_index: u32,
    seq_auth: u32,
    transfer: Transfer,
}

fn validate_ttl(ttl: u8) -> MeshResult<()> {
    // TTL 1 would never leave the first hop
    if ttl == 1 || ttl > MAX_TTL {
        return Err(MeshError::InvalidTtl(ttl));
    }
    Ok(())
}

fn validate_destination(destination: &MeshAddress) -> MeshResult<()> {
    match destination.kind() {
        AddressKind::Unicast | AddressKind::Group => Ok(()),
        AddressKind::Virtual => match destination.label {
            Some(label) if crypto::virtual_address(&label) == destination.address => Ok(()),
            Some(_) => Err(MeshError::InvalidAddress(format!(
                "label does not hash to virtual address {}",
                destination.address
            ))),
            None => Err(MeshError::InvalidAddress(format!(
                "virtual address {} without its Label UUID",
                destination.address
            ))),
        },
        AddressKind::Unassigned | AddressKind::Invalid => Err(MeshError::InvalidAddress(format!(
            "{} is not a valid destination",
            destination.address
        ))),
    }
}

async fn wait_response(response: &mut Option<oneshot::Receiver<RequestOutcome>>) -> RequestOutcome {
    match response {
        Some(receiver) => receiver.await.unwrap_or(Err(MeshError::Cancelled)),
        None => std::future::pending().await,
    }
}

impl EngineState {
    /// Network key the send travels on, checking every key it needs.
    ///
    /// Loopback sends are never encrypted, so the local node needs no device key.
    fn resolve_network_key(&self, key: SendKey, loopback: bool) -> MeshResult<KeyIndex> {
        match key {
            SendKey::Application(index) => {
                let bound = self.keys.application_key(index)?.bound_network_key();
                self.keys.network_key(bound)?;
                Ok(bound)
            }
            SendKey::Device(address) => {
                if !loopback {
                    self.keys.device_key(address).map_err(|_| {
                        MeshError::KeyNotBound(format!("no device key for node {}", address))
                    })?;
                }
                Ok(self.keys.primary_network_key()?.index())
            }
        }
    }

    fn encrypt_access(
        &self,
        message: &OutboundMessage,
        seq_auth: u32,
        iv_index: u32,
    ) -> MeshResult<(AccessKeyId, Vec<u8>)> {
        let (nonce, key, key_id) = match message.key {
            SendKey::Application(index) => {
                let application_key = self.keys.application_key(index)?;
                let phase = self.keys.network_key(application_key.bound_network_key())?.phase();
                let (key, aid) = application_key.transmit_key(phase);
                (UpperTransportNonce::Application, key, AccessKeyId::Application { aid })
            }
            SendKey::Device(address) => (
                UpperTransportNonce::Device,
                self.keys.device_key(address)?.key(),
                AccessKeyId::Device,
            ),
        };
        let ctx = UpperTransportContext {
            nonce,
            key,
            seq_auth,
            src: message.source,
            dst: message.destination.address,
            iv_index,
            mic: message.mic(),
            label: message.destination.label.as_ref(),
        };
        let upper = crypto::encrypt_upper_transport(&ctx, &message.access)?;
        Ok((key_id, upper))
    }

    fn prepare(&mut self, message: &OutboundMessage) -> MeshResult<Prepared> {
        let iv_index = self.iv_index.transmit_index();
        let seq_auth = self.sequence.allocate(message.source)?;
        let (key_id, upper_pdu) = self.encrypt_access(message, seq_auth, iv_index)?;
        let dst = message.destination.address;

        if !message.is_segmented() {
            let lower = LowerTransportPdu::UnsegmentedAccess { key: key_id, upper_pdu };
            let pdu = self.seal_with(
                seq_auth,
                message.source,
                dst,
                message.ttl,
                message.network_key,
                &lower,
            )?;
            return Ok(Prepared {
                iv_index,
                seq_auth,
                transfer: Transfer::Unsegmented(pdu),
            });
        }

        let segments = segment_access(&upper_pdu, key_id, message.mic(), seq_auth)?;
        let mut sealed = Vec::with_capacity(segments.len());
        for (n, segment) in segments.iter().enumerate() {
            let pdu = if n == 0 {
                self.seal_with(
                    seq_auth,
                    message.source,
                    dst,
                    message.ttl,
                    message.network_key,
                    segment,
                )?
            } else {
                self.seal(message.source, dst, message.ttl, message.network_key, segment)?
            };
            sealed.push(pdu);
        }
        let acks = if dst.is_unicast() {
            Some(self.outgoing.register(message.source, seq_zero(seq_auth), dst)?)
        } else {
            None
        };
        Ok(Prepared {
            iv_index,
            seq_auth,
            transfer: Transfer::Segmented { segments, sealed, acks },
        })
    }
}

fn seq_zero(seq_auth: u32) -> u16 {
    (seq_auth & 0x1FFF) as u16
}

impl EngineCore {
    /// Validate and encode a send, then spawn the task that drives it.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        message: Arc<dyn MeshMessage>,
        source: Address,
        destination: MeshAddress,
        ttl: Option<u8>,
        key: SendKey,
    ) -> MeshResult<MessageHandle> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        validate_ttl(ttl)?;
        if !self.local.owns(source) {
            return Err(MeshError::InvalidElement(source));
        }
        validate_destination(&destination)?;

        let (progress, state) = watch::channel(OutboundState::Idle);
        progress.send_replace(OutboundState::Encoding);
        let access = AccessPdu::from_message(message.as_ref())?;
        let security = message.security();
        let mic = match security {
            MessageSecurity::Low => MicSize::Short,
            MessageSecurity::High => MicSize::Long,
        };
        if access.len() + mic.len() > MAX_UPPER_TRANSPORT_PDU {
            return Err(MeshError::Encoding(format!(
                "access payload of {} bytes does not fit {} segments with a {}-byte TransMIC",
                access.len(),
                MAX_SEGMENTS,
                mic.len()
            )));
        }

        progress.send_replace(OutboundState::Encrypting);
        let id = Uuid::new_v4();
        let opcode = access.opcode;
        let cancel = self.shutdown.child_token();
        let loopback = destination.address.is_unicast() && self.local.owns(destination.address);
        let awaits_response = if destination.address.is_unicast() {
            message.response_opcode()
        } else {
            None
        };

        let (network_key, response) = {
            let mut state = self.state.lock().await;
            let network_key = state.resolve_network_key(key, loopback)?;
            let response = match awaits_response {
                Some(response_opcode) => {
                    let request = RequestKey {
                        source,
                        destination: destination.address,
                        response_opcode,
                    };
                    let window = self.request_window(ttl) * self.config.acknowledged_attempts;
                    let deadline = Instant::now() + window;
                    Some(state.correlator.register(id, request, deadline)?)
                }
                None => None,
            };
            state.sends.insert(id, cancel.clone());
            (network_key, response)
        };

        let outbound = OutboundMessage {
            id,
            opcode,
            security,
            force_segmented: message.is_segmented(),
            access: access.encode(),
            source,
            destination,
            ttl,
            key,
            network_key,
            loopback,
        };
        info!(
            request = %id,
            opcode = %opcode,
            src = %source,
            dst = %destination.address,
            ttl,
            "Sending message"
        );
        self.stats.record_message_sent();

        let (outcome_tx, outcome) = oneshot::channel();
        let task = self.clone().run_send(outbound, response, progress, outcome_tx, cancel.clone());
        tokio::spawn(task);

        Ok(MessageHandle {
            id,
            opcode,
            source,
            destination,
            state,
            outcome,
            cancel,
        })
    }

    /// Longest one attempt may take, including a full segmented transfer.
    fn request_window(&self, ttl: u8) -> Duration {
        let transfer = (self.config.segment_ack_timeout(ttl)
            + self.config.segment_transmission_interval() * MAX_SEGMENTS as u32)
            * (self.config.segment_retransmissions + 1);
        self.config.acknowledged_attempt_timeout() + transfer
    }

    async fn run_send(
        self: Arc<Self>,
        message: OutboundMessage,
        mut response: Option<oneshot::Receiver<RequestOutcome>>,
        progress: watch::Sender<OutboundState>,
        outcome: oneshot::Sender<SendOutcome>,
        cancel: CancellationToken,
    ) {
        let result = self.drive(&message, &mut response, &progress, &cancel).await;

        {
            let mut state = self.state.lock().await;
            state.correlator.remove(message.id);
            state.sends.remove(&message.id);
        }

        let final_state = match &result {
            Ok(response) => {
                info!(
                    request = %message.id,
                    opcode = %message.opcode,
                    answered = response.is_some(),
                    "Send completed"
                );
                OutboundState::Completed
            }
            Err(MeshError::Cancelled) => {
                info!(request = %message.id, "Send cancelled");
                self.stats.record_cancellation();
                OutboundState::Cancelled
            }
            Err(e) => {
                if matches!(e, MeshError::Timeout) {
                    self.stats.record_timeout();
                } else {
                    self.stats.record_send_failure();
                }
                warn!(
                    request = %message.id,
                    dst = %message.destination.address,
                    "Send failed: {}",
                    e
                );
                OutboundState::Failed(e.to_string())
            }
        };
        progress.send_replace(final_state);
        // The caller may have dropped the handle
        let _ = outcome.send(result);
    }

    async fn drive(
        &self,
        message: &OutboundMessage,
        response: &mut Option<oneshot::Receiver<RequestOutcome>>,
        progress: &watch::Sender<OutboundState>,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        if message.loopback {
            return self.loop_back(message, response, progress, cancel).await;
        }
        let acknowledged = response.is_some();
        let attempts = if acknowledged { self.config.acknowledged_attempts } else { 1 };

        for attempt in 1..=attempts {
            progress.send_replace(OutboundState::Segmenting);
            if acknowledged {
                let deadline = Instant::now() + self.request_window(message.ttl);
                self.state.lock().await.correlator.extend(message.id, deadline);
            }

            if let Some(received) = self.transmit(message, response, cancel).await? {
                return Ok(Some(received));
            }
            if !acknowledged {
                return Ok(None);
            }

            progress.send_replace(OutboundState::AwaitingAck { attempt });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                received = wait_response(response) => return received.map(Some),
                _ = tokio::time::sleep(self.config.acknowledged_attempt_timeout()) => {
                    debug!(request = %message.id, attempt, "No response within attempt timeout");
                }
            }
        }
        Err(MeshError::Timeout)
    }

    /// Hand a message for a local element straight to inbound delivery.
    async fn loop_back(
        &self,
        message: &OutboundMessage,
        response: &mut Option<oneshot::Receiver<RequestOutcome>>,
        progress: &watch::Sender<OutboundState>,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let access = AccessPdu::decode(&message.access)?;
        let decoded = self.registry.decode(&access)?;
        debug!(
            request = %message.id,
            dst = %message.destination.address,
            "Delivering to local element"
        );
        self.deliver(ReceivedMessage {
            message: decoded,
            source: message.source,
            destination: message.destination,
            key: message.received_key(),
            network_key: message.network_key,
            ttl: message.ttl,
            received_at: Utc::now(),
        })
        .await;

        if response.is_none() {
            return Ok(None);
        }
        progress.send_replace(OutboundState::AwaitingAck { attempt: 1 });
        let window = self.config.acknowledged_attempt_timeout() * self.config.acknowledged_attempts;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            received = wait_response(response) => received.map(Some),
            _ = tokio::time::sleep(window) => Err(MeshError::Timeout),
        }
    }

    /// One transmission of the message with a fresh SeqAuth.
    ///
    /// Returns the response if it arrived while segments were still in flight.
    async fn transmit(
        &self,
        message: &OutboundMessage,
        response: &mut Option<oneshot::Receiver<RequestOutcome>>,
        cancel: &CancellationToken,
    ) -> MeshResult<Option<ReceivedMessage>> {
        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let prepared = self.state.lock().await.prepare(message)?;
        let Prepared {
            iv_index,
            seq_auth,
            transfer,
        } = prepared;

        let result = async {
            self.persist_if_dirty().await?;
            match transfer {
                Transfer::Unsegmented(pdu) => {
                    self.put_on_bearer(&pdu, cancel).await?;
                    Ok(None)
                }
                Transfer::Segmented {
                    segments,
                    sealed,
                    acks: None,
                } => {
                    self.send_group_segments(message, iv_index, seq_auth, &segments, sealed, cancel)
                        .await?;
                    Ok(None)
                }
                Transfer::Segmented {
                    segments,
                    sealed,
                    acks: Some(acks),
                } => {
                    self.send_unicast_segments(
                        message, iv_index, seq_auth, &segments, sealed, acks, response, cancel,
                    )
                    .await
                }
            }
        }
        .await;

        if message.is_segmented() && message.destination.address.is_unicast() {
            self.state.lock().await.outgoing.remove(message.source, seq_zero(seq_auth));
        }
        result
    }

    /// Repeat the full segment set; group destinations never acknowledge.
    async fn send_group_segments(
        &self,
        message: &OutboundMessage,
        iv_index: u32,
        seq_auth: u32,
        segments: &[LowerTransportPdu],
        sealed: Vec<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> MeshResult<()> {
        let rounds = self.config.group_segment_transmissions.max(1);
        let mut first = Some(sealed);
        for round in 0..rounds {
            let batch = match first.take() {
                Some(sealed) => sealed,
                None => {
                    let mut batch = Vec::with_capacity(segments.len());
                    for segment in segments {
                        batch.push(self.reseal(message, iv_index, seq_auth, segment).await?);
                    }
                    batch
                }
            };
            for (n, pdu) in batch.iter().enumerate() {
                if round > 0 || n > 0 {
                    self.pause(self.config.segment_transmission_interval(), cancel).await?;
                }
                self.put_on_bearer(pdu, cancel).await?;
                self.stats.record_segment_sent(round > 0);
            }
        }
        debug!(
            request = %message.id,
            segments = segments.len(),
            rounds,
            "Group segments sent"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_unicast_segments(
        &self,
        message: &OutboundMessage,
        iv_index: u32,
        seq_auth: u32,
        segments: &[LowerTransportPdu],
        sealed: Vec<Vec<u8>>,
        mut acks: mpsc::UnboundedReceiver<SegmentAck>,
        response: &mut Option<oneshot::Receiver<RequestOutcome>>,
        cancel: &CancellationToken,
    ) -> MeshResult<Option<ReceivedMessage>> {
        let seg_n = (segments.len() - 1) as u8;
        let complete = full_block(seg_n);
        let dst = message.destination.address;
        let mut acknowledged = 0u32;
        let mut retransmissions = 0u32;
        let mut first = Some(sealed);

        loop {
            let missing: Vec<usize> = (0..segments.len())
                .filter(|seg_o| acknowledged & (1 << seg_o) == 0)
                .collect();
            for (n, seg_o) in missing.iter().enumerate() {
                if n > 0 {
                    self.pause(self.config.segment_transmission_interval(), cancel).await?;
                }
                let pdu = match &first {
                    Some(sealed) => sealed[*seg_o].clone(),
                    None => self.reseal(message, iv_index, seq_auth, &segments[*seg_o]).await?,
                };
                self.put_on_bearer(&pdu, cancel).await?;
                self.stats.record_segment_sent(first.is_none());
            }
            first = None;

            let timer = tokio::time::sleep(self.config.segment_ack_timeout(message.ttl));
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                    received = wait_response(response) => return received.map(Some),
                    ack = acks.recv() => {
                        let ack = ack.ok_or_else(|| {
                            MeshError::TransactionAborted(format!("transaction to {} aborted", dst))
                        })?;
                        self.stats.record_ack_received();
                        if ack.is_busy() {
                            return Err(MeshError::SegmentsRejected(dst));
                        }
                        let progress = ack.block_ack & complete & !acknowledged;
                        acknowledged |= ack.block_ack & complete;
                        debug!(
                            request = %message.id,
                            block_ack = ack.block_ack,
                            "Segment acknowledgment received"
                        );
                        if acknowledged == complete {
                            return Ok(None);
                        }
                        if progress != 0 {
                            // The receiver named what is still missing
                            break;
                        }
                    }
                    _ = &mut timer => {
                        debug!(
                            request = %message.id,
                            retransmissions,
                            "Segment acknowledgment timer fired"
                        );
                        break;
                    }
                }
            }

            if retransmissions >= self.config.segment_retransmissions {
                return Err(MeshError::Timeout);
            }
            retransmissions += 1;
        }
    }

    /// Secure a retransmitted segment with a fresh sequence number.
    async fn reseal(
        &self,
        message: &OutboundMessage,
        iv_index: u32,
        seq_auth: u32,
        segment: &LowerTransportPdu,
    ) -> MeshResult<Vec<u8>> {
        let pdu = {
            let mut state = self.state.lock().await;
            if state.iv_index.transmit_index() != iv_index {
                return Err(MeshError::TransactionAborted("IV Index changed".to_string()));
            }
            if state.sequence.peek(message.source).saturating_sub(seq_auth) >= SEQ_ZERO_WINDOW {
                return Err(MeshError::TransactionAborted(format!(
                    "sequence of {} moved past the SeqZero window",
                    message.source
                )));
            }
            state.seal(
                message.source,
                message.destination.address,
                message.ttl,
                message.network_key,
                segment,
            )?
        };
        self.persist_if_dirty().await?;
        Ok(pdu)
    }

    async fn put_on_bearer(&self, pdu: &[u8], cancel: &CancellationToken) -> MeshResult<()> {
        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        self.bearer
            .send_pdu(pdu)
            .await
            .map_err(|e| MeshError::TransmissionFailed(e.to_string()))?;
        self.stats.record_pdu_sent();
        Ok(())
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> MeshResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
