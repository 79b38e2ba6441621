//! Bearer abstraction carrying raw Network PDUs

use crate::crypto::MAX_NETWORK_PDU_SIZE;
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Trait for the radio bearer the engine transmits on
///
/// No reliability or ordering is assumed: PDUs may be lost, duplicated or
/// reordered.
#[async_trait]
pub trait Bearer: Send + Sync {
    /// Transmit one Network PDU
    async fn send_pdu(&self, pdu: &[u8]) -> MeshResult<()>;

    /// Wait for the next received Network PDU
    async fn receive_pdu(&self) -> MeshResult<Vec<u8>>;

    /// Largest PDU the bearer carries
    fn mtu(&self) -> usize {
        MAX_NETWORK_PDU_SIZE
    }
}

/// In-memory bearer connected to a peer bearer
pub struct ChannelBearer {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelBearer {
    /// Two bearers; whatever one sends, the other receives.
    pub fn pair() -> (Arc<ChannelBearer>, Arc<ChannelBearer>) {
        Self::pair_with_capacity(100)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Arc<ChannelBearer>, Arc<ChannelBearer>) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let a = ChannelBearer {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        };
        let b = ChannelBearer {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        };
        (Arc::new(a), Arc::new(b))
    }
}

#[async_trait]
impl Bearer for ChannelBearer {
    async fn send_pdu(&self, pdu: &[u8]) -> MeshResult<()> {
        if pdu.len() > self.mtu() {
            return Err(MeshError::TransmissionFailed(format!(
                "PDU of {} bytes exceeds MTU",
                pdu.len()
            )));
        }
        self.tx
            .send(pdu.to_vec())
            .await
            .map_err(|_| MeshError::BearerClosed)?;
        debug!("Bearer sent {} bytes", pdu.len());
        Ok(())
    }

    async fn receive_pdu(&self) -> MeshResult<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(MeshError::BearerClosed)
    }
}

/// Bearer that records every transmitted PDU and receives what is injected
pub struct RecordingBearer {
    sent: std::sync::Mutex<Vec<Vec<u8>>>,
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    inject_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl RecordingBearer {
    pub fn new() -> Arc<Self> {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
            inject_tx,
            inject_rx: Mutex::new(inject_rx),
        })
    }

    /// Every PDU sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or_default()
    }

    /// Queue a PDU for `receive_pdu`.
    pub fn inject(&self, pdu: Vec<u8>) {
        let _ = self.inject_tx.send(pdu);
    }
}

#[async_trait]
impl Bearer for RecordingBearer {
    async fn send_pdu(&self, pdu: &[u8]) -> MeshResult<()> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| MeshError::TransmissionFailed("recording lock poisoned".to_string()))?;
        sent.push(pdu.to_vec());
        Ok(())
    }

    async fn receive_pdu(&self) -> MeshResult<Vec<u8>> {
        let mut rx = self.inject_rx.lock().await;
        rx.recv().await.ok_or(MeshError::BearerClosed)
    }
}
