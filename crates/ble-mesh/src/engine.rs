//! Network engine: caller-facing API and the protocol state it owns
//!
//! Every piece of mutable protocol state lives in one [`EngineState`] behind a
//! single async mutex. The outbound tasks, the receive loop and the maintenance
//! loop all re-enter the engine through that lock and never perform bearer I/O,
//! storage I/O or sleeps while holding it.

use crate::address::{Address, MeshAddress};
use crate::bearer::Bearer;
use crate::correlator::Correlator;
use crate::crypto::{self, Key128};
use crate::error::{MeshError, MeshResult};
use crate::keys::{KeyIndex, KeyStore};
use crate::message::{MeshMessage, MessageRegistry, ReceivedMessage, StaticMeshMessage};
use crate::messages;
use crate::network::NetworkConfigProvider;
use crate::outbound::{MessageHandle, SendKey};
use crate::pdu::{LowerTransportPdu, NetworkPdu};
use crate::replay::{ReplayCache, ReplaySnapshot};
use crate::segmentation::{OutgoingAck, OutgoingTransactions, Reassembler, ReassemblyConfig};
use crate::sequence::{IvIndex, IvIndexChange, SequenceAllocator, SequenceSnapshot};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::storage::{self, InMemoryStateStore, StateStore, REPLAY_KEY, SEQUENCE_KEY};
use shared::TransportConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Elements of the node the engine runs for
#[derive(Debug, Clone)]
pub(crate) struct LocalNode {
    pub primary: Address,
    pub elements: Vec<Address>,
}

impl LocalNode {
    pub fn owns(&self, address: Address) -> bool {
        self.elements.contains(&address)
    }
}

/// Mutable protocol state, guarded by the engine mutex
#[derive(Debug)]
pub(crate) struct EngineState {
    pub keys: KeyStore,
    pub iv_index: IvIndex,
    pub sequence: SequenceAllocator,
    pub replay: ReplayCache,
    pub reassembler: Reassembler,
    pub outgoing: OutgoingTransactions,
    pub correlator: Correlator,
    /// Cancellation tokens of the running send tasks
    pub sends: HashMap<Uuid, CancellationToken>,
}

impl EngineState {
    /// Secure a lower transport PDU with the next sequence number of `src`.
    pub fn seal(
        &mut self,
        src: Address,
        dst: Address,
        ttl: u8,
        network_key: KeyIndex,
        lower: &LowerTransportPdu,
    ) -> MeshResult<Vec<u8>> {
        let seq = self.sequence.allocate(src)?;
        self.seal_with(seq, src, dst, ttl, network_key, lower)
    }

    /// Secure a lower transport PDU with an already allocated sequence number.
    pub fn seal_with(
        &self,
        seq: u32,
        src: Address,
        dst: Address,
        ttl: u8,
        network_key: KeyIndex,
        lower: &LowerTransportPdu,
    ) -> MeshResult<Vec<u8>> {
        let material = self.keys.network_key(network_key)?.transmit_material();
        let pdu = NetworkPdu {
            nid: material.nid,
            ctl: lower.is_control(),
            ttl,
            seq,
            src,
            dst,
            transport_pdu: lower.encode(),
        };
        crypto::encrypt_network_pdu(material, self.iv_index.transmit_index(), &pdu)
    }

    pub fn seal_ack(&mut self, ack: &OutgoingAck, ttl: u8) -> MeshResult<Vec<u8>> {
        self.seal(ack.src, ack.dst, ttl, ack.network_key, &LowerTransportPdu::SegmentAck(ack.ack))
    }

    /// Seal a batch of acknowledgments, skipping the ones that cannot be secured.
    pub fn seal_acks(&mut self, acks: &[OutgoingAck], ttl: u8) -> Vec<Vec<u8>> {
        let mut sealed = Vec::with_capacity(acks.len());
        for ack in acks {
            match self.seal_ack(ack, ttl) {
                Ok(pdu) => sealed.push(pdu),
                Err(e) => warn!(dst = %ack.dst, "Cannot secure segment acknowledgment: {}", e),
            }
        }
        sealed
    }
}

/// State shared by the engine handle and its background tasks
pub(crate) struct EngineCore {
    pub config: TransportConfig,
    pub local: LocalNode,
    pub state: Mutex<EngineState>,
    pub bearer: Arc<dyn Bearer>,
    pub network: Arc<dyn NetworkConfigProvider>,
    pub registry: MessageRegistry,
    pub stats: EngineStats,
    pub notifications: broadcast::Sender<ReceivedMessage>,
    pub shutdown: CancellationToken,
    /// Wakes the maintenance loop when a new timer deadline appears
    pub wakeup: Notify,
    store: Arc<dyn StateStore>,
    /// Serializes persistence so that no PDU leaves before its reservation is stored
    persist_lock: Mutex<()>,
}

impl EngineCore {
    /// Store sequence reservations and replay records that changed.
    pub async fn persist_if_dirty(&self) -> MeshResult<()> {
        let _guard = self.persist_lock.lock().await;
        let (sequence, replay) = {
            let mut state = self.state.lock().await;
            let sequence = state.sequence.take_dirty().then(|| SequenceSnapshot {
                iv_index: state.iv_index,
                reserved: state.sequence.reserved(),
            });
            let replay = state.replay.take_dirty().then(|| state.replay.snapshot());
            (sequence, replay)
        };

        if let Some(snapshot) = sequence {
            storage::store_json(self.store.as_ref(), SEQUENCE_KEY, &snapshot).await?;
        }
        if let Some(snapshot) = replay {
            storage::store_json(self.store.as_ref(), REPLAY_KEY, &snapshot).await?;
        }
        Ok(())
    }

    /// Store the full persisted state regardless of dirtiness.
    async fn persist_all(&self) -> MeshResult<()> {
        let _guard = self.persist_lock.lock().await;
        let (sequence, replay) = {
            let mut state = self.state.lock().await;
            state.sequence.take_dirty();
            state.replay.take_dirty();
            let sequence = SequenceSnapshot {
                iv_index: state.iv_index,
                reserved: state.sequence.reserved(),
            };
            (sequence, state.replay.snapshot())
        };
        storage::store_json(self.store.as_ref(), SEQUENCE_KEY, &sequence).await?;
        storage::store_json(self.store.as_ref(), REPLAY_KEY, &replay).await?;
        Ok(())
    }

    /// Hand sealed Segment Acknowledgments to the bearer.
    pub async fn send_acks(&self, acks: Vec<Vec<u8>>) {
        for pdu in acks {
            match self.bearer.send_pdu(&pdu).await {
                Ok(()) => {
                    self.stats.record_pdu_sent();
                    self.stats.record_ack_sent();
                }
                Err(e) => warn!("Failed to send segment acknowledgment: {}", e),
            }
        }
    }

    /// Fire reassembly timers and expire pending requests.
    pub async fn run_maintenance(&self) {
        let now = Instant::now();
        let acks = {
            let mut state = self.state.lock().await;
            let sweep = state.reassembler.sweep(now);
            let expired = state.correlator.expire(now);
            if expired > 0 {
                debug!("Expired {} pending requests", expired);
            }
            self.stats.record_reassemblies_abandoned(sweep.abandoned + sweep.expired);
            state.seal_acks(&sweep.acks, self.config.default_ttl)
        };
        if acks.is_empty() {
            return;
        }
        if let Err(e) = self.persist_if_dirty().await {
            error!("Failed to persist sequence state, acknowledgments withheld: {}", e);
            return;
        }
        self.send_acks(acks).await;
    }

    async fn next_maintenance(&self) -> Instant {
        let fallback = Instant::now() + self.config.maintenance_interval();
        let state = self.state.lock().await;
        [state.reassembler.next_deadline(), state.correlator.next_deadline()]
            .into_iter()
            .flatten()
            .fold(fallback, Instant::min)
    }

    async fn maintenance_loop(self: Arc<Self>) {
        debug!("Maintenance loop started");
        loop {
            let deadline = self.next_maintenance().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => self.run_maintenance().await,
            }
        }
        debug!("Maintenance loop stopped");
    }

    async fn receive_loop(self: Arc<Self>) {
        debug!("Receive loop started");
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.bearer.receive_pdu() => result,
            };
            match result {
                Ok(pdu) => self.process_pdu(&pdu).await,
                Err(MeshError::BearerClosed) => {
                    warn!("Bearer closed, receive loop stopping");
                    break;
                }
                Err(e) => warn!("Bearer receive failed: {}", e),
            }
        }
        debug!("Receive loop stopped");
    }
}

/// Builder for a [`NetworkEngine`]
pub struct NetworkEngineBuilder {
    config: TransportConfig,
    bearer: Arc<dyn Bearer>,
    network: Arc<dyn NetworkConfigProvider>,
    store: Arc<dyn StateStore>,
    keys: KeyStore,
    registry: MessageRegistry,
}

impl NetworkEngineBuilder {
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn keys(mut self, keys: KeyStore) -> Self {
        self.keys = keys;
        self
    }

    /// Replace the default message registry.
    pub fn registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register an additional message type.
    pub fn register<T: StaticMeshMessage>(mut self) -> Self {
        self.registry.register::<T>();
        self
    }

    /// Load persisted state and create the engine. Nothing runs until `start`.
    pub async fn build(self) -> MeshResult<NetworkEngine> {
        self.config.validate()?;
        let node = self
            .network
            .local_node()
            .ok_or_else(|| MeshError::Configuration("network has no local node".to_string()))?;
        if node.elements.is_empty() {
            return Err(MeshError::Configuration(format!(
                "local node {} has no elements",
                node.name
            )));
        }
        let local = LocalNode {
            primary: node.primary_address,
            elements: node.elements.iter().map(|element| element.address).collect(),
        };

        let block = self.config.sequence_reservation_block;
        let sequence: Option<SequenceSnapshot> =
            storage::load_json(self.store.as_ref(), SEQUENCE_KEY).await?;
        let (iv_index, allocator) = match sequence {
            Some(snapshot) => {
                info!(
                    "Restored IV Index {} and sequence reservations of {} sources",
                    snapshot.iv_index.index,
                    snapshot.reserved.len()
                );
                (snapshot.iv_index, SequenceAllocator::restore(&snapshot.reserved, block))
            }
            None => (IvIndex::default(), SequenceAllocator::new(block)),
        };

        let capacity = self.config.replay_cache_capacity;
        let replay: Option<ReplaySnapshot> =
            storage::load_json(self.store.as_ref(), REPLAY_KEY).await?;
        let replay = match replay {
            Some(snapshot) => ReplayCache::restore(snapshot, capacity),
            None => ReplayCache::new(capacity),
        };

        let state = EngineState {
            keys: self.keys,
            iv_index,
            sequence: allocator,
            replay,
            reassembler: Reassembler::new(ReassemblyConfig::from_transport(&self.config)),
            outgoing: OutgoingTransactions::new(),
            correlator: Correlator::new(
                self.config.max_pending_requests,
                self.config.allow_concurrent_requests,
            ),
            sends: HashMap::new(),
        };

        let (notifications, _) = broadcast::channel(self.config.notification_capacity);
        info!(
            "Network engine created for {} ({} elements)",
            local.primary,
            local.elements.len()
        );

        Ok(NetworkEngine {
            core: Arc::new(EngineCore {
                config: self.config,
                local,
                state: Mutex::new(state),
                bearer: self.bearer,
                network: self.network,
                registry: self.registry,
                stats: EngineStats::new(),
                notifications,
                shutdown: CancellationToken::new(),
                wakeup: Notify::new(),
                store: self.store,
                persist_lock: Mutex::new(()),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Mesh network & transport engine of one local node
pub struct NetworkEngine {
    core: Arc<EngineCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkEngine {
    /// Builder with default configuration, an in-memory state store, an empty
    /// key store and the built-in message registry.
    pub fn builder(
        bearer: Arc<dyn Bearer>,
        network: Arc<dyn NetworkConfigProvider>,
    ) -> NetworkEngineBuilder {
        NetworkEngineBuilder {
            config: TransportConfig::default(),
            bearer,
            network,
            store: Arc::new(InMemoryStateStore::new()),
            keys: KeyStore::new(),
            registry: messages::default_registry(),
        }
    }

    /// Spawn the receive and maintenance loops.
    pub async fn start(&self) -> MeshResult<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(MeshError::Configuration("engine has been shut down".to_string()));
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(tokio::spawn(self.core.clone().receive_loop()));
        tasks.push(tokio::spawn(self.core.clone().maintenance_loop()));
        info!("Network engine started for {}", self.core.local.primary);
        Ok(())
    }

    /// Stop every task, fail outstanding requests and persist state.
    pub async fn shutdown(&self) -> MeshResult<()> {
        info!("Shutting down network engine for {}", self.core.local.primary);
        self.core.shutdown.cancel();
        {
            let mut state = self.core.state.lock().await;
            for token in state.sends.values() {
                token.cancel();
            }
            let failed = state.correlator.fail_all(|| MeshError::Cancelled);
            if failed > 0 {
                debug!("Failed {} pending requests at shutdown", failed);
            }
            state.reassembler.abort_all();
            state.outgoing.abort_all();
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }

        self.core.persist_all().await?;
        info!("Network engine stopped");
        Ok(())
    }

    /// Send `message` from local element `from` secured with application key `app_key`.
    ///
    /// Without `from` the message leaves from the primary element.
    pub async fn send<M: MeshMessage>(
        &self,
        message: M,
        from: Option<Address>,
        to: impl Into<MeshAddress>,
        ttl: Option<u8>,
        app_key: KeyIndex,
    ) -> MeshResult<MessageHandle> {
        let from = from.unwrap_or(self.core.local.primary);
        self.core
            .dispatch(Arc::new(message), from, to.into(), ttl, SendKey::Application(app_key))
            .await
    }

    /// Send to a model, secured with the first application key bound to it.
    pub async fn send_to_model<M: MeshMessage>(
        &self,
        message: M,
        from: Option<Address>,
        element: Address,
        model_id: u32,
        ttl: Option<u8>,
    ) -> MeshResult<MessageHandle> {
        let app_key = self
            .core
            .network
            .node(element)
            .and_then(|node| node.element(element))
            .and_then(|element| element.model(model_id))
            .and_then(|model| model.bound_application_keys.first().copied())
            .ok_or_else(|| {
                MeshError::KeyNotBound(format!(
                    "model {:#06X} on {} has no bound application key",
                    model_id, element
                ))
            })?;
        self.send(message, from, element, ttl, app_key).await
    }

    /// Send to a node, secured with that node's device key.
    pub async fn send_with_device_key<M: MeshMessage>(
        &self,
        message: M,
        from: Option<Address>,
        to: Address,
        ttl: Option<u8>,
    ) -> MeshResult<MessageHandle> {
        let from = from.unwrap_or(self.core.local.primary);
        if !to.is_unicast() {
            return Err(MeshError::InvalidAddress(format!(
                "device key messages need a unicast destination, got {}",
                to
            )));
        }
        let node = self
            .core
            .network
            .node(to)
            .ok_or_else(|| MeshError::KeyNotBound(format!("no known node owns {}", to)))?;
        let device = node.primary_address;
        self.core
            .dispatch(Arc::new(message), from, MeshAddress::new(to), ttl, SendKey::Device(device))
            .await
    }

    /// Send to the local node's primary element, secured with its device key.
    ///
    /// The message never reaches the bearer: it is decoded and delivered to
    /// subscribers as if it had been received.
    pub async fn send_to_local_node<M: MeshMessage>(
        &self,
        message: M,
    ) -> MeshResult<MessageHandle> {
        let primary = self.core.local.primary;
        let key = SendKey::Device(primary);
        self.core
            .dispatch(Arc::new(message), primary, MeshAddress::new(primary), None, key)
            .await
    }

    /// Cancel a running send. Returns false if it already finished.
    pub async fn cancel(&self, handle: &MessageHandle) -> bool {
        let state = self.core.state.lock().await;
        match state.sends.get(&handle.id()) {
            Some(token) => {
                debug!(request = %handle.id(), "Cancelling send");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Unsolicited inbound messages, and responses that matched no pending request.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.core.notifications.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Feed one Network PDU received outside the bearer loop.
    pub async fn process_pdu(&self, pdu: &[u8]) {
        self.core.process_pdu(pdu).await;
    }

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) {
        self.core.run_maintenance().await;
    }

    pub fn local_address(&self) -> Address {
        self.core.local.primary
    }

    pub async fn add_network_key(&self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        self.core.state.lock().await.keys.add_network_key(index, key)
    }

    pub async fn add_application_key(
        &self,
        index: KeyIndex,
        bound_network_key: KeyIndex,
        key: Key128,
    ) -> MeshResult<()> {
        self.core
            .state
            .lock()
            .await
            .keys
            .add_application_key(index, bound_network_key, key)
    }

    pub async fn add_device_key(&self, address: Address, key: Key128) -> MeshResult<()> {
        self.core.state.lock().await.keys.add_device_key(address, key)
    }

    pub async fn refresh_network_key(&self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        self.core.state.lock().await.keys.refresh_network_key(index, key)
    }

    pub async fn refresh_application_key(&self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        self.core.state.lock().await.keys.refresh_application_key(index, key)
    }

    pub async fn switch_to_new_keys(&self, index: KeyIndex) -> MeshResult<()> {
        self.core.state.lock().await.keys.switch_to_new_keys(index)
    }

    pub async fn complete_key_refresh(&self, index: KeyIndex) -> MeshResult<()> {
        self.core.state.lock().await.keys.complete_key_refresh(index)
    }

    pub async fn iv_index(&self) -> IvIndex {
        self.core.state.lock().await.iv_index
    }

    /// Move to a new IV Index.
    ///
    /// In-flight segmented transactions in both directions are aborted when the
    /// index changes; sequence numbers restart once the transmit index grows.
    pub async fn set_iv_index(&self, next: IvIndex) -> MeshResult<()> {
        {
            let mut state = self.core.state.lock().await;
            let change = IvIndexChange::validate(state.iv_index, next)?;
            if change.abort_transactions {
                state.reassembler.forget_completed_before(next.index.saturating_sub(1));
                let inbound = state.reassembler.abort_all();
                let outbound = state.outgoing.abort_all();
                if inbound + outbound > 0 {
                    info!(
                        "IV Index change aborted {} inbound and {} outbound transactions",
                        inbound, outbound
                    );
                }
            }
            if change.reset_sequences {
                state.sequence.reset();
            }
            info!(
                "IV Index {} -> {} (update active: {})",
                state.iv_index.index, next.index, next.update_active
            );
            state.iv_index = next;
        }
        self.core.persist_all().await
    }
}

impl Drop for NetworkEngine {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::RecordingBearer;
    use crate::network::StaticNetwork;

    const NETWORK: &str = r#"{
        "local_node": "0001",
        "nodes": [
            {"name": "client", "primary_address": "0001", "elements": [
                {"address": "0001"}, {"address": "0002"}
            ]},
            {"name": "lamp", "primary_address": "0010", "elements": [
                {"address": "0010", "models": [{"model_id": 4096, "bound_application_keys": [0]}]}
            ]}
        ]
    }"#;

    async fn engine() -> NetworkEngine {
        let network = Arc::new(StaticNetwork::from_json(NETWORK).unwrap());
        let mut keys = KeyStore::new();
        keys.add_network_key(KeyIndex::new(0).unwrap(), [0x11; 16]).unwrap();
        NetworkEngine::builder(RecordingBearer::new(), network)
            .keys(keys)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_local_node() {
        let json = r#"{"local_node": "0005", "nodes": []}"#;
        let network = Arc::new(StaticNetwork::from_json(json).unwrap());
        let result = NetworkEngine::builder(RecordingBearer::new(), network).build().await;
        assert!(matches!(result, Err(MeshError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_iv_index_update_resets_sequences() {
        let engine = engine().await;
        {
            let mut state = engine.core.state.lock().await;
            state.sequence.allocate(Address::new(0x0001)).unwrap();
        }

        // Entering the update keeps transmitting on the old index
        engine.set_iv_index(IvIndex::new(1, true)).await.unwrap();
        assert_eq!(engine.core.state.lock().await.sequence.peek(Address::new(0x0001)), 1);

        engine.set_iv_index(IvIndex::new(1, false)).await.unwrap();
        assert_eq!(engine.core.state.lock().await.sequence.peek(Address::new(0x0001)), 0);

        assert!(matches!(
            engine.set_iv_index(IvIndex::new(0, false)).await,
            Err(MeshError::IvIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_key_management_through_engine() {
        let engine = engine().await;
        let app = KeyIndex::new(0).unwrap();
        engine.add_application_key(app, KeyIndex::new(0).unwrap(), [0x22; 16]).await.unwrap();
        assert!(matches!(
            engine.add_application_key(app, KeyIndex::new(0).unwrap(), [0x22; 16]).await,
            Err(MeshError::KeyAlreadyExists(_))
        ));
        assert!(engine.refresh_application_key(app, [0x33; 16]).await.is_err());
        engine.refresh_network_key(KeyIndex::new(0).unwrap(), [0x55; 16]).await.unwrap();
        engine.refresh_application_key(app, [0x33; 16]).await.unwrap();
        engine.switch_to_new_keys(KeyIndex::new(0).unwrap()).await.unwrap();
        engine.complete_key_refresh(KeyIndex::new(0).unwrap()).await.unwrap();
        let missing_net = KeyIndex::new(7).unwrap();
        assert!(matches!(
            engine.add_application_key(KeyIndex::new(1).unwrap(), missing_net, [0x44; 16]).await,
            Err(MeshError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = engine().await;
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(engine.start().await.is_err());
    }
}
