//! Key store for network, application and device keys

use crate::address::Address;
use crate::crypto::{self, Key128};
use crate::error::{MeshError, MeshResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::info;
use zeroize::Zeroize;

/// Index of a network or application key (0..=4095)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct KeyIndex(u16);

impl KeyIndex {
    pub const MAX: u16 = 4095;

    pub fn new(value: u16) -> MeshResult<Self> {
        if value > Self::MAX {
            return Err(MeshError::KeyNotFound(format!("key index {} out of range", value)));
        }
        Ok(Self(value))
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for KeyIndex {
    type Error = MeshError;

    fn try_from(value: u16) -> MeshResult<Self> {
        Self::new(value)
    }
}

impl From<KeyIndex> for u16 {
    fn from(index: KeyIndex) -> Self {
        index.0
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key refresh procedure phase of a network key and the application keys bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// Only one key exists
    Normal,
    /// New key distributed, transmissions still use the old key
    Distributing,
    /// Transmissions use the new key, the old one is still accepted
    Switching,
}

/// Material derived from a network key
#[derive(Clone)]
pub struct NetworkKeyMaterial {
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
    pub network_id: [u8; 8],
}

impl NetworkKeyMaterial {
    pub fn derive(net_key: &Key128) -> Self {
        let (nid, encryption_key, privacy_key) = crypto::k2(net_key, &[0x00]);
        Self {
            nid,
            encryption_key,
            privacy_key,
            network_id: crypto::k3(net_key),
        }
    }
}

impl Drop for NetworkKeyMaterial {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.privacy_key.zeroize();
    }
}

impl fmt::Debug for NetworkKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKeyMaterial")
            .field("nid", &format_args!("0x{:02X}", self.nid))
            .finish_non_exhaustive()
    }
}

struct NetworkKeyVersion {
    key: Key128,
    material: NetworkKeyMaterial,
}

impl NetworkKeyVersion {
    fn new(key: Key128) -> Self {
        let material = NetworkKeyMaterial::derive(&key);
        Self { key, material }
    }
}

impl Drop for NetworkKeyVersion {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// A network key and, during key refresh, its predecessor
pub struct NetworkKey {
    index: KeyIndex,
    current: NetworkKeyVersion,
    old: Option<NetworkKeyVersion>,
    phase: KeyRefreshPhase,
}

impl NetworkKey {
    pub fn new(index: KeyIndex, key: Key128) -> Self {
        Self {
            index,
            current: NetworkKeyVersion::new(key),
            old: None,
            phase: KeyRefreshPhase::Normal,
        }
    }

    pub fn index(&self) -> KeyIndex {
        self.index
    }

    pub fn key(&self) -> &Key128 {
        &self.current.key
    }

    pub fn material(&self) -> &NetworkKeyMaterial {
        &self.current.material
    }

    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Material used for outgoing PDUs in the current phase.
    pub fn transmit_material(&self) -> &NetworkKeyMaterial {
        match (&self.old, self.phase) {
            (Some(old), KeyRefreshPhase::Distributing) => &old.material,
            _ => &self.current.material,
        }
    }

    /// Every material accepted on receipt, new key first.
    pub fn receive_materials(&self) -> impl Iterator<Item = &NetworkKeyMaterial> {
        std::iter::once(&self.current.material).chain(self.old.iter().map(|old| &old.material))
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKey")
            .field("index", &self.index)
            .field("nid", &self.current.material.nid)
            .field("phase", &self.phase)
            .finish()
    }
}

struct ApplicationKeyVersion {
    key: Key128,
    aid: u8,
}

impl ApplicationKeyVersion {
    fn new(key: Key128) -> Self {
        let aid = crypto::k4(&key);
        Self { key, aid }
    }
}

impl Drop for ApplicationKeyVersion {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// An application key bound to exactly one network key
pub struct ApplicationKey {
    index: KeyIndex,
    bound_network_key: KeyIndex,
    current: ApplicationKeyVersion,
    old: Option<ApplicationKeyVersion>,
}

impl ApplicationKey {
    pub fn index(&self) -> KeyIndex {
        self.index
    }

    pub fn bound_network_key(&self) -> KeyIndex {
        self.bound_network_key
    }

    pub fn key(&self) -> &Key128 {
        &self.current.key
    }

    pub fn aid(&self) -> u8 {
        self.current.aid
    }

    /// Key and AID used for outgoing messages while the bound network key is in `phase`.
    pub fn transmit_key(&self, phase: KeyRefreshPhase) -> (&Key128, u8) {
        match (&self.old, phase) {
            (Some(old), KeyRefreshPhase::Distributing) => (&old.key, old.aid),
            _ => (&self.current.key, self.current.aid),
        }
    }

    fn versions(&self) -> impl Iterator<Item = &ApplicationKeyVersion> {
        std::iter::once(&self.current).chain(self.old.iter())
    }
}

impl fmt::Debug for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationKey")
            .field("index", &self.index)
            .field("bound_network_key", &self.bound_network_key)
            .field("aid", &format_args!("0x{:02X}", self.current.aid))
            .finish()
    }
}

/// Device key of a node, addressed by the node's primary unicast address
pub struct DeviceKey {
    address: Address,
    key: Key128,
}

impl DeviceKey {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn key(&self) -> &Key128 {
        &self.key
    }
}

impl Drop for DeviceKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey").field("address", &self.address).finish()
    }
}

/// Network material candidate for an inbound PDU
#[derive(Debug, Clone)]
pub struct NetworkKeyCandidate {
    pub index: KeyIndex,
    pub material: NetworkKeyMaterial,
}

/// Application key candidate for an inbound PDU
#[derive(Clone)]
pub struct ApplicationKeyCandidate {
    pub index: KeyIndex,
    pub key: Key128,
}

impl Drop for ApplicationKeyCandidate {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Owner of every key known to the local node
#[derive(Debug, Default)]
pub struct KeyStore {
    network_keys: BTreeMap<KeyIndex, NetworkKey>,
    application_keys: BTreeMap<KeyIndex, ApplicationKey>,
    device_keys: HashMap<Address, DeviceKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate random 128-bit key material.
    pub fn generate_key() -> Key128 {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    pub fn add_network_key(&mut self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        if self.network_keys.contains_key(&index) {
            return Err(MeshError::KeyAlreadyExists(format!("network key {}", index)));
        }
        let network_key = NetworkKey::new(index, key);
        info!(
            "Added network key {} (NID 0x{:02X})",
            index,
            network_key.material().nid
        );
        self.network_keys.insert(index, network_key);
        Ok(())
    }

    pub fn add_application_key(
        &mut self,
        index: KeyIndex,
        bound_network_key: KeyIndex,
        key: Key128,
    ) -> MeshResult<()> {
        if self.application_keys.contains_key(&index) {
            return Err(MeshError::KeyAlreadyExists(format!("application key {}", index)));
        }
        if !self.network_keys.contains_key(&bound_network_key) {
            return Err(MeshError::KeyNotFound(format!("network key {}", bound_network_key)));
        }
        let application_key = ApplicationKey {
            index,
            bound_network_key,
            current: ApplicationKeyVersion::new(key),
            old: None,
        };
        info!(
            "Added application key {} bound to network key {} (AID 0x{:02X})",
            index,
            bound_network_key,
            application_key.aid()
        );
        self.application_keys.insert(index, application_key);
        Ok(())
    }

    pub fn add_device_key(&mut self, address: Address, key: Key128) -> MeshResult<()> {
        if !address.is_unicast() {
            return Err(MeshError::InvalidAddress(format!("device key address {}", address)));
        }
        if self.device_keys.contains_key(&address) {
            return Err(MeshError::KeyAlreadyExists(format!("device key {}", address)));
        }
        self.device_keys.insert(address, DeviceKey { address, key });
        Ok(())
    }

    pub fn network_key(&self, index: KeyIndex) -> MeshResult<&NetworkKey> {
        self.network_keys
            .get(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("network key {}", index)))
    }

    pub fn application_key(&self, index: KeyIndex) -> MeshResult<&ApplicationKey> {
        self.application_keys
            .get(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("application key {}", index)))
    }

    pub fn device_key(&self, address: Address) -> MeshResult<&DeviceKey> {
        self.device_keys
            .get(&address)
            .ok_or_else(|| MeshError::KeyNotFound(format!("device key {}", address)))
    }

    /// Network key with the lowest index, used for device-key traffic.
    pub fn primary_network_key(&self) -> MeshResult<&NetworkKey> {
        self.network_keys
            .values()
            .next()
            .ok_or_else(|| MeshError::Configuration("no network key".to_string()))
    }

    pub fn network_keys(&self) -> impl Iterator<Item = &NetworkKey> {
        self.network_keys.values()
    }

    /// Every network material whose NID matches, in both key refresh versions.
    pub fn network_keys_by_nid(&self, nid: u8) -> Vec<NetworkKeyCandidate> {
        self.network_keys
            .values()
            .flat_map(|key| {
                key.receive_materials()
                    .filter(move |material| material.nid == nid)
                    .map(move |material| NetworkKeyCandidate {
                        index: key.index,
                        material: material.clone(),
                    })
            })
            .collect()
    }

    /// Every application key bound to `network_key` whose AID matches.
    pub fn application_keys_by_aid(
        &self,
        network_key: KeyIndex,
        aid: u8,
    ) -> Vec<ApplicationKeyCandidate> {
        self.application_keys
            .values()
            .filter(|key| key.bound_network_key == network_key)
            .flat_map(|key| {
                key.versions()
                    .filter(move |version| version.aid == aid)
                    .map(move |version| ApplicationKeyCandidate {
                        index: key.index,
                        key: version.key,
                    })
            })
            .collect()
    }

    /// Start the key refresh procedure: `key` becomes the new network key.
    pub fn refresh_network_key(&mut self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        let network_key = self
            .network_keys
            .get_mut(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("network key {}", index)))?;
        if network_key.phase != KeyRefreshPhase::Normal {
            return Err(MeshError::Configuration(format!(
                "key refresh already in progress for network key {}",
                index
            )));
        }

        let previous = std::mem::replace(&mut network_key.current, NetworkKeyVersion::new(key));
        network_key.old = Some(previous);
        network_key.phase = KeyRefreshPhase::Distributing;
        info!("Network key {} entered key refresh phase 1", index);
        Ok(())
    }

    /// Distribute a new application key while its network key is being refreshed.
    pub fn refresh_application_key(&mut self, index: KeyIndex, key: Key128) -> MeshResult<()> {
        let bound = self.application_key(index)?.bound_network_key;
        if self.network_key(bound)?.phase != KeyRefreshPhase::Distributing {
            return Err(MeshError::Configuration(format!(
                "network key {} is not distributing new keys",
                bound
            )));
        }

        let application_key = self
            .application_keys
            .get_mut(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("application key {}", index)))?;
        if application_key.old.is_some() {
            return Err(MeshError::KeyAlreadyExists(format!(
                "application key {} already refreshed",
                index
            )));
        }
        let previous =
            std::mem::replace(&mut application_key.current, ApplicationKeyVersion::new(key));
        application_key.old = Some(previous);
        Ok(())
    }

    /// Key refresh phase 2: transmit with the new keys.
    pub fn switch_to_new_keys(&mut self, index: KeyIndex) -> MeshResult<()> {
        let network_key = self
            .network_keys
            .get_mut(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("network key {}", index)))?;
        if network_key.phase != KeyRefreshPhase::Distributing {
            return Err(MeshError::Configuration(format!(
                "network key {} is not in key refresh phase 1",
                index
            )));
        }
        network_key.phase = KeyRefreshPhase::Switching;
        info!("Network key {} entered key refresh phase 2", index);
        Ok(())
    }

    /// Finish the key refresh procedure and drop the old material.
    pub fn complete_key_refresh(&mut self, index: KeyIndex) -> MeshResult<()> {
        let network_key = self
            .network_keys
            .get_mut(&index)
            .ok_or_else(|| MeshError::KeyNotFound(format!("network key {}", index)))?;
        if network_key.phase == KeyRefreshPhase::Normal {
            return Err(MeshError::Configuration(format!(
                "network key {} is not being refreshed",
                index
            )));
        }
        network_key.old = None;
        network_key.phase = KeyRefreshPhase::Normal;

        for application_key in self.application_keys.values_mut() {
            if application_key.bound_network_key == index {
                application_key.old = None;
            }
        }
        info!("Key refresh completed for network key {}", index);
        Ok(())
    }
}
