//! Concrete access messages: Generic OnOff, Scenes, Private Node Identity and
//! the Simple OnOff vendor model

use crate::keys::KeyIndex;
use crate::message::{MeshMessage, MessageRegistry, Opcode, StaticMeshMessage};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::any::Any;
use std::fmt;

macro_rules! impl_static_message {
    ($ty:ty, $opcode:expr) => {
        impl StaticMeshMessage for $ty {
            const OPCODE: Opcode = Opcode::from_const($opcode);

            fn decode(parameters: &[u8]) -> Option<Self> {
                Self::from_parameters(parameters)
            }
        }
    };
}

/// Register every message type defined in this module.
pub fn register_all(registry: &mut MessageRegistry) {
    registry
        .register::<GenericOnOffGet>()
        .register::<GenericOnOffSet>()
        .register::<GenericOnOffSetUnacknowledged>()
        .register::<GenericOnOffStatus>()
        .register::<SceneDelete>()
        .register::<SceneRegisterStatus>()
        .register::<PrivateNodeIdentitySet>()
        .register::<PrivateNodeIdentityStatus>()
        .register::<SimpleOnOffSet>()
        .register::<SimpleOnOffStatus>();
}

/// Registry preloaded with every message type of this module.
pub fn default_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    register_all(&mut registry);
    registry
}

fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Generic Default Transition Time encoded state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub transition_time: u8,
    pub delay: u8,
}

// ---------------------------------------------------------------------------
// Generic OnOff

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenericOnOffGet;

impl GenericOnOffGet {
    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        parameters.is_empty().then_some(Self)
    }
}

impl MeshMessage for GenericOnOffGet {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        Vec::new()
    }

    fn response_opcode(&self) -> Option<Opcode> {
        Some(GenericOnOffStatus::OPCODE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(GenericOnOffGet, 0x8201);

fn encode_onoff_set(is_on: bool, tid: u8, transition: Option<Transition>) -> Vec<u8> {
    let mut out = vec![u8::from(is_on), tid];
    if let Some(transition) = transition {
        out.push(transition.transition_time);
        out.push(transition.delay);
    }
    out
}

fn decode_onoff_set(parameters: &[u8]) -> Option<(bool, u8, Option<Transition>)> {
    match parameters {
        [state @ (0 | 1), tid] => Some((*state == 1, *tid, None)),
        [state @ (0 | 1), tid, transition_time, delay] => Some((
            *state == 1,
            *tid,
            Some(Transition {
                transition_time: *transition_time,
                delay: *delay,
            }),
        )),
        _ => None,
    }
}

/// Generic OnOff Set; answered with Generic OnOff Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericOnOffSet {
    pub is_on: bool,
    pub tid: u8,
    pub transition: Option<Transition>,
}

impl GenericOnOffSet {
    pub fn new(is_on: bool, tid: u8) -> Self {
        Self {
            is_on,
            tid,
            transition: None,
        }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        decode_onoff_set(parameters).map(|(is_on, tid, transition)| Self { is_on, tid, transition })
    }
}

impl MeshMessage for GenericOnOffSet {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        encode_onoff_set(self.is_on, self.tid, self.transition)
    }

    fn response_opcode(&self) -> Option<Opcode> {
        Some(GenericOnOffStatus::OPCODE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(GenericOnOffSet, 0x8202);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericOnOffSetUnacknowledged {
    pub is_on: bool,
    pub tid: u8,
    pub transition: Option<Transition>,
}

impl GenericOnOffSetUnacknowledged {
    pub fn new(is_on: bool, tid: u8) -> Self {
        Self {
            is_on,
            tid,
            transition: None,
        }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        decode_onoff_set(parameters).map(|(is_on, tid, transition)| Self { is_on, tid, transition })
    }
}

impl MeshMessage for GenericOnOffSetUnacknowledged {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        encode_onoff_set(self.is_on, self.tid, self.transition)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(GenericOnOffSetUnacknowledged, 0x8203);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericOnOffStatus {
    pub is_on: bool,
    /// Target state and remaining time of a transition in progress
    pub target: Option<(bool, u8)>,
}

impl GenericOnOffStatus {
    pub fn new(is_on: bool) -> Self {
        Self { is_on, target: None }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        match parameters {
            [present @ (0 | 1)] => Some(Self::new(*present == 1)),
            [present @ (0 | 1), target @ (0 | 1), remaining] => Some(Self {
                is_on: *present == 1,
                target: Some((*target == 1, *remaining)),
            }),
            _ => None,
        }
    }
}

impl MeshMessage for GenericOnOffStatus {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        let mut out = vec![u8::from(self.is_on)];
        if let Some((target, remaining)) = self.target {
            out.push(u8::from(target));
            out.push(remaining);
        }
        out
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(GenericOnOffStatus, 0x8204);

// ---------------------------------------------------------------------------
// Scenes

/// Scene number; 0x0000 is prohibited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneNumber(pub u16);

impl SceneNumber {
    pub const INVALID: SceneNumber = SceneNumber(0x0000);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for SceneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl Serialize for SceneNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SceneNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SceneVisitor;

        impl Visitor<'_> for SceneVisitor {
            type Value = SceneNumber;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("Scene must be 4-character hexadecimal string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<SceneNumber, E> {
                if value.len() != 4 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(E::invalid_value(de::Unexpected::Str(value), &self));
                }
                u16::from_str_radix(value, 16)
                    .map(SceneNumber)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(SceneVisitor)
    }
}

/// Scene Delete; answered with Scene Register Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneDelete {
    pub scene: SceneNumber,
}

impl SceneDelete {
    pub fn new(scene: SceneNumber) -> Self {
        Self { scene }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        if parameters.len() != 2 {
            return None;
        }
        read_u16_le(parameters, 0).map(|scene| Self::new(SceneNumber(scene)))
    }
}

impl MeshMessage for SceneDelete {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        self.scene.0.to_le_bytes().to_vec()
    }

    fn response_opcode(&self) -> Option<Opcode> {
        Some(SceneRegisterStatus::OPCODE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(SceneDelete, 0x829E);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneRegisterStatus {
    pub status: u8,
    pub current_scene: SceneNumber,
    pub scenes: Vec<SceneNumber>,
}

impl SceneRegisterStatus {
    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        if parameters.len() < 3 || (parameters.len() - 3) % 2 != 0 {
            return None;
        }
        let scenes = parameters[3..]
            .chunks_exact(2)
            .map(|chunk| SceneNumber(u16::from_le_bytes([chunk[0], chunk[1]])))
            .collect();
        Some(Self {
            status: parameters[0],
            current_scene: SceneNumber(read_u16_le(parameters, 1)?),
            scenes,
        })
    }
}

impl MeshMessage for SceneRegisterStatus {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.scenes.len() * 2);
        out.push(self.status);
        out.extend_from_slice(&self.current_scene.0.to_le_bytes());
        for scene in &self.scenes {
            out.extend_from_slice(&scene.0.to_le_bytes());
        }
        out
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(SceneRegisterStatus, 0x8245);

// ---------------------------------------------------------------------------
// Private Node Identity (configuration, secured with the device key)

fn encode_key_index(index: KeyIndex, out: &mut Vec<u8>) {
    out.extend_from_slice(&index.value().to_le_bytes());
}

fn decode_key_index(data: &[u8], offset: usize) -> Option<KeyIndex> {
    read_u16_le(data, offset).and_then(|value| KeyIndex::new(value & 0x0FFF).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateNodeIdentitySet {
    pub network_key: KeyIndex,
    pub enabled: bool,
}

impl PrivateNodeIdentitySet {
    pub fn new(network_key: KeyIndex, enabled: bool) -> Self {
        Self { network_key, enabled }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        if parameters.len() != 3 {
            return None;
        }
        Some(Self {
            network_key: decode_key_index(parameters, 0)?,
            enabled: parameters[2] == 0x01,
        })
    }
}

impl MeshMessage for PrivateNodeIdentitySet {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        encode_key_index(self.network_key, &mut out);
        out.push(u8::from(self.enabled));
        out
    }

    fn response_opcode(&self) -> Option<Opcode> {
        Some(PrivateNodeIdentityStatus::OPCODE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(PrivateNodeIdentitySet, 0x8067);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateNodeIdentityStatus {
    pub status: u8,
    pub network_key: KeyIndex,
    pub state: u8,
}

impl PrivateNodeIdentityStatus {
    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        if parameters.len() != 4 {
            return None;
        }
        Some(Self {
            status: parameters[0],
            network_key: decode_key_index(parameters, 1)?,
            state: parameters[3],
        })
    }
}

impl MeshMessage for PrivateNodeIdentityStatus {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.push(self.status);
        encode_key_index(self.network_key, &mut out);
        out.push(self.state);
        out
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(PrivateNodeIdentityStatus, 0x8068);

// ---------------------------------------------------------------------------
// Simple OnOff vendor model (Nordic Semiconductor, company 0x0059)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleOnOffSet {
    pub is_on: bool,
}

impl SimpleOnOffSet {
    pub fn new(is_on: bool) -> Self {
        Self { is_on }
    }

    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        match parameters {
            [value] => Some(Self::new(*value == 0x01)),
            _ => None,
        }
    }
}

impl MeshMessage for SimpleOnOffSet {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        vec![u8::from(self.is_on)]
    }

    fn response_opcode(&self) -> Option<Opcode> {
        Some(SimpleOnOffStatus::OPCODE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(SimpleOnOffSet, 0xC15900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleOnOffStatus {
    pub is_on: bool,
}

impl SimpleOnOffStatus {
    fn from_parameters(parameters: &[u8]) -> Option<Self> {
        match parameters {
            [value] => Some(Self { is_on: *value == 0x01 }),
            _ => None,
        }
    }
}

impl MeshMessage for SimpleOnOffStatus {
    fn opcode(&self) -> Opcode {
        Self::OPCODE
    }

    fn parameters(&self) -> Vec<u8> {
        vec![u8::from(self.is_on)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl_static_message!(SimpleOnOffStatus, 0xC45900);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AccessPdu, DecodedMessage};

    fn decode(message: &dyn MeshMessage) -> DecodedMessage {
        let pdu = AccessPdu::from_message(message).unwrap();
        let wire = pdu.encode();
        default_registry().decode(&AccessPdu::decode(&wire).unwrap()).unwrap()
    }

    #[test]
    fn test_generic_onoff_set_with_transition() {
        let set = GenericOnOffSet {
            is_on: true,
            tid: 9,
            transition: Some(Transition {
                transition_time: 0x41,
                delay: 2,
            }),
        };
        assert_eq!(set.parameters(), vec![1, 9, 0x41, 2]);
        assert_eq!(decode(&set).downcast_ref::<GenericOnOffSet>(), Some(&set));
        assert!(GenericOnOffSet::decode(&[2, 9]).is_none());
        assert!(GenericOnOffSet::decode(&[1, 9, 3]).is_none());
    }

    #[test]
    fn test_acknowledged_flags() {
        assert_eq!(GenericOnOffGet.response_opcode(), Some(GenericOnOffStatus::OPCODE));
        assert!(GenericOnOffSetUnacknowledged::new(true, 0).response_opcode().is_none());
        assert_eq!(
            SceneDelete::new(SceneNumber(1)).response_opcode(),
            Some(SceneRegisterStatus::OPCODE)
        );
    }

    #[test]
    fn test_scene_delete_little_endian() {
        let delete = SceneDelete::new(SceneNumber(0x1234));
        assert_eq!(delete.parameters(), vec![0x34, 0x12]);
        assert!(SceneDelete::decode(&[0x34]).is_none());
    }

    #[test]
    fn test_scene_register_status() {
        let status = SceneRegisterStatus {
            status: 0,
            current_scene: SceneNumber(3),
            scenes: vec![SceneNumber(1), SceneNumber(3)],
        };
        assert_eq!(decode(&status).downcast_ref::<SceneRegisterStatus>(), Some(&status));
        assert!(SceneRegisterStatus::decode(&[0, 3, 0, 1]).is_none());
    }

    #[test]
    fn test_scene_number_serde() {
        assert_eq!(serde_json::to_string(&SceneNumber(0x00AB)).unwrap(), "\"00AB\"");
        assert_eq!(serde_json::from_str::<SceneNumber>("\"ffff\"").unwrap(), SceneNumber(0xFFFF));
        assert!(serde_json::from_str::<SceneNumber>("\"1\"").is_err());
        assert!(!SceneNumber::INVALID.is_valid());
    }

    #[test]
    fn test_private_node_identity_set_encoding() {
        let set = PrivateNodeIdentitySet::new(KeyIndex::new(0x0123).unwrap(), true);
        assert_eq!(set.parameters(), vec![0x23, 0x01, 0x01]);
        assert_eq!(decode(&set).downcast_ref::<PrivateNodeIdentitySet>(), Some(&set));
    }

    #[test]
    fn test_simple_onoff_vendor_opcode() {
        let set = SimpleOnOffSet::new(true);
        let pdu = AccessPdu::from_message(&set).unwrap();
        assert_eq!(hex::encode(pdu.encode()), "c1590001");
        assert!(decode(&set).downcast_ref::<SimpleOnOffSet>().unwrap().is_on);
    }
}
