//! Access layer: opcodes, access PDUs and the message codec registry

use crate::address::{Address, MeshAddress};
use crate::error::{MeshError, MeshResult};
use crate::keys::KeyIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Largest access payload: 384 bytes of upper transport PDU minus a 32-bit TransMIC
pub const MAX_ACCESS_PAYLOAD: usize = 380;

/// A 1-, 2- or 3-byte (vendor) access opcode
///
/// Vendor opcodes are written as they appear on the wire, e.g. `0xC15900` is
/// opcode 0x01 of company 0x0059.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Opcode(u32);

impl Opcode {
    /// Validate the value against the opcode encoding rules.
    pub const fn new(value: u32) -> Option<Self> {
        let valid = match value {
            0x00..=0x7E => true,
            0x8000..=0xBFFF => true,
            0xC0_0000..=0xFF_FFFF => true,
            _ => false,
        };
        if valid {
            Some(Self(value))
        } else {
            None
        }
    }

    /// For opcode constants; the value must be a valid opcode.
    pub const fn from_const(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn len(self) -> usize {
        if self.0 <= 0x7E {
            1
        } else if self.0 <= 0xFFFF {
            2
        } else {
            3
        }
    }

    pub const fn is_vendor(self) -> bool {
        self.len() == 3
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        let bytes = self.0.to_be_bytes();
        out.extend_from_slice(&bytes[4 - self.len()..]);
    }

    /// Read an opcode from the start of an access payload; returns it and its length.
    pub fn decode(data: &[u8]) -> MeshResult<(Self, usize)> {
        let first = *data
            .first()
            .ok_or_else(|| MeshError::InvalidPdu("empty access payload".to_string()))?;
        let len = match first >> 6 {
            0b00 | 0b01 if first != 0x7F => 1,
            0b10 => 2,
            0b11 => 3,
            _ => return Err(MeshError::InvalidPdu("reserved opcode 0x7F".to_string())),
        };
        if data.len() < len {
            return Err(MeshError::InvalidPdu(format!(
                "truncated {}-byte opcode",
                len
            )));
        }
        let value = data[..len].iter().fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
        Ok((Self(value), len))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.len() {
            1 => write!(f, "0x{:02X}", self.0),
            2 => write!(f, "0x{:04X}", self.0),
            _ => write!(f, "0x{:06X}", self.0),
        }
    }
}

/// Opcode followed by parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    pub opcode: Opcode,
    pub parameters: Vec<u8>,
}

impl AccessPdu {
    pub fn new(opcode: Opcode, parameters: Vec<u8>) -> MeshResult<Self> {
        let pdu = Self { opcode, parameters };
        if pdu.len() > MAX_ACCESS_PAYLOAD {
            return Err(MeshError::Encoding(format!(
                "access payload of {} bytes exceeds {}",
                pdu.len(),
                MAX_ACCESS_PAYLOAD
            )));
        }
        Ok(pdu)
    }

    pub fn from_message(message: &dyn MeshMessage) -> MeshResult<Self> {
        Self::new(message.opcode(), message.parameters())
    }

    pub fn len(&self) -> usize {
        self.opcode.len() + self.parameters.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.opcode.encode(&mut out);
        out.extend_from_slice(&self.parameters);
        out
    }

    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        let (opcode, len) = Opcode::decode(data)?;
        Ok(Self {
            opcode,
            parameters: data[len..].to_vec(),
        })
    }
}

/// Required upper transport security of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageSecurity {
    /// 32-bit TransMIC; short messages go unsegmented
    #[default]
    Low,
    /// 64-bit TransMIC; always segmented
    High,
}

/// An access layer message
pub trait MeshMessage: Send + Sync + fmt::Debug + Any {
    fn opcode(&self) -> Opcode;

    fn parameters(&self) -> Vec<u8>;

    /// Opcode of the status message answering this one. `Some` makes the
    /// message acknowledged.
    fn response_opcode(&self) -> Option<Opcode> {
        None
    }

    fn security(&self) -> MessageSecurity {
        MessageSecurity::Low
    }

    /// Force segmentation even when the PDU would fit unsegmented.
    fn is_segmented(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn MeshMessage {
    pub fn is_acknowledged(&self) -> bool {
        self.response_opcode().is_some()
    }

    pub fn downcast_ref<T: MeshMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A message type with a fixed opcode that can be decoded from its parameters
pub trait StaticMeshMessage: MeshMessage + Sized {
    const OPCODE: Opcode;

    fn decode(parameters: &[u8]) -> Option<Self>;
}

/// Decoder stored in the registry
pub type MessageDecoder = fn(&[u8]) -> Option<Arc<dyn MeshMessage>>;

fn decode_static<T: StaticMeshMessage>(parameters: &[u8]) -> Option<Arc<dyn MeshMessage>> {
    T::decode(parameters).map(|message| Arc::new(message) as Arc<dyn MeshMessage>)
}

/// Result of decoding an access PDU
#[derive(Debug, Clone)]
pub enum DecodedMessage {
    Known(Arc<dyn MeshMessage>),
    Unknown { opcode: Opcode, parameters: Vec<u8> },
}

impl DecodedMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            DecodedMessage::Known(message) => message.opcode(),
            DecodedMessage::Unknown { opcode, .. } => *opcode,
        }
    }

    pub fn downcast_ref<T: MeshMessage>(&self) -> Option<&T> {
        match self {
            DecodedMessage::Known(message) => message.downcast_ref::<T>(),
            DecodedMessage::Unknown { .. } => None,
        }
    }
}

/// Opcode to decoder map
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<Opcode, MessageDecoder>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: StaticMeshMessage>(&mut self) -> &mut Self {
        self.decoders.insert(T::OPCODE, decode_static::<T>);
        self
    }

    pub fn register_decoder(&mut self, opcode: Opcode, decoder: MessageDecoder) -> &mut Self {
        self.decoders.insert(opcode, decoder);
        self
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.decoders.contains_key(&opcode)
    }

    /// Decode a PDU; registered opcodes whose parameters do not parse are an error.
    pub fn decode(&self, pdu: &AccessPdu) -> MeshResult<DecodedMessage> {
        match self.decoders.get(&pdu.opcode) {
            Some(decoder) => decoder(&pdu.parameters).map(DecodedMessage::Known).ok_or_else(|| {
                MeshError::InvalidPdu(format!("malformed parameters for opcode {}", pdu.opcode))
            }),
            None => Ok(DecodedMessage::Unknown {
                opcode: pdu.opcode,
                parameters: pdu.parameters.clone(),
            }),
        }
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opcodes: Vec<_> = self.decoders.keys().map(|opcode| opcode.to_string()).collect();
        opcodes.sort();
        f.debug_struct("MessageRegistry").field("opcodes", &opcodes).finish()
    }
}

/// Key that secured a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKey {
    Application(KeyIndex),
    Device(Address),
}

/// A message delivered by the inbound pipeline
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: DecodedMessage,
    pub source: Address,
    pub destination: MeshAddress,
    pub key: MessageKey,
    pub network_key: KeyIndex,
    pub ttl: u8,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u8);

    impl MeshMessage for Ping {
        fn opcode(&self) -> Opcode {
            Self::OPCODE
        }

        fn parameters(&self) -> Vec<u8> {
            vec![self.0]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl StaticMeshMessage for Ping {
        const OPCODE: Opcode = Opcode::from_const(0x8201);

        fn decode(parameters: &[u8]) -> Option<Self> {
            match parameters {
                [value] => Some(Ping(*value)),
                _ => None,
            }
        }
    }

    #[test]
    fn test_opcode_lengths() {
        assert_eq!(Opcode::new(0x04).unwrap().len(), 1);
        assert_eq!(Opcode::new(0x8201).unwrap().len(), 2);
        assert_eq!(Opcode::new(0xC15900).unwrap().len(), 3);
        assert!(Opcode::new(0x7F).is_none());
        assert!(Opcode::new(0x7F00).is_none());
        assert!(Opcode::new(0x01_000000).is_none());
    }

    #[test]
    fn test_opcode_wire_format() {
        for (value, wire) in [(0x04u32, "04"), (0x8201, "8201"), (0xC15900, "c15900")] {
            let opcode = Opcode::new(value).unwrap();
            let mut out = Vec::new();
            opcode.encode(&mut out);
            assert_eq!(hex::encode(&out), wire);
            assert_eq!(Opcode::decode(&out).unwrap(), (opcode, out.len()));
        }
        assert!(Opcode::decode(&[0x7F]).is_err());
        assert!(Opcode::decode(&[0x82]).is_err());
        assert!(Opcode::decode(&[0xC1, 0x59]).is_err());
    }

    #[test]
    fn test_access_pdu_size_limit() {
        let opcode = Opcode::new(0x8201).unwrap();
        assert!(AccessPdu::new(opcode, vec![0; 378]).is_ok());
        assert!(matches!(AccessPdu::new(opcode, vec![0; 379]), Err(MeshError::Encoding(_))));
    }

    #[test]
    fn test_registry_known_unknown_malformed() {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>();

        let known = registry
            .decode(&AccessPdu::decode(&[0x82, 0x01, 0x07]).unwrap())
            .unwrap();
        assert_eq!(known.downcast_ref::<Ping>(), Some(&Ping(7)));

        let unknown = registry.decode(&AccessPdu::decode(&[0x82, 0x02, 0x07]).unwrap()).unwrap();
        assert!(matches!(unknown, DecodedMessage::Unknown { .. }));
        assert_eq!(unknown.opcode(), Opcode::new(0x8202).unwrap());

        let malformed = registry.decode(&AccessPdu::decode(&[0x82, 0x01]).unwrap());
        assert!(matches!(malformed, Err(MeshError::InvalidPdu(_))));
    }
}
