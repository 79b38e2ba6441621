//! Bluetooth Mesh addresses and their classification

use crate::crypto;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use uuid::Uuid;

/// Class of a 16-bit mesh address, a pure function of its bit pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// 0b0000000000000000
    Unassigned,
    /// 0b0xxxxxxxxxxxxxxx except zero
    Unicast,
    /// 0b10xxxxxxxxxxxxxx
    Virtual,
    /// 0b11xxxxxxxxxxxxxx outside the reserved range
    Group,
    /// 0xFF00..=0xFFFB, reserved for future use
    Invalid,
}

/// A 16-bit mesh address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u16);

impl Address {
    pub const UNASSIGNED: Address = Address(0x0000);
    pub const MIN_UNICAST: Address = Address(0x0001);
    pub const MAX_UNICAST: Address = Address(0x7FFF);
    pub const MIN_VIRTUAL: Address = Address(0x8000);
    pub const MAX_VIRTUAL: Address = Address(0xBFFF);
    pub const MIN_GROUP: Address = Address(0xC000);
    pub const MAX_GROUP: Address = Address(0xFEFF);

    pub const ALL_PROXIES: Address = Address(0xFFFC);
    pub const ALL_FRIENDS: Address = Address(0xFFFD);
    pub const ALL_RELAYS: Address = Address(0xFFFE);
    pub const ALL_NODES: Address = Address(0xFFFF);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Classify the address.
    pub const fn classify(self) -> AddressKind {
        let value = self.0;
        if value == 0x0000 {
            AddressKind::Unassigned
        } else if value & 0x8000 == 0x0000 {
            AddressKind::Unicast
        } else if value & 0xC000 == 0x8000 {
            AddressKind::Virtual
        } else if value >= 0xFF00 && value <= 0xFFFB {
            AddressKind::Invalid
        } else {
            AddressKind::Group
        }
    }

    /// Returns true if the address is outside the reserved range.
    pub const fn is_valid(self) -> bool {
        self.0 < 0xFF00 || self.0 > 0xFFFB
    }

    pub const fn is_unassigned(self) -> bool {
        self.0 == 0x0000
    }

    pub const fn is_unicast(self) -> bool {
        self.0 & 0x8000 == 0x0000 && !self.is_unassigned()
    }

    pub const fn is_virtual(self) -> bool {
        self.0 & 0xC000 == 0x8000
    }

    /// Group addresses include the fixed groups 0xFFFC..=0xFFFF.
    pub const fn is_group(self) -> bool {
        self.0 & 0xC000 == 0xC000 && self.is_valid()
    }

    pub const fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub const fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Address> for u16 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl PartialEq<u16> for Address {
    fn eq(&self, other: &u16) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u16> for Address {
    fn partial_cmp(&self, other: &u16) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl BitAnd<u16> for Address {
    type Output = Address;

    fn bitand(self, rhs: u16) -> Address {
        Address(self.0 & rhs)
    }
}

impl BitOr<u16> for Address {
    type Output = Address;

    fn bitor(self, rhs: u16) -> Address {
        Address(self.0 | rhs)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04X}", self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressVisitor;

        impl Visitor<'_> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 4-character hexadecimal string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Address, E> {
                if value.len() != 4 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(E::invalid_value(de::Unexpected::Str(value), &self));
                }
                u16::from_str_radix(value, 16)
                    .map(Address)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(AddressVisitor)
    }
}

/// A destination address, carrying the Label UUID when it is virtual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAddress {
    pub address: Address,
    pub label: Option<Uuid>,
}

impl MeshAddress {
    pub fn new(address: Address) -> Self {
        Self { address, label: None }
    }

    /// Virtual address derived from a Label UUID.
    pub fn from_label(label: Uuid) -> Self {
        Self {
            address: crypto::virtual_address(&label),
            label: Some(label),
        }
    }

    pub fn kind(&self) -> AddressKind {
        self.address.classify()
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{} ({})", self.address, label),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_partitions_address_space() {
        let mut counts = [0u32; 5];
        for value in 0..=u16::MAX {
            let address = Address::new(value);
            let index = match address.classify() {
                AddressKind::Unassigned => 0,
                AddressKind::Unicast => 1,
                AddressKind::Virtual => 2,
                AddressKind::Group => 3,
                AddressKind::Invalid => 4,
            };
            counts[index] += 1;

            // Helpers agree with the classification, and at most one holds
            let flags = [
                address.is_unassigned(),
                address.is_unicast(),
                address.is_virtual(),
                address.is_group(),
                !address.is_valid(),
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "overlap at {}", address);
            assert!(flags[index], "helper mismatch at {}", address);
        }

        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 0x7FFF);
        assert_eq!(counts[2], 0x4000);
        assert_eq!(counts[3], 0x3F00 + 4);
        assert_eq!(counts[4], 0xFC);
        assert_eq!(counts.iter().sum::<u32>(), 0x10000);
    }

    #[test]
    fn test_range_boundaries() {
        assert_eq!(Address::UNASSIGNED.classify(), AddressKind::Unassigned);
        assert_eq!(Address::MIN_UNICAST.classify(), AddressKind::Unicast);
        assert_eq!(Address::MAX_UNICAST.classify(), AddressKind::Unicast);
        assert_eq!(Address::MIN_VIRTUAL.classify(), AddressKind::Virtual);
        assert_eq!(Address::MAX_VIRTUAL.classify(), AddressKind::Virtual);
        assert_eq!(Address::MIN_GROUP.classify(), AddressKind::Group);
        assert_eq!(Address::MAX_GROUP.classify(), AddressKind::Group);
        assert_eq!(Address::new(0xFF00).classify(), AddressKind::Invalid);
        assert_eq!(Address::new(0xFFFB).classify(), AddressKind::Invalid);
        assert_eq!(Address::ALL_PROXIES.classify(), AddressKind::Group);
        assert_eq!(Address::ALL_NODES.classify(), AddressKind::Group);
    }

    #[test]
    fn test_bitwise_operations_are_values() {
        let address = Address::new(0x1234);
        assert_eq!(address & 0x00FF, Address::new(0x0034));
        assert_eq!(address | 0xC000, Address::new(0xD234));
        // The original is untouched
        assert_eq!(address, 0x1234u16);
        assert!(address < 0x2000u16);
    }

    #[test]
    fn test_serde_hex_string() {
        let json = serde_json::to_string(&Address::new(0x0A1f)).unwrap();
        assert_eq!(json, "\"0A1F\"");

        let parsed: Address = serde_json::from_str("\"c001\"").unwrap();
        assert_eq!(parsed, Address::new(0xC001));

        assert!(serde_json::from_str::<Address>("\"12345\"").is_err());
        assert!(serde_json::from_str::<Address>("\"XYZ1\"").is_err());
        assert!(serde_json::from_str::<Address>("4660").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new(0x10).to_string(), "0x0010");
    }

    #[test]
    fn test_virtual_address_from_label() {
        let label = Uuid::new_v4();
        let address = MeshAddress::from_label(label);
        assert!(address.address.is_virtual());
        assert_eq!(address.label, Some(label));
        // Derivation is deterministic
        assert_eq!(MeshAddress::from_label(label), address);
    }
}
