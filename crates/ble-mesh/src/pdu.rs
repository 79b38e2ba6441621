//! Network and lower transport wire formats

use crate::address::Address;
use crate::error::{MeshError, MeshResult};

/// Largest upper transport PDU carried in a single unsegmented access message
pub const MAX_UNSEGMENTED_ACCESS_PDU: usize = 15;

/// Segment payload of a segmented access message
pub const ACCESS_SEGMENT_SIZE: usize = 12;

/// Segment payload of a segmented control message
pub const CONTROL_SEGMENT_SIZE: usize = 8;

/// Maximum number of segments in one transaction
pub const MAX_SEGMENTS: usize = 32;

/// Largest upper transport PDU (32 segments of 12 bytes)
pub const MAX_UPPER_TRANSPORT_PDU: usize = MAX_SEGMENTS * ACCESS_SEGMENT_SIZE;

const MAX_UNSEGMENTED_CONTROL_PARAMETERS: usize = 11;
const SEGMENT_ACK_OPCODE: u8 = 0x00;
const SEQ_ZERO_MASK: u16 = 0x1FFF;

/// A decrypted, deobfuscated Network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    pub nid: u8,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: Address,
    pub dst: Address,
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    /// IVI bit and NID of a raw network PDU, readable before decryption.
    pub fn peek_ivi_nid(data: &[u8]) -> Option<(u8, u8)> {
        data.first().map(|byte| (byte >> 7, byte & 0x7F))
    }
}

/// Key used to secure an access message: AKF=0 is the device key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKeyId {
    Device,
    Application { aid: u8 },
}

impl AccessKeyId {
    fn header_bits(self) -> u8 {
        match self {
            AccessKeyId::Device => 0x00,
            AccessKeyId::Application { aid } => 0x40 | (aid & 0x3F),
        }
    }

    fn from_header(byte: u8) -> Self {
        if byte & 0x40 != 0 {
            AccessKeyId::Application { aid: byte & 0x3F }
        } else {
            AccessKeyId::Device
        }
    }
}

/// Segmentation fields shared by segmented access and control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// For access messages: 64-bit TransMIC. Always false for control messages.
    pub szmic: bool,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; 3] {
        let value: u32 = (u32::from(self.szmic) << 23)
            | (u32::from(self.seq_zero & SEQ_ZERO_MASK) << 10)
            | (u32::from(self.seg_o & 0x1F) << 5)
            | u32::from(self.seg_n & 0x1F);
        let bytes = value.to_be_bytes();
        [bytes[1], bytes[2], bytes[3]]
    }

    fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let header = Self {
            szmic: value & 0x80_0000 != 0,
            seq_zero: ((value >> 10) as u16) & SEQ_ZERO_MASK,
            seg_o: ((value >> 5) & 0x1F) as u8,
            seg_n: (value & 0x1F) as u8,
        };
        if header.seg_o > header.seg_n {
            return Err(MeshError::InvalidPdu(format!(
                "SegO {} exceeds SegN {}",
                header.seg_o, header.seg_n
            )));
        }
        Ok(header)
    }
}

/// Segment Acknowledgment control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Sent by a friend on behalf of a low power node
    pub obo: bool,
    pub seq_zero: u16,
    pub block_ack: u32,
}

impl SegmentAck {
    pub fn new(seq_zero: u16, block_ack: u32) -> Self {
        Self {
            obo: false,
            seq_zero: seq_zero & SEQ_ZERO_MASK,
            block_ack,
        }
    }

    /// True if segment `seg_o` has been received.
    pub fn acknowledges(&self, seg_o: u8) -> bool {
        seg_o < 32 && self.block_ack & (1 << seg_o) != 0
    }

    /// An empty block means the receiver cannot accept the transaction.
    pub fn is_busy(&self) -> bool {
        self.block_ack == 0
    }

    fn encode_parameters(&self) -> [u8; 6] {
        let first = (u16::from(self.obo) << 15) | ((self.seq_zero & SEQ_ZERO_MASK) << 2);
        let mut out = [0u8; 6];
        out[0..2].copy_from_slice(&first.to_be_bytes());
        out[2..6].copy_from_slice(&self.block_ack.to_be_bytes());
        out
    }

    fn decode_parameters(parameters: &[u8]) -> MeshResult<Self> {
        if parameters.len() != 6 {
            return Err(MeshError::InvalidPdu(format!(
                "segment acknowledgment with {} parameter bytes",
                parameters.len()
            )));
        }
        let first = u16::from_be_bytes([parameters[0], parameters[1]]);
        Ok(Self {
            obo: first & 0x8000 != 0,
            seq_zero: (first >> 2) & SEQ_ZERO_MASK,
            block_ack: u32::from_be_bytes([
                parameters[2],
                parameters[3],
                parameters[4],
                parameters[5],
            ]),
        })
    }
}

/// A lower transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    UnsegmentedAccess {
        key: AccessKeyId,
        upper_pdu: Vec<u8>,
    },
    SegmentedAccess {
        key: AccessKeyId,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    UnsegmentedControl {
        opcode: u8,
        parameters: Vec<u8>,
    },
    SegmentedControl {
        opcode: u8,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    SegmentAck(SegmentAck),
}

impl LowerTransportPdu {
    /// Parse the transport PDU of a network PDU with the given CTL bit.
    pub fn decode(ctl: bool, data: &[u8]) -> MeshResult<Self> {
        let first = *data
            .first()
            .ok_or_else(|| MeshError::InvalidPdu("empty lower transport PDU".to_string()))?;
        let segmented = first & 0x80 != 0;

        match (ctl, segmented) {
            (false, false) => {
                let upper_pdu = &data[1..];
                // At least one byte of access payload and a 32-bit TransMIC
                if upper_pdu.len() < 5 || upper_pdu.len() > MAX_UNSEGMENTED_ACCESS_PDU {
                    return Err(MeshError::InvalidPdu(format!(
                        "unsegmented access PDU of {} bytes",
                        upper_pdu.len()
                    )));
                }
                Ok(LowerTransportPdu::UnsegmentedAccess {
                    key: AccessKeyId::from_header(first),
                    upper_pdu: upper_pdu.to_vec(),
                })
            }
            (false, true) => {
                if data.len() < 5 || data.len() > 4 + ACCESS_SEGMENT_SIZE {
                    return Err(MeshError::InvalidPdu(format!(
                        "segmented access PDU of {} bytes",
                        data.len()
                    )));
                }
                Ok(LowerTransportPdu::SegmentedAccess {
                    key: AccessKeyId::from_header(first),
                    header: SegmentHeader::decode(&data[1..4])?,
                    segment: data[4..].to_vec(),
                })
            }
            (true, false) => {
                let opcode = first & 0x7F;
                let parameters = &data[1..];
                if opcode == SEGMENT_ACK_OPCODE {
                    return SegmentAck::decode_parameters(parameters)
                        .map(LowerTransportPdu::SegmentAck);
                }
                if parameters.len() > MAX_UNSEGMENTED_CONTROL_PARAMETERS {
                    return Err(MeshError::InvalidPdu(format!(
                        "unsegmented control PDU with {} parameter bytes",
                        parameters.len()
                    )));
                }
                Ok(LowerTransportPdu::UnsegmentedControl {
                    opcode,
                    parameters: parameters.to_vec(),
                })
            }
            (true, true) => {
                if data.len() < 5 || data.len() > 4 + CONTROL_SEGMENT_SIZE {
                    return Err(MeshError::InvalidPdu(format!(
                        "segmented control PDU of {} bytes",
                        data.len()
                    )));
                }
                let mut header = SegmentHeader::decode(&data[1..4])?;
                // RFU bit in control messages
                header.szmic = false;
                Ok(LowerTransportPdu::SegmentedControl {
                    opcode: first & 0x7F,
                    header,
                    segment: data[4..].to_vec(),
                })
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LowerTransportPdu::UnsegmentedAccess { key, upper_pdu } => {
                let mut out = Vec::with_capacity(1 + upper_pdu.len());
                out.push(key.header_bits());
                out.extend_from_slice(upper_pdu);
                out
            }
            LowerTransportPdu::SegmentedAccess { key, header, segment } => {
                let mut out = Vec::with_capacity(4 + segment.len());
                out.push(0x80 | key.header_bits());
                out.extend_from_slice(&header.encode());
                out.extend_from_slice(segment);
                out
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                let mut out = Vec::with_capacity(1 + parameters.len());
                out.push(opcode & 0x7F);
                out.extend_from_slice(parameters);
                out
            }
            LowerTransportPdu::SegmentedControl { opcode, header, segment } => {
                let header = SegmentHeader { szmic: false, ..*header };
                let mut out = Vec::with_capacity(4 + segment.len());
                out.push(0x80 | (opcode & 0x7F));
                out.extend_from_slice(&header.encode());
                out.extend_from_slice(segment);
                out
            }
            LowerTransportPdu::SegmentAck(ack) => {
                let mut out = Vec::with_capacity(7);
                out.push(SEGMENT_ACK_OPCODE);
                out.extend_from_slice(&ack.encode_parameters());
                out
            }
        }
    }

    /// True for PDUs carried with CTL=1.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            LowerTransportPdu::UnsegmentedControl { .. }
                | LowerTransportPdu::SegmentedControl { .. }
                | LowerTransportPdu::SegmentAck(_)
        )
    }
}

/// Reconstruct the 24-bit SeqAuth of a transaction from a segment's SEQ and SeqZero.
///
/// Returns `None` when SeqZero lies ahead of SEQ by more than 8191, which no valid
/// segment produces.
pub fn seq_auth(seq: u32, seq_zero: u16) -> Option<u32> {
    let delta = seq.wrapping_sub(u32::from(seq_zero)) & u32::from(SEQ_ZERO_MASK);
    seq.checked_sub(delta)
}
