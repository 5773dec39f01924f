use crate::error::PacketError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sequence_number::SequenceNumber;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Display, Formatter};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x01,
    Ack = 0x02,
    Syn = 0x03,
    Fin = 0x04,
    Rst = 0x05,
}

impl Display for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PacketType::Data => "DATA",
            PacketType::Ack => "ACK",
            PacketType::Syn => "SYN",
            PacketType::Fin => "FIN",
            PacketType::Rst => "RST",
        };
        write!(f, "{}", s)
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ACK = 0x01;
        const SYN = 0x02;
        const FIN = 0x04;
        const RST = 0x08;
    }
}

/// A single protocol unit. The header is written byte by byte in network byte order:
///
/// ```ascii
///  0: version (high nibble) | packet type (low nibble)
///  1: flags
///  2: total length (u16) - header plus payload
///  4: sequence number (u32)
///  8: acknowledgement number (u32) - the next sequence number expected by the sender of this packet
/// 12: checksum (u32) over bytes 0..12 and the payload
/// 16: payload (0..1400 bytes)
/// ```
///
/// A packet is immutable once constructed: the checksum is calculated by the constructor, and
///  a decoded packet is only ever produced after its checksum was verified.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    packet_type: PacketType,
    flags: PacketFlags,
    sequence_number: SequenceNumber,
    ack_number: SequenceNumber,
    checksum: u32,
    payload: Bytes,
}

impl Packet {
    pub const PROTOCOL_VERSION: u8 = 0x01;
    pub const HEADER_SIZE: usize = 16;
    /// MTU minus IP header, UDP header and our own header
    pub const MAX_PAYLOAD_SIZE: usize = 1400;
    pub const MAX_PACKET_SIZE: usize = Self::HEADER_SIZE + Self::MAX_PAYLOAD_SIZE;

    const CHECKSUM_OFFSET: usize = 12;

    /// NB: A payload exceeding [Packet::MAX_PAYLOAD_SIZE] is silently truncated
    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        sequence_number: SequenceNumber,
        ack_number: SequenceNumber,
        payload: impl Into<Bytes>,
    ) -> Packet {
        let mut payload = payload.into();
        payload.truncate(Self::MAX_PAYLOAD_SIZE);

        let header = Self::checksummed_header(packet_type, flags, (Self::HEADER_SIZE + payload.len()).prechecked_cast(), sequence_number, ack_number);
        let checksum = checksum(&header, &payload);

        Packet {
            packet_type,
            flags,
            sequence_number,
            ack_number,
            checksum,
            payload,
        }
    }

    pub fn data(sequence_number: SequenceNumber, payload: impl Into<Bytes>) -> Packet {
        Self::new(PacketType::Data, PacketFlags::empty(), sequence_number, SequenceNumber::ZERO, payload)
    }

    pub fn ack(ack_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Ack, PacketFlags::ACK, SequenceNumber::ZERO, ack_number, Bytes::new())
    }

    pub fn syn(sequence_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Syn, PacketFlags::SYN, sequence_number, SequenceNumber::ZERO, Bytes::new())
    }

    pub fn syn_ack(sequence_number: SequenceNumber, ack_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Syn, PacketFlags::SYN | PacketFlags::ACK, sequence_number, ack_number, Bytes::new())
    }

    pub fn fin(sequence_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Fin, PacketFlags::FIN, sequence_number, SequenceNumber::ZERO, Bytes::new())
    }

    pub fn fin_ack(sequence_number: SequenceNumber, ack_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Fin, PacketFlags::FIN | PacketFlags::ACK, sequence_number, ack_number, Bytes::new())
    }

    pub fn rst(sequence_number: SequenceNumber) -> Packet {
        Self::new(PacketType::Rst, PacketFlags::RST, sequence_number, SequenceNumber::ZERO, Bytes::new())
    }

    fn checksummed_header(packet_type: PacketType, flags: PacketFlags, length: u16, sequence_number: SequenceNumber, ack_number: SequenceNumber) -> [u8; Self::CHECKSUM_OFFSET] {
        let mut header = [0u8; Self::CHECKSUM_OFFSET];
        let mut buf = &mut header[..];
        buf.put_u8((Self::PROTOCOL_VERSION << 4) | (u8::from(packet_type) & 0x0f));
        buf.put_u8(flags.bits());
        buf.put_u16(length);
        buf.put_u32(sequence_number.to_raw());
        buf.put_u32(ack_number.to_raw());
        header
    }

    pub fn version(&self) -> u8 {
        Self::PROTOCOL_VERSION
    }
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }
    pub fn ack_number(&self) -> SequenceNumber {
        self.ack_number
    }
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// total length on the wire, i.e. header plus payload
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    pub fn is_data(&self) -> bool {
        self.packet_type == PacketType::Data
    }
    pub fn is_ack(&self) -> bool {
        self.packet_type == PacketType::Ack
    }
    pub fn is_syn(&self) -> bool {
        self.packet_type == PacketType::Syn
    }
    pub fn is_fin(&self) -> bool {
        self.packet_type == PacketType::Fin
    }
    pub fn is_rst(&self) -> bool {
        self.packet_type == PacketType::Rst
    }

    pub fn has_ack(&self) -> bool {
        self.flags.contains(PacketFlags::ACK)
    }
    pub fn has_syn(&self) -> bool {
        self.flags.contains(PacketFlags::SYN)
    }
    pub fn has_fin(&self) -> bool {
        self.flags.contains(PacketFlags::FIN)
    }
    pub fn has_rst(&self) -> bool {
        self.flags.contains(PacketFlags::RST)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&Self::checksummed_header(self.packet_type, self.flags, self.len().prechecked_cast(), self.sequence_number, self.ack_number));
        buf.put_u32(self.checksum);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Checks are done in a fixed order: size bounds, version, declared length, checksum and
    ///  finally packet type. The checksum is only calculated for a length-consistent buffer.
    pub fn deser(raw: &[u8]) -> Result<Packet, PacketError> {
        if raw.len() < Self::HEADER_SIZE || raw.len() > Self::MAX_PACKET_SIZE {
            return Err(PacketError::MalformedPacket { len: raw.len() });
        }

        let mut buf = raw;
        let version_type = buf.get_u8();
        let version = version_type >> 4;
        if version != Self::PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let flags = PacketFlags::from_bits_retain(buf.get_u8());
        let length = buf.get_u16();
        let sequence_number = SequenceNumber::from_raw(buf.get_u32());
        let ack_number = SequenceNumber::from_raw(buf.get_u32());
        let declared_checksum = buf.get_u32();

        let declared_len: usize = length.safe_cast();
        if declared_len != raw.len() {
            return Err(PacketError::LengthMismatch { declared: length, actual: raw.len() });
        }

        let payload = &raw[Self::HEADER_SIZE..];
        let expected_checksum = checksum(&raw[..Self::CHECKSUM_OFFSET], payload);
        if declared_checksum != expected_checksum {
            return Err(PacketError::ChecksumMismatch { expected: expected_checksum, actual: declared_checksum });
        }

        let packet_type = PacketType::try_from(version_type & 0x0f)
            .map_err(|e| PacketError::UnknownPacketType(e.number))?;

        Ok(Packet {
            packet_type,
            flags,
            sequence_number,
            ack_number,
            checksum: declared_checksum,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let flag_names = [
            (PacketFlags::SYN, "SYN"),
            (PacketFlags::ACK, "ACK"),
            (PacketFlags::FIN, "FIN"),
            (PacketFlags::RST, "RST"),
        ]
            .iter()
            .filter(|(flag, _)| self.flags.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>();

        write!(f, "{}", self.packet_type)?;
        if !flag_names.is_empty() {
            write!(f, " [{}]", flag_names.join(","))?;
        }
        write!(f, " seq={} ack={} len={} payload={}", self.sequence_number, self.ack_number, self.len(), self.payload.len())
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}}}", self)
    }
}

/// Ones' complement style sum of big-endian 32 bit words (the last word zero-padded on the
///  right), folded to 16 bits and inverted.
fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut sum = sum_words(header) + sum_words(payload);
    while (sum >> 16) > 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u32)
}

fn sum_words(buf: &[u8]) -> u64 {
    buf.chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_be_bytes(word) as u64
        })
        .sum()
}
