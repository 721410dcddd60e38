//! PUBACK/PUBREC/PUBREL/PUBCOMP 共用同一种结构：报文标识符 + 原因码 + 属性

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, PacketType, Properties};

/// 响应报文原因码
pub trait ReasonCode: Copy + Eq + TryFrom<u8, Error = Error> {
    const SUCCESS: Self;

    fn code(self) -> u8;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubResponse<R> {
    pub packet_id: u16,
    pub reason: R,
    pub properties: Properties,
}

pub type PubAck = PubResponse<PubAckReason>;
pub type PubRec = PubResponse<PubAckReason>;
pub type PubRel = PubResponse<PubRelReason>;
pub type PubComp = PubResponse<PubRelReason>;

impl<R: ReasonCode> PubResponse<R> {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason: R::SUCCESS,
            properties: Properties::default(),
        }
    }

    fn len(&self) -> usize {
        // 成功且无属性时可以省略原因码与属性
        if self.reason == R::SUCCESS && self.properties.is_empty() {
            return 2;
        }
        2 + 1 + self.properties.block_len()
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_packet_id(stream)?;
        let reason = if stream.has_remaining() {
            R::try_from(packet::read_u8(stream)?)?
        } else {
            R::SUCCESS
        };
        let properties = if stream.has_remaining() {
            Properties::read(stream, properties::ACK)?
        } else {
            Properties::default()
        };

        Ok(Self {
            packet_id,
            reason,
            properties,
        })
    }

    pub(crate) fn write(&self, packet_type: PacketType, stream: &mut BytesMut) -> Result<(), Error> {
        let flags = match packet_type {
            PacketType::PubRel => 0b0010,
            _ => 0,
        };
        stream.put_u8((packet_type as u8) << 4 | flags);

        let len = self.len();
        packet::write_remaining_length(stream, len)?;
        stream.put_u16(self.packet_id);
        if len > 2 {
            stream.put_u8(self.reason.code());
            self.properties.write(stream, properties::ACK)?;
        }
        Ok(())
    }
}

/// PUBACK/PUBREC 原因码
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubAckReason {
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

impl TryFrom<u8> for PubAckReason {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use PubAckReason::*;
        let code = match value {
            0 => Success,
            16 => NoMatchingSubscribers,
            128 => UnspecifiedError,
            131 => ImplementationSpecificError,
            135 => NotAuthorized,
            144 => TopicNameInvalid,
            145 => PacketIdentifierInUse,
            151 => QuotaExceeded,
            153 => PayloadFormatInvalid,
            num => return Err(Error::InvalidReasonCode(num)),
        };
        Ok(code)
    }
}

impl ReasonCode for PubAckReason {
    const SUCCESS: Self = PubAckReason::Success;

    fn code(self) -> u8 {
        self as u8
    }
}

/// PUBREL/PUBCOMP 原因码
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubRelReason {
    Success = 0,
    PacketIdentifierNotFound = 146,
}

impl TryFrom<u8> for PubRelReason {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PubRelReason::Success),
            146 => Ok(PubRelReason::PacketIdentifierNotFound),
            num => Err(Error::InvalidReasonCode(num)),
        }
    }
}

impl ReasonCode for PubRelReason {
    const SUCCESS: Self = PubRelReason::Success;

    fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use crate::network::packet::{decode, encode, Packet};

    use super::*;

    #[test]
    fn short_forms() {
        let packet = Packet::PubAck(PubAck::new(5));
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.as_ref(), b"\x40\x02\x00\x05");
        assert_eq!(decode(&bytes).unwrap().0, packet);

        let packet = Packet::PubRel(PubRel::new(5));
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.as_ref(), b"\x62\x02\x00\x05");
        assert_eq!(decode(&bytes).unwrap().0, packet);
    }

    #[test]
    fn with_reason() {
        let packet = Packet::PubRec(PubRec {
            packet_id: 1,
            reason: PubAckReason::NoMatchingSubscribers,
            properties: Properties::default(),
        });
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.as_ref(), b"\x50\x04\x00\x01\x10\x00");
        assert_eq!(decode(&bytes).unwrap().0, packet);

        // 只带原因码、省略属性长度
        let (packet, _) = decode(b"\x70\x03\x00\x01\x92").unwrap();
        assert_eq!(
            packet,
            Packet::PubComp(PubComp {
                packet_id: 1,
                reason: PubRelReason::PacketIdentifierNotFound,
                properties: Properties::default(),
            })
        );
    }

    #[test]
    fn zero_packet_id() {
        assert_eq!(decode(b"\x40\x02\x00\x00").unwrap_err(), Error::MalformedPacket);
    }

    #[test]
    fn pubrel_flags() {
        assert_eq!(
            decode(b"\x60\x02\x00\x01").unwrap_err(),
            Error::ReservedFlags(PacketType::PubRel)
        );
    }
}
