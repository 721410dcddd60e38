use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub return_codes: Vec<UnsubscribeReasonCode>,
}

impl UnsubAck {
    fn len(&self) -> usize {
        2 + self.properties.block_len() + self.return_codes.len()
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_packet_id(stream)?;
        let properties = Properties::read(stream, properties::ACK)?;

        let mut return_codes = Vec::with_capacity(stream.remaining());
        while stream.has_remaining() {
            return_codes.push(packet::read_u8(stream)?.try_into()?);
        }

        Ok(Self {
            packet_id,
            properties,
            return_codes,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0xB0);
        packet::write_remaining_length(stream, self.len())?;

        stream.put_u16(self.packet_id);
        self.properties.write(stream, properties::ACK)?;
        for code in &self.return_codes {
            stream.put_u8(*code as u8);
        }
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeReasonCode {
    Success = 0,
    NoSubscriptionExisted = 17,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
}

impl UnsubscribeReasonCode {
    /// 原因码 >= 0x80 表示取消订阅失败
    pub fn is_error(&self) -> bool {
        (*self as u8) >= 0x80
    }
}

impl TryFrom<u8> for UnsubscribeReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use UnsubscribeReasonCode::*;
        let code = match value {
            0 => Success,
            17 => NoSubscriptionExisted,
            128 => UnspecifiedError,
            131 => ImplementationSpecificError,
            135 => NotAuthorized,
            143 => TopicFilterInvalid,
            145 => PacketIdentifierInUse,
            num => return Err(Error::InvalidReasonCode(num)),
        };
        Ok(code)
    }
}
