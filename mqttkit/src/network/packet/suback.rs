use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub properties: Properties,
    /// 与 SUBSCRIBE 中的过滤器一一对应
    pub return_codes: Vec<SubscribeReasonCode>,
}

impl SubAck {
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
        stream.put_u8(0x90);
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
pub enum SubscribeReasonCode {
    GrantedQoS0 = 0,
    GrantedQoS1 = 1,
    GrantedQoS2 = 2,
    Unspecified = 128,
    ImplementationSpecific = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PkidInUse = 145,
    QuotaExceeded = 151,
    SharedSubscriptionsNotSupported = 158,
    SubscriptionIdNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

impl SubscribeReasonCode {
    /// 原因码 >= 0x80 表示订阅失败
    pub fn is_error(&self) -> bool {
        (*self as u8) >= 0x80
    }
}

impl TryFrom<u8> for SubscribeReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use SubscribeReasonCode::*;
        let code = match value {
            0 => GrantedQoS0,
            1 => GrantedQoS1,
            2 => GrantedQoS2,
            128 => Unspecified,
            131 => ImplementationSpecific,
            135 => NotAuthorized,
            143 => TopicFilterInvalid,
            145 => PkidInUse,
            151 => QuotaExceeded,
            158 => SharedSubscriptionsNotSupported,
            161 => SubscriptionIdNotSupported,
            162 => WildcardSubscriptionsNotSupported,
            num => return Err(Error::InvalidReasonCode(num)),
        };
        Ok(code)
    }
}
