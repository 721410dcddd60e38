use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties};

/// 增强认证报文，只做编解码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub reason_code: AuthReasonCode,
    pub properties: Properties,
}

impl Auth {
    fn len(&self) -> usize {
        if self.reason_code == AuthReasonCode::Success && self.properties.is_empty() {
            return 0;
        }
        1 + self.properties.block_len()
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let reason_code = if stream.has_remaining() {
            packet::read_u8(stream)?.try_into()?
        } else {
            AuthReasonCode::Success
        };
        let properties = if stream.has_remaining() {
            Properties::read(stream, properties::AUTH)?
        } else {
            Properties::default()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0xF0);
        let len = self.len();
        packet::write_remaining_length(stream, len)?;
        if len > 0 {
            stream.put_u8(self.reason_code as u8);
            self.properties.write(stream, properties::AUTH)?;
        }
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReasonCode {
    Success = 0x00,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,
}

impl TryFrom<u8> for AuthReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AuthReasonCode::Success),
            0x18 => Ok(AuthReasonCode::ContinueAuthentication),
            0x19 => Ok(AuthReasonCode::ReAuthenticate),
            num => Err(Error::InvalidReasonCode(num)),
        }
    }
}
