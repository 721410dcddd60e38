use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    pub fn new(code: ConnectReasonCode, session_present: bool) -> Self {
        Self {
            session_present,
            code,
            properties: Properties::default(),
        }
    }

    fn len(&self) -> usize {
        1 + 1 + self.properties.block_len()
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let flags = packet::read_u8(stream)?;
        // 除 session present 外的标志位保留
        if flags & 0xFE != 0 {
            return Err(Error::MalformedPacket);
        }
        let code = packet::read_u8(stream)?.try_into()?;
        let properties = if stream.has_remaining() {
            Properties::read(stream, properties::CONNACK)?
        } else {
            Properties::default()
        };

        Ok(Self {
            session_present: flags & 0x01 != 0,
            code,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x20);

        packet::write_remaining_length(stream, self.len())?;
        stream.put_u8(self.session_present as u8);
        stream.put_u8(self.code as u8);
        self.properties.write(stream, properties::CONNACK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReasonCode {
    Success = 0,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    UnsupportedProtocolVersion = 132,
    ClientIdentifierNotValid = 133,
    BadUserNamePassword = 134,
    NotAuthorized = 135,
    ServerUnavailable = 136,
    ServerBusy = 137,
    Banned = 138,
    BadAuthenticationMethod = 140,
    TopicNameInvalid = 144,
    PacketTooLarge = 149,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QoSNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    ConnectionRateExceeded = 159,
}

impl TryFrom<u8> for ConnectReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ConnectReasonCode::*;
        let code = match value {
            0 => Success,
            128 => UnspecifiedError,
            129 => MalformedPacket,
            130 => ProtocolError,
            131 => ImplementationSpecificError,
            132 => UnsupportedProtocolVersion,
            133 => ClientIdentifierNotValid,
            134 => BadUserNamePassword,
            135 => NotAuthorized,
            136 => ServerUnavailable,
            137 => ServerBusy,
            138 => Banned,
            140 => BadAuthenticationMethod,
            144 => TopicNameInvalid,
            149 => PacketTooLarge,
            151 => QuotaExceeded,
            153 => PayloadFormatInvalid,
            154 => RetainNotSupported,
            155 => QoSNotSupported,
            156 => UseAnotherServer,
            157 => ServerMoved,
            159 => ConnectionRateExceeded,
            num => return Err(Error::InvalidReasonCode(num)),
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use crate::network::packet::{decode, encode, Packet};

    use super::*;

    #[test]
    fn success() {
        let packet = Packet::ConnAck(ConnAck::new(ConnectReasonCode::Success, false));
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.as_ref(), b"\x20\x03\x00\x00\x00");
        assert_eq!(decode(&bytes).unwrap(), (packet, 5));
    }

    #[test]
    fn with_topic_alias_maximum() {
        let (packet, _) = decode(b"\x20\x06\x01\x00\x03\x22\x00\x05").unwrap();
        let Packet::ConnAck(connack) = packet else {
            panic!("not a CONNACK: {:?}", packet);
        };
        assert!(connack.session_present);
        assert_eq!(connack.code, ConnectReasonCode::Success);
        assert_eq!(connack.properties.topic_alias_maximum, Some(5));
    }

    #[test]
    fn rejected() {
        let (packet, _) = decode(b"\x20\x03\x00\x87\x00").unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAck::new(ConnectReasonCode::NotAuthorized, false))
        );
    }

    #[test]
    fn unknown_reason_code() {
        assert_eq!(
            decode(b"\x20\x03\x00\x01\x00").unwrap_err(),
            Error::InvalidReasonCode(1)
        );
    }

    #[test]
    fn reserved_ack_flags() {
        assert_eq!(
            decode(b"\x20\x03\x02\x00\x00").unwrap_err(),
            Error::MalformedPacket
        );
    }
}
