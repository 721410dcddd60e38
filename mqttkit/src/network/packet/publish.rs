use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// 使用已注册的主题别名时为空
    pub topic: String,
    /// 仅 QoS > 0 时存在
    pub packet_id: Option<u16>,
    pub properties: Properties,
    pub payload: Bytes,
}

impl Publish {
    /// QoS 0 消息
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            properties: Properties::default(),
            payload: payload.into(),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len + self.properties.block_len() + self.payload.len()
    }

    pub(crate) fn read(flags: u8, stream: &mut Bytes) -> Result<Self, Error> {
        let dup = flags & 0b1000 != 0;
        let qos = QoS::try_from((flags & 0b0110) >> 1)?;
        let retain = flags & 0b0001 != 0;
        // QoS 0 消息的 dup 必须为 0
        if dup && qos == QoS::AtMostOnce {
            return Err(Error::MalformedPacket);
        }

        let topic = packet::read_string(stream)?;
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(packet::read_packet_id(stream)?),
        };
        let properties = Properties::read(stream, properties::PUBLISH)?;
        let payload = stream.copy_to_bytes(stream.remaining());

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut byte1 = 0x30 | (self.qos as u8) << 1;
        if self.dup {
            byte1 |= 0b1000;
        }
        if self.retain {
            byte1 |= 0b0001;
        }
        stream.put_u8(byte1);
        packet::write_remaining_length(stream, self.len())?;

        packet::write_string(stream, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            match self.packet_id {
                Some(packet_id) => stream.put_u16(packet_id),
                None => return Err(Error::MissPacketId),
            }
        }
        self.properties.write(stream, properties::PUBLISH)?;
        stream.extend_from_slice(&self.payload);

        Ok(())
    }
}
