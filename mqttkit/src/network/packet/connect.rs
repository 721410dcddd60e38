use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties, QoS};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    /// keepalive 时长，单位秒，0 表示关闭
    pub keep_alive: u16,
    /// 客户端id
    pub client_id: String,
    /// 是否清除会话
    pub clean_start: bool,
    /// 遗嘱消息
    pub last_will: Option<LastWill>,
    /// 登录凭证
    pub username: Option<String>,
    pub password: Option<Bytes>,
    /// 属性
    pub properties: Properties,
}

impl Connect {
    fn len(&self) -> usize {
        // 协议名 + 协议版本 + 连接标志 + keepalive
        let mut len = 2 + packet::PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += self.properties.block_len();
        len += 2 + self.client_id.len();
        if let Some(will) = &self.last_will {
            len += will.len();
        }
        if let Some(username) = &self.username {
            len += 2 + username.len();
        }
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }
        len
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_start {
            flags |= 0x02;
        }
        if let Some(will) = &self.last_will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let protocol_name = packet::read_string(stream)?;
        if protocol_name != packet::PROTOCOL_NAME {
            return Err(Error::InvalidProtocol);
        }
        let protocol_level = packet::read_u8(stream)?;
        if protocol_level != packet::PROTOCOL_LEVEL {
            return Err(Error::InvalidProtocolLevel(protocol_level));
        }

        let connect_flags = packet::read_u8(stream)?;
        // 保留位必须为 0
        if connect_flags & 0x01 != 0 {
            return Err(Error::MalformedPacket);
        }
        let clean_start = (connect_flags & 0x02) != 0;
        let keep_alive = packet::read_u16(stream)?;

        let properties = Properties::read(stream, properties::CONNECT)?;
        let client_id = packet::read_string(stream)?;

        let last_will = if connect_flags & 0x04 != 0 {
            let qos = QoS::try_from((connect_flags >> 3) & 0x03)?;
            let retain = (connect_flags & 0x20) != 0;
            Some(LastWill::read(qos, retain, stream)?)
        } else {
            // 没有遗嘱时遗嘱 QoS 与 retain 必须为 0
            if connect_flags & 0x38 != 0 {
                return Err(Error::MalformedPacket);
            }
            None
        };

        let username = if connect_flags & 0x80 != 0 {
            Some(packet::read_string(stream)?)
        } else {
            None
        };
        let password = if connect_flags & 0x40 != 0 {
            Some(packet::read_bytes(stream)?)
        } else {
            None
        };

        Ok(Self {
            keep_alive,
            client_id,
            clean_start,
            last_will,
            username,
            password,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x10);
        packet::write_remaining_length(stream, self.len())?;

        packet::write_string(stream, packet::PROTOCOL_NAME)?;
        stream.put_u8(packet::PROTOCOL_LEVEL);
        stream.put_u8(self.flags());
        stream.put_u16(self.keep_alive);
        self.properties.write(stream, properties::CONNECT)?;
        packet::write_string(stream, &self.client_id)?;

        if let Some(will) = &self.last_will {
            will.write(stream)?;
        }
        if let Some(username) = &self.username {
            packet::write_string(stream, username)?;
        }
        if let Some(password) = &self.password {
            packet::write_bytes(stream, password)?;
        }
        Ok(())
    }
}

/// 遗嘱消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl LastWill {
    fn len(&self) -> usize {
        self.properties.block_len() + 2 + self.topic.len() + 2 + self.payload.len()
    }

    fn read(qos: QoS, retain: bool, stream: &mut Bytes) -> Result<Self, Error> {
        let properties = Properties::read(stream, properties::WILL)?;
        let topic = packet::read_string(stream)?;
        let payload = packet::read_bytes(stream)?;
        Ok(Self {
            topic,
            payload,
            qos,
            retain,
            properties,
        })
    }

    fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        self.properties.write(stream, properties::WILL)?;
        packet::write_string(stream, &self.topic)?;
        packet::write_bytes(stream, &self.payload)
    }
}
