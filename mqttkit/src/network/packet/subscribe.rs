use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::network::packet::{self, properties, Error, Properties, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

impl Subscribe {
    pub fn new(packet_id: u16, filter: impl Into<String>) -> Self {
        Self {
            packet_id,
            filters: vec![SubscribeFilter::new(filter)],
            properties: Properties::default(),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.properties.block_len();
        for filter in &self.filters {
            len += 2 + filter.path.len() + 1;
        }
        len
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_packet_id(stream)?;
        let properties = Properties::read(stream, properties::SUBSCRIBE)?;

        let mut filters = Vec::new();
        while stream.has_remaining() {
            let path = packet::read_string(stream)?;
            let options = packet::read_u8(stream)?;
            filters.push(SubscribeFilter::read(path, options)?);
        }
        // 至少包含一个订阅
        if filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x82);
        packet::write_remaining_length(stream, self.len())?;

        stream.put_u16(self.packet_id);
        self.properties.write(stream, properties::SUBSCRIBE)?;
        for filter in &self.filters {
            packet::write_string(stream, &filter.path)?;
            stream.put_u8(filter.options());
        }
        Ok(())
    }
}

/// 订阅过滤器与订阅选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
    pub no_local: bool,
    pub preserve_retain: bool,
    pub retain_forward_rule: RetainForwardRule,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            qos: QoS::AtMostOnce,
            no_local: false,
            preserve_retain: false,
            retain_forward_rule: RetainForwardRule::OnEverySubscribe,
        }
    }

    fn read(path: String, options: u8) -> Result<Self, Error> {
        // 高两位保留
        if options & 0xC0 != 0 {
            return Err(Error::MalformedPacket);
        }
        let retain_forward_rule = match (options >> 4) & 0x03 {
            0 => RetainForwardRule::OnEverySubscribe,
            1 => RetainForwardRule::OnNewSubscribe,
            2 => RetainForwardRule::Never,
            _ => return Err(Error::MalformedPacket),
        };

        Ok(Self {
            path,
            qos: QoS::try_from(options & 0x03)?,
            no_local: options & 0x04 != 0,
            preserve_retain: options & 0x08 != 0,
            retain_forward_rule,
        })
    }

    fn options(&self) -> u8 {
        let mut options = self.qos as u8;
        if self.no_local {
            options |= 0x04;
        }
        if self.preserve_retain {
            options |= 0x08;
        }
        options | (self.retain_forward_rule as u8) << 4
    }
}

/// 保留消息转发规则
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainForwardRule {
    #[default]
    OnEverySubscribe = 0,
    OnNewSubscribe = 1,
    Never = 2,
}
