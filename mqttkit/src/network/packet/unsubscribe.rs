use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{self, properties, Error, Properties};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub fn new(packet_id: u16, filter: impl Into<String>) -> Self {
        Self {
            packet_id,
            filters: vec![filter.into()],
            properties: Properties::default(),
        }
    }

    fn len(&self) -> usize {
        let filters_len: usize = self.filters.iter().map(|f| 2 + f.len()).sum();
        2 + self.properties.block_len() + filters_len
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_packet_id(stream)?;
        let properties = Properties::read(stream, properties::UNSUBSCRIBE)?;

        let mut filters = Vec::new();
        while stream.has_remaining() {
            filters.push(packet::read_string(stream)?);
        }
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
        stream.put_u8(0xA2);
        packet::write_remaining_length(stream, self.len())?;

        stream.put_u16(self.packet_id);
        self.properties.write(stream, properties::UNSUBSCRIBE)?;
        for filter in &self.filters {
            packet::write_string(stream, filter)?;
        }
        Ok(())
    }
}
