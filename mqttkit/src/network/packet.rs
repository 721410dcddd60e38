//! MQTT 5.0 报文编解码

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use self::{
    auth::{Auth, AuthReasonCode},
    connack::{ConnAck, ConnectReasonCode},
    connect::{Connect, LastWill},
    disconnect::{Disconnect, DisconnectReasonCode},
    properties::{Properties, PropertyType},
    puback::{
        PubAck, PubAckReason, PubComp, PubRec, PubRel, PubRelReason, PubResponse, ReasonCode,
    },
    publish::Publish,
    suback::{SubAck, SubscribeReasonCode},
    subscribe::{RetainForwardRule, Subscribe, SubscribeFilter},
    unsuback::{UnsubAck, UnsubscribeReasonCode},
    unsubscribe::Unsubscribe,
};

mod auth;
mod connack;
mod connect;
mod disconnect;
mod properties;
mod puback;
mod publish;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

/// 剩余长度字段能表示的最大值
pub const PAYLOAD_MAX_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // 编码错误
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("String or binary field too long: {0} bytes")]
    StringTooLong(usize),
    #[error("Property {0:?} not allowed in this packet")]
    PropertyNotAllowed(PropertyType),
    #[error("Miss packet id")]
    MissPacketId,

    // 解码错误
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Reserved flags set for packet type {0:?}")]
    ReservedFlags(PacketType),
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Payload required")]
    PayloadRequired,
    #[error("Invalid property type: {0}")]
    UnexpectedPropertyType(u8),
    #[error("Duplicate property: {0:?}")]
    DuplicateProperty(PropertyType),
    #[error("Invalid reason code: {0}")]
    InvalidReasonCode(u8),
}

impl Error {
    /// 是否是编码方向的错误
    pub fn is_encode(&self) -> bool {
        matches!(
            self,
            Error::PayloadTooLarge
                | Error::StringTooLong(_)
                | Error::PropertyNotAllowed(_)
                | Error::MissPacketId
        )
    }
}

/// 报文类型
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
    Auth,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            num => return Err(Error::InvalidPacketType(num)),
        };
        Ok(packet_type)
    }
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

/// 固定头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    byte1: u8,
    /// 固定头长度：1 字节类型标志 + 剩余长度字段
    fixed_header_len: usize,
    remaining_len: usize,
}

impl FixedHeader {
    pub fn read_from(stream: &[u8]) -> Result<Self, Error> {
        let byte1 = match stream.first() {
            Some(byte1) => *byte1,
            None => return Err(Error::InsufficientBytes(2)),
        };
        let (len_len, remaining_len) = length(stream[1..].iter())?;
        Ok(Self {
            byte1,
            fixed_header_len: 1 + len_len,
            remaining_len,
        })
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        (self.byte1 >> 4).try_into()
    }

    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    pub fn packet_len(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// 从缓冲区中读取一个完整报文，成功时从缓冲区中移除对应字节
    ///
    /// 数据不足时返回 [`Error::InsufficientBytes`]，缓冲区保持不变
    pub fn read(stream: &mut BytesMut) -> Result<Self, Error> {
        let fixed_header = FixedHeader::read_from(stream)?;
        let packet_type = fixed_header.packet_type()?;

        let packet_len = fixed_header.packet_len();
        if stream.len() < packet_len {
            return Err(Error::InsufficientBytes(packet_len - stream.len()));
        }

        // 校验保留标志位
        let flags = fixed_header.flags();
        let expected_flags = match packet_type {
            PacketType::Publish => flags,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        };
        if flags != expected_flags {
            stream.advance(packet_len);
            return Err(Error::ReservedFlags(packet_type));
        }

        let mut body = stream.split_to(packet_len).freeze();
        body.advance(fixed_header.fixed_header_len);

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut body)?),
            PacketType::Publish => Packet::Publish(Publish::read(flags, &mut body)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(&mut body)?),
            PacketType::PubRec => Packet::PubRec(PubRec::read(&mut body)?),
            PacketType::PubRel => Packet::PubRel(PubRel::read(&mut body)?),
            PacketType::PubComp => Packet::PubComp(PubComp::read(&mut body)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(&mut body)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::read(&mut body)?),
            PacketType::Auth => Packet::Auth(Auth::read(&mut body)?),
        };

        // 剩余长度必须被完整消费
        if body.has_remaining() {
            return Err(Error::MalformedPacket);
        }

        Ok(packet)
    }

    /// 写入一个完整报文，失败时缓冲区回退到写入前的状态
    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let start = stream.len();
        let res = match self {
            Packet::Connect(connect) => connect.write(stream),
            Packet::ConnAck(connack) => connack.write(stream),
            Packet::Publish(publish) => publish.write(stream),
            Packet::PubAck(puback) => puback.write(PacketType::PubAck, stream),
            Packet::PubRec(pubrec) => pubrec.write(PacketType::PubRec, stream),
            Packet::PubRel(pubrel) => pubrel.write(PacketType::PubRel, stream),
            Packet::PubComp(pubcomp) => pubcomp.write(PacketType::PubComp, stream),
            Packet::Subscribe(subscribe) => subscribe.write(stream),
            Packet::SubAck(suback) => suback.write(stream),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(stream),
            Packet::UnsubAck(unsuback) => unsuback.write(stream),
            Packet::PingReq => {
                stream.put_slice(&[0xC0, 0x00]);
                Ok(())
            }
            Packet::PingResp => {
                stream.put_slice(&[0xD0, 0x00]);
                Ok(())
            }
            Packet::Disconnect(disconnect) => disconnect.write(stream),
            Packet::Auth(auth) => auth.write(stream),
        };
        if res.is_err() {
            stream.truncate(start);
        }
        res
    }
}

/// 把报文编码成字节
pub fn encode(packet: &Packet) -> Result<Bytes, Error> {
    let mut stream = BytesMut::new();
    packet.write(&mut stream)?;
    Ok(stream.freeze())
}

/// 从字节中解码一个报文，返回报文与消费的字节数
pub fn decode(bytes: &[u8]) -> Result<(Packet, usize), Error> {
    let mut stream = BytesMut::from(bytes);
    let packet = Packet::read(&mut stream)?;
    Ok((packet, bytes.len() - stream.len()))
}

/// 解析变长整数，返回 (字段长度, 值)
pub(crate) fn length<'a>(stream: impl Iterator<Item = &'a u8>) -> Result<(usize, usize), Error> {
    let mut len: usize = 0;
    let mut len_len = 0;
    let mut shift = 0;

    for byte in stream {
        len_len += 1;
        len += ((byte & 0x7F) as usize) << shift;

        if byte & 0x80 == 0 {
            return Ok((len_len, len));
        }

        // 最多 4 个字节
        if len_len == 4 {
            return Err(Error::MalformedRemainingLength);
        }
        shift += 7;
    }

    Err(Error::InsufficientBytes(1))
}

/// 变长整数编码后占用的字节数
pub(crate) fn len_len(len: usize) -> usize {
    if len >= 2_097_152 {
        4
    } else if len >= 16_384 {
        3
    } else if len >= 128 {
        2
    } else {
        1
    }
}

/// 报文内部的变长整数，数据不足即为格式错误
fn read_varint(stream: &mut Bytes) -> Result<usize, Error> {
    let (len_len, value) = match length(stream.iter()) {
        Ok(v) => v,
        Err(Error::InsufficientBytes(_)) => return Err(Error::MalformedPacket),
        Err(e) => return Err(e),
    };
    stream.advance(len_len);
    Ok(value)
}

/// 读取多个字节
fn read_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    // 后续可取出的字节的长度
    let len = read_u16(stream)? as usize;

    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.split_to(len))
}

fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_bytes(stream)?;
    match String::from_utf8(s.to_vec()) {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::MalformedString),
    }
}

fn read_u32(stream: &mut Bytes) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u32())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

/// 报文标识符不能为 0
fn read_packet_id(stream: &mut Bytes) -> Result<u16, Error> {
    match read_u16(stream)? {
        0 => Err(Error::MalformedPacket),
        packet_id => Ok(packet_id),
    }
}

pub(crate) fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > PAYLOAD_MAX_LENGTH {
        return Err(Error::PayloadTooLarge);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

fn write_bytes(stream: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::StringTooLong(bytes.len()));
    }
    stream.put_u16(bytes.len() as u16);
    stream.extend_from_slice(bytes);
    Ok(())
}

fn write_string(stream: &mut BytesMut, string: &str) -> Result<(), Error> {
    write_bytes(stream, string.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(value: usize) -> BytesMut {
        let mut stream = BytesMut::new();
        write_remaining_length(&mut stream, value).unwrap();
        stream
    }

    #[test]
    fn remaining_length_sizes() {
        let cases = [
            (0, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
        ];
        for (value, size) in cases {
            let stream = varint(value);
            assert_eq!(stream.len(), size, "value {}", value);
            assert_eq!(len_len(value), size);
            assert_eq!(length(stream.iter()).unwrap(), (size, value));
        }
    }

    #[test]
    fn remaining_length_too_large() {
        let mut stream = BytesMut::new();
        assert_eq!(
            write_remaining_length(&mut stream, PAYLOAD_MAX_LENGTH + 1),
            Err(Error::PayloadTooLarge)
        );
    }

    #[test]
    fn remaining_length_five_bytes() {
        let stream = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            length(stream.iter()),
            Err(Error::MalformedRemainingLength)
        );
        assert_eq!(
            decode(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err(),
            Error::MalformedRemainingLength
        );
    }

    #[test]
    fn incomplete_packet() {
        assert!(matches!(decode(&[]), Err(Error::InsufficientBytes(_))));
        assert!(matches!(decode(&[0x30]), Err(Error::InsufficientBytes(_))));
        assert!(matches!(
            decode(&[0x30, 0x05, 0x00]),
            Err(Error::InsufficientBytes(_))
        ));
    }

    #[test]
    fn packet_type_zero() {
        assert_eq!(decode(&[0x00, 0x00]).unwrap_err(), Error::InvalidPacketType(0));
    }

    #[test]
    fn reserved_flags() {
        // PINGREQ 带标志位
        assert_eq!(
            decode(&[0xC1, 0x00]).unwrap_err(),
            Error::ReservedFlags(PacketType::PingReq)
        );
        // SUBSCRIBE 标志位必须是 0b0010
        assert_eq!(
            decode(&[0x80, 0x00]).unwrap_err(),
            Error::ReservedFlags(PacketType::Subscribe)
        );
    }

    #[test]
    fn ping() {
        assert_eq!(encode(&Packet::PingReq).unwrap().as_ref(), b"\xc0\x00");
        assert_eq!(encode(&Packet::PingResp).unwrap().as_ref(), b"\xd0\x00");
        assert_eq!(decode(b"\xc0\x00").unwrap(), (Packet::PingReq, 2));
        assert_eq!(decode(b"\xd0\x00").unwrap(), (Packet::PingResp, 2));
        assert_eq!(
            decode(b"\xd0\x01\x00").unwrap_err(),
            Error::MalformedPacket
        );
    }

    #[test]
    fn trailing_bytes_in_body() {
        // 原因码 + 空属性后多出一个字节
        assert_eq!(
            decode(b"\xe0\x03\x00\x00\x00").unwrap_err(),
            Error::MalformedPacket
        );
    }

    #[test]
    fn decode_leaves_following_bytes() {
        let (packet, consumed) = decode(b"\xc0\x00\xd0\x00").unwrap();
        assert_eq!(packet, Packet::PingReq);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn read_consumes_buffer() {
        let mut stream = BytesMut::from(&b"\xc0\x00\xd0"[..]);
        assert_eq!(Packet::read(&mut stream).unwrap(), Packet::PingReq);
        assert_eq!(stream.as_ref(), b"\xd0");
        assert!(matches!(
            Packet::read(&mut stream),
            Err(Error::InsufficientBytes(_))
        ));
        assert_eq!(stream.as_ref(), b"\xd0");
    }

    #[test]
    fn error_direction() {
        assert!(Error::PayloadTooLarge.is_encode());
        assert!(Error::StringTooLong(70_000).is_encode());
        assert!(!Error::MalformedPacket.is_encode());
        assert!(!Error::InsufficientBytes(1).is_encode());
    }

    #[test]
    fn string_too_long() {
        let mut stream = BytesMut::new();
        let long = "a".repeat(65_536);
        assert_eq!(
            write_string(&mut stream, &long),
            Err(Error::StringTooLong(65_536))
        );
    }
}
