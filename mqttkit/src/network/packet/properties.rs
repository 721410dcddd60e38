use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 1,
    MessageExpiryInterval = 2,
    ContentType = 3,
    ResponseTopic = 8,
    CorrelationData = 9,
    SubscriptionIdentifier = 11,
    SessionExpiryInterval = 17,
    AssignedClientIdentifier = 18,
    ServerKeepAlive = 19,
    AuthenticationMethod = 21,
    AuthenticationData = 22,
    RequestProblemInformation = 23,
    WillDelayInterval = 24,
    RequestResponseInformation = 25,
    ResponseInformation = 26,
    ServerReference = 28,
    ReasonString = 31,
    ReceiveMaximum = 33,
    TopicAliasMaximum = 34,
    TopicAlias = 35,
    MaximumQos = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifierAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

impl TryFrom<u8> for PropertyType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let property = match value {
            1 => PropertyType::PayloadFormatIndicator,
            2 => PropertyType::MessageExpiryInterval,
            3 => PropertyType::ContentType,
            8 => PropertyType::ResponseTopic,
            9 => PropertyType::CorrelationData,
            11 => PropertyType::SubscriptionIdentifier,
            17 => PropertyType::SessionExpiryInterval,
            18 => PropertyType::AssignedClientIdentifier,
            19 => PropertyType::ServerKeepAlive,
            21 => PropertyType::AuthenticationMethod,
            22 => PropertyType::AuthenticationData,
            23 => PropertyType::RequestProblemInformation,
            24 => PropertyType::WillDelayInterval,
            25 => PropertyType::RequestResponseInformation,
            26 => PropertyType::ResponseInformation,
            28 => PropertyType::ServerReference,
            31 => PropertyType::ReasonString,
            33 => PropertyType::ReceiveMaximum,
            34 => PropertyType::TopicAliasMaximum,
            35 => PropertyType::TopicAlias,
            36 => PropertyType::MaximumQos,
            37 => PropertyType::RetainAvailable,
            38 => PropertyType::UserProperty,
            39 => PropertyType::MaximumPacketSize,
            40 => PropertyType::WildcardSubscriptionAvailable,
            41 => PropertyType::SubscriptionIdentifierAvailable,
            42 => PropertyType::SharedSubscriptionAvailable,
            num => return Err(Error::UnexpectedPropertyType(num)),
        };

        Ok(property)
    }
}

use PropertyType::*;

pub(crate) const CONNECT: &[PropertyType] = &[
    SessionExpiryInterval,
    AuthenticationMethod,
    AuthenticationData,
    RequestProblemInformation,
    RequestResponseInformation,
    ReceiveMaximum,
    TopicAliasMaximum,
    UserProperty,
    MaximumPacketSize,
];

pub(crate) const WILL: &[PropertyType] = &[
    PayloadFormatIndicator,
    MessageExpiryInterval,
    ContentType,
    ResponseTopic,
    CorrelationData,
    WillDelayInterval,
    UserProperty,
];

pub(crate) const CONNACK: &[PropertyType] = &[
    SessionExpiryInterval,
    AssignedClientIdentifier,
    ServerKeepAlive,
    AuthenticationMethod,
    AuthenticationData,
    ResponseInformation,
    ServerReference,
    ReasonString,
    ReceiveMaximum,
    TopicAliasMaximum,
    MaximumQos,
    RetainAvailable,
    UserProperty,
    MaximumPacketSize,
    WildcardSubscriptionAvailable,
    SubscriptionIdentifierAvailable,
    SharedSubscriptionAvailable,
];

pub(crate) const PUBLISH: &[PropertyType] = &[
    PayloadFormatIndicator,
    MessageExpiryInterval,
    ContentType,
    ResponseTopic,
    CorrelationData,
    SubscriptionIdentifier,
    TopicAlias,
    UserProperty,
];

/// PUBACK/PUBREC/PUBREL/PUBCOMP/SUBACK/UNSUBACK
pub(crate) const ACK: &[PropertyType] = &[ReasonString, UserProperty];

pub(crate) const SUBSCRIBE: &[PropertyType] = &[SubscriptionIdentifier, UserProperty];

pub(crate) const UNSUBSCRIBE: &[PropertyType] = &[UserProperty];

pub(crate) const DISCONNECT: &[PropertyType] = &[
    SessionExpiryInterval,
    ServerReference,
    ReasonString,
    UserProperty,
];

pub(crate) const AUTH: &[PropertyType] = &[
    AuthenticationMethod,
    AuthenticationData,
    ReasonString,
    UserProperty,
];

/// 报文属性
///
/// 所有报文共用一个结构，每种报文允许出现的属性由调用方传入的白名单决定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// 可以出现多次
    pub subscription_identifiers: Vec<usize>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    /// 可以出现多次，保持顺序
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

fn set<T>(slot: &mut Option<T>, value: T, property: PropertyType) -> Result<(), Error> {
    if slot.is_some() {
        return Err(Error::DuplicateProperty(property));
    }
    *slot = Some(value);
    Ok(())
}

fn check(allowed: &[PropertyType], property: PropertyType) -> Result<(), Error> {
    if !allowed.contains(&property) {
        return Err(Error::PropertyNotAllowed(property));
    }
    Ok(())
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 属性内容长度，不含属性长度字段本身
    pub(crate) fn len(&self) -> usize {
        let mut len = 0;

        let u8s = [
            self.payload_format_indicator,
            self.request_problem_information,
            self.request_response_information,
            self.maximum_qos,
            self.retain_available,
            self.wildcard_subscription_available,
            self.subscription_identifier_available,
            self.shared_subscription_available,
        ];
        len += u8s.iter().flatten().count() * (1 + 1);

        let u16s = [
            self.server_keep_alive,
            self.receive_maximum,
            self.topic_alias_maximum,
            self.topic_alias,
        ];
        len += u16s.iter().flatten().count() * (1 + 2);

        let u32s = [
            self.message_expiry_interval,
            self.session_expiry_interval,
            self.will_delay_interval,
            self.maximum_packet_size,
        ];
        len += u32s.iter().flatten().count() * (1 + 4);

        let strings = [
            &self.content_type,
            &self.response_topic,
            &self.assigned_client_identifier,
            &self.authentication_method,
            &self.response_information,
            &self.server_reference,
            &self.reason_string,
        ];
        for s in strings.into_iter().flatten() {
            len += 1 + 2 + s.len();
        }

        for data in [&self.correlation_data, &self.authentication_data]
            .into_iter()
            .flatten()
        {
            len += 1 + 2 + data.len();
        }

        for id in &self.subscription_identifiers {
            len += 1 + super::len_len(*id);
        }

        for (key, value) in &self.user_properties {
            len += 1 + 2 + key.len() + 2 + value.len();
        }

        len
    }

    /// 属性块总长度：属性长度字段 + 属性内容
    pub(crate) fn block_len(&self) -> usize {
        let len = self.len();
        super::len_len(len) + len
    }

    pub(crate) fn read(stream: &mut Bytes, allowed: &[PropertyType]) -> Result<Self, Error> {
        let properties_len = super::read_varint(stream)?;
        if properties_len > stream.len() {
            return Err(Error::MalformedPacket);
        }

        let mut stream = stream.split_to(properties_len);
        let mut properties = Properties::default();
        while stream.has_remaining() {
            let prop = super::read_u8(&mut stream)?;
            let property = PropertyType::try_from(prop)?;
            if !allowed.contains(&property) {
                return Err(Error::UnexpectedPropertyType(prop));
            }
            properties.read_one(property, &mut stream)?;
        }

        Ok(properties)
    }

    fn read_one(&mut self, property: PropertyType, stream: &mut Bytes) -> Result<(), Error> {
        match property {
            PayloadFormatIndicator => set(
                &mut self.payload_format_indicator,
                super::read_u8(stream)?,
                property,
            ),
            MessageExpiryInterval => set(
                &mut self.message_expiry_interval,
                super::read_u32(stream)?,
                property,
            ),
            ContentType => set(&mut self.content_type, super::read_string(stream)?, property),
            ResponseTopic => set(
                &mut self.response_topic,
                super::read_string(stream)?,
                property,
            ),
            CorrelationData => set(
                &mut self.correlation_data,
                super::read_bytes(stream)?,
                property,
            ),
            SubscriptionIdentifier => {
                let id = super::read_varint(stream)?;
                // 订阅标识符不能为 0
                if id == 0 {
                    return Err(Error::MalformedPacket);
                }
                self.subscription_identifiers.push(id);
                Ok(())
            }
            SessionExpiryInterval => set(
                &mut self.session_expiry_interval,
                super::read_u32(stream)?,
                property,
            ),
            AssignedClientIdentifier => set(
                &mut self.assigned_client_identifier,
                super::read_string(stream)?,
                property,
            ),
            ServerKeepAlive => set(
                &mut self.server_keep_alive,
                super::read_u16(stream)?,
                property,
            ),
            AuthenticationMethod => set(
                &mut self.authentication_method,
                super::read_string(stream)?,
                property,
            ),
            AuthenticationData => set(
                &mut self.authentication_data,
                super::read_bytes(stream)?,
                property,
            ),
            RequestProblemInformation => set(
                &mut self.request_problem_information,
                super::read_u8(stream)?,
                property,
            ),
            WillDelayInterval => set(
                &mut self.will_delay_interval,
                super::read_u32(stream)?,
                property,
            ),
            RequestResponseInformation => set(
                &mut self.request_response_information,
                super::read_u8(stream)?,
                property,
            ),
            ResponseInformation => set(
                &mut self.response_information,
                super::read_string(stream)?,
                property,
            ),
            ServerReference => set(
                &mut self.server_reference,
                super::read_string(stream)?,
                property,
            ),
            ReasonString => set(
                &mut self.reason_string,
                super::read_string(stream)?,
                property,
            ),
            ReceiveMaximum => set(
                &mut self.receive_maximum,
                super::read_u16(stream)?,
                property,
            ),
            TopicAliasMaximum => set(
                &mut self.topic_alias_maximum,
                super::read_u16(stream)?,
                property,
            ),
            TopicAlias => set(&mut self.topic_alias, super::read_u16(stream)?, property),
            MaximumQos => set(&mut self.maximum_qos, super::read_u8(stream)?, property),
            RetainAvailable => set(
                &mut self.retain_available,
                super::read_u8(stream)?,
                property,
            ),
            UserProperty => {
                let key = super::read_string(stream)?;
                let value = super::read_string(stream)?;
                self.user_properties.push((key, value));
                Ok(())
            }
            MaximumPacketSize => set(
                &mut self.maximum_packet_size,
                super::read_u32(stream)?,
                property,
            ),
            WildcardSubscriptionAvailable => set(
                &mut self.wildcard_subscription_available,
                super::read_u8(stream)?,
                property,
            ),
            SubscriptionIdentifierAvailable => set(
                &mut self.subscription_identifier_available,
                super::read_u8(stream)?,
                property,
            ),
            SharedSubscriptionAvailable => set(
                &mut self.shared_subscription_available,
                super::read_u8(stream)?,
                property,
            ),
        }
    }

    /// 按属性标识符升序写入属性块
    pub(crate) fn write(&self, stream: &mut BytesMut, allowed: &[PropertyType]) -> Result<(), Error> {
        super::write_remaining_length(stream, self.len())?;

        if let Some(v) = self.payload_format_indicator {
            check(allowed, PayloadFormatIndicator)?;
            stream.put_u8(PayloadFormatIndicator as u8);
            stream.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            check(allowed, MessageExpiryInterval)?;
            stream.put_u8(MessageExpiryInterval as u8);
            stream.put_u32(v);
        }
        if let Some(v) = &self.content_type {
            check(allowed, ContentType)?;
            stream.put_u8(ContentType as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = &self.response_topic {
            check(allowed, ResponseTopic)?;
            stream.put_u8(ResponseTopic as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = &self.correlation_data {
            check(allowed, CorrelationData)?;
            stream.put_u8(CorrelationData as u8);
            super::write_bytes(stream, v)?;
        }
        for id in &self.subscription_identifiers {
            check(allowed, SubscriptionIdentifier)?;
            stream.put_u8(SubscriptionIdentifier as u8);
            super::write_remaining_length(stream, *id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            check(allowed, SessionExpiryInterval)?;
            stream.put_u8(SessionExpiryInterval as u8);
            stream.put_u32(v);
        }
        if let Some(v) = &self.assigned_client_identifier {
            check(allowed, AssignedClientIdentifier)?;
            stream.put_u8(AssignedClientIdentifier as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = self.server_keep_alive {
            check(allowed, ServerKeepAlive)?;
            stream.put_u8(ServerKeepAlive as u8);
            stream.put_u16(v);
        }
        if let Some(v) = &self.authentication_method {
            check(allowed, AuthenticationMethod)?;
            stream.put_u8(AuthenticationMethod as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = &self.authentication_data {
            check(allowed, AuthenticationData)?;
            stream.put_u8(AuthenticationData as u8);
            super::write_bytes(stream, v)?;
        }
        if let Some(v) = self.request_problem_information {
            check(allowed, RequestProblemInformation)?;
            stream.put_u8(RequestProblemInformation as u8);
            stream.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            check(allowed, WillDelayInterval)?;
            stream.put_u8(WillDelayInterval as u8);
            stream.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            check(allowed, RequestResponseInformation)?;
            stream.put_u8(RequestResponseInformation as u8);
            stream.put_u8(v);
        }
        if let Some(v) = &self.response_information {
            check(allowed, ResponseInformation)?;
            stream.put_u8(ResponseInformation as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = &self.server_reference {
            check(allowed, ServerReference)?;
            stream.put_u8(ServerReference as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = &self.reason_string {
            check(allowed, ReasonString)?;
            stream.put_u8(ReasonString as u8);
            super::write_string(stream, v)?;
        }
        if let Some(v) = self.receive_maximum {
            check(allowed, ReceiveMaximum)?;
            stream.put_u8(ReceiveMaximum as u8);
            stream.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            check(allowed, TopicAliasMaximum)?;
            stream.put_u8(TopicAliasMaximum as u8);
            stream.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            check(allowed, TopicAlias)?;
            stream.put_u8(TopicAlias as u8);
            stream.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            check(allowed, MaximumQos)?;
            stream.put_u8(MaximumQos as u8);
            stream.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            check(allowed, RetainAvailable)?;
            stream.put_u8(RetainAvailable as u8);
            stream.put_u8(v);
        }
        for (key, value) in &self.user_properties {
            check(allowed, UserProperty)?;
            stream.put_u8(UserProperty as u8);
            super::write_string(stream, key)?;
            super::write_string(stream, value)?;
        }
        if let Some(v) = self.maximum_packet_size {
            check(allowed, MaximumPacketSize)?;
            stream.put_u8(MaximumPacketSize as u8);
            stream.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            check(allowed, WildcardSubscriptionAvailable)?;
            stream.put_u8(WildcardSubscriptionAvailable as u8);
            stream.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            check(allowed, SubscriptionIdentifierAvailable)?;
            stream.put_u8(SubscriptionIdentifierAvailable as u8);
            stream.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            check(allowed, SharedSubscriptionAvailable)?;
            stream.put_u8(SharedSubscriptionAvailable as u8);
            stream.put_u8(v);
        }

        Ok(())
    }
}
