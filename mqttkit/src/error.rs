use tokio::io;

use crate::network::{
    alias, conn,
    packet::{
        self, ConnectReasonCode, DisconnectReasonCode, SubscribeReasonCode,
        UnsubscribeReasonCode,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connect refused by broker: {0:?}")]
    Connect(ConnectReasonCode),
    #[error("Broker has no session to resume")]
    SessionResume,
    #[error("Subscribe refused by broker: {0:?}")]
    Subscribe(SubscribeReasonCode),
    #[error("Unsubscribe refused by broker: {0:?}")]
    Unsubscribe(UnsubscribeReasonCode),
    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Topic alias error: {0}")]
    TopicAlias(#[from] alias::Error),
    #[error("Disconnected by broker: {0:?}")]
    Disconnected(DisconnectReasonCode),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Not connected")]
    NotConnected,
    #[error("Client already started")]
    AlreadyStarted,
    #[error("All packet identifiers in use")]
    PacketIdentifiersExhausted,
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Connection error: {0}")]
    Conn(conn::Error),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl From<conn::Error> for Error {
    fn from(e: conn::Error) -> Self {
        match e {
            conn::Error::Packet(e) => Error::Packet(e),
            conn::Error::IO(e) => Error::Io(e),
            e => Error::Conn(e),
        }
    }
}

impl Error {
    /// 客户端断开连接前发送给 broker 的原因码
    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReasonCode> {
        match self {
            Error::Packet(e) if !e.is_encode() => Some(DisconnectReasonCode::MalformedPacket),
            Error::Protocol(_) => Some(DisconnectReasonCode::ProtocolError),
            Error::TopicAlias(_) => Some(DisconnectReasonCode::TopicAliasInvalid),
            _ => None,
        }
    }

    /// 对端违反协议，或者 broker 以重试也不会改变的原因拒绝连接时不再重连
    ///
    /// ServerUnavailable、ServerBusy 等暂时性的拒绝继续重连
    pub(crate) fn stops_reconnect(&self) -> bool {
        match self {
            Error::Packet(_) | Error::Protocol(_) | Error::TopicAlias(_) => true,
            Error::Connect(code) => matches!(
                code,
                ConnectReasonCode::UnsupportedProtocolVersion
                    | ConnectReasonCode::ClientIdentifierNotValid
                    | ConnectReasonCode::BadUserNamePassword
                    | ConnectReasonCode::NotAuthorized
                    | ConnectReasonCode::Banned
                    | ConnectReasonCode::BadAuthenticationMethod
            ),
            _ => false,
        }
    }
}
