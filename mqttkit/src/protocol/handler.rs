use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{self, Instant},
};

use crate::{
    config::{self, BrokerConfig},
    network::{
        alias::{self, Outbound, TopicAliasTable},
        conn::{self, Connection},
        packet::{
            self, ConnAck, Connect, ConnectReasonCode, Disconnect, DisconnectReasonCode,
            LastWill, Packet, PacketType, Publish, QoS, RetainForwardRule, SubAck, Subscribe,
            SubscribeReasonCode, UnsubAck, Unsubscribe, UnsubscribeReasonCode,
        },
        topic, Stream,
    },
    Hook,
};

use super::{registry::SessionHandle, Outgoing, Registry};

/// 等待第一个 CONNECT 报文的时间
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    #[error("First packet not connect")]
    FirstPacketNotConnect,
    #[error("Timeout waiting for CONNECT")]
    ConnectTimeout,
    #[error("Connect refused: {0:?}")]
    Refused(ConnectReasonCode),
    #[error("Unexpected incoming packet: {0:?}")]
    UnexpectedPacket(PacketType),
    #[error("Topic alias error: {0}")]
    TopicAlias(#[from] alias::Error),
    #[error("Invalid publish topic: {0:?}")]
    InvalidPublishTopic(String),
    #[error("QoS not supported: {0:?}")]
    QoSNotSupported(QoS),
    #[error("Keep alive timeout")]
    KeepAliveTimeout,
    #[error("Session taken over")]
    SessionTakenOver,
    #[error("Server shutting down")]
    ShuttingDown,
}

impl Error {
    /// 断开前发送给客户端的原因码，None 表示不发送 DISCONNECT
    fn reason_code(&self) -> Option<DisconnectReasonCode> {
        let code = match self {
            Error::Connection(conn::Error::Packet(e)) if !e.is_encode() => {
                DisconnectReasonCode::MalformedPacket
            }
            Error::Connection(conn::Error::PacketTooLarge(_)) => DisconnectReasonCode::PacketTooLarge,
            Error::Connection(_) => return None,
            Error::FirstPacketNotConnect | Error::ConnectTimeout | Error::Refused(_) => return None,
            Error::UnexpectedPacket(_) => DisconnectReasonCode::ProtocolError,
            Error::TopicAlias(_) => DisconnectReasonCode::TopicAliasInvalid,
            Error::InvalidPublishTopic(_) => DisconnectReasonCode::TopicNameInvalid,
            Error::QoSNotSupported(_) => DisconnectReasonCode::QoSNotSupported,
            Error::KeepAliveTimeout => DisconnectReasonCode::KeepAliveTimeout,
            Error::SessionTakenOver => DisconnectReasonCode::SessionTakenOver,
            Error::ShuttingDown => DisconnectReasonCode::ServerShuttingDown,
        };
        Some(code)
    }
}

/// 处理一个客户端连接，直到连接断开
pub(crate) async fn serve<S: Stream, H: Hook>(
    stream: S,
    registry: Arc<Registry>,
    hook: Arc<H>,
    cfg: Arc<BrokerConfig>,
    shutdown: watch::Receiver<bool>,
) {
    let mut conn = Connection::new(stream);
    conn.set_max_incoming(cfg.maximum_packet_size.map(|max| max as usize));

    // 第一个报文，必须是 connect 报文
    let connect = match accept(&mut conn, hook.as_ref()).await {
        Ok(connect) => connect,
        Err(e) => {
            info!("Closing connection before CONNACK: {}", e);
            let _ = conn.shutdown().await;
            return;
        }
    };

    let assigned = connect.client_id.is_empty();
    let client_id = if assigned {
        config::random_client_id()
    } else {
        connect.client_id.clone()
    };
    let requested_expiry = connect.properties.session_expiry_interval.unwrap_or(0);
    let expiry_interval = registry.session_expiry(requested_expiry);

    // conn_tx 由 session 持有，用于给当前这个连接发送消息
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let (session, session_present) = registry.open_session(&client_id, connect.clean_start, conn_tx);

    let mut connack = ConnAck::new(ConnectReasonCode::Success, session_present);
    let properties = &mut connack.properties;
    properties.maximum_qos = Some(0);
    properties.retain_available = Some(1);
    properties.shared_subscription_available = Some(0);
    properties.subscription_identifier_available = Some(0);
    properties.maximum_packet_size = cfg.maximum_packet_size;
    if cfg.topic_alias_maximum > 0 {
        properties.topic_alias_maximum = Some(cfg.topic_alias_maximum);
    }
    if assigned {
        properties.assigned_client_identifier = Some(client_id.clone());
    }
    if expiry_interval != requested_expiry {
        properties.session_expiry_interval = Some(expiry_interval);
    }
    conn.set_max_outgoing(
        connect
            .properties
            .maximum_packet_size
            .map(|max| max as usize),
    );
    if let Err(e) = conn.write_packet(&Packet::ConnAck(connack)).await {
        info!("Failed to send CONNACK to {}: {}", client_id, e);
        registry.close_session(&session, expiry_interval);
        return;
    }

    info!(
        "Client {} connected (keep alive {}s, session present {})",
        client_id, connect.keep_alive, session_present
    );
    hook.connected(&client_id).await;

    let keep_alive = match connect.keep_alive {
        0 => None,
        secs => {
            let keep_alive = Duration::from_secs(secs as u64);
            Some(keep_alive + keep_alive.mul_f32(0.5))
        }
    };
    let mut handler = ConnectionHandler {
        client_id: client_id.clone(),
        conn,
        conn_rx,
        registry: registry.clone(),
        session,
        keep_alive,
        rx_aliases: TopicAliasTable::new(cfg.topic_alias_maximum),
        tx_aliases: TopicAliasTable::new(connect.properties.topic_alias_maximum.unwrap_or(0)),
        expiry_interval,
        shutdown,
    };

    let publish_will = match handler.run().await {
        Ok(with_will) => {
            info!("Client {} disconnected", client_id);
            with_will
        }
        Err(e) => {
            info!("Closing connection of {}: {}", client_id, e);
            if let Some(reason) = e.reason_code() {
                let disconnect = Packet::Disconnect(Disconnect::new(reason));
                let _ = handler.conn.write_packet(&disconnect).await;
            }
            true
        }
    };
    let _ = handler.conn.shutdown().await;

    if publish_will {
        if let Some(will) = connect.last_will {
            publish_last_will(&registry, &client_id, will);
        }
    }
    registry.close_session(&handler.session, handler.expiry_interval);
    hook.disconnected(&client_id).await;
}

/// 读取并校验 CONNECT 报文，拒绝时回复 CONNACK
async fn accept<S: Stream, H: Hook>(
    conn: &mut Connection<S>,
    hook: &H,
) -> Result<Connect, Error> {
    let connect = match time::timeout(CONNECT_TIMEOUT, conn.read_packet()).await {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(_)) => return Err(Error::FirstPacketNotConnect),
        Ok(Err(conn::Error::Packet(packet::Error::InvalidProtocolLevel(level)))) => {
            debug!("Unsupported protocol level {}", level);
            return Err(refuse(conn, ConnectReasonCode::UnsupportedProtocolVersion).await);
        }
        Ok(Err(conn::Error::Packet(e))) => {
            debug!("Malformed CONNECT: {}", e);
            return Err(refuse(conn, ConnectReasonCode::MalformedPacket).await);
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::ConnectTimeout),
    };

    // 不支持增强认证
    if connect.properties.authentication_method.is_some() {
        return Err(refuse(conn, ConnectReasonCode::BadAuthenticationMethod).await);
    }
    let authenticated = hook
        .authenticate(
            &connect.client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        )
        .await;
    if !authenticated {
        return Err(refuse(conn, ConnectReasonCode::BadUserNamePassword).await);
    }
    if let Some(will) = &connect.last_will {
        if will.qos != QoS::AtMostOnce {
            return Err(refuse(conn, ConnectReasonCode::QoSNotSupported).await);
        }
        if !topic::valid_publish_topic(&will.topic) {
            return Err(refuse(conn, ConnectReasonCode::TopicNameInvalid).await);
        }
    }

    Ok(connect)
}

/// If a server sends a CONNACK packet containing a non-zero return code it MUST set Session Present to 0
async fn refuse<S: Stream>(conn: &mut Connection<S>, code: ConnectReasonCode) -> Error {
    let connack = Packet::ConnAck(ConnAck::new(code, false));
    if let Err(e) = conn.write_packet(&connack).await {
        debug!("Failed to send CONNACK: {}", e);
    }
    Error::Refused(code)
}

fn publish_last_will(registry: &Registry, client_id: &str, will: LastWill) {
    let mut publish = Publish::new(will.topic, will.payload);
    publish.retain = will.retain;
    publish.properties = will.properties;
    publish.properties.will_delay_interval = None;

    if publish.retain {
        registry.retain(&publish);
    }
    let count = registry.route_publish(&publish);
    info!(
        "Published will of {} to {} on {}",
        client_id, count, publish.topic
    );
}

/// 客户端连接在 broker 侧的事件循环
struct ConnectionHandler<S> {
    client_id: String,
    conn: Connection<S>,
    conn_rx: mpsc::UnboundedReceiver<Outgoing>,
    registry: Arc<Registry>,
    session: SessionHandle,
    /// 客户端 keepalive 的 1.5 倍
    keep_alive: Option<Duration>,
    /// 客户端发来的主题别名
    rx_aliases: TopicAliasTable,
    /// 发给客户端的主题别名
    tx_aliases: TopicAliasTable,
    expiry_interval: u32,
    shutdown: watch::Receiver<bool>,
}

impl<S: Stream> ConnectionHandler<S> {
    /// 开启事件循环
    /// * 从网络层读取 packet 并处理
    /// * 接收会话转发的消息，写入网络层
    ///
    /// 客户端正常断开时返回是否要发布遗嘱
    async fn run(&mut self) -> Result<bool, Error> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }

        // 只有收到报文才推迟 keepalive 期限
        let mut deadline = self.keep_alive.map(|keep_alive| Instant::now() + keep_alive);
        loop {
            select! {
                // 从网络层读数据
                packet = read_packet(&mut self.conn, deadline) => {
                    deadline = self.keep_alive.map(|keep_alive| Instant::now() + keep_alive);
                    if let Some(with_will) = self.handle_packet(packet?).await? {
                        return Ok(with_will);
                    }
                }
                // 会话转发的消息
                outgoing = self.conn_rx.recv() => match outgoing {
                    Some(Outgoing::Publish(publish)) => self.deliver(publish).await?,
                    Some(Outgoing::Disconnect(_)) | None => return Err(Error::SessionTakenOver),
                },
                _ = self.shutdown.changed() => return Err(Error::ShuttingDown),
            }
        }
    }

    /// 收到 DISCONNECT 时返回 Some
    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<bool>, Error> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish)?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.conn.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect(disconnect) => {
                if let Some(expiry) = disconnect.properties.session_expiry_interval {
                    self.expiry_interval = self.registry.session_expiry(expiry);
                }
                debug!(
                    "Client {} sent DISCONNECT {:?}",
                    self.client_id, disconnect.reason_code
                );
                let with_will =
                    disconnect.reason_code == DisconnectReasonCode::DisconnectWithWillMessage;
                return Ok(Some(with_will));
            }
            packet => return Err(Error::UnexpectedPacket(packet.packet_type())),
        }
        Ok(None)
    }

    fn handle_publish(&mut self, mut publish: Publish) -> Result<(), Error> {
        if publish.qos != QoS::AtMostOnce {
            return Err(Error::QoSNotSupported(publish.qos));
        }
        self.rx_aliases.resolve(&mut publish)?;
        if !topic::valid_publish_topic(&publish.topic) {
            return Err(Error::InvalidPublishTopic(publish.topic));
        }

        if publish.retain {
            self.registry.retain(&publish);
        }
        let count = self.registry.route_publish(&publish);
        debug!(
            "Routed {} from {} to {} sessions",
            publish.topic, self.client_id, count
        );
        Ok(())
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<(), Error> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained_filters = Vec::new();
        {
            let mut session = self.session.lock();
            for filter in &subscribe.filters {
                if !topic::valid_subscribe_filter(&filter.path) {
                    return_codes.push(SubscribeReasonCode::TopicFilterInvalid);
                    continue;
                }
                let is_new = session.subscribe(&filter.path);
                return_codes.push(SubscribeReasonCode::GrantedQoS0);

                let send_retained = match filter.retain_forward_rule {
                    RetainForwardRule::OnEverySubscribe => true,
                    RetainForwardRule::OnNewSubscribe => is_new,
                    RetainForwardRule::Never => false,
                };
                if send_retained {
                    retained_filters.push(filter.path.clone());
                }
            }
        }
        debug!(
            "Client {} subscribed {:?}: {:?}",
            self.client_id, subscribe.filters, return_codes
        );

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            properties: Default::default(),
            return_codes,
        };
        self.conn.write_packet(&Packet::SubAck(suback)).await?;

        // 订阅成功后发送匹配的保留消息
        for filter in retained_filters {
            for publish in self.registry.retained(&filter) {
                self.deliver(publish).await?;
            }
        }
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<(), Error> {
        let return_codes = {
            let mut session = self.session.lock();
            unsubscribe
                .filters
                .iter()
                .map(|filter| match session.unsubscribe(filter) {
                    true => UnsubscribeReasonCode::Success,
                    false => UnsubscribeReasonCode::NoSubscriptionExisted,
                })
                .collect()
        };

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
            properties: Default::default(),
            return_codes,
        };
        self.conn.write_packet(&Packet::UnsubAck(unsuback)).await?;
        Ok(())
    }

    /// 发送消息给客户端，超过客户端最大报文长度的消息直接丢弃
    async fn deliver(&mut self, mut publish: Publish) -> Result<(), Error> {
        let outbound = self.tx_aliases.compress(&mut publish);
        match self.conn.write_packet(&Packet::Publish(publish)).await {
            Ok(()) => Ok(()),
            Err(conn::Error::PacketTooLarge(len)) => {
                if let Outbound::Assign(alias) = outbound {
                    self.tx_aliases.release(alias);
                }
                warn!(
                    "Dropping {} byte message to {}: larger than its maximum packet size",
                    len, self.client_id
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_packet<S: Stream>(
    conn: &mut Connection<S>,
    deadline: Option<Instant>,
) -> Result<Packet, Error> {
    let packet = match deadline {
        // 等待 keepalive 时间内至少有完整的包进来
        Some(deadline) => time::timeout_at(deadline, conn.read_packet())
            .await
            .map_err(|_| Error::KeepAliveTimeout)??,
        None => conn.read_packet().await?,
    };
    Ok(packet)
}
