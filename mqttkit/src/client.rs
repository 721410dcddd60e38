//! MQTT 5.0 客户端
//!
//! 每个连接有两个后台任务：读任务分发 broker 发来的报文，keepalive 任务在空闲时发送 PINGREQ
//! 连接意外断开后由监督任务按 `connect_delays` 重连

use std::{
    iter,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    io::{self, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    config::{self, ClientConfig},
    error::Error,
    network::{
        alias::{Outbound, TopicAliasTable},
        conn::Connection,
        packet::{
            Connect, ConnectReasonCode, Disconnect, DisconnectReasonCode, LastWill, Packet,
            Publish, QoS, RetainForwardRule, Subscribe, SubscribeFilter, SubscribeReasonCode,
            Unsubscribe, UnsubscribeReasonCode,
        },
        topic, Connector, Stream, TcpConnector,
    },
    protocol::lock,
};

use request::{Requests, Response};

mod request;

/// 应用层消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    /// 请求/响应模式中对方回复的 topic
    pub response_topic: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            response_topic: None,
        }
    }
}

/// 从 [`Messages`] 收到的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Message),
    /// 与 broker 的连接断开，重连成功后会继续收到消息
    ConnectionLost,
}

/// 收到的消息流
pub struct Messages {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Messages {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl futures::Stream for Messages {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// MQTT 客户端
pub struct Client {
    inner: Arc<Inner>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        Self::with_connector(cfg, TcpConnector)
    }

    /// 使用自定义的传输层
    pub fn with_connector(cfg: ClientConfig, connector: impl Connector) -> Self {
        let client_id = cfg.client_id.clone().unwrap_or_else(config::random_client_id);
        let (deliveries, messages) = mpsc::unbounded_channel();
        let inner = Inner {
            cfg,
            client_id: Mutex::new(client_id),
            connector: Arc::new(connector),
            writer: AsyncMutex::new(None),
            requests: Requests::default(),
            link: Mutex::new(Link::default()),
            pingresp: Notify::new(),
            deliveries,
            supervisor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            messages: Mutex::new(Some(messages)),
        }
    }

    /// 客户端 id，broker 分配了新 id 时返回分配的 id
    pub fn client_id(&self) -> String {
        lock(&self.inner.client_id).clone()
    }

    pub fn state(&self) -> State {
        lock(&self.inner.link).state
    }

    /// 收到的消息，只能取一次
    pub fn messages(&self) -> Option<Messages> {
        lock(&self.messages).take().map(|rx| Messages { rx })
    }

    /// 连接 broker，失败时按 `connect_delays` 等待后重试，`connect_delays` 为空时只尝试一次
    ///
    /// `resume_session` 为 true 时尝试恢复上一次的会话，broker 没有会话时返回
    /// [`Error::SessionResume`]，此时连接已经建立，并且已重新订阅配置中的 filter
    pub async fn start(&self, resume_session: bool) -> Result<(), Error> {
        let inner = &self.inner;
        {
            let mut link = lock(&inner.link);
            if link.state != State::Disconnected {
                return Err(Error::AlreadyStarted);
            }
            link.state = State::Connecting;
        }
        inner.stopped.store(false, Ordering::SeqCst);

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let result = inner
            .connect_retrying(resume_session, inner.connect_delays(), &lost_tx)
            .await;
        if matches!(result, Ok(()) | Err(Error::SessionResume)) {
            let supervisor = tokio::spawn(inner.clone().supervise(lost_tx, lost_rx));
            if let Some(old) = lock(&inner.supervisor).replace(supervisor) {
                old.abort();
            }
        }
        result
    }

    /// 断开连接，不再重连
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        if let Some(supervisor) = lock(&inner.supervisor).take() {
            supervisor.abort();
        }

        let was_connected = lock(&inner.link).state == State::Connected;
        inner
            .teardown(Some(DisconnectReasonCode::NormalDisconnection))
            .await;
        lock(&inner.link).state = State::Disconnected;
        if was_connected {
            info!("Disconnected from {}:{}", inner.cfg.host, inner.cfg.port);
            let _ = inner.deliveries.send(Delivery::ConnectionLost);
        }
    }

    /// 订阅一个 filter，返回 broker 授予的原因码
    pub async fn subscribe(&self, filter: &str) -> Result<SubscribeReasonCode, Error> {
        self.inner
            .subscribe(filter, RetainForwardRule::OnEverySubscribe)
            .await
    }

    /// 订阅一个 filter，并指定 broker 何时发送匹配的保留消息
    pub async fn subscribe_with(
        &self,
        filter: &str,
        retain_handling: RetainForwardRule,
    ) -> Result<SubscribeReasonCode, Error> {
        self.inner.subscribe(filter, retain_handling).await
    }

    /// 取消订阅，filter 本来就不存在时返回 [`UnsubscribeReasonCode::NoSubscriptionExisted`]
    pub async fn unsubscribe(&self, filter: &str) -> Result<UnsubscribeReasonCode, Error> {
        self.inner.unsubscribe(filter).await
    }

    /// 发布 QoS 0 消息，写入连接后立即返回
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        self.inner.publish(message).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.inner.supervisor).take() {
            supervisor.abort();
        }
        let mut link = lock(&self.inner.link);
        for task in [link.reader.take(), link.keep_alive.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// 读任务或 keepalive 任务报告连接断开
struct Lost {
    epoch: u64,
    error: Error,
}

type LostSender = mpsc::UnboundedSender<Lost>;

#[derive(Default)]
struct Link {
    state: State,
    /// 每次连接加一，用于忽略旧连接的断开事件
    epoch: u64,
    reader: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
}

/// 连接的写端，所有报文都经过这里，保证一次只写一个报文
struct Writer {
    conn: Connection<WriteHalf<Box<dyn Stream>>>,
    /// 发往 broker 的主题别名
    aliases: TopicAliasTable,
    last_sent: Instant,
}

impl Writer {
    fn new(stream: WriteHalf<Box<dyn Stream>>) -> Self {
        Self {
            conn: Connection::new(stream),
            aliases: TopicAliasTable::default(),
            last_sent: Instant::now(),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        debug!("Sending {:?}", packet.packet_type());
        self.conn.write_packet(packet).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

struct Inner {
    cfg: ClientConfig,
    client_id: Mutex<String>,
    connector: Arc<dyn Connector>,
    writer: AsyncMutex<Option<Writer>>,
    requests: Requests,
    link: Mutex<Link>,
    pingresp: Notify,
    deliveries: mpsc::UnboundedSender<Delivery>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Inner {
    /// 建立一次连接，失败时清理已经建立的部分
    async fn connect(self: &Arc<Self>, resume: bool, lost_tx: &LostSender) -> Result<(), Error> {
        let epoch = {
            let mut link = lock(&self.link);
            link.state = State::Connecting;
            link.epoch += 1;
            link.epoch
        };

        let result = self.try_connect(resume, epoch, lost_tx).await;
        match &result {
            Ok(()) => {}
            Err(Error::SessionResume) => info!("No session to resume"),
            Err(e) => {
                info!("Connect to {}:{} failed: {}", self.cfg.host, self.cfg.port, e);
                let reason = match lock(&self.link).state {
                    State::Connected => Some(
                        e.disconnect_reason()
                            .unwrap_or(DisconnectReasonCode::NormalDisconnection),
                    ),
                    _ => None,
                };
                self.teardown(reason).await;
                lock(&self.link).state = State::Disconnected;
            }
        }
        result
    }

    async fn try_connect(
        self: &Arc<Self>,
        resume: bool,
        epoch: u64,
        lost_tx: &LostSender,
    ) -> Result<(), Error> {
        info!("Connecting to {}:{}", self.cfg.host, self.cfg.port);
        let stream = self.connector.connect(&self.cfg.host, self.cfg.port).await?;
        let (read_half, write_half) = io::split(stream);
        *self.writer.lock().await = Some(Writer::new(write_half));

        let connack = self.requests.expect_connack();
        let reader = tokio::spawn(self.clone().read_loop(
            Connection::new(read_half),
            epoch,
            lost_tx.clone(),
        ));
        lock(&self.link).reader = Some(reader);

        self.send(&Packet::Connect(self.connect_packet(resume)))
            .await?;
        let connack = match time::timeout(self.cfg.response_timeout, connack).await {
            Ok(Ok(connack)) => connack,
            Ok(Err(_)) => return Err(Error::ConnectionLost),
            Err(_) => return Err(Error::Timeout("CONNACK")),
        };
        if connack.code != ConnectReasonCode::Success {
            return Err(Error::Connect(connack.code));
        }

        let properties = connack.properties;
        if let Some(client_id) = properties.assigned_client_identifier {
            info!("Broker assigned client id {}", client_id);
            *lock(&self.client_id) = client_id;
        }
        if let Some(writer) = self.writer.lock().await.as_mut() {
            writer
                .aliases
                .reset(properties.topic_alias_maximum.unwrap_or(0));
            writer
                .conn
                .set_max_outgoing(properties.maximum_packet_size.map(|max| max as usize));
        }
        // broker 指定的 keepalive 优先
        let keep_alive = properties.server_keep_alive.unwrap_or(self.cfg.keep_alive);
        {
            let mut link = lock(&self.link);
            link.state = State::Connected;
            if keep_alive > 0 {
                let period = Duration::from_secs(keep_alive as u64);
                let task = tokio::spawn(self.clone().keep_alive_loop(period, epoch, lost_tx.clone()));
                link.keep_alive = Some(task);
            }
        }
        info!(
            "Connected to {}:{} (session present {})",
            self.cfg.host, self.cfg.port, connack.session_present
        );

        if !(resume && connack.session_present) {
            for subscription in &self.cfg.subscriptions {
                self.subscribe(&subscription.filter, subscription.retain_handling)
                    .await?;
            }
        }
        if resume && !connack.session_present {
            return Err(Error::SessionResume);
        }
        Ok(())
    }

    fn connect_packet(&self, resume: bool) -> Connect {
        let cfg = &self.cfg;
        let mut connect = Connect {
            keep_alive: cfg.keep_alive,
            client_id: lock(&self.client_id).clone(),
            clean_start: !resume,
            username: cfg.username.clone(),
            password: cfg.password.clone().map(Bytes::from),
            ..Default::default()
        };
        if let Some(will) = &cfg.will {
            connect.last_will = Some(LastWill {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone()),
                qos: QoS::AtMostOnce,
                retain: will.retain,
                properties: Default::default(),
            });
        }
        if cfg.session_expiry_interval > 0 {
            connect.properties.session_expiry_interval = Some(cfg.session_expiry_interval);
        }
        if cfg.topic_alias_maximum > 0 {
            connect.properties.topic_alias_maximum = Some(cfg.topic_alias_maximum);
        }
        connect
    }

    /// 关闭连接，等待中的请求都会收到连接断开
    async fn teardown(&self, reason: Option<DisconnectReasonCode>) {
        let (reader, keep_alive) = {
            let mut link = lock(&self.link);
            link.state = State::Disconnecting;
            (link.reader.take(), link.keep_alive.take())
        };
        if let Some(keep_alive) = keep_alive {
            keep_alive.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Some(reason) = reason {
                let disconnect = Packet::Disconnect(Disconnect::new(reason));
                match time::timeout(self.cfg.response_timeout, writer.send(&disconnect)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Failed to send DISCONNECT: {}", e),
                    Err(_) => debug!("Timeout sending DISCONNECT"),
                }
            }
            let _ = time::timeout(self.cfg.response_timeout, writer.conn.shutdown()).await;
        }

        if let Some(reader) = reader {
            reader.abort();
        }
        self.requests.clear();
    }

    async fn send(&self, packet: &Packet) -> Result<(), Error> {
        match self.writer.lock().await.as_mut() {
            Some(writer) => writer.send(packet).await,
            None => Err(Error::NotConnected),
        }
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match lock(&self.link).state {
            State::Connected => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        retain_handling: RetainForwardRule,
    ) -> Result<SubscribeReasonCode, Error> {
        self.ensure_connected()?;
        let (pending, response) = self.requests.register()?;
        let mut subscribe_filter = SubscribeFilter::new(filter);
        subscribe_filter.retain_forward_rule = retain_handling;
        let subscribe = Subscribe {
            packet_id: pending.packet_id,
            filters: vec![subscribe_filter],
            properties: Default::default(),
        };
        self.send(&Packet::Subscribe(subscribe)).await?;

        let suback = match self.wait(response, "SUBACK").await? {
            Response::SubAck(suback) => suback,
            Response::UnsubAck(_) => return Err(Error::Protocol("UNSUBACK for SUBSCRIBE".into())),
        };
        let code = suback
            .return_codes
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("SUBACK without reason code".into()))?;
        if code.is_error() {
            return Err(Error::Subscribe(code));
        }
        debug!("Subscribed {}: {:?}", filter, code);
        Ok(code)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<UnsubscribeReasonCode, Error> {
        self.ensure_connected()?;
        let (pending, response) = self.requests.register()?;
        let unsubscribe = Unsubscribe::new(pending.packet_id, filter);
        self.send(&Packet::Unsubscribe(unsubscribe)).await?;

        let unsuback = match self.wait(response, "UNSUBACK").await? {
            Response::UnsubAck(unsuback) => unsuback,
            Response::SubAck(_) => return Err(Error::Protocol("SUBACK for UNSUBSCRIBE".into())),
        };
        let code = unsuback
            .return_codes
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("UNSUBACK without reason code".into()))?;
        if code.is_error() {
            return Err(Error::Unsubscribe(code));
        }
        Ok(code)
    }

    async fn wait(
        &self,
        response: oneshot::Receiver<Response>,
        name: &'static str,
    ) -> Result<Response, Error> {
        match time::timeout(self.cfg.response_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            // 等待期间连接断开
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => Err(Error::Timeout(name)),
        }
    }

    async fn publish(&self, message: Message) -> Result<(), Error> {
        if !topic::valid_publish_topic(&message.topic) {
            return Err(Error::InvalidTopic(message.topic));
        }
        self.ensure_connected()?;

        let mut publish = Publish::new(message.topic, message.payload);
        publish.retain = message.retain;
        publish.properties.response_topic = message.response_topic;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        let outbound = writer.aliases.compress(&mut publish);
        let result = writer.send(&Packet::Publish(publish)).await;
        if result.is_err() {
            if let Outbound::Assign(alias) = outbound {
                writer.aliases.release(alias);
            }
        }
        result
    }

    /// 读任务：读取并分发 broker 发来的报文，直到连接出错
    async fn read_loop(
        self: Arc<Self>,
        mut conn: Connection<ReadHalf<Box<dyn Stream>>>,
        epoch: u64,
        lost_tx: LostSender,
    ) {
        // 别名只在本次连接内有效
        let mut aliases = TopicAliasTable::new(self.cfg.topic_alias_maximum);
        let error = loop {
            let packet = match conn.read_packet().await {
                Ok(packet) => packet,
                Err(e) => break Error::from(e),
            };
            debug!("Received {:?}", packet.packet_type());
            if let Err(e) = self.dispatch(packet, &mut aliases) {
                break e;
            }
        };

        debug!("Reader stopped: {}", error);
        let _ = lost_tx.send(Lost { epoch, error });
    }

    fn dispatch(&self, packet: Packet, aliases: &mut TopicAliasTable) -> Result<(), Error> {
        match packet {
            Packet::ConnAck(connack) => {
                if !self.requests.complete_connack(connack) {
                    return Err(Error::Protocol("unexpected CONNACK".into()));
                }
            }
            Packet::Publish(mut publish) => {
                if publish.qos != QoS::AtMostOnce {
                    return Err(Error::Protocol(format!("PUBLISH with {:?}", publish.qos)));
                }
                aliases.resolve(&mut publish)?;
                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                    response_topic: publish.properties.response_topic,
                };
                let _ = self.deliveries.send(Delivery::Message(message));
            }
            Packet::SubAck(suback) => {
                let packet_id = suback.packet_id;
                if !self.requests.complete(packet_id, Response::SubAck(suback)) {
                    debug!("Discarding unexpected SUBACK {}", packet_id);
                }
            }
            Packet::UnsubAck(unsuback) => {
                let packet_id = unsuback.packet_id;
                if !self.requests.complete(packet_id, Response::UnsubAck(unsuback)) {
                    debug!("Discarding unexpected UNSUBACK {}", packet_id);
                }
            }
            Packet::PingResp => self.pingresp.notify_waiters(),
            Packet::Disconnect(disconnect) => {
                if let Some(reason) = &disconnect.properties.reason_string {
                    info!("Broker disconnect reason: {}", reason);
                }
                return Err(Error::Disconnected(disconnect.reason_code));
            }
            packet => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?}",
                    packet.packet_type()
                )))
            }
        }
        Ok(())
    }

    /// keepalive 任务：距离上次发送报文超过 period 时发送 PINGREQ
    async fn keep_alive_loop(self: Arc<Self>, period: Duration, epoch: u64, lost_tx: LostSender) {
        let error = loop {
            if let Err(e) = self.ping(period).await {
                break e;
            }
        };
        debug!("Keep alive stopped: {}", error);
        let _ = lost_tx.send(Lost { epoch, error });
    }

    async fn ping(&self, period: Duration) -> Result<(), Error> {
        let last_sent = self
            .writer
            .lock()
            .await
            .as_ref()
            .map(|writer| writer.last_sent)
            .ok_or(Error::NotConnected)?;
        let deadline = last_sent + period;
        if Instant::now() < deadline {
            time::sleep_until(deadline).await;
            return Ok(());
        }

        debug!("Pinging the broker");
        let pingresp = self.pingresp.notified();
        self.send(&Packet::PingReq).await?;
        time::timeout(self.cfg.response_timeout, pingresp)
            .await
            .map_err(|_| Error::Timeout("PINGRESP"))
    }

    /// 监督任务：处理连接断开并重连
    async fn supervise(self: Arc<Self>, lost_tx: LostSender, mut lost_rx: mpsc::UnboundedReceiver<Lost>) {
        while let Some(Lost { epoch, error }) = lost_rx.recv().await {
            if epoch != lock(&self.link).epoch {
                debug!("Ignoring {} from a previous connection", error);
                continue;
            }

            warn!("Connection lost: {}", error);
            self.teardown(error.disconnect_reason()).await;
            lock(&self.link).state = State::Disconnected;
            let _ = self.deliveries.send(Delivery::ConnectionLost);

            if self.stopped.load(Ordering::SeqCst) || error.stops_reconnect() {
                break;
            }
            if !self.reconnect(&lost_tx).await {
                break;
            }
        }
    }

    /// 重连延时：依次使用 connect_delays，之后一直重复最后一个；为空时没有延时
    fn connect_delays(&self) -> impl Iterator<Item = Duration> + Send + '_ {
        let last = self.cfg.connect_delays.last().copied();
        self.cfg
            .connect_delays
            .iter()
            .copied()
            .chain(iter::from_fn(move || last))
    }

    /// 连接断开后先等待第一个延时再重连，放弃时返回 false
    async fn reconnect(self: &Arc<Self>, lost_tx: &LostSender) -> bool {
        let mut delays = self.connect_delays();
        let delay = match delays.next() {
            Some(delay) => delay,
            None => return false,
        };
        info!("Waiting {:?} before reconnecting", delay);
        lock(&self.link).state = State::Connecting;
        time::sleep(delay).await;
        if self.stopped.load(Ordering::SeqCst) {
            lock(&self.link).state = State::Disconnected;
            return false;
        }

        matches!(
            self.connect_retrying(true, delays, lost_tx).await,
            Ok(()) | Err(Error::SessionResume)
        )
    }

    /// 立即连接，失败时依次取 delays 中的延时等待后重试
    ///
    /// 延时用完、调用了 stop 或者遇到不可恢复的错误时返回最后一次的错误
    async fn connect_retrying(
        self: &Arc<Self>,
        resume: bool,
        mut delays: impl Iterator<Item = Duration> + Send,
        lost_tx: &LostSender,
    ) -> Result<(), Error> {
        let mut attempt = 1;
        loop {
            let error = match self.connect(resume, lost_tx).await {
                Err(Error::SessionResume) => return Err(Error::SessionResume),
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if error.stops_reconnect() || self.stopped.load(Ordering::SeqCst) {
                return Err(error);
            }
            let delay = match delays.next() {
                Some(delay) => delay,
                None => return Err(error),
            };

            attempt += 1;
            info!(
                "Waiting {:?} before connection attempt {}",
                delay, attempt
            );
            lock(&self.link).state = State::Connecting;
            time::sleep(delay).await;
            if self.stopped.load(Ordering::SeqCst) {
                lock(&self.link).state = State::Disconnected;
                return Err(error);
            }
        }
    }
}
