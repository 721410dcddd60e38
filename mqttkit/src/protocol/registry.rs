use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use log::{debug, info};
use tokio::{sync::mpsc::UnboundedSender, time};

use crate::network::{
    packet::{DisconnectReasonCode, Properties, Publish},
    topic,
};

use super::{Outgoing, Session};

/// 会话永不过期
pub const NEVER_EXPIRE: u32 = u32::MAX;

/// 锁被毒化时仍然使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一次连接持有的会话
pub(crate) struct SessionHandle {
    pub(crate) client_id: String,
    pub(crate) connection_id: u64,
    session: Arc<Mutex<Session>>,
}

impl SessionHandle {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

/// 所有会话与保留消息
///
/// 会话表的锁只保护查找、插入与删除，不与单个会话的锁同时持有；任何锁都不跨越 await
/// 从会话表删除会话前先在会话内标记 removed，拿到已删除会话的连接会重新查找
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    /// key = topic
    retained: Mutex<BTreeMap<String, Publish>>,
    /// 会话过期时间上限
    max_expiry_interval: Option<u32>,
    next_connection_id: AtomicU64,
}

impl Registry {
    pub fn new(max_expiry_interval: Option<u32>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retained: Mutex::new(BTreeMap::new()),
            max_expiry_interval,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// 实际使用的会话过期时间
    pub fn session_expiry(&self, requested: u32) -> u32 {
        match self.max_expiry_interval {
            Some(max) => requested.min(max),
            None => requested,
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// 读取会话状态
    pub fn with_session<R>(&self, client_id: &str, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let session = lock(&self.sessions).get(client_id).cloned()?;
        let session = lock(&session);
        Some(f(&session))
    }

    /// 新连接打开会话
    ///
    /// * clean_start 或者会话不存在时创建新会话，否则恢复已有会话
    /// * 旧连接仍在线时通知其断开
    /// * 返回的 bool 表示是否恢复了已有会话
    pub(crate) fn open_session(
        &self,
        client_id: &str,
        clean_start: bool,
        conn_tx: UnboundedSender<Outgoing>,
    ) -> (SessionHandle, bool) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        loop {
            let (session, resumed, replaced) = {
                let mut sessions = lock(&self.sessions);
                match sessions.get(client_id) {
                    Some(session) if !clean_start => (session.clone(), true, None),
                    _ => {
                        let session = Arc::new(Mutex::new(Session::new(client_id)));
                        let replaced = sessions.insert(client_id.into(), session.clone());
                        (session, false, replaced)
                    }
                }
            };

            if let Some(old) = replaced {
                let mut old = lock(&old);
                old.removed = true;
                old.cancel_expiry();
                take_over(old.detach());
                debug!("Discarded session of {}", client_id);
            }

            let previous = {
                let mut guard = lock(&session);
                if guard.removed {
                    // 会话刚刚过期，重新查找
                    drop(guard);
                    self.remove_session(client_id, &session);
                    continue;
                }
                guard.attach(connection_id, conn_tx.clone())
            };
            take_over(previous);

            if resumed {
                info!("Resumed session of {}", client_id);
            }
            let handle = SessionHandle {
                client_id: client_id.into(),
                connection_id,
                session,
            };
            return (handle, resumed);
        }
    }

    /// 连接断开后关闭会话
    ///
    /// 过期时间为 0 时立即删除，[`NEVER_EXPIRE`] 时永久保留，其它情况下启动过期定时器
    /// 会话已被其它连接接管时什么也不做
    pub(crate) fn close_session(self: &Arc<Self>, handle: &SessionHandle, expiry_interval: u32) {
        let expiry_interval = self.session_expiry(expiry_interval);
        {
            let mut session = handle.lock();
            if session.removed || session.connection_id() != handle.connection_id {
                return;
            }
            session.detach();

            match expiry_interval {
                0 => session.removed = true,
                NEVER_EXPIRE => return,
                secs => {
                    let registry = Arc::downgrade(self);
                    let client_id = handle.client_id.clone();
                    let connection_id = handle.connection_id;
                    session.expiry = Some(tokio::spawn(async move {
                        time::sleep(Duration::from_secs(secs as u64)).await;
                        expire(registry, &client_id, connection_id);
                    }));
                    return;
                }
            }
        }

        self.remove_session(&handle.client_id, &handle.session);
        debug!("Removed session of {}", handle.client_id);
    }

    /// 会话表中的会话仍是 session 时删除
    fn remove_session(&self, client_id: &str, session: &Arc<Mutex<Session>>) {
        let mut sessions = lock(&self.sessions);
        if matches!(sessions.get(client_id), Some(current) if Arc::ptr_eq(current, session)) {
            sessions.remove(client_id);
        }
    }

    /// 把消息转发给所有订阅匹配的会话，返回匹配的会话数
    pub(crate) fn route_publish(&self, publish: &Publish) -> usize {
        let forwarded = forwarded(publish, false);
        let sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();

        let mut count = 0;
        for session in sessions {
            let mut session = lock(&session);
            if session.matches(&publish.topic) {
                session.publish_message(forwarded.clone());
                count += 1;
            }
        }
        count
    }

    /// 保存或删除保留消息，空载荷表示删除
    pub(crate) fn retain(&self, publish: &Publish) {
        let mut retained = lock(&self.retained);
        if publish.payload.is_empty() {
            retained.remove(&publish.topic);
        } else {
            retained.insert(publish.topic.clone(), forwarded(publish, true));
        }
    }

    /// 与 filter 匹配的保留消息
    pub fn retained(&self, filter: &str) -> Vec<Publish> {
        lock(&self.retained)
            .values()
            .filter(|publish| topic::matches(filter, &publish.topic))
            .cloned()
            .collect()
    }
}

fn take_over(conn_tx: Option<UnboundedSender<Outgoing>>) {
    if let Some(conn_tx) = conn_tx {
        // 旧连接可能已经关闭
        let _ = conn_tx.send(Outgoing::Disconnect(DisconnectReasonCode::SessionTakenOver));
    }
}

fn expire(registry: Weak<Registry>, client_id: &str, connection_id: u64) {
    let registry = match registry.upgrade() {
        Some(registry) => registry,
        None => return,
    };

    let session = match lock(&registry.sessions).get(client_id).cloned() {
        Some(session) => session,
        None => return,
    };
    {
        let mut guard = lock(&session);
        if guard.removed || guard.is_connected() || guard.connection_id() != connection_id {
            return;
        }
        guard.removed = true;
    }
    registry.remove_session(client_id, &session);
    info!("Session of {} expired", client_id);
}

/// 转发给订阅者的消息：QoS 0，不带别名与订阅标识符
fn forwarded(publish: &Publish, retain: bool) -> Publish {
    let properties = &publish.properties;
    Publish {
        dup: false,
        qos: Default::default(),
        retain,
        topic: publish.topic.clone(),
        packet_id: None,
        properties: Properties {
            payload_format_indicator: properties.payload_format_indicator,
            message_expiry_interval: properties.message_expiry_interval,
            content_type: properties.content_type.clone(),
            response_topic: properties.response_topic.clone(),
            correlation_data: properties.correlation_data.clone(),
            user_properties: properties.user_properties.clone(),
            ..Default::default()
        },
        payload: publish.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    fn recv_publish(rx: &mut UnboundedReceiver<Outgoing>) -> Publish {
        match rx.try_recv().unwrap() {
            Outgoing::Publish(publish) => publish,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn new_and_resumed_sessions() {
        let registry = Arc::new(Registry::new(None));

        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, resumed) = registry.open_session("c", false, tx);
        assert!(!resumed);
        handle.lock().subscribe("a/#");
        registry.close_session(&handle, NEVER_EXPIRE);
        assert_eq!(registry.with_session("c", |s| s.is_connected()), Some(false));

        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, resumed) = registry.open_session("c", false, tx);
        assert!(resumed);
        assert_eq!(handle.lock().subscriptions(), vec!["a/#".to_string()]);
        registry.close_session(&handle, NEVER_EXPIRE);

        // clean start 丢弃旧会话
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, resumed) = registry.open_session("c", true, tx);
        assert!(!resumed);
        assert!(handle.lock().subscriptions().is_empty());
    }

    #[tokio::test]
    async fn zero_expiry_removes_session() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _) = registry.open_session("c", false, tx);
        registry.close_session(&handle, 0);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_expires() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _) = registry.open_session("c", false, tx);
        registry.close_session(&handle, 10);

        time::sleep(Duration::from_secs(9)).await;
        assert_eq!(registry.session_count(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_expiry() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _) = registry.open_session("c", false, tx);
        registry.close_session(&handle, 10);

        let (tx, _rx2) = mpsc::unbounded_channel();
        let (_handle, resumed) = registry.open_session("c", false, tx);
        assert!(resumed);

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_capped() {
        let registry = Arc::new(Registry::new(Some(5)));
        assert_eq!(registry.session_expiry(3600), 5);
        assert_eq!(registry.session_expiry(NEVER_EXPIRE), 5);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _) = registry.open_session("c", false, tx);
        registry.close_session(&handle, NEVER_EXPIRE);
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn removed_session_not_resumed() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (old, _) = registry.open_session("c", false, tx);
        old.lock().subscribe("a");
        registry.close_session(&old, NEVER_EXPIRE);
        // 过期定时器已标记，还没来得及从会话表删除
        old.lock().removed = true;

        let (tx, _rx) = mpsc::unbounded_channel();
        let (new, resumed) = registry.open_session("c", false, tx);
        assert!(!resumed);
        assert!(new.lock().subscriptions().is_empty());
        assert_eq!(registry.session_count(), 1);

        // 旧会话的关闭不影响新会话
        registry.close_session(&old, 0);
        assert_eq!(registry.with_session("c", |s| s.is_connected()), Some(true));
    }

    #[test]
    fn busy_session_does_not_block_other_clients() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (a, _) = registry.open_session("a", false, tx);
        let a = Arc::new(a);

        let guard = a.lock();
        let closer = {
            let registry = registry.clone();
            let a = a.clone();
            std::thread::spawn(move || registry.close_session(&a, 0))
        };
        // 关闭线程等待 a 的会话锁
        std::thread::sleep(Duration::from_millis(50));

        let (tx, _rx) = mpsc::unbounded_channel();
        let (_b, resumed) = registry.open_session("b", false, tx);
        assert!(!resumed);
        assert_eq!(registry.session_count(), 2);

        drop(guard);
        closer.join().unwrap();
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn take_over_disconnects_old_connection() {
        let registry = Arc::new(Registry::new(None));
        let (tx, mut old_rx) = mpsc::unbounded_channel();
        let (old, _) = registry.open_session("c", false, tx);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (new, resumed) = registry.open_session("c", false, tx);
        assert!(resumed);
        assert!(matches!(
            old_rx.try_recv(),
            Ok(Outgoing::Disconnect(DisconnectReasonCode::SessionTakenOver))
        ));

        // 旧连接关闭不影响新连接
        registry.close_session(&old, 0);
        assert_eq!(registry.with_session("c", |s| s.is_connected()), Some(true));
        registry.close_session(&new, 0);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn route_to_matching_sessions() {
        let registry = Arc::new(Registry::new(None));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (a, _) = registry.open_session("a", false, tx_a);
        a.lock().subscribe("/test/#");
        a.lock().subscribe("/test/+/foo");
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (b, _) = registry.open_session("b", false, tx_b);
        b.lock().subscribe("other");

        let mut publish = Publish::new("/test/mqttools/foo", &b"bar"[..]);
        publish.retain = true;
        publish.properties.topic_alias = Some(3);
        publish.properties.response_topic = Some("reply".into());
        assert_eq!(registry.route_publish(&publish), 1);

        // 多个订阅匹配时只投递一次
        let delivered = recv_publish(&mut rx_a);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(delivered.topic, "/test/mqttools/foo");
        assert_eq!(delivered.payload.as_ref(), b"bar");
        assert!(!delivered.retain);
        assert_eq!(delivered.properties.topic_alias, None);
        assert_eq!(delivered.properties.response_topic.as_deref(), Some("reply"));
    }

    #[tokio::test]
    async fn offline_messages_queued() {
        let registry = Arc::new(Registry::new(None));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _) = registry.open_session("c", false, tx);
        handle.lock().subscribe("t");
        registry.close_session(&handle, NEVER_EXPIRE);

        registry.route_publish(&Publish::new("t", &b"1"[..]));
        registry.route_publish(&Publish::new("t", &b"2"[..]));
        assert_eq!(registry.with_session("c", |s| s.pending_len()), Some(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.open_session("c", false, tx);
        assert_eq!(recv_publish(&mut rx).payload.as_ref(), b"1");
        assert_eq!(recv_publish(&mut rx).payload.as_ref(), b"2");
    }

    #[test]
    fn retained_messages() {
        let registry = Registry::new(None);
        let mut publish = Publish::new("a/b", &b"x"[..]);
        publish.retain = true;
        registry.retain(&publish);
        registry.retain(&Publish::new("a/c", &b"y"[..]));

        let retained = registry.retained("a/+");
        assert_eq!(retained.len(), 2);
        assert!(retained.iter().all(|p| p.retain));
        assert!(registry.retained("b").is_empty());

        registry.retain(&Publish::new("a/b", bytes::Bytes::new()));
        let retained = registry.retained("a/#");
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].topic, "a/c");
    }
}
