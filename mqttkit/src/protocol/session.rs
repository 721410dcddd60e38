use std::collections::{BTreeSet, VecDeque};

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

use crate::network::{packet::Publish, topic};

use super::Outgoing;

/// 代表服务端的一次会话
/// 会话的生命周期不能小于一次客户端连接
/// 客户端断开后，会话在过期前保留订阅与断开期间收到的消息
/// 协议层会话和网络层连接通过 conn_tx 进行通信
#[derive(Debug)]
pub struct Session {
    /// 客户端 id
    client_id: String,
    /// 订阅的 filter，不可以重复订阅
    subscriptions: BTreeSet<String>,
    /// 断开期间收到的消息，重连后按顺序发送
    pending: VecDeque<Publish>,
    /// 发送给客户端的消息，None 表示客户端未连接
    conn_tx: Option<UnboundedSender<Outgoing>>,
    /// 当前（或最后一次）连接的编号
    connection_id: u64,
    /// 过期定时器
    pub(crate) expiry: Option<JoinHandle<()>>,
    /// 已经（或即将）从会话表中删除，不能再被连接接管
    pub(crate) removed: bool,
}

impl Session {
    pub(crate) fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.into(),
            subscriptions: BTreeSet::new(),
            pending: VecDeque::new(),
            conn_tx: None,
            connection_id: 0,
            expiry: None,
            removed: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.conn_tx.is_some()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }

    /// 断开期间积压的消息数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// 返回 true 表示是新增的订阅
    pub(crate) fn subscribe(&mut self, filter: &str) -> bool {
        self.subscriptions.insert(filter.into())
    }

    /// 返回 false 表示订阅原本不存在
    pub(crate) fn unsubscribe(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter)
    }

    /// 任意一个订阅匹配 topic
    pub(crate) fn matches(&self, topic: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|filter| topic::matches(filter, topic))
    }

    /// 新的连接接管会话，积压的消息立即发往新连接
    ///
    /// 返回被接管的旧连接
    pub(crate) fn attach(
        &mut self,
        connection_id: u64,
        conn_tx: UnboundedSender<Outgoing>,
    ) -> Option<UnboundedSender<Outgoing>> {
        self.cancel_expiry();
        self.connection_id = connection_id;
        let previous = self.conn_tx.replace(conn_tx);

        while let Some(publish) = self.pending.pop_front() {
            if !self.send(publish) {
                break;
            }
        }
        previous
    }

    /// 客户端断开，会话进入离线状态
    pub(crate) fn detach(&mut self) -> Option<UnboundedSender<Outgoing>> {
        self.conn_tx.take()
    }

    /// 给客户端发送消息，客户端不在线时暂存
    pub(crate) fn publish_message(&mut self, publish: Publish) {
        if self.conn_tx.is_some() && self.pending.is_empty() {
            self.send(publish);
        } else {
            self.pending.push_back(publish);
        }
    }

    pub(crate) fn cancel_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }

    /// 发送失败说明连接已经关闭，消息放回队首
    fn send(&mut self, publish: Publish) -> bool {
        let sender = match &self.conn_tx {
            Some(sender) => sender,
            None => {
                self.pending.push_front(publish);
                return false;
            }
        };
        match sender.send(Outgoing::Publish(publish)) {
            Ok(()) => true,
            Err(e) => {
                if let Outgoing::Publish(publish) = e.0 {
                    self.pending.push_front(publish);
                }
                self.conn_tx = None;
                false
            }
        }
    }
}
