use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

use crate::{
    error::Error,
    network::packet::{ConnAck, SubAck, UnsubAck},
    protocol::lock,
};

/// 分配报文标识符：单调递增，跳过 0 和正在使用的标识符
#[derive(Debug)]
pub(crate) struct PacketIdAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }
}

impl PacketIdAllocator {
    /// 所有标识符都在使用时返回 None
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() == u16::MAX as usize {
            return None;
        }
        loop {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if self.in_use.insert(id) {
                return Some(id);
            }
        }
    }

    pub(crate) fn free(&mut self, id: u16) {
        self.in_use.remove(&id);
    }
}

/// 等待 broker 响应的报文
#[derive(Debug)]
pub(crate) enum Response {
    SubAck(SubAck),
    UnsubAck(UnsubAck),
}

#[derive(Debug, Default)]
struct Inner {
    ids: PacketIdAllocator,
    waiters: HashMap<u16, oneshot::Sender<Response>>,
    connack: Option<oneshot::Sender<ConnAck>>,
    /// 每次连接断开时加一，旧连接上的请求不会释放新连接的标识符
    generation: u64,
}

/// 正在等待响应的请求
#[derive(Debug, Clone, Default)]
pub(crate) struct Requests {
    inner: Arc<Mutex<Inner>>,
}

impl Requests {
    /// 分配标识符并登记等待者，返回的 guard 被丢弃时取消请求
    pub(crate) fn register(&self) -> Result<(Pending, oneshot::Receiver<Response>), Error> {
        let mut inner = lock(&self.inner);
        let packet_id = inner
            .ids
            .allocate()
            .ok_or(Error::PacketIdentifiersExhausted)?;
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(packet_id, tx);

        let pending = Pending {
            requests: self.clone(),
            packet_id,
            generation: inner.generation,
        };
        Ok((pending, rx))
    }

    /// 收到响应，返回 false 表示没有对应的请求
    pub(crate) fn complete(&self, packet_id: u16, response: Response) -> bool {
        let mut inner = lock(&self.inner);
        match inner.waiters.remove(&packet_id) {
            Some(tx) => {
                inner.ids.free(packet_id);
                // 等待者可能已超时
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    fn cancel(&self, packet_id: u16, generation: u64) {
        let mut inner = lock(&self.inner);
        if inner.generation == generation && inner.waiters.remove(&packet_id).is_some() {
            inner.ids.free(packet_id);
        }
    }

    pub(crate) fn expect_connack(&self) -> oneshot::Receiver<ConnAck> {
        let (tx, rx) = oneshot::channel();
        lock(&self.inner).connack = Some(tx);
        rx
    }

    /// 收到 CONNACK，返回 false 表示不在等待 CONNACK
    pub(crate) fn complete_connack(&self, connack: ConnAck) -> bool {
        match lock(&self.inner).connack.take() {
            Some(tx) => tx.send(connack).is_ok(),
            None => false,
        }
    }

    /// 连接断开，所有等待者收到连接丢失
    pub(crate) fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.waiters.clear();
        inner.connack = None;
        inner.ids = PacketIdAllocator::default();
        inner.generation += 1;
    }
}

/// 请求的标识符，被丢弃时释放
pub(crate) struct Pending {
    requests: Requests,
    pub(crate) packet_id: u16,
    generation: u64,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.requests.cancel(self.packet_id, self.generation);
    }
}
