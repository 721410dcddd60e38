//! 一个 MQTT 5.0 客户端与 broker 库，只支持 QoS 0
//!
//! * [`Client`] 连接 broker，订阅、发布消息，断线后自动重连
//! * [`Broker`] 接受客户端连接，维护会话并转发消息

use async_trait::async_trait;

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use broker::Broker;
pub use client::{Client, Delivery, Message, Messages, State};
pub use config::{BrokerConfig, ClientConfig, Subscription};
pub use error::Error;
pub use network::packet::RetainForwardRule;

/// mqtt事件发生时的回调，由用户实现
///
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 客户端认证
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool;
    /// 客户端上线
    async fn connected(&self, client_id: &str);
    /// 客户端连接断开
    async fn disconnected(&self, client_id: &str);
}

/// 不带用户名密码的客户端都可以连接
pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        username.is_none() && password.is_none()
    }

    async fn connected(&self, _client_id: &str) {}

    async fn disconnected(&self, _client_id: &str) {}
}
