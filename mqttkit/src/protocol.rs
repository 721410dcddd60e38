//! 协议层
//! 处理会话相关的逻辑，依赖于底层的网络层进行网络读写

use crate::network::packet::{DisconnectReasonCode, Publish};

pub(crate) use handler::serve;
pub(crate) use registry::lock;
pub use registry::{Registry, NEVER_EXPIRE};
pub use session::Session;

mod handler;
mod registry;
mod session;

/// 会话发送给客户端连接的消息
#[derive(Debug)]
pub enum Outgoing {
    /// 转发给客户端的消息
    Publish(Publish),
    /// 通知连接断开
    Disconnect(DisconnectReasonCode),
}
