//! 网络层
//! 本层只关心报文编解码与字节流读写，不包含任何协议状态

use async_trait::async_trait;
use tokio::{
    io::{self, AsyncRead, AsyncWrite},
    net::TcpStream,
};

pub mod alias;
pub mod conn;
pub mod packet;
pub mod topic;

/// 可以承载 MQTT 报文的双向字节流
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 建立到 broker 的字节流，客户端每次连接或重连时调用
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Stream>>;
}

/// 默认使用 TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Stream>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
