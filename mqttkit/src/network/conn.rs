use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::packet::{self, FixedHeader, Packet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Connection reset by peer")]
    ConnectionReset,
    #[error("Packet of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),
}

/// 客户端与服务器之间的连接
/// 单纯的字节流读写管理
/// 以 packet 为单位读写
pub(crate) struct Connection<S> {
    stream: S,
    /// 读缓冲区
    /// 使用缓冲区而非按照字节 从 socket 读取数据
    read: BytesMut,
    /// 写缓冲区
    /// 先写入缓冲区再刷入 socket 而非按字节向 socket 写入数据
    write: BytesMut,
    /// 允许接收的最大报文长度
    max_incoming: Option<usize>,
    /// 对端允许接收的最大报文长度
    max_outgoing: Option<usize>,
}

impl<S> Connection<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4096),
            write: BytesMut::with_capacity(4096),
            max_incoming: None,
            max_outgoing: None,
        }
    }

    pub(crate) fn set_max_incoming(&mut self, max: Option<usize>) {
        self.max_incoming = max;
    }

    pub(crate) fn set_max_outgoing(&mut self, max: Option<usize>) {
        self.max_outgoing = max;
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// 读取一个 packet
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, Error> {
        loop {
            if let (Some(max), Ok(header)) = (self.max_incoming, FixedHeader::read_from(&self.read)) {
                if header.packet_len() > max {
                    return Err(Error::PacketTooLarge(header.packet_len()));
                }
            }

            match Packet::read(&mut self.read) {
                Ok(packet) => return Ok(packet),
                Err(packet::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Packet(e)),
            }

            // 数据不足，读取更多数据
            if 0 == self.stream.read_buf(&mut self.read).await? {
                // 对端关闭时缓冲区里还有半个报文
                if self.read.is_empty() {
                    return Err(Error::ConnectionAborted);
                } else {
                    return Err(Error::ConnectionReset);
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// 写入一个 packet 并立即刷入底层流
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        let start = self.write.len();
        packet.write(&mut self.write)?;

        let len = self.write.len() - start;
        if let Some(max) = self.max_outgoing {
            if len > max {
                self.write.truncate(start);
                return Err(Error::PacketTooLarge(len));
            }
        }

        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }

        self.stream.write_all(&self.write).await?;
        self.stream.flush().await?;
        self.write.clear();
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
