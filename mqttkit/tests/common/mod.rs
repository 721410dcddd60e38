#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mqttkit::{
    network::{Connector, Stream},
    Broker, BrokerConfig, ClientConfig, Delivery, Messages,
};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::TcpListener,
    sync::mpsc,
    time,
};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// 在随机端口上启动 broker
pub async fn start_broker(cfg: BrokerConfig) -> (Arc<Broker>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = Arc::new(Broker::new(cfg));
    let server = broker.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (broker, port)
}

pub fn client_config(port: u16, client_id: &str) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".into(),
        port,
        client_id: Some(client_id.into()),
        response_timeout: TIMEOUT,
        connect_delays: Vec::new(),
        ..Default::default()
    }
}

pub async fn next_delivery(messages: &mut Messages) -> Delivery {
    time::timeout(TIMEOUT, messages.recv())
        .await
        .expect("no delivery in time")
        .expect("messages closed")
}

/// 每次连接都创建一对内存流，另一端交给测试扮演 broker
pub struct DuplexConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<Box<dyn Stream>> {
        let (client, broker) = io::duplex(4096);
        self.tx
            .send(broker)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "fake broker gone"))?;
        Ok(Box::new(client))
    }
}

/// 读取并比较对端发来的字节
pub async fn expect(stream: &mut DuplexStream, expected: &[u8]) {
    let mut buf = vec![0; expected.len()];
    time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("no data in time")
        .unwrap();
    assert_eq!(buf, expected);
}

pub async fn send(stream: &mut DuplexStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}
