use std::{sync::Arc, time::Duration};

use mqttkit::{
    network::packet::{ConnectReasonCode, SubscribeReasonCode},
    Client, ClientConfig, Delivery, Error, Message, State,
};
use tokio::{io::DuplexStream, sync::mpsc::UnboundedReceiver, time};

mod common;

use common::{expect, next_delivery, send, DuplexConnector, TIMEOUT};

/// 客户端 id goo，不使用别名
const CONNECT: &[u8] = b"\x10\x10\x00\x04MQTT\x05\x02\x00\x00\x00\x00\x03goo";
const CONNACK: &[u8] = b"\x20\x03\x00\x00\x00";
/// 断线重连时 clean start 为 0
const RESUME_CONNECT: &[u8] = b"\x10\x10\x00\x04MQTT\x05\x00\x00\x00\x00\x00\x03goo";
const SERVER_UNAVAILABLE: &[u8] = b"\x20\x03\x00\x88\x00";

fn config() -> ClientConfig {
    ClientConfig {
        client_id: Some("goo".into()),
        keep_alive: 0,
        topic_alias_maximum: 0,
        response_timeout: TIMEOUT,
        connect_delays: Vec::new(),
        ..Default::default()
    }
}

async fn accept(streams: &mut UnboundedReceiver<DuplexStream>) -> DuplexStream {
    time::timeout(TIMEOUT, streams.recv())
        .await
        .expect("no connection in time")
        .unwrap()
}

/// 启动客户端并完成 CONNECT/CONNACK
async fn connected(cfg: ClientConfig) -> (Arc<Client>, DuplexStream, UnboundedReceiver<DuplexStream>) {
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();
    (client, broker, streams)
}

#[tokio::test]
async fn keep_alive_pings() {
    let mut cfg = config();
    cfg.keep_alive = 1;
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, b"\x10\x10\x00\x04MQTT\x05\x02\x00\x01\x00\x00\x03goo").await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();

    // 空闲 1 秒后发送 PINGREQ
    let begin = time::Instant::now();
    expect(&mut broker, b"\xc0\x00").await;
    assert!(begin.elapsed() >= Duration::from_millis(900));
    send(&mut broker, b"\xd0\x00").await;

    let begin = time::Instant::now();
    expect(&mut broker, b"\xc0\x00").await;
    assert!(begin.elapsed() >= Duration::from_millis(900));
    send(&mut broker, b"\xd0\x00").await;
    assert_eq!(client.state(), State::Connected);
}

#[tokio::test]
async fn missing_pingresp_loses_connection() {
    let mut cfg = config();
    cfg.keep_alive = 1;
    cfg.response_timeout = Duration::from_millis(200);
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let mut messages = client.messages().unwrap();
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, b"\x10\x10\x00\x04MQTT\x05\x02\x00\x01\x00\x00\x03goo").await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();

    expect(&mut broker, b"\xc0\x00").await;
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn publish_with_topic_alias() {
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(config(), connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    // broker 接受 5 个别名
    send(&mut broker, b"\x20\x06\x00\x00\x03\x22\x00\x05").await;
    start.await.unwrap().unwrap();

    client
        .publish(Message::new("/test/mqttools/foo", "bar"))
        .await
        .unwrap();
    expect(
        &mut broker,
        b"\x30\x1b\x00\x12/test/mqttools/foo\x03\x23\x00\x01bar",
    )
    .await;

    // 第二次只发送别名
    client
        .publish(Message::new("/test/mqttools/foo", "bar"))
        .await
        .unwrap();
    expect(&mut broker, b"\x30\x09\x00\x00\x03\x23\x00\x01bar").await;
}

#[tokio::test]
async fn receive_with_topic_alias() {
    let mut cfg = config();
    cfg.topic_alias_maximum = 5;
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let mut messages = client.messages().unwrap();
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(
        &mut broker,
        b"\x10\x13\x00\x04MQTT\x05\x02\x00\x00\x03\x22\x00\x05\x00\x03goo",
    )
    .await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();

    send(
        &mut broker,
        b"\x30\x2c\x00\x12/test/mqttools/foo\x03\x23\x00\x01sets-alias-in-broker",
    )
    .await;
    send(
        &mut broker,
        b"\x30\x1a\x00\x00\x03\x23\x00\x01published-with-alias",
    )
    .await;

    for payload in [&b"sets-alias-in-broker"[..], &b"published-with-alias"[..]] {
        match next_delivery(&mut messages).await {
            Delivery::Message(message) => {
                assert_eq!(message.topic, "/test/mqttools/foo");
                assert_eq!(message.payload.as_ref(), payload);
            }
            Delivery::ConnectionLost => panic!("connection lost"),
        }
    }
}

#[tokio::test]
async fn unknown_topic_alias_is_fatal() {
    let mut cfg = config();
    cfg.topic_alias_maximum = 5;
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let mut messages = client.messages().unwrap();
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(
        &mut broker,
        b"\x10\x13\x00\x04MQTT\x05\x02\x00\x00\x03\x22\x00\x05\x00\x03goo",
    )
    .await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();

    send(
        &mut broker,
        b"\x30\x1a\x00\x00\x03\x23\x00\x01published-with-alias",
    )
    .await;
    // DISCONNECT 0x94
    expect(&mut broker, b"\xe0\x02\x94\x00").await;
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);
}

#[tokio::test]
async fn reconnect_resumes_session() {
    let mut cfg = config();
    cfg.connect_delays = vec![Duration::from_millis(100)];
    let (client, broker, mut streams) = connected(cfg).await;
    let mut messages = client.messages().unwrap();

    // broker 关闭连接
    drop(broker);
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);

    let mut broker = accept(&mut streams).await;
    // clean start 为 0
    expect(&mut broker, RESUME_CONNECT).await;
    send(&mut broker, b"\x20\x03\x01\x00\x00").await;

    let deadline = time::Instant::now() + TIMEOUT;
    while client.state() != State::Connected {
        assert!(time::Instant::now() < deadline, "not reconnected");
        time::sleep(Duration::from_millis(10)).await;
    }

    // 恢复会话后继续收到消息
    send(&mut broker, b"\x30\x08\x00\x03a/b\x00hi").await;
    match next_delivery(&mut messages).await {
        Delivery::Message(message) => assert_eq!(message.topic, "a/b"),
        Delivery::ConnectionLost => panic!("connection lost"),
    }
}

#[tokio::test]
async fn connack_timeout() {
    let mut cfg = config();
    cfg.response_timeout = Duration::from_millis(200);
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    assert!(matches!(
        start.await.unwrap(),
        Err(Error::Timeout("CONNACK"))
    ));
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn connack_refused() {
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(config(), connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    send(&mut broker, b"\x20\x03\x00\x87\x00").await;
    assert!(matches!(
        start.await.unwrap(),
        Err(Error::Connect(ConnectReasonCode::NotAuthorized))
    ));
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn start_retries_after_server_unavailable() {
    let mut cfg = config();
    cfg.connect_delays = vec![Duration::from_millis(50)];
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    send(&mut broker, SERVER_UNAVAILABLE).await;

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    send(&mut broker, CONNACK).await;
    start.await.unwrap().unwrap();
    assert_eq!(client.state(), State::Connected);
}

#[tokio::test]
async fn start_gives_up_when_not_authorized() {
    let mut cfg = config();
    cfg.connect_delays = vec![Duration::from_millis(50)];
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, CONNECT).await;
    send(&mut broker, b"\x20\x03\x00\x87\x00").await;
    assert!(matches!(
        start.await.unwrap(),
        Err(Error::Connect(ConnectReasonCode::NotAuthorized))
    ));
    // 不再尝试连接
    assert!(time::timeout(Duration::from_millis(300), streams.recv())
        .await
        .is_err());
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn reconnect_continues_after_server_unavailable() {
    let mut cfg = config();
    cfg.connect_delays = vec![Duration::from_millis(50)];
    let (client, broker, mut streams) = connected(cfg).await;
    let mut messages = client.messages().unwrap();

    drop(broker);
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, RESUME_CONNECT).await;
    send(&mut broker, SERVER_UNAVAILABLE).await;

    let mut broker = accept(&mut streams).await;
    expect(&mut broker, RESUME_CONNECT).await;
    send(&mut broker, b"\x20\x03\x01\x00\x00").await;

    let deadline = time::Instant::now() + TIMEOUT;
    while client.state() != State::Connected {
        assert!(time::Instant::now() < deadline, "not reconnected");
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn connect_delays_hold_last_value() {
    let mut cfg = config();
    cfg.connect_delays = vec![Duration::from_millis(100), Duration::from_millis(300)];
    let (connector, mut streams) = DuplexConnector::new();
    let client = Arc::new(Client::with_connector(cfg, connector));
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start(false).await });

    // 前三次被拒绝，第四次成功
    let mut attempts = Vec::new();
    for connack in [SERVER_UNAVAILABLE, SERVER_UNAVAILABLE, SERVER_UNAVAILABLE, CONNACK] {
        let mut broker = accept(&mut streams).await;
        attempts.push(time::Instant::now());
        expect(&mut broker, CONNECT).await;
        send(&mut broker, connack).await;
    }
    start.await.unwrap().unwrap();

    let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, delay) in gaps.iter().zip([100, 300, 300]) {
        assert!(
            *gap >= Duration::from_millis(delay) && *gap < Duration::from_millis(delay + 50),
            "gaps {:?}",
            gaps
        );
    }
    assert_eq!(gaps.len(), 3);
}

#[tokio::test]
async fn suback_timeout_then_late_suback() {
    let mut cfg = config();
    cfg.response_timeout = Duration::from_millis(200);
    let (client, mut broker, _streams) = connected(cfg).await;

    let subscriber = client.clone();
    let subscribe = tokio::spawn(async move { subscriber.subscribe("a").await });
    expect(&mut broker, b"\x82\x07\x00\x01\x00\x00\x01a\x00").await;
    assert!(matches!(
        subscribe.await.unwrap(),
        Err(Error::Timeout("SUBACK"))
    ));

    // 迟到的 SUBACK 被丢弃，下一次订阅使用新的标识符
    send(&mut broker, b"\x90\x04\x00\x01\x00\x00").await;
    let subscriber = client.clone();
    let subscribe = tokio::spawn(async move { subscriber.subscribe("a").await });
    expect(&mut broker, b"\x82\x07\x00\x02\x00\x00\x01a\x00").await;
    send(&mut broker, b"\x90\x04\x00\x02\x00\x00").await;
    assert_eq!(
        subscribe.await.unwrap().unwrap(),
        SubscribeReasonCode::GrantedQoS0
    );
    assert_eq!(client.state(), State::Connected);
}

#[tokio::test]
async fn pending_subscribe_sees_connection_lost() {
    let (client, mut broker, _streams) = connected(config()).await;

    let subscriber = client.clone();
    let subscribe = tokio::spawn(async move { subscriber.subscribe("a").await });
    expect(&mut broker, b"\x82\x07\x00\x01\x00\x00\x01a\x00").await;
    drop(broker);
    assert!(matches!(
        subscribe.await.unwrap(),
        Err(Error::ConnectionLost)
    ));
}

#[tokio::test]
async fn stop_sends_disconnect() {
    let (client, mut broker, _streams) = connected(config()).await;
    let mut messages = client.messages().unwrap();

    client.stop().await;
    expect(&mut broker, b"\xe0\x02\x00\x00").await;
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);
    assert_eq!(client.state(), State::Disconnected);
    assert!(matches!(
        client.publish(Message::new("a", "b")).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn disconnected_by_broker() {
    let (client, mut broker, _streams) = connected(config()).await;
    let mut messages = client.messages().unwrap();

    // 0x8B 服务端关闭
    send(&mut broker, b"\xe0\x02\x8b\x00").await;
    assert_eq!(next_delivery(&mut messages).await, Delivery::ConnectionLost);
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn invalid_publish_topic() {
    let (client, _broker, _streams) = connected(config()).await;
    assert!(matches!(
        client.publish(Message::new("a/#", "b")).await,
        Err(Error::InvalidTopic(_))
    ));
    assert!(matches!(
        client.publish(Message::new("", "b")).await,
        Err(Error::InvalidTopic(_))
    ));
}
