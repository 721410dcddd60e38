use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand};
use log::info;
use mqttkit::{Client, ClientConfig, Delivery, Message, RetainForwardRule, Subscription};

/// MQTT 5.0 客户端
#[derive(Parser)]
#[clap(name = "client", version)]
struct Args {
    /// toml 配置文件
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// broker 地址，覆盖配置文件
    #[clap(short = 'H', long)]
    host: Option<String>,
    #[clap(short, long)]
    port: Option<u16>,
    #[clap(long)]
    client_id: Option<String>,
    /// 日志级别，默认读取 MQTTKIT_LOG
    #[clap(long)]
    log: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 订阅并打印收到的消息，Ctrl-C 退出
    Subscribe {
        #[clap(required = true)]
        filters: Vec<String>,
        /// 恢复上一次的会话
        #[clap(long)]
        resume: bool,
        /// 不接收订阅时已有的保留消息
        #[clap(long)]
        no_retained: bool,
    },
    /// 发布消息
    Publish {
        topic: String,
        payload: String,
        /// 发布次数
        #[clap(short = 'n', long, default_value_t = 1)]
        count: usize,
        #[clap(short, long)]
        retain: bool,
        #[clap(long)]
        response_topic: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _logger = demos::init_logger(args.log.as_deref())?;

    let mut cfg = match &args.config {
        Some(path) => ClientConfig::from_path(path).await?,
        None => ClientConfig::default(),
    };
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if args.client_id.is_some() {
        cfg.client_id = args.client_id;
    }

    match args.command {
        Command::Subscribe {
            filters,
            resume,
            no_retained,
        } => {
            let retain_handling = match no_retained {
                true => RetainForwardRule::Never,
                false => RetainForwardRule::OnEverySubscribe,
            };
            cfg.subscriptions = filters
                .into_iter()
                .map(|filter| Subscription::new(filter, retain_handling))
                .collect();
            subscribe(cfg, resume).await
        }
        Command::Publish {
            topic,
            payload,
            count,
            retain,
            response_topic,
        } => {
            // 发布完就退出，不需要重连
            cfg.connect_delays.clear();
            let client = Client::new(cfg);
            client.start(false).await?;
            for _ in 0..count {
                let mut message = Message::new(topic.clone(), payload.clone());
                message.retain = retain;
                message.response_topic = response_topic.clone();
                client.publish(message).await?;
            }
            info!("Published {} message(s) to {}", count, topic);
            client.stop().await;
            Ok(())
        }
    }
}

async fn subscribe(cfg: ClientConfig, resume: bool) -> Result<(), Box<dyn Error>> {
    let client = Client::new(cfg);
    let mut messages = client.messages().ok_or("messages already taken")?;
    match client.start(resume).await {
        Ok(()) => {}
        Err(mqttkit::Error::SessionResume) => info!("No session to resume, subscribed again"),
        Err(e) => return Err(e.into()),
    }

    loop {
        tokio::select! {
            delivery = messages.recv() => match delivery {
                Some(Delivery::Message(message)) => println!(
                    "{}: {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                ),
                Some(Delivery::ConnectionLost) => info!("Connection lost"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await;
    Ok(())
}
