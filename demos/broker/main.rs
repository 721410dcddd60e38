use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use mqttkit::{Broker, BrokerConfig};

/// MQTT 5.0 broker
#[derive(Parser)]
#[clap(name = "broker", version)]
struct Args {
    /// toml 配置文件
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// 监听地址，覆盖配置文件
    #[clap(short, long)]
    listen: Option<String>,
    /// 日志级别，默认读取 MQTTKIT_LOG
    #[clap(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _logger = demos::init_logger(args.log.as_deref())?;

    // 获取配置
    let mut cfg = match &args.config {
        Some(path) => BrokerConfig::from_path(path).await?,
        None => BrokerConfig::default(),
    };
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    // 启动 broker
    let broker = Arc::new(Broker::new(cfg));
    let server = broker.clone();
    let serve = tokio::spawn(async move { server.serve_forever().await });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping");
    broker.stop();
    serve.await??;
    Ok(())
}
