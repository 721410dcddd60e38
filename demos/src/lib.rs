//! 示例程序共用的日志初始化

use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

const DEFAULT_LOG: &str = "info";

/// 从环境变量读取的配置，变量名带 `MQTTKIT_` 前缀
#[derive(Debug, serde::Deserialize)]
struct Env {
    /// 日志级别，例如 `MQTTKIT_LOG=mqttkit=debug`
    #[serde(default = "default_log")]
    log: String,
}

fn default_log() -> String {
    DEFAULT_LOG.into()
}

/// 启动日志，命令行参数优先于环境变量
pub fn init_logger(spec: Option<&str>) -> Result<LoggerHandle, FlexiLoggerError> {
    let spec = match spec {
        Some(spec) => spec.to_owned(),
        None => envy::prefixed("MQTTKIT_")
            .from_env::<Env>()
            .map(|env| env.log)
            .unwrap_or_else(|_| default_log()),
    };
    Logger::try_with_str(spec)?
        .format(flexi_logger::detailed_format)
        .start()
}
