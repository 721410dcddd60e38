//! 客户端与 broker 配置，可以从 toml 文件加载
//!
//! 时间类字段在 toml 中以秒为单位，允许小数

use std::{path::Path, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use tokio::{fs, io::AsyncReadExt};
use uuid::Uuid;

use crate::{error::Error, network::packet::RetainForwardRule};

/// 客户端配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// 不指定时随机生成
    pub client_id: Option<String>,
    pub will: Option<Will>,
    /// 单位秒，0 表示关闭
    pub keep_alive: u16,
    /// 等待 CONNACK/SUBACK/UNSUBACK/PINGRESP 的时间
    #[serde(deserialize_with = "secs")]
    pub response_timeout: Duration,
    /// 愿意接收的最大主题别名，0 表示不接收
    pub topic_alias_maximum: u16,
    pub session_expiry_interval: u32,
    /// 连接成功后订阅的 filter
    pub subscriptions: Vec<Subscription>,
    /// 重连前的等待时间，依次使用，最后一个一直重复；为空表示不重连
    #[serde(deserialize_with = "secs_list")]
    pub connect_delays: Vec<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            will: None,
            keep_alive: 60,
            response_timeout: Duration::from_secs(5),
            topic_alias_maximum: 10,
            session_expiry_interval: 0,
            subscriptions: Vec::new(),
            connect_delays: [1, 2, 4, 8].into_iter().map(Duration::from_secs).collect(),
            username: None,
            password: None,
        }
    }
}

impl ClientConfig {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        load(path).await
    }
}

/// 连接后自动订阅的 filter
///
/// toml 中可以只写 filter，也可以写成 `{ filter = "a/#", retain_handling = "never" }`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "SubscriptionRepr")]
pub struct Subscription {
    pub filter: String,
    pub retain_handling: RetainForwardRule,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, retain_handling: RetainForwardRule) -> Self {
        Self {
            filter: filter.into(),
            retain_handling,
        }
    }
}

impl From<&str> for Subscription {
    fn from(filter: &str) -> Self {
        Self::new(filter, RetainForwardRule::default())
    }
}

impl From<String> for Subscription {
    fn from(filter: String) -> Self {
        Self::new(filter, RetainForwardRule::default())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubscriptionRepr {
    Filter(String),
    Table {
        filter: String,
        #[serde(default)]
        retain_handling: RetainForwardRule,
    },
}

impl From<SubscriptionRepr> for Subscription {
    fn from(repr: SubscriptionRepr) -> Self {
        match repr {
            SubscriptionRepr::Filter(filter) => filter.into(),
            SubscriptionRepr::Table {
                filter,
                retain_handling,
            } => Self::new(filter, retain_handling),
        }
    }
}

/// 遗嘱消息，客户端异常断开时由 broker 发布
#[derive(Debug, Clone, Deserialize)]
pub struct Will {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

/// broker 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 监听地址
    pub listen: String,
    /// 允许客户端使用的最大主题别名，0 表示不允许
    pub topic_alias_maximum: u16,
    /// 允许接收的最大报文长度
    pub maximum_packet_size: Option<u32>,
    pub session: SessionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:1883".into(),
            topic_alias_maximum: 10,
            maximum_packet_size: None,
            session: SessionConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        load(path).await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 会话过期时间上限，单位秒
    pub max_expiry_interval: Option<u32>,
}

/// 随机生成的客户端 id
pub(crate) fn random_client_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("mqttkit-{}", &uuid[..14])
}

async fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let mut file = fs::File::open(path).await?;
    let mut s = String::new();
    file.read_to_string(&mut s).await?;

    Ok(toml::from_str::<T>(&s)?)
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn secs_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
    Vec::<f64>::deserialize(deserializer)?
        .into_iter()
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .collect()
}
