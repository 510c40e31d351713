use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::messaging::codec::SerializationFormat;
use crate::messaging::error::MessagingError;
use crate::messaging::events::DEFAULT_SOURCE;

/// 所有配置项的环境变量前缀
pub const ENV_PREFIX: &str = "USER_EVENTS_";

/// 消息子系统配置：Broker 连接、主题路由与调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker 地址列表
    pub brokers: Vec<String>,

    /// 上报给 Broker 的客户端 ID
    pub client_id: String,

    /// 默认消费者组（处理器未指定时使用）
    pub consumer_group: String,

    /// 发布事件时写入的来源服务名
    pub source: String,

    /// 路由键 -> 实际主题名 的覆盖配置
    pub topics: HashMap<String, String>,

    /// 事件负载的序列化格式
    pub serialization_format: SerializationFormat,

    pub producer: ProducerSettings,

    pub consumer: ConsumerSettings,
}

/// 生产批次使用的压缩算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(MessagingError::config(format!(
                "unsupported compression codec: {}",
                other
            ))),
        }
    }
}

/// 新消费者组的起始读取位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// 生产者配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// 首次失败后客户端的重试次数
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// 启用幂等生产（Broker 端对重试去重）
    pub idempotent: bool,
    pub acks: String,
    pub compression: Compression,
    /// 批量大小阈值（字节）
    pub batch_size: usize,
    /// 批量发送等待时间（毫秒）
    pub linger_ms: u64,
    /// 同步发布等待确认的超时时间
    pub sync_timeout_secs: u64,
    /// 异步发布进入发送队列的超时时间
    pub enqueue_timeout_secs: u64,
    /// 异步发送队列容量
    pub channel_buffer_size: usize,
    /// 关闭时刷新待发送消息的超时时间
    pub flush_timeout_secs: u64,
    /// 原始客户端配置覆盖，最后应用
    pub extra: HashMap<String, String>,
}

/// 消费者配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub session_timeout_ms: u64,
    pub auto_offset_reset: OffsetReset,
    pub auto_commit_interval_ms: u64,
    /// 加入或拉取失败后重新加入前的等待时间
    pub rejoin_backoff_ms: u64,
    /// 处理失败的消息交回重投前的等待时间
    pub redelivery_backoff_ms: u64,
    /// 原始客户端配置覆盖，最后应用
    pub extra: HashMap<String, String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "user-events".to_string(),
            consumer_group: "user-events-consumers".to_string(),
            source: DEFAULT_SOURCE.to_string(),
            topics: HashMap::new(),
            serialization_format: SerializationFormat::Json,
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 100,
            idempotent: true,
            acks: "all".to_string(),
            compression: Compression::Snappy,
            batch_size: 16384,
            linger_ms: 5,
            sync_timeout_secs: 30,
            enqueue_timeout_secs: 5,
            channel_buffer_size: 256,
            flush_timeout_secs: 10,
            extra: HashMap::new(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            session_timeout_ms: 10000,
            auto_offset_reset: OffsetReset::Earliest,
            auto_commit_interval_ms: 1000,
            rejoin_backoff_ms: 2000,
            redelivery_backoff_ms: 500,
            extra: HashMap::new(),
        }
    }
}

impl ProducerSettings {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs(self.enqueue_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

impl ConsumerSettings {
    pub fn rejoin_backoff(&self) -> Duration {
        Duration::from_millis(self.rejoin_backoff_ms)
    }

    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }
}

impl MessagingConfig {
    /// `host:port,host:port` 形式的 Broker 列表
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(MessagingError::config("at least one broker address is required"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(MessagingError::config("consumer_group must not be empty"));
        }
        if self.producer.sync_timeout_secs == 0 {
            return Err(MessagingError::config("producer.sync_timeout_secs must be > 0"));
        }
        if self.producer.enqueue_timeout_secs == 0 {
            return Err(MessagingError::config("producer.enqueue_timeout_secs must be > 0"));
        }
        if self.producer.channel_buffer_size == 0 {
            return Err(MessagingError::config("producer.channel_buffer_size must be > 0"));
        }
        if self.producer.idempotent && self.producer.acks != "all" && self.producer.acks != "-1" {
            return Err(MessagingError::config(
                "idempotent production requires producer.acks = \"all\"",
            ));
        }
        Ok(())
    }
}

/// 配置来源
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    DotEnv(Option<PathBuf>),
    Environment,
    Default,
}

/// 配置加载器：按顺序合并配置来源，后者覆盖前者
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
        }
    }

    /// 默认值 -> 配置文件（可选） -> `.env` -> 环境变量
    pub fn standard(config_path: Option<PathBuf>) -> Self {
        let mut loader = Self::new();
        if let Some(path) = config_path {
            loader = loader.add_source(ConfigSource::File(path));
        }
        loader
            .add_source(ConfigSource::DotEnv(None))
            .add_source(ConfigSource::Environment)
    }

    pub fn add_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn load(&self) -> Result<MessagingConfig, MessagingError> {
        let mut config = MessagingConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::File(path) => {
                    config = Self::load_from_file(path)?;
                }
                ConfigSource::DotEnv(path) => {
                    // .env 文件不存在不算错误
                    match path {
                        Some(path) => {
                            dotenvy::from_path(path).ok();
                        }
                        None => {
                            dotenvy::dotenv().ok();
                        }
                    }
                }
                ConfigSource::Environment => {
                    Self::apply_overrides(&mut config, std::env::vars())?;
                }
                ConfigSource::Default => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML、YAML 或 JSON 文件，未出现的字段保留默认值
    pub fn load_from_file(path: &Path) -> Result<MessagingConfig, MessagingError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MessagingError::config(format!("cannot read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| MessagingError::config(format!("TOML parse error: {}", e))),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| MessagingError::config(format!("YAML parse error: {}", e))),
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| MessagingError::config(format!("JSON parse error: {}", e))),
            _ => Err(MessagingError::config(format!(
                "unsupported config file format: {}",
                path.display()
            ))),
        }
    }

    /// 应用 `USER_EVENTS_*` 环境变量（名称, 值）
    pub fn apply_overrides<I>(config: &mut MessagingConfig, vars: I) -> Result<(), MessagingError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match key {
                "BROKERS" => {
                    config.brokers = value
                        .split(',')
                        .map(|b| b.trim().to_string())
                        .filter(|b| !b.is_empty())
                        .collect();
                }
                "CLIENT_ID" => config.client_id = value,
                "CONSUMER_GROUP" => config.consumer_group = value,
                "SOURCE" => config.source = value,
                "SERIALIZATION_FORMAT" => config.serialization_format = value.parse()?,
                "COMPRESSION" => config.producer.compression = value.parse()?,
                "PRODUCER_MAX_RETRIES" => {
                    config.producer.max_retries = parse_number(key, &value)?;
                }
                "PRODUCER_SYNC_TIMEOUT_SECS" => {
                    config.producer.sync_timeout_secs = parse_number(key, &value)?;
                }
                "PRODUCER_ENQUEUE_TIMEOUT_SECS" => {
                    config.producer.enqueue_timeout_secs = parse_number(key, &value)?;
                }
                other => {
                    if let Some(route) = other.strip_prefix("TOPIC_") {
                        config.topics.insert(route.to_ascii_lowercase(), value);
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MessagingError> {
    value
        .trim()
        .parse()
        .map_err(|_| MessagingError::config(format!("{}{} must be a number, got '{}'", ENV_PREFIX, key, value)))
}
