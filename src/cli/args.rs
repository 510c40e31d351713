use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use crate::infrastructure::logging::LogFormat;
use crate::messaging::events::{EventEnvelope, EventKind, EventPayload};

#[derive(Parser, Debug)]
#[command(
    name = "user-events",
    version,
    about = "Publish and consume user lifecycle events",
    long_about = "user-events publishes typed user events (registered, logged in, password changed, status changed, deleted, updated) to the broker and runs consumer groups that log what they receive."
)]
pub struct Args {
    /// 配置文件路径（TOML、YAML 或 JSON）
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 消息 Broker 后端
    #[arg(short, long, value_enum, default_value_t = BrokerKind::Kafka)]
    pub broker: BrokerKind,

    /// 日志输出格式
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// 启用调试日志
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    Kafka,
    /// 进程内 Broker，消息不离开当前进程
    Memory,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 发布一个用户事件
    Publish(PublishArgs),
    /// 消费指定路由键上的事件并记录日志，直到 Ctrl-C
    Consume(ConsumeArgs),
    /// 打印主题路由表
    Topics,
}

#[derive(clap::Args, Debug, Default)]
pub struct PublishArgs {
    /// 事件类型，例如 user.registered 或 user_registered
    #[arg(short, long)]
    pub kind: String,

    /// 事件所属用户 ID
    #[arg(short, long)]
    pub subject: String,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub email: Option<String>,

    #[arg(long)]
    pub old_status: Option<String>,

    #[arg(long)]
    pub new_status: Option<String>,

    #[arg(long)]
    pub reason: Option<String>,

    /// 操作人（修改密码 / 删除用户）
    #[arg(long)]
    pub actor: Option<String>,

    #[arg(long)]
    pub ip_address: Option<String>,

    #[arg(long)]
    pub user_agent: Option<String>,

    /// user.updated 的变更字段，可重复；值尽量按 JSON 解析
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,

    /// 入队后立即返回，不等待 Broker 确认
    #[arg(long = "async", default_value_t = false)]
    pub async_publish: bool,

    #[arg(long)]
    pub request_id: Option<String>,
}

#[derive(clap::Args, Debug, Default)]
pub struct ConsumeArgs {
    /// 要消费的路由键或主题，可重复（默认：全部事件类型）
    #[arg(short, long = "topic")]
    pub topics: Vec<String>,
}

impl PublishArgs {
    /// 根据参数构建事件，来源服务名由生产者按配置填充
    pub fn build_event(&self) -> anyhow::Result<EventEnvelope> {
        let kind: EventKind = self.kind.parse()?;

        let payload = match kind {
            EventKind::Registered => EventPayload::Registered {
                username: required(&self.username, "--username", kind)?,
                email: required(&self.email, "--email", kind)?,
            },
            EventKind::LoggedIn => EventPayload::LoggedIn {
                ip_address: self.ip_address.clone(),
                user_agent: self.user_agent.clone(),
            },
            EventKind::PasswordChanged => EventPayload::PasswordChanged {
                changed_by: self.actor.clone(),
            },
            EventKind::StatusChanged => EventPayload::StatusChanged {
                old_status: required(&self.old_status, "--old-status", kind)?,
                new_status: required(&self.new_status, "--new-status", kind)?,
                reason: self.reason.clone(),
            },
            EventKind::Deleted => EventPayload::Deleted {
                deleted_by: self.actor.clone(),
                reason: self.reason.clone(),
            },
            EventKind::Updated => EventPayload::Updated {
                changed_fields: parse_fields(&self.fields)?,
            },
        };

        let mut event = EventEnvelope::new(self.subject.as_str(), payload);
        if let Some(request_id) = &self.request_id {
            event = event.with_request_id(request_id.as_str());
        }
        Ok(event)
    }
}

fn required(value: &Option<String>, flag: &str, kind: EventKind) -> anyhow::Result<String> {
    value
        .clone()
        .with_context(|| format!("{} is required for {}", flag, kind))
}

fn parse_fields(fields: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    if fields.is_empty() {
        anyhow::bail!("at least one --field KEY=VALUE is required for {}", EventKind::Updated);
    }

    fields
        .iter()
        .map(|field| -> anyhow::Result<(String, serde_json::Value)> {
            let (key, raw) = field
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE, got '{}'", field))?;
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}
