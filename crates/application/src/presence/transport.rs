//! 发布/订阅传输层抽象
//!
//! 适配器只通过这个接口接触传输层，具体实现可以是 Redis、进程内总线或其它消息代理。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::events::ChannelMember;

/// 传输层投递的原始频道事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChannelEvent {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

impl RawChannelEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("订阅频道 {channel} 失败: {message}")]
    Subscribe { channel: String, message: String },

    #[error("发布到频道 {channel} 失败: {message}")]
    Publish { channel: String, message: String },

    #[error("事件 {event} 解码失败: {message}")]
    Decode { event: String, message: String },

    #[error("未订阅频道 {channel}")]
    NotSubscribed { channel: String },

    #[error("传输连接已关闭")]
    Closed,
}

impl TransportError {
    pub fn subscribe(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    pub fn publish(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    pub fn decode(event: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            event: event.into(),
            message: message.to_string(),
        }
    }
}

/// 具名频道的发布/订阅传输
///
/// 约定：
/// - 每次（重新）订阅成功都要先投递一条 `subscription_succeeded`，携带当前全部成员；
/// - 其它客户端加入或离开时投递 `member_added` / `member_removed`；
/// - `trigger` 发出的客户端事件不会回送给发送者。
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// 以 `member` 的身份订阅频道，返回该频道的事件接收端
    async fn subscribe(
        &self,
        channel: &str,
        member: &ChannelMember,
    ) -> Result<mpsc::Receiver<RawChannelEvent>, TransportError>;

    /// 取消订阅并释放频道，之前返回的接收端随之关闭
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// 发布客户端事件
    async fn trigger(&self, channel: &str, event: &str, data: Value)
        -> Result<(), TransportError>;
}
