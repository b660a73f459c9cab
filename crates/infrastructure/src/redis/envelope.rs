//! Redis 频道上的消息格式与键命名

use application::RawChannelEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::RedisResult;

/// 发布到 Redis 频道的消息
///
/// `origin` 是发送方连接的标识，订阅方据此过滤自己发出的客户端事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisEnvelope {
    pub origin: Uuid,
    pub event: String,
    pub data: Value,
}

impl RedisEnvelope {
    pub fn new(origin: Uuid, event: impl Into<String>, data: Value) -> Self {
        Self {
            origin,
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> RedisResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> RedisResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn into_event(self, channel: &str) -> RawChannelEvent {
        RawChannelEvent::new(channel, self.event, self.data)
    }
}

/// 频道名到 Redis 键的映射
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 发布/订阅使用的 Redis 频道
    pub fn pubsub_channel(&self, channel: &str) -> String {
        format!("{}:channel:{}", self.prefix, channel)
    }

    /// 频道成员哈希：连接ID -> 成员 JSON
    pub fn members(&self, channel: &str) -> String {
        format!("{}:members:{}", self.prefix, channel)
    }

    /// 频道心跳有序集合：连接ID，分值为最近一次心跳的毫秒时间戳
    pub fn heartbeats(&self, channel: &str) -> String {
        format!("{}:heartbeats:{}", self.prefix, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        let keys = RedisKeys::new("chatroom:presence");
        assert_eq!(
            keys.pubsub_channel("group:42"),
            "chatroom:presence:channel:group:42"
        );
        assert_eq!(keys.members("dm:7"), "chatroom:presence:members:dm:7");
        assert_eq!(
            keys.heartbeats("dm:7"),
            "chatroom:presence:heartbeats:dm:7"
        );
    }

    #[test]
    fn test_envelope_wire_format() {
        let origin = Uuid::new_v4();
        let envelope = RedisEnvelope::new(origin, "client-typing", json!({ "userName": "Alice" }));
        let payload = envelope.encode().unwrap();

        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["origin"], origin.to_string());
        assert_eq!(value["event"], "client-typing");

        let event = RedisEnvelope::decode(&payload).unwrap().into_event("group:1");
        assert_eq!(event.channel, "group:1");
        assert_eq!(event.data["userName"], "Alice");
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(RedisEnvelope::decode("not json").is_err());
        assert!(RedisEnvelope::decode(r#"{"event":"x"}"#).is_err());
    }
}
