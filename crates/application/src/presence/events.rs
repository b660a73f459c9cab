//! 频道事件的线上格式与类型化表示
//!
//! 事件名 + JSON 负载，负载字段使用 camelCase。

use domain::{ChannelId, PresenceStatus, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transport::{RawChannelEvent, TransportError};

/// 订阅成功（包括重连后的重新订阅），负载为当前全部成员
pub const SUBSCRIPTION_SUCCEEDED: &str = "subscription_succeeded";
/// 有成员加入频道
pub const MEMBER_ADDED: &str = "member_added";
/// 有成员离开频道（包括连接断开）
pub const MEMBER_REMOVED: &str = "member_removed";
/// 客户端事件：在线状态变更
pub const STATUS_CHANGED: &str = "client-status-changed";
/// 客户端事件：开始输入
pub const TYPING: &str = "client-typing";
/// 客户端事件：停止输入
pub const STOPPED_TYPING: &str = "client-stopped-typing";

/// 成员附带信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
}

/// 频道成员
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub id: UserId,
    pub info: MemberInfo,
}

impl ChannelMember {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            info: MemberInfo {
                name: name.into(),
                status: None,
            },
        }
    }

    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.info.status = Some(status);
        self
    }

    /// 没有携带状态的成员视为在线
    pub fn status(&self) -> PresenceStatus {
        self.info.status.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSucceeded {
    pub members: Vec<ChannelMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRemoved {
    pub id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub user_id: UserId,
    pub user_name: String,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedTyping {
    pub user_id: UserId,
    pub channel_id: ChannelId,
}

/// 类型化的频道事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    SubscriptionSucceeded(SubscriptionSucceeded),
    MemberAdded(ChannelMember),
    MemberRemoved(MemberRemoved),
    StatusChanged(StatusChanged),
    Typing(Typing),
    StoppedTyping(StoppedTyping),
}

impl PresenceEvent {
    /// 把原始事件解码为类型化事件；未知事件名返回 `Ok(None)`
    pub fn decode(raw: &RawChannelEvent) -> Result<Option<Self>, TransportError> {
        fn payload<T: serde::de::DeserializeOwned>(
            raw: &RawChannelEvent,
        ) -> Result<T, TransportError> {
            serde_json::from_value(raw.data.clone())
                .map_err(|e| TransportError::decode(raw.event.as_str(), e))
        }

        let event = match raw.event.as_str() {
            SUBSCRIPTION_SUCCEEDED => PresenceEvent::SubscriptionSucceeded(payload(raw)?),
            MEMBER_ADDED => PresenceEvent::MemberAdded(payload(raw)?),
            MEMBER_REMOVED => PresenceEvent::MemberRemoved(payload(raw)?),
            STATUS_CHANGED => PresenceEvent::StatusChanged(payload(raw)?),
            TYPING => PresenceEvent::Typing(payload(raw)?),
            STOPPED_TYPING => PresenceEvent::StoppedTyping(payload(raw)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            PresenceEvent::SubscriptionSucceeded(_) => SUBSCRIPTION_SUCCEEDED,
            PresenceEvent::MemberAdded(_) => MEMBER_ADDED,
            PresenceEvent::MemberRemoved(_) => MEMBER_REMOVED,
            PresenceEvent::StatusChanged(_) => STATUS_CHANGED,
            PresenceEvent::Typing(_) => TYPING,
            PresenceEvent::StoppedTyping(_) => STOPPED_TYPING,
        }
    }

    pub fn payload(&self) -> Value {
        let encoded = match self {
            PresenceEvent::SubscriptionSucceeded(p) => serde_json::to_value(p),
            PresenceEvent::MemberAdded(p) => serde_json::to_value(p),
            PresenceEvent::MemberRemoved(p) => serde_json::to_value(p),
            PresenceEvent::StatusChanged(p) => serde_json::to_value(p),
            PresenceEvent::Typing(p) => serde_json::to_value(p),
            PresenceEvent::StoppedTyping(p) => serde_json::to_value(p),
        };
        // 这些负载只包含字符串与枚举，编码不会失败
        encoded.unwrap_or(Value::Null)
    }

    pub fn into_raw(self, channel: impl Into<String>) -> RawChannelEvent {
        RawChannelEvent::new(channel, self.event_name(), self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn decodes_typing_payload() {
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let raw = RawChannelEvent::new(
            "group:x",
            TYPING,
            json!({ "userId": user, "userName": "Alice", "channelId": channel }),
        );

        let event = PresenceEvent::decode(&raw).unwrap().unwrap();
        assert_eq!(
            event,
            PresenceEvent::Typing(Typing {
                user_id: UserId::new(user),
                user_name: "Alice".to_string(),
                channel_id: ChannelId::new(channel),
            })
        );
    }

    #[test]
    fn member_without_status_defaults_to_online() {
        let raw = RawChannelEvent::new(
            "group:x",
            SUBSCRIPTION_SUCCEEDED,
            json!({ "members": [{ "id": Uuid::new_v4(), "info": { "name": "Bob" } }] }),
        );

        match PresenceEvent::decode(&raw).unwrap() {
            Some(PresenceEvent::SubscriptionSucceeded(payload)) => {
                assert_eq!(payload.members.len(), 1);
                assert_eq!(payload.members[0].status(), PresenceStatus::Online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn member_removed_ignores_extra_fields() {
        let id = Uuid::new_v4();
        let raw = RawChannelEvent::new(
            "group:x",
            MEMBER_REMOVED,
            json!({ "id": id, "info": { "name": "Bob" } }),
        );
        assert_eq!(
            PresenceEvent::decode(&raw).unwrap(),
            Some(PresenceEvent::MemberRemoved(MemberRemoved { id: UserId::new(id) }))
        );
    }

    #[test]
    fn unknown_event_is_skipped_and_bad_payload_rejected() {
        let unknown = RawChannelEvent::new("group:x", "client-reaction", json!({}));
        assert_eq!(PresenceEvent::decode(&unknown).unwrap(), None);

        let malformed = RawChannelEvent::new(
            "group:x",
            STATUS_CHANGED,
            json!({ "userId": "nope", "status": "busy" }),
        );
        assert!(matches!(
            PresenceEvent::decode(&malformed),
            Err(TransportError::Decode { .. })
        ));
    }

    #[test]
    fn encodes_back_to_raw() {
        let event = PresenceEvent::StatusChanged(StatusChanged {
            user_id: UserId::generate(),
            status: PresenceStatus::Dnd,
        });
        let raw = event.clone().into_raw("user:1");
        assert_eq!(raw.event, STATUS_CHANGED);
        assert_eq!(raw.data["status"], "dnd");
        assert_eq!(PresenceEvent::decode(&raw).unwrap(), Some(event));
    }
}
