//! 在线状态与输入状态实体
//!
//! 这些记录都是客户端本地的派生状态，从不作为持久化数据源。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChannelId, ConversationId, GroupId, Timestamp, UserId};

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Dnd => "dnd",
            PresenceStatus::Invisible => "invisible",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "idle" => Ok(PresenceStatus::Idle),
            "dnd" => Ok(PresenceStatus::Dnd),
            "invisible" => Ok(PresenceStatus::Invisible),
            other => Err(DomainError::validation_error(
                "status",
                format!("未知在线状态 {other}"),
            )),
        }
    }
}

/// 在线状态记录
///
/// 成员离开频道时整条记录被删除，而不是变成某种“离线”状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: Timestamp,
}

/// 输入状态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRecord {
    pub user_id: UserId,
    pub user_name: String,
    pub channel_id: ChannelId,
    pub expires_at: Timestamp,
}

/// 传输层频道的逻辑作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelScope {
    Group(GroupId),
    DirectMessage(ConversationId),
    User(UserId),
}

impl ChannelScope {
    /// 作用域对应的传输频道名：`group:{id}`、`dm:{id}`、`user:{id}`
    pub fn channel_name(&self) -> String {
        match self {
            ChannelScope::Group(id) => format!("group:{id}"),
            ChannelScope::DirectMessage(id) => format!("dm:{id}"),
            ChannelScope::User(id) => format!("user:{id}"),
        }
    }
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

impl FromStr for ChannelScope {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation_error("channel", format!("无法识别的频道名 {s}"));
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;

        match kind {
            "group" => id.parse().map(ChannelScope::Group).map_err(|_| invalid()),
            "dm" => id.parse().map(ChannelScope::DirectMessage).map_err(|_| invalid()),
            "user" => id.parse().map(ChannelScope::User).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_values() {
        assert_eq!(serde_json::to_string(&PresenceStatus::Dnd).unwrap(), "\"dnd\"");
        assert_eq!("idle".parse::<PresenceStatus>().unwrap(), PresenceStatus::Idle);
        assert!("offline".parse::<PresenceStatus>().is_err());
    }

    #[test]
    fn scope_channel_names_parse_back() {
        let scopes = [
            ChannelScope::Group(GroupId::generate()),
            ChannelScope::DirectMessage(ConversationId::generate()),
            ChannelScope::User(UserId::generate()),
        ];

        for scope in scopes {
            assert_eq!(scope.channel_name().parse::<ChannelScope>().unwrap(), scope);
        }
        assert!("room:abc".parse::<ChannelScope>().is_err());
        assert!("group:not-a-uuid".parse::<ChannelScope>().is_err());
    }
}
