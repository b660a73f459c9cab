//! 权限键与默认权限表
//!
//! 权限键是封闭枚举：新增一个键时，`PermissionKey::default_for` 中的穷尽匹配
//! 会强制同步更新 everyone / moderator / admin 三张默认表。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 权限键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionKey {
    /// 管理群组设置
    ManageGroup,
    /// 管理角色
    ManageRoles,
    /// 管理频道
    ManageChannels,
    /// 踢出成员
    KickMembers,
    /// 封禁成员
    BanMembers,
    /// 创建邀请
    CreateInvites,
    /// 修改自己的昵称
    ChangeNickname,
    /// 修改他人昵称
    ManageNicknames,
    /// 查看频道
    ViewChannels,
    /// 发送消息
    SendMessages,
    /// 管理消息（删除他人消息、置顶）
    ManageMessages,
    /// 上传附件
    AttachFiles,
    /// 嵌入链接
    EmbedLinks,
    /// 添加表情回应
    AddReactions,
    /// 提及所有人
    MentionEveryone,
    /// 查看历史消息
    ReadMessageHistory,
    /// 连接语音频道
    Connect,
    /// 语音发言
    Speak,
    /// 禁言成员
    MuteMembers,
    /// 禁听成员
    DeafenMembers,
    /// 移动语音成员
    MoveMembers,
}

impl PermissionKey {
    pub const ALL: [PermissionKey; 21] = [
        PermissionKey::ManageGroup,
        PermissionKey::ManageRoles,
        PermissionKey::ManageChannels,
        PermissionKey::KickMembers,
        PermissionKey::BanMembers,
        PermissionKey::CreateInvites,
        PermissionKey::ChangeNickname,
        PermissionKey::ManageNicknames,
        PermissionKey::ViewChannels,
        PermissionKey::SendMessages,
        PermissionKey::ManageMessages,
        PermissionKey::AttachFiles,
        PermissionKey::EmbedLinks,
        PermissionKey::AddReactions,
        PermissionKey::MentionEveryone,
        PermissionKey::ReadMessageHistory,
        PermissionKey::Connect,
        PermissionKey::Speak,
        PermissionKey::MuteMembers,
        PermissionKey::DeafenMembers,
        PermissionKey::MoveMembers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKey::ManageGroup => "manageGroup",
            PermissionKey::ManageRoles => "manageRoles",
            PermissionKey::ManageChannels => "manageChannels",
            PermissionKey::KickMembers => "kickMembers",
            PermissionKey::BanMembers => "banMembers",
            PermissionKey::CreateInvites => "createInvites",
            PermissionKey::ChangeNickname => "changeNickname",
            PermissionKey::ManageNicknames => "manageNicknames",
            PermissionKey::ViewChannels => "viewChannels",
            PermissionKey::SendMessages => "sendMessages",
            PermissionKey::ManageMessages => "manageMessages",
            PermissionKey::AttachFiles => "attachFiles",
            PermissionKey::EmbedLinks => "embedLinks",
            PermissionKey::AddReactions => "addReactions",
            PermissionKey::MentionEveryone => "mentionEveryone",
            PermissionKey::ReadMessageHistory => "readMessageHistory",
            PermissionKey::Connect => "connect",
            PermissionKey::Speak => "speak",
            PermissionKey::MuteMembers => "muteMembers",
            PermissionKey::DeafenMembers => "deafenMembers",
            PermissionKey::MoveMembers => "moveMembers",
        }
    }

    /// 合成角色的默认授权值
    pub fn default_for(&self, role: SyntheticRole) -> bool {
        use PermissionKey::*;

        match role {
            SyntheticRole::Admin => true,
            SyntheticRole::Moderator => match self {
                ManageGroup | ManageRoles | ManageChannels => false,
                KickMembers | BanMembers | ManageNicknames | ManageMessages | MentionEveryone
                | MuteMembers | DeafenMembers | MoveMembers => true,
                _ => self.default_for(SyntheticRole::Everyone),
            },
            SyntheticRole::Everyone => match self {
                ManageGroup | ManageRoles | ManageChannels | KickMembers | BanMembers
                | ManageNicknames | ManageMessages | MentionEveryone | MuteMembers
                | DeafenMembers | MoveMembers => false,
                CreateInvites | ChangeNickname | ViewChannels | SendMessages | AttachFiles
                | EmbedLinks | AddReactions | ReadMessageHistory | Connect | Speak => true,
            },
        }
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| DomainError::validation_error("permission", format!("未知权限键 {s}")))
    }
}

/// 每个群组自带的合成角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyntheticRole {
    Everyone,
    Moderator,
    Admin,
}

impl SyntheticRole {
    pub const ALL: [SyntheticRole; 3] = [
        SyntheticRole::Everyone,
        SyntheticRole::Moderator,
        SyntheticRole::Admin,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SyntheticRole::Everyone => "everyone",
            SyntheticRole::Moderator => "moderator",
            SyntheticRole::Admin => "admin",
        }
    }

    pub fn position(&self) -> i64 {
        match self {
            SyntheticRole::Everyone => 0,
            SyntheticRole::Moderator => 50,
            SyntheticRole::Admin => 100,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            SyntheticRole::Everyone => "#99AAB5",
            SyntheticRole::Moderator => "#3498DB",
            SyntheticRole::Admin => "#E74C3C",
        }
    }

    /// 角色上定义的权限映射
    ///
    /// everyone 为每个键给出明确取值；moderator 与 admin 只写入授予项，
    /// 以免较高位置的默认 false 覆盖自定义角色的授予。
    pub fn permission_map(&self) -> BTreeMap<PermissionKey, bool> {
        PermissionKey::ALL
            .iter()
            .map(|key| (*key, key.default_for(*self)))
            .filter(|(_, granted)| *self == SyntheticRole::Everyone || *granted)
            .collect()
    }
}

/// 解析后的有效权限集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<PermissionKey>);

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: PermissionKey) -> bool {
        self.0.contains(&key)
    }

    pub fn contains_any(&self, keys: &[PermissionKey]) -> bool {
        keys.iter().any(|key| self.0.contains(key))
    }

    /// 空列表视为满足
    pub fn contains_all(&self, keys: &[PermissionKey]) -> bool {
        keys.iter().all(|key| self.0.contains(key))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = PermissionKey> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<PermissionKey> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<PermissionKey> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = PermissionKey>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_camel_case_on_the_wire() {
        let json = serde_json::to_string(&PermissionKey::ManageGroup).unwrap();
        assert_eq!(json, "\"manageGroup\"");

        for key in PermissionKey::ALL {
            let encoded = serde_json::to_string(&key).unwrap();
            assert_eq!(encoded, format!("\"{}\"", key.as_str()));
            assert_eq!(key.as_str().parse::<PermissionKey>().unwrap(), key);
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!("manageGruop".parse::<PermissionKey>().is_err());
        assert!(serde_json::from_str::<PermissionKey>("\"manageGruop\"").is_err());
    }

    #[test]
    fn everyone_defines_every_key() {
        let map = SyntheticRole::Everyone.permission_map();
        assert_eq!(map.len(), PermissionKey::ALL.len());
        assert_eq!(map.get(&PermissionKey::SendMessages), Some(&true));
        assert_eq!(map.get(&PermissionKey::BanMembers), Some(&false));
    }

    #[test]
    fn elevated_roles_only_carry_grants() {
        let moderator = SyntheticRole::Moderator.permission_map();
        assert!(moderator.values().all(|granted| *granted));
        assert!(moderator.contains_key(&PermissionKey::BanMembers));
        assert!(!moderator.contains_key(&PermissionKey::ManageRoles));

        let admin = SyntheticRole::Admin.permission_map();
        assert_eq!(admin.len(), PermissionKey::ALL.len());
    }

    #[test]
    fn permission_set_predicates() {
        let set: PermissionSet = [PermissionKey::SendMessages, PermissionKey::ViewChannels]
            .into_iter()
            .collect();

        assert!(set.contains(PermissionKey::SendMessages));
        assert!(set.contains_any(&[PermissionKey::BanMembers, PermissionKey::ViewChannels]));
        assert!(!set.contains_any(&[]));
        assert!(set.contains_all(&[PermissionKey::SendMessages, PermissionKey::ViewChannels]));
        assert!(!set.contains_all(&[PermissionKey::SendMessages, PermissionKey::BanMembers]));
    }
}
