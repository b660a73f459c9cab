//! 群组成员实体定义

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entities::permission::PermissionSet;
use crate::value_objects::{GroupId, RoleId, Timestamp, UserId};

/// 群组成员实体
///
/// `permissions` 是由角色解析出的缓存投影，每次 `roles` 变化都要重新计算，
/// 不能脱离角色目录单独作为权限依据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// 用户ID
    pub user_id: UserId,
    /// 群组ID
    pub group_id: GroupId,
    /// 持有的角色
    pub roles: BTreeSet<RoleId>,
    /// 权限缓存投影
    #[serde(default)]
    pub permissions: PermissionSet,
    /// 加入时间
    pub joined_at: Timestamp,
}

impl Member {
    /// 创建新成员，初始不持有任何角色
    pub fn new(group_id: GroupId, user_id: UserId, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            group_id,
            roles: BTreeSet::new(),
            permissions: PermissionSet::empty(),
            joined_at,
        }
    }

    /// 检查是否持有指定角色
    pub fn has_role(&self, role_id: RoleId) -> bool {
        self.roles.contains(&role_id)
    }

    /// 替换角色集合与对应的权限投影
    pub fn set_roles(&mut self, roles: BTreeSet<RoleId>, permissions: PermissionSet) {
        self.roles = roles;
        self.permissions = permissions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::permission::PermissionKey;
    use chrono::Utc;

    #[test]
    fn test_new_member_holds_nothing() {
        let member = Member::new(GroupId::generate(), UserId::generate(), Utc::now());
        assert!(member.roles.is_empty());
        assert!(member.permissions.is_empty());
    }

    #[test]
    fn test_set_roles_replaces_projection() {
        let mut member = Member::new(GroupId::generate(), UserId::generate(), Utc::now());
        let role_id = RoleId::generate();

        member.set_roles(
            BTreeSet::from([role_id]),
            [PermissionKey::SendMessages].into_iter().collect(),
        );
        assert!(member.has_role(role_id));
        assert!(member.permissions.contains(PermissionKey::SendMessages));

        member.set_roles(BTreeSet::new(), PermissionSet::empty());
        assert!(!member.has_role(role_id));
        assert!(member.permissions.is_empty());
    }
}
