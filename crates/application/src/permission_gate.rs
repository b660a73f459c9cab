//! 权限闸门
//!
//! 针对（群组，用户）的只读视图。每次读取时检查群组快照的版本，版本变化即重新解析，
//! 因此角色或成员数据变更后会自动生效。成员记录不存在时所有判断都返回 `false`。

use std::sync::{Arc, Mutex, PoisonError};

use domain::{is_owner, GroupId, PermissionKey, PermissionSet, UserId};
use tokio::sync::watch;

use crate::role_store::GroupSnapshot;

/// 按快照版本缓存的解析结果，`None` 表示不是成员
type CachedResolution = (u64, Option<PermissionSet>);

pub struct PermissionGate {
    group_id: GroupId,
    user_id: UserId,
    snapshots: watch::Receiver<Arc<GroupSnapshot>>,
    cache: Mutex<Option<CachedResolution>>,
}

impl PermissionGate {
    pub fn new(
        group_id: GroupId,
        user_id: UserId,
        snapshots: watch::Receiver<Arc<GroupSnapshot>>,
    ) -> Self {
        Self {
            group_id,
            user_id,
            snapshots,
            cache: Mutex::new(None),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn resolved(&self) -> Option<PermissionSet> {
        let snapshot = Arc::clone(&self.snapshots.borrow());
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        match cache.as_ref() {
            Some((version, permissions)) if *version == snapshot.version => permissions.clone(),
            _ => {
                let permissions = snapshot.resolve(self.user_id);
                *cache = Some((snapshot.version, permissions.clone()));
                permissions
            }
        }
    }

    pub fn has_permission(&self, key: PermissionKey) -> bool {
        self.resolved()
            .is_some_and(|permissions| permissions.contains(key))
    }

    /// 任意一个满足即可
    pub fn has_any_permission(&self, keys: &[PermissionKey]) -> bool {
        self.resolved()
            .is_some_and(|permissions| permissions.contains_any(keys))
    }

    /// 全部满足；空列表对成员视为满足，对非成员仍为 `false`
    pub fn has_all_permissions(&self, keys: &[PermissionKey]) -> bool {
        self.resolved()
            .is_some_and(|permissions| permissions.contains_all(keys))
    }

    /// 近似的群主判断，见 [`domain::is_owner`]
    pub fn is_owner(&self) -> bool {
        self.resolved()
            .is_some_and(|permissions| is_owner(&permissions))
    }

    pub fn is_member(&self) -> bool {
        self.snapshots.borrow().member(self.user_id).is_some()
    }

    /// 当前有效权限；非成员返回空集合
    pub fn permissions(&self) -> PermissionSet {
        self.resolved().unwrap_or_default()
    }

    /// 等待下一次快照变更；角色存储已释放时返回 `false`
    pub async fn changed(&mut self) -> bool {
        self.snapshots.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{Member, Role, SyntheticRole};
    use std::collections::{BTreeSet, HashMap};

    fn snapshot(
        group_id: GroupId,
        version: u64,
        roles: Vec<Role>,
        members: Vec<Member>,
    ) -> Arc<GroupSnapshot> {
        Arc::new(GroupSnapshot {
            group_id,
            version,
            roles,
            members: members
                .into_iter()
                .map(|member| (member.user_id, member))
                .collect::<HashMap<_, _>>(),
        })
    }

    #[test]
    fn test_non_member_is_denied_everything() {
        let group_id = GroupId::generate();
        let (_tx, rx) = watch::channel(Arc::new(GroupSnapshot::empty(group_id)));
        let gate = PermissionGate::new(group_id, UserId::generate(), rx);

        assert!(!gate.has_permission(PermissionKey::SendMessages));
        assert!(!gate.has_any_permission(&PermissionKey::ALL));
        assert!(!gate.has_all_permissions(&[]));
        assert!(!gate.is_owner());
        assert!(!gate.is_member());
        assert!(gate.permissions().is_empty());
    }

    #[test]
    fn test_gate_follows_snapshot_updates() {
        let group_id = GroupId::generate();
        let now = Utc::now();
        let everyone = Role::synthetic(group_id, SyntheticRole::Everyone, now);
        let admin = Role::synthetic(group_id, SyntheticRole::Admin, now);
        let user_id = UserId::generate();

        let mut member = Member::new(group_id, user_id, now);
        member.roles = BTreeSet::from([everyone.id]);

        let (tx, rx) = watch::channel(snapshot(
            group_id,
            1,
            vec![everyone.clone(), admin.clone()],
            vec![member.clone()],
        ));
        let gate = PermissionGate::new(group_id, user_id, rx);

        assert!(gate.is_member());
        assert!(gate.has_permission(PermissionKey::SendMessages));
        assert!(gate.has_all_permissions(&[]));
        assert!(!gate.has_permission(PermissionKey::BanMembers));
        assert!(!gate.is_owner());

        member.roles.insert(admin.id);
        tx.send_replace(snapshot(group_id, 2, vec![everyone, admin], vec![member]));

        assert!(gate.has_all_permissions(&[PermissionKey::BanMembers, PermissionKey::ManageRoles]));
        assert!(gate.is_owner());
    }

    #[test]
    fn test_stale_cached_projection_is_not_trusted() {
        let group_id = GroupId::generate();
        let user_id = UserId::generate();
        let mut member = Member::new(group_id, user_id, Utc::now());
        // 缓存投影声称有权限，但没有任何角色支撑
        member.permissions = [PermissionKey::ManageGroup].into_iter().collect();

        let (_tx, rx) = watch::channel(snapshot(group_id, 1, Vec::new(), vec![member]));
        let gate = PermissionGate::new(group_id, user_id, rx);
        assert!(gate.is_member());
        assert!(!gate.has_permission(PermissionKey::ManageGroup));
    }
}
