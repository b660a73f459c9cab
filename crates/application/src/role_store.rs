//! 角色存储
//!
//! 按群组维护角色与成员的快照，并通过 `watch` 通道推送给权限闸门。快照只是外部目录的
//! 缓存：目录读取失败时保留上一份快照（可能过期，但不会放宽权限）。
//! 角色变更与成员角色分配需要操作者在当前快照中解析出 `manageRoles`。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use domain::{
    compute_permissions, resolve_member_permissions, DomainError, GroupId, Member,
    MemberDirectory, NewRole, PermissionKey, PermissionSet, Role, RoleChanges, RoleDirectory,
    RoleId, SyntheticRole, UserId,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::permission_gate::PermissionGate;

/// 某一时刻群组的角色与成员
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    /// 每次从目录重新加载后递增，0 表示尚未加载
    pub version: u64,
    pub roles: Vec<Role>,
    pub members: HashMap<UserId, Member>,
}

impl GroupSnapshot {
    pub fn empty(group_id: GroupId) -> Self {
        Self {
            group_id,
            version: 0,
            roles: Vec::new(),
            members: HashMap::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.version > 0
    }

    pub fn member(&self, user_id: UserId) -> Option<&Member> {
        self.members.get(&user_id)
    }

    pub fn role(&self, role_id: RoleId) -> Option<&Role> {
        self.roles.iter().find(|role| role.id == role_id)
    }

    /// 从角色重新解析成员权限，不使用成员身上的缓存投影
    pub fn resolve(&self, user_id: UserId) -> Option<PermissionSet> {
        self.member(user_id)
            .map(|member| resolve_member_permissions(member, &self.roles))
    }

    /// 缓存投影与角色解析结果不一致的成员
    fn stale_projections(&self) -> Vec<(UserId, BTreeSet<RoleId>, PermissionSet)> {
        let mut stale: Vec<_> = self
            .members
            .values()
            .filter_map(|member| {
                let resolved = resolve_member_permissions(member, &self.roles);
                (resolved != member.permissions).then(|| {
                    (member.user_id, member.roles.clone(), resolved)
                })
            })
            .collect();
        stale.sort_by_key(|(user_id, _, _)| *user_id);
        stale
    }
}

pub struct RoleStore {
    roles: Arc<dyn RoleDirectory>,
    members: Arc<dyn MemberDirectory>,
    clock: Arc<dyn Clock>,
    groups: RwLock<HashMap<GroupId, watch::Sender<Arc<GroupSnapshot>>>>,
    refresh_lock: Mutex<()>,
}

impl RoleStore {
    pub fn new(
        roles: Arc<dyn RoleDirectory>,
        members: Arc<dyn MemberDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            roles,
            members,
            clock,
            groups: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// 订阅群组快照
    pub fn watch(&self, group_id: GroupId) -> watch::Receiver<Arc<GroupSnapshot>> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(group_id)
            .or_insert_with(|| watch::channel(Arc::new(GroupSnapshot::empty(group_id))).0)
            .subscribe()
    }

    /// 当前快照；从未加载过的群组返回空快照
    pub fn snapshot(&self, group_id: GroupId) -> Arc<GroupSnapshot> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .get(&group_id)
            .map(|sender| Arc::clone(&sender.borrow()))
            .unwrap_or_else(|| Arc::new(GroupSnapshot::empty(group_id)))
    }

    /// 为用户创建权限闸门
    pub fn gate(&self, group_id: GroupId, user_id: UserId) -> PermissionGate {
        PermissionGate::new(group_id, user_id, self.watch(group_id))
    }

    /// 从目录重新加载群组快照
    ///
    /// 失败时保留上一份快照并返回错误，由调用方决定是否重试。
    pub async fn refresh(&self, group_id: GroupId) -> ApplicationResult<Arc<GroupSnapshot>> {
        let _guard = self.refresh_lock.lock().await;

        let loaded = tokio::try_join!(
            self.roles.list_roles(group_id),
            self.members.list_members(group_id)
        );
        let (roles, members) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "加载角色快照失败，保留上一份快照");
                return Err(e.into());
            }
        };

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let sender = groups
            .entry(group_id)
            .or_insert_with(|| watch::channel(Arc::new(GroupSnapshot::empty(group_id))).0);

        let version = sender.borrow().version + 1;
        let snapshot = Arc::new(GroupSnapshot {
            group_id,
            version,
            roles,
            members: members
                .into_iter()
                .filter(|member| member.group_id == group_id)
                .map(|member| (member.user_id, member))
                .collect(),
        });
        sender.send_replace(Arc::clone(&snapshot));

        debug!(
            group_id = %group_id,
            version,
            roles = snapshot.roles.len(),
            members = snapshot.members.len(),
            "角色快照已更新"
        );
        Ok(snapshot)
    }

    async fn loaded_snapshot(&self, group_id: GroupId) -> ApplicationResult<Arc<GroupSnapshot>> {
        let snapshot = self.snapshot(group_id);
        if snapshot.is_loaded() {
            Ok(snapshot)
        } else {
            self.refresh(group_id).await
        }
    }

    async fn authorize(
        &self,
        group_id: GroupId,
        actor: UserId,
        key: PermissionKey,
    ) -> ApplicationResult<Arc<GroupSnapshot>> {
        let snapshot = self.loaded_snapshot(group_id).await?;
        let allowed = snapshot
            .resolve(actor)
            .is_some_and(|permissions| permissions.contains(key));
        if !allowed {
            warn!(group_id = %group_id, actor = %actor, permission = %key, "拒绝未授权的角色操作");
            return Err(ApplicationError::Authorization(key));
        }
        Ok(snapshot)
    }

    /// 重新计算所有成员的权限投影并写回目录
    pub async fn resync_projections(
        &self,
        group_id: GroupId,
    ) -> ApplicationResult<Arc<GroupSnapshot>> {
        let snapshot = self.refresh(group_id).await?;
        let stale = snapshot.stale_projections();
        if stale.is_empty() {
            return Ok(snapshot);
        }

        for (user_id, roles, permissions) in stale {
            self.members
                .set_member_roles(group_id, user_id, roles, permissions)
                .await?;
        }
        info!(group_id = %group_id, "成员权限投影已重新同步");
        self.refresh(group_id).await
    }

    /// 为新群组创建 everyone / moderator / admin 三个合成角色，并让群主持有 admin
    ///
    /// 群主必须已经是成员。群组已有角色时直接返回现有角色。
    pub async fn install_default_roles(
        &self,
        group_id: GroupId,
        owner: UserId,
    ) -> ApplicationResult<Vec<Role>> {
        let existing = self.roles.list_roles(group_id).await?;
        if !existing.is_empty() {
            debug!(group_id = %group_id, "群组已有角色，跳过默认角色安装");
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut created = Vec::with_capacity(SyntheticRole::ALL.len());
        for kind in SyntheticRole::ALL {
            let role = self
                .roles
                .create_role(Role::synthetic(group_id, kind, now))
                .await?;
            created.push(role);
        }

        let owner_roles: BTreeSet<RoleId> = SyntheticRole::ALL
            .iter()
            .zip(&created)
            .filter(|(kind, _)| matches!(kind, SyntheticRole::Everyone | SyntheticRole::Admin))
            .map(|(_, role)| role.id)
            .collect();
        let permissions =
            compute_permissions(created.iter().filter(|role| owner_roles.contains(&role.id)));
        self.members
            .set_member_roles(group_id, owner, owner_roles, permissions)
            .await?;

        info!(group_id = %group_id, owner = %owner, "默认角色已安装");
        self.refresh(group_id).await?;
        Ok(created)
    }

    pub async fn create_role(
        &self,
        group_id: GroupId,
        actor: UserId,
        draft: NewRole,
    ) -> ApplicationResult<Role> {
        self.authorize(group_id, actor, PermissionKey::ManageRoles)
            .await?;

        let role = Role::new(group_id, draft, self.clock.now())?;
        let created = self.roles.create_role(role).await?;
        info!(group_id = %group_id, role_id = %created.id, actor = %actor, "角色已创建");

        self.refresh(group_id).await?;
        Ok(created)
    }

    /// 修改角色；持有该角色的成员的权限投影随之重新计算
    pub async fn update_role(
        &self,
        group_id: GroupId,
        actor: UserId,
        role_id: RoleId,
        changes: RoleChanges,
    ) -> ApplicationResult<Role> {
        let snapshot = self
            .authorize(group_id, actor, PermissionKey::ManageRoles)
            .await?;

        let mut role = snapshot
            .role(role_id)
            .cloned()
            .ok_or_else(|| DomainError::resource_not_found("role", role_id.to_string()))?;
        role.apply(changes)?;

        let updated = self.roles.update_role(role).await?;
        info!(group_id = %group_id, role_id = %role_id, actor = %actor, "角色已更新");

        self.resync_projections(group_id).await?;
        Ok(updated)
    }

    /// 删除角色；从成员身上剥离角色由角色目录负责
    pub async fn delete_role(
        &self,
        group_id: GroupId,
        actor: UserId,
        role_id: RoleId,
    ) -> ApplicationResult<()> {
        let snapshot = self
            .authorize(group_id, actor, PermissionKey::ManageRoles)
            .await?;
        if snapshot.role(role_id).is_none() {
            return Err(DomainError::resource_not_found("role", role_id.to_string()).into());
        }

        self.roles.delete_role(group_id, role_id).await?;
        info!(group_id = %group_id, role_id = %role_id, actor = %actor, "角色已删除");

        self.resync_projections(group_id).await?;
        Ok(())
    }

    /// 替换成员的角色集合并写入重新计算的权限投影
    pub async fn assign_roles(
        &self,
        group_id: GroupId,
        actor: UserId,
        target: UserId,
        roles: BTreeSet<RoleId>,
    ) -> ApplicationResult<PermissionSet> {
        let snapshot = self
            .authorize(group_id, actor, PermissionKey::ManageRoles)
            .await?;

        if snapshot.member(target).is_none() {
            return Err(DomainError::resource_not_found("member", target.to_string()).into());
        }
        if let Some(unknown) = roles.iter().find(|role_id| snapshot.role(**role_id).is_none()) {
            return Err(DomainError::resource_not_found("role", unknown.to_string()).into());
        }

        let permissions =
            compute_permissions(snapshot.roles.iter().filter(|role| roles.contains(&role.id)));
        self.members
            .set_member_roles(group_id, target, roles, permissions.clone())
            .await?;
        info!(group_id = %group_id, target = %target, actor = %actor, "成员角色已更新");

        self.refresh(group_id).await?;
        Ok(permissions)
    }
}
