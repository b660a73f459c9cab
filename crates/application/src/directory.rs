//! 内存中的成员目录与角色目录
//!
//! 用于单机运行和测试。删除角色时同步从所有成员身上剥离该角色，与外部目录的约定一致。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use domain::{
    GroupId, Member, MemberDirectory, PermissionSet, RepositoryError, RepositoryResult, Role,
    RoleDirectory, RoleId, UserId,
};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryDirectory {
    roles: RwLock<HashMap<GroupId, BTreeMap<RoleId, Role>>>,
    members: RwLock<HashMap<GroupId, HashMap<UserId, Member>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入成员，已存在时覆盖
    pub async fn add_member(&self, member: Member) {
        self.members
            .write()
            .await
            .entry(member.group_id)
            .or_default()
            .insert(member.user_id, member);
    }

    pub async fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Option<Member> {
        self.members
            .write()
            .await
            .get_mut(&group_id)
            .and_then(|members| members.remove(&user_id))
    }
}

#[async_trait]
impl RoleDirectory for MemoryDirectory {
    async fn list_roles(&self, group_id: GroupId) -> RepositoryResult<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .await
            .get(&group_id)
            .map(|roles| roles.values().cloned().collect())
            .unwrap_or_default();
        roles.sort_by(|a, b| b.position.cmp(&a.position).then(a.id.cmp(&b.id)));
        Ok(roles)
    }

    async fn create_role(&self, role: Role) -> RepositoryResult<Role> {
        let mut roles = self.roles.write().await;
        let group = roles.entry(role.group_id).or_default();
        if group.contains_key(&role.id) {
            return Err(RepositoryError::conflict(format!("角色 {} 已存在", role.id)));
        }
        group.insert(role.id, role.clone());
        Ok(role)
    }

    async fn update_role(&self, role: Role) -> RepositoryResult<Role> {
        let mut roles = self.roles.write().await;
        let existing = roles
            .get_mut(&role.group_id)
            .and_then(|group| group.get_mut(&role.id))
            .ok_or(RepositoryError::NotFound)?;
        *existing = role.clone();
        Ok(role)
    }

    async fn delete_role(&self, group_id: GroupId, role_id: RoleId) -> RepositoryResult<()> {
        self.roles
            .write()
            .await
            .get_mut(&group_id)
            .and_then(|group| group.remove(&role_id))
            .ok_or(RepositoryError::NotFound)?;

        if let Some(members) = self.members.write().await.get_mut(&group_id) {
            for member in members.values_mut() {
                member.roles.remove(&role_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for MemoryDirectory {
    async fn list_members(&self, group_id: GroupId) -> RepositoryResult<Vec<Member>> {
        let mut members: Vec<Member> = self
            .members
            .read()
            .await
            .get(&group_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        members.sort_by_key(|member| member.user_id);
        Ok(members)
    }

    async fn get_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> RepositoryResult<Option<Member>> {
        Ok(self
            .members
            .read()
            .await
            .get(&group_id)
            .and_then(|members| members.get(&user_id))
            .cloned())
    }

    async fn set_member_roles(
        &self,
        group_id: GroupId,
        user_id: UserId,
        roles: BTreeSet<RoleId>,
        permissions: PermissionSet,
    ) -> RepositoryResult<()> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(&group_id)
            .and_then(|members| members.get_mut(&user_id))
            .ok_or(RepositoryError::NotFound)?;
        member.set_roles(roles, permissions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::SyntheticRole;

    #[tokio::test]
    async fn test_delete_role_strips_members() {
        let directory = MemoryDirectory::new();
        let group_id = GroupId::generate();
        let role = directory
            .create_role(Role::synthetic(group_id, SyntheticRole::Moderator, Utc::now()))
            .await
            .unwrap();

        let user_id = UserId::generate();
        directory
            .add_member(Member::new(group_id, user_id, Utc::now()))
            .await;
        directory
            .set_member_roles(group_id, user_id, BTreeSet::from([role.id]), PermissionSet::empty())
            .await
            .unwrap();

        directory.delete_role(group_id, role.id).await.unwrap();

        let member = directory.get_member(group_id, user_id).await.unwrap().unwrap();
        assert!(member.roles.is_empty());
        assert_eq!(
            directory.delete_role(group_id, role.id).await,
            Err(RepositoryError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_unknown_member_cannot_be_assigned() {
        let directory = MemoryDirectory::new();
        let result = directory
            .set_member_roles(
                GroupId::generate(),
                UserId::generate(),
                BTreeSet::new(),
                PermissionSet::empty(),
            )
            .await;
        assert_eq!(result, Err(RepositoryError::NotFound));
        assert!(directory.list_roles(GroupId::generate()).await.unwrap().is_empty());
    }
}
