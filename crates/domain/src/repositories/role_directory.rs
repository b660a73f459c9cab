//! 角色目录接口定义

use async_trait::async_trait;

use crate::entities::Role;
use crate::errors::RepositoryResult;
use crate::value_objects::{GroupId, RoleId};

/// 角色目录
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// 列出群组全部角色，顺序不做保证
    async fn list_roles(&self, group_id: GroupId) -> RepositoryResult<Vec<Role>>;

    async fn create_role(&self, role: Role) -> RepositoryResult<Role>;

    async fn update_role(&self, role: Role) -> RepositoryResult<Role>;

    /// 删除角色，同时负责把该角色从所有成员身上剥离
    async fn delete_role(&self, group_id: GroupId, role_id: RoleId) -> RepositoryResult<()>;
}
