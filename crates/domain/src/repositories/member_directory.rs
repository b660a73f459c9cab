//! 成员目录接口定义

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::entities::{Member, PermissionSet};
use crate::errors::RepositoryResult;
use crate::value_objects::{GroupId, RoleId, UserId};

/// 成员目录
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// 列出群组全部成员
    async fn list_members(&self, group_id: GroupId) -> RepositoryResult<Vec<Member>>;

    /// 查找单个成员，不是成员时返回 `None`
    async fn get_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> RepositoryResult<Option<Member>>;

    /// 写入成员的角色集合与权限缓存投影
    async fn set_member_roles(
        &self,
        group_id: GroupId,
        user_id: UserId,
        roles: BTreeSet<RoleId>,
        permissions: PermissionSet,
    ) -> RepositoryResult<()>;
}
