//! 角色实体定义
//!
//! 角色属于群组，带有位置（优先级）和权限映射。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entities::permission::{PermissionKey, SyntheticRole};
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{GroupId, RoleId, Timestamp};

const MAX_ROLE_NAME_LEN: usize = 100;

/// 角色实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// 角色ID
    pub id: RoleId,
    /// 所属群组
    pub group_id: GroupId,
    /// 角色名称
    pub name: String,
    /// 显示颜色，`#RRGGBB`
    pub color: String,
    /// 优先级，数值越大越高
    pub position: i64,
    /// 角色上定义的权限，未出现的键表示该角色不表态
    pub permissions: BTreeMap<PermissionKey, bool>,
    /// 创建时间
    pub created_at: Timestamp,
}

/// 创建角色所需的字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRole {
    pub name: String,
    pub color: String,
    pub position: i64,
    #[serde(default)]
    pub permissions: BTreeMap<PermissionKey, bool>,
}

/// 角色更新内容，`None` 表示保持不变
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChanges {
    pub name: Option<String>,
    pub color: Option<String>,
    pub position: Option<i64>,
    pub permissions: Option<BTreeMap<PermissionKey, bool>>,
}

impl Role {
    /// 创建新的角色
    pub fn new(group_id: GroupId, draft: NewRole, now: Timestamp) -> DomainResult<Self> {
        validate_name(&draft.name)?;
        validate_color(&draft.color)?;
        validate_position(draft.position)?;

        Ok(Self {
            id: RoleId::generate(),
            group_id,
            name: draft.name.trim().to_owned(),
            color: draft.color.to_ascii_uppercase(),
            position: draft.position,
            permissions: draft.permissions,
            created_at: now,
        })
    }

    /// 创建群组自带的合成角色
    pub fn synthetic(group_id: GroupId, kind: SyntheticRole, now: Timestamp) -> Self {
        Self {
            id: RoleId::generate(),
            group_id,
            name: kind.name().to_owned(),
            color: kind.color().to_owned(),
            position: kind.position(),
            permissions: kind.permission_map(),
            created_at: now,
        }
    }

    /// 应用更新，校验失败时角色保持原样
    pub fn apply(&mut self, changes: RoleChanges) -> DomainResult<()> {
        if let Some(name) = &changes.name {
            validate_name(name)?;
        }
        if let Some(color) = &changes.color {
            validate_color(color)?;
        }
        if let Some(position) = changes.position {
            validate_position(position)?;
        }

        if let Some(name) = changes.name {
            self.name = name.trim().to_owned();
        }
        if let Some(color) = changes.color {
            self.color = color.to_ascii_uppercase();
        }
        if let Some(position) = changes.position {
            self.position = position;
        }
        if let Some(permissions) = changes.permissions {
            self.permissions = permissions;
        }
        Ok(())
    }

    /// 角色对某个权限键的表态
    pub fn grant_for(&self, key: PermissionKey) -> Option<bool> {
        self.permissions.get(&key).copied()
    }
}

fn validate_name(name: &str) -> DomainResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::validation_error("name", "cannot be empty"));
    }
    if name.chars().count() > MAX_ROLE_NAME_LEN {
        return Err(DomainError::validation_error("name", "too long"));
    }
    Ok(())
}

fn validate_color(color: &str) -> DomainResult<()> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(DomainError::validation_error("color", "must be #RRGGBB"));
    }
    Ok(())
}

fn validate_position(position: i64) -> DomainResult<()> {
    if position < 0 {
        return Err(DomainError::validation_error("position", "cannot be negative"));
    }
    Ok(())
}
