//! 权限解析
//!
//! 把成员持有的角色合并为有效权限集合。纯函数，不读取任何缓存。

use std::collections::BTreeMap;

use crate::entities::{Member, PermissionKey, PermissionSet, Role};

/// 根据角色列表计算有效权限
///
/// 角色按 `position` 降序遍历，位置相同时按角色ID升序，保证结果与输入顺序无关。
/// 每个权限键取第一个表态的角色的值；位置大于 0 的角色在与已表态角色同位时可以覆盖，
/// 位置为 0 的基础角色永远不会覆盖已有决定。没有角色时返回空集合。
pub fn compute_permissions<'a, I>(roles: I) -> PermissionSet
where
    I: IntoIterator<Item = &'a Role>,
{
    let mut ordered: Vec<&Role> = roles.into_iter().collect();
    ordered.sort_by(|a, b| b.position.cmp(&a.position).then_with(|| a.id.cmp(&b.id)));

    // 键 -> (取值, 做出决定的角色位置)
    let mut decided: BTreeMap<PermissionKey, (bool, i64)> = BTreeMap::new();

    for role in ordered {
        for (key, granted) in &role.permissions {
            let overrides = match decided.get(key) {
                None => true,
                Some((_, decided_at)) => role.position > 0 && role.position >= *decided_at,
            };
            if overrides {
                decided.insert(*key, (*granted, role.position));
            }
        }
    }

    decided
        .into_iter()
        .filter_map(|(key, (granted, _))| granted.then_some(key))
        .collect()
}

/// 解析成员在群组中的有效权限
///
/// 只使用角色目录中仍然存在的角色；已删除但尚未从成员身上剥离的角色不生效。
pub fn resolve_member_permissions(member: &Member, group_roles: &[Role]) -> PermissionSet {
    compute_permissions(
        group_roles
            .iter()
            .filter(|role| role.group_id == member.group_id && member.has_role(role.id)),
    )
}

/// 近似判断是否为群主：同时拥有管理群组与管理角色权限
pub fn is_owner(permissions: &PermissionSet) -> bool {
    permissions.contains(PermissionKey::ManageGroup)
        && permissions.contains(PermissionKey::ManageRoles)
}
