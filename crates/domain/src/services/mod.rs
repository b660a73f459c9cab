//! 领域服务定义
//!
//! 权限解析是纯函数，放在领域层供应用层的权限门与角色存储共用。

pub mod permission_resolver;

pub use permission_resolver::{compute_permissions, is_owner, resolve_member_permissions};
