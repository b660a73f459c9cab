//! 领域实体定义
//!
//! 包含权限键、角色、成员以及在线/输入状态记录。

pub mod member;
pub mod permission;
pub mod presence;
pub mod role;

// 重新导出核心实体
pub use member::Member;
pub use permission::{PermissionKey, PermissionSet, SyntheticRole};
pub use presence::{ChannelScope, PresenceRecord, PresenceStatus, TypingRecord};
pub use role::{NewRole, Role, RoleChanges};
