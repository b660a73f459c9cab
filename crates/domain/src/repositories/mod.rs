//! 外部目录接口定义
//!
//! 成员目录与角色目录由群组聚合持有，本子系统只通过这些接口读写。

pub mod member_directory;
pub mod role_directory;

pub use member_directory::MemberDirectory;
pub use role_directory::RoleDirectory;

#[cfg(any(test, feature = "testing"))]
pub use member_directory::MockMemberDirectory;
#[cfg(any(test, feature = "testing"))]
pub use role_directory::MockRoleDirectory;
