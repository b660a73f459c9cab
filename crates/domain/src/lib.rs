//! 聊天室权限与在线状态子系统的领域模型
//!
//! 包含角色、成员、权限键、在线/输入状态记录，以及纯函数形式的权限解析。

pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
