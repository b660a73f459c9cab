//! 应用层实现。
//!
//! 角色存储与权限闸门负责访问控制；在线状态存储、频道适配器与输入提示负责
//! 多客户端之间的在线/输入状态同步。传输层与外部目录都通过 trait 注入。

pub mod clock;
pub mod directory;
pub mod error;
pub mod expiring_map;
pub mod permission_gate;
pub mod presence;
pub mod role_store;
pub mod typing;

pub use clock::{Clock, SystemClock};
pub use directory::MemoryDirectory;
pub use error::{ApplicationError, ApplicationResult};
pub use expiring_map::ExpiringMap;
pub use permission_gate::PermissionGate;
pub use presence::{
    ChannelMember, LocalPubSubHub, LocalPubSubTransport, MemberRemoved, PresenceChange,
    PresenceChannelAdapter, PresenceContext, PresenceEvent, PresenceStore, PubSubTransport,
    RawChannelEvent, SubscriptionSucceeded, TransportError,
};
pub use role_store::{GroupSnapshot, RoleStore};
pub use typing::{TypingPublisher, TypingTrigger};

#[cfg(any(test, feature = "testing"))]
pub use typing::MockTypingPublisher;
