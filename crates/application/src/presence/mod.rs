//! 在线状态与输入提示的同步

pub mod adapter;
pub mod context;
pub mod events;
pub mod local;
pub mod store;
pub mod transport;

pub use adapter::PresenceChannelAdapter;
pub use context::PresenceContext;
pub use events::{
    ChannelMember, MemberInfo, MemberRemoved, PresenceEvent, StatusChanged, StoppedTyping,
    SubscriptionSucceeded, Typing,
};
pub use local::{LocalPubSubHub, LocalPubSubTransport};
pub use store::{PresenceChange, PresenceStore};
pub use transport::{PubSubTransport, RawChannelEvent, TransportError};
