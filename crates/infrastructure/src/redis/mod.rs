//! Redis Pub/Sub 模块
//!
//! 提供在线状态频道的 Redis 传输实现。

pub mod envelope;
pub mod error;
pub mod publisher;
pub mod subscriber;
pub mod transport;

// 重新导出
pub use envelope::{RedisEnvelope, RedisKeys};
pub use error::{RedisError, RedisResult};
pub use publisher::{departed_users, distinct_members, stale_connections, RedisPublisher};
pub use subscriber::{reconnect_delay, RedisSubscriber};
pub use transport::RedisPubSubTransport;
