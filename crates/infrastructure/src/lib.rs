//! 基础设施层实现。
//!
//! 提供应用层传输接口的 Redis 适配器。

pub mod redis;

pub use crate::redis::{RedisError, RedisPubSubTransport, RedisResult};
