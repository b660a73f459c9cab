//! Redis 消息发布者
//!
//! 负责向频道发布消息，并在成员哈希中登记/注销本连接。使用 `ConnectionManager`
//! 自动重连，避免每次操作重新建立连接。
//!
//! 每个连接在心跳有序集合中有一个最近心跳时间；心跳超时的连接由仍在线的监听任务清除。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use application::ChannelMember;
use chrono::Utc;
use config::RedisConfig;
use domain::UserId;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{RedisEnvelope, RedisKeys};
use super::error::{RedisError, RedisResult};

/// 按用户去重并排序，同一用户的多个连接只保留一个
pub fn distinct_members<I>(connections: I) -> Vec<ChannelMember>
where
    I: IntoIterator<Item = ChannelMember>,
{
    let mut by_user = HashMap::new();
    for member in connections {
        by_user.entry(member.id).or_insert(member);
    }
    let mut members: Vec<ChannelMember> = by_user.into_values().collect();
    members.sort_by_key(|member| member.id);
    members
}

/// 心跳早于 `cutoff_ms` 或从未心跳的连接
pub fn stale_connections(
    connections: &[(String, ChannelMember)],
    heartbeats: &HashMap<String, f64>,
    cutoff_ms: i64,
) -> Vec<String> {
    connections
        .iter()
        .filter(|(socket, _)| {
            heartbeats
                .get(socket)
                .map_or(true, |beat| (*beat as i64) < cutoff_ms)
        })
        .map(|(socket, _)| socket.clone())
        .collect()
}

/// 移除 `removed` 中的连接后不再有任何连接的用户
pub fn departed_users(
    connections: &[(String, ChannelMember)],
    removed: &HashSet<String>,
) -> Vec<ChannelMember> {
    let live: HashSet<UserId> = connections
        .iter()
        .filter(|(socket, _)| !removed.contains(socket))
        .map(|(_, member)| member.id)
        .collect();

    distinct_members(
        connections
            .iter()
            .filter(|(socket, member)| removed.contains(socket) && !live.contains(&member.id))
            .map(|(_, member)| member.clone()),
    )
}

/// Redis 发布者
#[derive(Clone)]
pub struct RedisPublisher {
    connection: ConnectionManager,
    keys: RedisKeys,
    member_ttl_secs: u64,
}

impl RedisPublisher {
    pub async fn new(client: &Client, config: &RedisConfig) -> RedisResult<Self> {
        let connection =
            client
                .get_connection_manager()
                .await
                .map_err(|e| RedisError::ConnectionError {
                    message: format!("连接 Redis 失败: {}", e),
                })?;

        Ok(Self {
            connection,
            keys: RedisKeys::new(config.key_prefix.as_str()),
            member_ttl_secs: config.member_ttl_secs,
        })
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// 发布消息到频道，返回收到消息的订阅者数量
    pub async fn publish(&self, channel: &str, envelope: &RedisEnvelope) -> RedisResult<u32> {
        let payload = envelope.encode()?;
        let mut conn = self.connection.clone();

        let receivers: u32 = redis::cmd("PUBLISH")
            .arg(self.keys.pubsub_channel(channel))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("发布到频道 {} 失败: {}", channel, e),
            })?;

        debug!(channel = %channel, event = %envelope.event, receivers, "消息已发布");
        Ok(receivers)
    }

    /// 把本连接登记为频道成员并刷新心跳
    ///
    /// 返回该连接此前是否不在成员哈希中（首次登记，或已被当作断线清除）。
    pub async fn register_member(
        &self,
        channel: &str,
        socket_id: Uuid,
        member: &ChannelMember,
    ) -> RedisResult<bool> {
        let members_key = self.keys.members(channel);
        let heartbeats_key = self.keys.heartbeats(channel);
        let socket = socket_id.to_string();
        let value = serde_json::to_string(member)?;
        let ttl = self.member_ttl_secs as i64;
        let mut conn = self.connection.clone();

        let (added,): (u32,) = redis::pipe()
            .atomic()
            .hset(&members_key, &socket, value)
            .zadd(&heartbeats_key, &socket, Utc::now().timestamp_millis())
            .ignore()
            .expire(&members_key, ttl)
            .ignore()
            .expire(&heartbeats_key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    pub async fn unregister_member(&self, channel: &str, socket_id: Uuid) -> RedisResult<()> {
        let socket = socket_id.to_string();
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(self.keys.members(channel), &socket)
            .ignore()
            .zrem(self.keys.heartbeats(channel), &socket)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// 清除心跳超时的连接，返回因此不再有任何连接的用户
    ///
    /// 多个监听任务可能同时清除；只有真正删除了成员条目的一方会返回这些用户。
    pub async fn sweep_stale(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> RedisResult<Vec<ChannelMember>> {
        let members_key = self.keys.members(channel);
        let heartbeats_key = self.keys.heartbeats(channel);
        let cutoff_ms = Utc::now().timestamp_millis() - timeout.as_millis() as i64;

        let connections = self.connections(channel).await?;
        let mut conn = self.connection.clone();
        let heartbeats: HashMap<String, f64> = redis::cmd("ZRANGE")
            .arg(&heartbeats_key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let stale = stale_connections(&connections, &heartbeats, cutoff_ms);
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for socket in &stale {
            pipe.hdel(&members_key, socket);
        }
        pipe.zrembyscore(&heartbeats_key, "-inf", cutoff_ms).ignore();
        let deleted: Vec<u32> = pipe.query_async(&mut conn).await?;

        let removed: HashSet<String> = stale
            .into_iter()
            .zip(deleted)
            .filter(|(_, count)| *count > 0)
            .map(|(socket, _)| socket)
            .collect();
        if !removed.is_empty() {
            info!(channel = %channel, connections = removed.len(), "清除心跳超时的连接");
        }
        Ok(departed_users(&connections, &removed))
    }

    /// 频道上所有连接及其成员信息；无法解析的条目被跳过
    pub async fn connections(&self, channel: &str) -> RedisResult<Vec<(String, ChannelMember)>> {
        let mut conn = self.connection.clone();
        let entries: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.members(channel))
            .query_async(&mut conn)
            .await?;

        let mut connections = Vec::with_capacity(entries.len());
        for (socket, value) in entries {
            match serde_json::from_str::<ChannelMember>(&value) {
                Ok(member) => connections.push((socket, member)),
                Err(e) => {
                    warn!(channel = %channel, socket = %socket, error = %e, "跳过无法解析的成员记录");
                }
            }
        }
        Ok(connections)
    }

    /// 频道当前成员（按用户去重）
    pub async fn members(&self, channel: &str) -> RedisResult<Vec<ChannelMember>> {
        let connections = self.connections(channel).await?;
        Ok(distinct_members(
            connections.into_iter().map(|(_, member)| member),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    #[test]
    fn test_distinct_members_collapses_connections() {
        let alice = UserId::generate();
        let bob = UserId::generate();
        let members = distinct_members(vec![
            ChannelMember::new(alice, "Alice"),
            ChannelMember::new(bob, "Bob"),
            ChannelMember::new(alice, "Alice"),
        ]);

        assert_eq!(members.len(), 2);
        assert!(members.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn test_connections_without_recent_heartbeat_are_stale() {
        let alice = ChannelMember::new(UserId::generate(), "Alice");
        let connections = vec![
            ("live".to_string(), alice.clone()),
            ("killed".to_string(), alice.clone()),
            ("never".to_string(), alice),
        ];
        let heartbeats = HashMap::from([
            ("live".to_string(), 10_000.0),
            ("killed".to_string(), 1_000.0),
        ]);

        let mut stale = stale_connections(&connections, &heartbeats, 5_000);
        stale.sort();
        assert_eq!(stale, vec!["killed".to_string(), "never".to_string()]);
    }

    #[test]
    fn test_only_users_without_live_connections_depart() {
        let alice = ChannelMember::new(UserId::generate(), "Alice");
        let bob = ChannelMember::new(UserId::generate(), "Bob");
        let connections = vec![
            ("a1".to_string(), alice.clone()),
            ("a2".to_string(), alice),
            ("b1".to_string(), bob.clone()),
        ];
        let removed = HashSet::from(["a1".to_string(), "b1".to_string()]);

        assert_eq!(departed_users(&connections, &removed), vec![bob]);
        assert!(departed_users(&connections, &HashSet::new()).is_empty());
    }
}
