//! 基于 Redis 的发布/订阅传输
//!
//! 频道成员登记在 Redis 哈希中（连接ID -> 成员），成员加入/离开与客户端事件都以
//! [`RedisEnvelope`] 的形式发布到对应的 Redis 频道。异常退出的连接不再刷新心跳，
//! 超时后被仍在线的连接清除并宣告离开。

use std::collections::HashMap;

use application::{
    ChannelMember, MemberRemoved, PresenceEvent, PubSubTransport, RawChannelEvent,
    TransportError,
};
use async_trait::async_trait;
use config::RedisConfig;
use redis::Client;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::envelope::RedisEnvelope;
use super::error::{RedisError, RedisResult};
use super::publisher::RedisPublisher;
use super::subscriber::RedisSubscriber;

const CLIENT_EVENT_PREFIX: &str = "client-";
const DEFAULT_EVENT_BUFFER: usize = 256;

struct RedisSubscription {
    member: ChannelMember,
    listener: JoinHandle<()>,
}

/// 一个客户端连接
pub struct RedisPubSubTransport {
    client: Client,
    publisher: RedisPublisher,
    config: RedisConfig,
    socket_id: Uuid,
    event_buffer: usize,
    subscriptions: Mutex<HashMap<String, RedisSubscription>>,
}

impl RedisPubSubTransport {
    /// 创建新的 Redis 传输
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let publisher = RedisPublisher::new(&client, config).await?;
        let socket_id = Uuid::new_v4();

        info!(socket_id = %socket_id, url = %config.url, "Redis 传输已连接");
        Ok(Self {
            client,
            publisher,
            config: config.clone(),
            socket_id,
            event_buffer: DEFAULT_EVENT_BUFFER,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// 每个频道事件通道的容量
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    pub fn socket_id(&self) -> Uuid {
        self.socket_id
    }

    async fn announce(&self, channel: &str, event: PresenceEvent) -> RedisResult<()> {
        let envelope = RedisEnvelope::new(self.socket_id, event.event_name(), event.payload());
        self.publisher.publish(channel, &envelope).await.map(|_| ())
    }

    /// 同一用户是否还有其它连接留在频道中
    async fn present_elsewhere(&self, channel: &str, user: &ChannelMember) -> RedisResult<bool> {
        let own = self.socket_id.to_string();
        Ok(self
            .publisher
            .connections(channel)
            .await?
            .into_iter()
            .any(|(socket, member)| socket != own && member.id == user.id))
    }

    async fn join(&self, channel: &str, member: &ChannelMember) -> RedisResult<()> {
        let announce = !self.present_elsewhere(channel, member).await?;
        self.publisher
            .register_member(channel, self.socket_id, member)
            .await?;
        if announce {
            self.announce(channel, PresenceEvent::MemberAdded(member.clone()))
                .await?;
        }
        Ok(())
    }

    async fn leave(&self, channel: &str, subscription: RedisSubscription) -> RedisResult<()> {
        subscription.listener.abort();
        self.publisher
            .unregister_member(channel, self.socket_id)
            .await?;
        if !self.present_elsewhere(channel, &subscription.member).await? {
            let removed = PresenceEvent::MemberRemoved(MemberRemoved {
                id: subscription.member.id,
            });
            self.announce(channel, removed).await?;
        }
        Ok(())
    }

    /// 释放全部频道
    pub async fn shutdown(&self) {
        let subscriptions: Vec<(String, RedisSubscription)> =
            self.subscriptions.lock().await.drain().collect();
        for (channel, subscription) in subscriptions {
            if let Err(e) = self.leave(&channel, subscription).await {
                warn!(channel = %channel, error = %e, "关闭时释放频道失败");
            }
        }
        info!(socket_id = %self.socket_id, "Redis 传输已关闭");
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSubTransport {
    async fn subscribe(
        &self,
        channel: &str,
        member: &ChannelMember,
    ) -> Result<mpsc::Receiver<RawChannelEvent>, TransportError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(previous) = subscriptions.remove(channel) {
            previous.listener.abort();
        }

        self.join(channel, member)
            .await
            .map_err(|e| e.into_transport(channel))?;

        let (sender, receiver) = mpsc::channel(self.event_buffer);
        let subscriber = RedisSubscriber::new(
            self.client.clone(),
            self.publisher.clone(),
            &self.config,
            channel,
            self.socket_id,
            member.clone(),
        );
        let listener = tokio::spawn(subscriber.run(sender));

        subscriptions.insert(
            channel.to_string(),
            RedisSubscription {
                member: member.clone(),
                listener,
            },
        );
        Ok(receiver)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(channel)
            .ok_or_else(|| TransportError::NotSubscribed {
                channel: channel.to_string(),
            })?;

        self.leave(channel, subscription)
            .await
            .map_err(|e| e.into_transport(channel))
    }

    async fn trigger(
        &self,
        channel: &str,
        event: &str,
        data: Value,
    ) -> Result<(), TransportError> {
        if !event.starts_with(CLIENT_EVENT_PREFIX) {
            return Err(TransportError::publish(
                channel,
                format!("客户端事件必须以 {} 开头", CLIENT_EVENT_PREFIX),
            ));
        }
        if !self.subscriptions.lock().await.contains_key(channel) {
            return Err(TransportError::NotSubscribed {
                channel: channel.to_string(),
            });
        }

        let envelope = RedisEnvelope::new(self.socket_id, event, data);
        self.publisher
            .publish(channel, &envelope)
            .await
            .map(|_| ())
            .map_err(|e| e.into_transport(channel))
    }
}

impl Drop for RedisPubSubTransport {
    fn drop(&mut self) {
        // 无法在这里异步注销，心跳停止后由其它连接的监听任务清除
        if let Ok(subscriptions) = self.subscriptions.try_lock() {
            for subscription in subscriptions.values() {
                subscription.listener.abort();
            }
        }
    }
}
