//! Redis 消息订阅者
//!
//! 每个订阅的频道一个后台监听任务。连接断开后按指数退避重连，每次（重新）订阅成功后
//! 都先从成员哈希合成一条 `subscription_succeeded`，让上层整体重建该作用域。
//! 监听期间定时刷新本连接的心跳，并清除心跳超时的连接。

use application::{
    ChannelMember, MemberRemoved, PresenceEvent, RawChannelEvent, SubscriptionSucceeded,
};
use config::RedisConfig;
use futures_util::stream::StreamExt;
use redis::Client;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::envelope::RedisEnvelope;
use super::error::{RedisError, RedisResult};
use super::publisher::RedisPublisher;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 第 `attempt` 次重连前的等待时间（从 1 开始），上限 30 秒
pub fn reconnect_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1).min(16));
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// 监听任务结束的原因
enum ListenExit {
    /// 上层已关闭接收端
    ReceiverClosed,
}

/// 单个频道的订阅者
pub struct RedisSubscriber {
    client: Client,
    publisher: RedisPublisher,
    channel: String,
    socket_id: Uuid,
    member: ChannelMember,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    reconnect_interval_ms: u64,
    max_reconnect_attempts: u32,
}

impl RedisSubscriber {
    pub fn new(
        client: Client,
        publisher: RedisPublisher,
        config: &RedisConfig,
        channel: impl Into<String>,
        socket_id: Uuid,
        member: ChannelMember,
    ) -> Self {
        Self {
            client,
            publisher,
            channel: channel.into(),
            socket_id,
            member,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
            reconnect_interval_ms: config.reconnect_interval_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// 监听循环，直到接收端关闭或重连次数耗尽
    pub async fn run(self, sender: mpsc::Sender<RawChannelEvent>) {
        let mut attempts = 0_u32;

        loop {
            match self.listen(&sender, &mut attempts).await {
                Ok(ListenExit::ReceiverClosed) => break,
                Err(e) => {
                    if sender.is_closed() {
                        break;
                    }
                    attempts += 1;
                    if self.max_reconnect_attempts > 0 && attempts >= self.max_reconnect_attempts {
                        error!(
                            channel = %self.channel,
                            attempts,
                            error = %e,
                            "重连失败，已达最大重试次数"
                        );
                        break;
                    }

                    let delay = reconnect_delay(self.reconnect_interval_ms, attempts);
                    warn!(
                        channel = %self.channel,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis 订阅中断，稍后重连"
                    );
                    sleep(delay).await;
                }
            }
        }

        info!(channel = %self.channel, "Redis 频道监听已停止");
    }

    async fn listen(
        &self,
        sender: &mpsc::Sender<RawChannelEvent>,
        attempts: &mut u32,
    ) -> RedisResult<ListenExit> {
        let mut pubsub =
            self.client
                .get_async_pubsub()
                .await
                .map_err(|e| RedisError::ConnectionError {
                    message: format!("获取 PubSub 连接失败: {}", e),
                })?;

        pubsub
            .subscribe(self.publisher.keys().pubsub_channel(&self.channel))
            .await
            .map_err(|e| RedisError::SubscribeError {
                message: format!("订阅频道 {} 失败: {}", self.channel, e),
            })?;

        // 重连期间成员记录可能已过期或被清除，重新登记
        self.publisher
            .register_member(&self.channel, self.socket_id, &self.member)
            .await?;
        self.sweep().await?;
        let members = self.publisher.members(&self.channel).await?;
        *attempts = 0;

        let succeeded = PresenceEvent::SubscriptionSucceeded(SubscriptionSucceeded { members })
            .into_raw(self.channel.as_str());
        if sender.send(succeeded).await.is_err() {
            return Ok(ListenExit::ReceiverClosed);
        }
        info!(channel = %self.channel, "Redis 频道订阅成功");

        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "获取消息负载失败");
                            continue;
                        }
                    };

                    let envelope = match RedisEnvelope::decode(&payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "丢弃无法解析的消息");
                            continue;
                        }
                    };
                    if envelope.origin == self.socket_id {
                        continue;
                    }

                    debug!(channel = %self.channel, event = %envelope.event, "收到频道消息");
                    if sender.send(envelope.into_event(&self.channel)).await.is_err() {
                        return Ok(ListenExit::ReceiverClosed);
                    }
                }
                _ = heartbeat.tick() => {
                    match self.keep_alive().await {
                        Ok(departed) => {
                            for member in departed {
                                let removed = PresenceEvent::MemberRemoved(MemberRemoved {
                                    id: member.id,
                                })
                                .into_raw(self.channel.as_str());
                                if sender.send(removed).await.is_err() {
                                    return Ok(ListenExit::ReceiverClosed);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "刷新心跳失败");
                        }
                    }
                }
            }
        }

        Err(RedisError::ConnectionError {
            message: format!("频道 {} 的消息流已结束", self.channel),
        })
    }

    /// 刷新心跳并清除超时连接
    ///
    /// 本连接若已被其它监听任务当作断线清除，重新登记并再次宣告加入。
    async fn keep_alive(&self) -> RedisResult<Vec<ChannelMember>> {
        let rejoined = self
            .publisher
            .register_member(&self.channel, self.socket_id, &self.member)
            .await?;
        if rejoined {
            warn!(
                channel = %self.channel,
                socket_id = %self.socket_id,
                "连接曾被清除，重新登记"
            );
            let added = PresenceEvent::MemberAdded(self.member.clone());
            let envelope = RedisEnvelope::new(self.socket_id, added.event_name(), added.payload());
            self.publisher.publish(&self.channel, &envelope).await?;
        }
        self.sweep().await
    }

    /// 清除心跳超时的连接，并向其它连接宣告不再在线的用户离开
    ///
    /// 返回的用户还需要交给本连接的上层；自己发布的消息会被监听循环过滤掉。
    async fn sweep(&self) -> RedisResult<Vec<ChannelMember>> {
        let departed = self
            .publisher
            .sweep_stale(&self.channel, self.connection_timeout)
            .await?;
        for member in &departed {
            debug!(channel = %self.channel, user_id = %member.id, "宣告断线用户离开");
            let removed = PresenceEvent::MemberRemoved(MemberRemoved { id: member.id });
            let envelope =
                RedisEnvelope::new(self.socket_id, removed.event_name(), removed.payload());
            self.publisher.publish(&self.channel, &envelope).await?;
        }
        Ok(departed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(reconnect_delay(500, 1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(500, 4), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(500, 10), MAX_BACKOFF);
        assert_eq!(reconnect_delay(500, u32::MAX), MAX_BACKOFF);
    }
}
