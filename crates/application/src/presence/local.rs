//! 进程内的发布/订阅传输实现，用于单机部署与测试

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::{ChannelMember, MemberRemoved, PresenceEvent, SubscriptionSucceeded};
use super::transport::{PubSubTransport, RawChannelEvent, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Envelope {
    from_socket: u64,
    event: RawChannelEvent,
}

struct LocalChannel {
    sender: broadcast::Sender<Envelope>,
    members: HashMap<u64, ChannelMember>,
}

impl LocalChannel {
    fn is_present(&self, member: &ChannelMember) -> bool {
        self.members.values().any(|m| m.id == member.id)
    }

    /// 按用户去重后的成员列表
    fn distinct_members(&self) -> Vec<ChannelMember> {
        let mut seen = HashMap::new();
        for member in self.members.values() {
            seen.entry(member.id).or_insert_with(|| member.clone());
        }
        let mut members: Vec<ChannelMember> = seen.into_values().collect();
        members.sort_by_key(|member| member.id);
        members
    }

    fn publish(&self, from_socket: u64, event: RawChannelEvent) {
        // 没有其它订阅者时发送失败，可以忽略
        let _ = self.sender.send(Envelope { from_socket, event });
    }
}

/// 进程内消息中枢，多个客户端连接共享
pub struct LocalPubSubHub {
    channels: Mutex<HashMap<String, LocalChannel>>,
    next_socket: AtomicU64,
    capacity: usize,
}

impl LocalPubSubHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            next_socket: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    /// 建立一个新的客户端连接
    pub fn connect(self: &Arc<Self>) -> LocalPubSubTransport {
        LocalPubSubTransport {
            hub: Arc::clone(self),
            socket_id: self.next_socket.fetch_add(1, Ordering::Relaxed),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// 频道当前成员（按用户去重）
    pub fn members(&self, channel: &str) -> Vec<ChannelMember> {
        lock(&self.channels)
            .get(channel)
            .map(LocalChannel::distinct_members)
            .unwrap_or_default()
    }
}

struct LocalSubscription {
    member: ChannelMember,
    direct: mpsc::Sender<RawChannelEvent>,
    pump: JoinHandle<()>,
}

/// 单个客户端连接
pub struct LocalPubSubTransport {
    hub: Arc<LocalPubSubHub>,
    socket_id: u64,
    subscriptions: Mutex<HashMap<String, LocalSubscription>>,
}

impl LocalPubSubTransport {
    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// 模拟重连：向自己的订阅重新投递一次 `subscription_succeeded`
    pub fn resync(&self, channel: &str) -> Result<(), TransportError> {
        let subscriptions = lock(&self.subscriptions);
        let subscription =
            subscriptions
                .get(channel)
                .ok_or_else(|| TransportError::NotSubscribed {
                    channel: channel.to_string(),
                })?;

        let members = self.hub.members(channel);
        let event = PresenceEvent::SubscriptionSucceeded(SubscriptionSucceeded { members })
            .into_raw(channel);
        subscription
            .direct
            .try_send(event)
            .map_err(|e| TransportError::subscribe(channel, e))
    }

    /// 模拟连接异常断开：释放全部频道，其它客户端收到 `member_removed`
    pub fn disconnect(&self) {
        let channels: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        for channel in channels {
            self.leave(&channel);
        }
    }

    fn leave(&self, channel: &str) -> bool {
        let Some(subscription) = lock(&self.subscriptions).remove(channel) else {
            return false;
        };
        subscription.pump.abort();

        let mut channels = lock(&self.hub.channels);
        if let Some(local) = channels.get_mut(channel) {
            local.members.remove(&self.socket_id);
            if !local.is_present(&subscription.member) {
                let removed = PresenceEvent::MemberRemoved(MemberRemoved {
                    id: subscription.member.id,
                })
                .into_raw(channel);
                local.publish(self.socket_id, removed);
            }
            if local.members.is_empty() {
                channels.remove(channel);
            }
        }

        debug!(channel = %channel, socket_id = self.socket_id, "本地频道已释放");
        true
    }
}

#[async_trait]
impl PubSubTransport for LocalPubSubTransport {
    async fn subscribe(
        &self,
        channel: &str,
        member: &ChannelMember,
    ) -> Result<mpsc::Receiver<RawChannelEvent>, TransportError> {
        // 重复订阅视为重新订阅
        self.leave(channel);

        let (direct, receiver) = mpsc::channel(self.hub.capacity);

        let (mut feed, members, announce) = {
            let mut channels = lock(&self.hub.channels);
            let local = channels
                .entry(channel.to_string())
                .or_insert_with(|| LocalChannel {
                    sender: broadcast::channel(self.hub.capacity).0,
                    members: HashMap::new(),
                });

            let announce = !local.is_present(member);
            local.members.insert(self.socket_id, member.clone());
            (local.sender.subscribe(), local.distinct_members(), announce)
        };

        let succeeded = PresenceEvent::SubscriptionSucceeded(SubscriptionSucceeded { members })
            .into_raw(channel);
        direct
            .try_send(succeeded)
            .map_err(|e| TransportError::subscribe(channel, e))?;

        if announce {
            let added = PresenceEvent::MemberAdded(member.clone()).into_raw(channel);
            if let Some(local) = lock(&self.hub.channels).get(channel) {
                local.publish(self.socket_id, added);
            }
        }

        let socket_id = self.socket_id;
        let forward = direct.clone();
        let channel_name = channel.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(envelope) if envelope.from_socket == socket_id => continue,
                    Ok(envelope) => {
                        if forward.send(envelope.event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "本地频道消息积压，部分事件被丢弃");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        lock(&self.subscriptions).insert(
            channel.to_string(),
            LocalSubscription {
                member: member.clone(),
                direct,
                pump,
            },
        );

        debug!(channel = %channel, socket_id = self.socket_id, "本地频道订阅成功");
        Ok(receiver)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        if self.leave(channel) {
            Ok(())
        } else {
            Err(TransportError::NotSubscribed {
                channel: channel.to_string(),
            })
        }
    }

    async fn trigger(
        &self,
        channel: &str,
        event: &str,
        data: Value,
    ) -> Result<(), TransportError> {
        if !event.starts_with("client-") {
            return Err(TransportError::publish(channel, "只允许发布 client- 前缀的事件"));
        }
        if !lock(&self.subscriptions).contains_key(channel) {
            return Err(TransportError::NotSubscribed {
                channel: channel.to_string(),
            });
        }

        if let Some(local) = lock(&self.hub.channels).get(channel) {
            local.publish(self.socket_id, RawChannelEvent::new(channel, event, data));
        }
        Ok(())
    }
}

impl Drop for LocalPubSubTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::events::{MEMBER_ADDED, MEMBER_REMOVED, SUBSCRIPTION_SUCCEEDED};
    use domain::UserId;
    use serde_json::json;

    #[tokio::test]
    async fn test_membership_events_flow_between_clients() {
        let hub = LocalPubSubHub::new(16);
        let alice_conn = hub.connect();
        let bob_conn = hub.connect();
        let alice = ChannelMember::new(UserId::generate(), "Alice");
        let bob = ChannelMember::new(UserId::generate(), "Bob");

        let mut alice_rx = alice_conn.subscribe("group:1", &alice).await.unwrap();
        let first = alice_rx.recv().await.unwrap();
        assert_eq!(first.event, SUBSCRIPTION_SUCCEEDED);

        let mut bob_rx = bob_conn.subscribe("group:1", &bob).await.unwrap();
        let succeeded = bob_rx.recv().await.unwrap();
        assert_eq!(succeeded.data["members"].as_array().unwrap().len(), 2);

        let added = alice_rx.recv().await.unwrap();
        assert_eq!(added.event, MEMBER_ADDED);

        bob_conn.disconnect();
        let removed = alice_rx.recv().await.unwrap();
        assert_eq!(removed.event, MEMBER_REMOVED);
        assert_eq!(hub.members("group:1").len(), 1);
    }

    #[tokio::test]
    async fn test_client_events_are_not_echoed() {
        let hub = LocalPubSubHub::new(16);
        let alice_conn = hub.connect();
        let bob_conn = hub.connect();

        let mut alice_rx = alice_conn
            .subscribe("dm:1", &ChannelMember::new(UserId::generate(), "Alice"))
            .await
            .unwrap();
        let mut bob_rx = bob_conn
            .subscribe("dm:1", &ChannelMember::new(UserId::generate(), "Bob"))
            .await
            .unwrap();
        alice_rx.recv().await.unwrap();
        alice_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();

        alice_conn
            .trigger("dm:1", "client-ping", json!({ "n": 1 }))
            .await
            .unwrap();
        let received = bob_rx.recv().await.unwrap();
        assert_eq!(received.event, "client-ping");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trigger_rules() {
        let hub = LocalPubSubHub::new(16);
        let conn = hub.connect();

        assert!(matches!(
            conn.trigger("group:1", "client-typing", json!({})).await,
            Err(TransportError::NotSubscribed { .. })
        ));

        let _rx = conn
            .subscribe("group:1", &ChannelMember::new(UserId::generate(), "Alice"))
            .await
            .unwrap();
        assert!(matches!(
            conn.trigger("group:1", "member_added", json!({})).await,
            Err(TransportError::Publish { .. })
        ));
        assert!(conn.unsubscribe("group:1").await.is_ok());
        assert!(conn.unsubscribe("group:1").await.is_err());
    }
}
