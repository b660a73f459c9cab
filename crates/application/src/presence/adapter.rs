//! 在线状态频道适配器
//!
//! 每个作用域（群组、私聊会话、用户）绑定一个传输频道，把原始频道事件翻译为
//! [`PresenceStore`] 的更新。适配器在两次（重新）订阅之间不保存状态：每次收到
//! `subscription_succeeded` 都重新执行一次整体初始化。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use domain::{ChannelId, ChannelScope, PresenceStatus, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{ChannelMember, PresenceEvent, StatusChanged, StoppedTyping, Typing};
use super::store::PresenceStore;
use super::transport::{PubSubTransport, RawChannelEvent, TransportError};
use crate::typing::TypingPublisher;

pub struct PresenceChannelAdapter {
    scope: ChannelScope,
    channel: String,
    local: ChannelMember,
    transport: Arc<dyn PubSubTransport>,
    store: PresenceStore,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceChannelAdapter {
    pub fn new(
        scope: ChannelScope,
        local: ChannelMember,
        transport: Arc<dyn PubSubTransport>,
        store: PresenceStore,
    ) -> Self {
        Self {
            channel: scope.channel_name(),
            scope,
            local,
            transport,
            store,
            pump: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> ChannelScope {
        self.scope
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn local_user(&self) -> UserId {
        self.local.id
    }

    fn pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bound(&self) -> bool {
        self.pump()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 订阅频道并开始把事件写入存储
    pub async fn bind(&self) -> Result<(), TransportError> {
        let events = self.transport.subscribe(&self.channel, &self.local).await?;
        let pump = tokio::spawn(Self::run(self.scope, self.store.clone(), events));

        if let Some(previous) = self.pump().replace(pump) {
            previous.abort();
        }
        info!(scope = %self.scope, user_id = %self.local.id, "已绑定在线状态频道");
        Ok(())
    }

    /// 解除事件处理并释放频道；该作用域独有的成员从存储中移除
    pub async fn unbind(&self) {
        if let Some(pump) = self.pump().take() {
            pump.abort();
        }
        if let Err(e) = self.transport.unsubscribe(&self.channel).await {
            warn!(scope = %self.scope, error = %e, "释放频道失败");
        }
        self.store.release_scope(self.scope);
        info!(scope = %self.scope, "已解除在线状态频道");
    }

    /// 发布本地用户的状态；客户端事件不会回送，因此同时直接写入本地存储
    pub async fn publish_status(&self, status: PresenceStatus) -> Result<(), TransportError> {
        let event = PresenceEvent::StatusChanged(StatusChanged {
            user_id: self.local.id,
            status,
        });
        self.publish(event).await?;
        self.store.set_user_online(self.local.id, status);
        Ok(())
    }

    async fn publish(&self, event: PresenceEvent) -> Result<(), TransportError> {
        self.transport
            .trigger(&self.channel, event.event_name(), event.payload())
            .await
    }

    async fn run(
        scope: ChannelScope,
        store: PresenceStore,
        mut events: mpsc::Receiver<RawChannelEvent>,
    ) {
        while let Some(raw) = events.recv().await {
            match PresenceEvent::decode(&raw) {
                Ok(Some(event)) => Self::apply(scope, &store, event),
                Ok(None) => {
                    debug!(scope = %scope, event = %raw.event, "忽略未知频道事件");
                }
                Err(e) => {
                    warn!(scope = %scope, error = %e, "丢弃格式错误的频道事件");
                }
            }
        }
        debug!(scope = %scope, "频道事件流已结束");
    }

    /// 把单个事件应用到存储
    pub fn apply(scope: ChannelScope, store: &PresenceStore, event: PresenceEvent) {
        match event {
            PresenceEvent::SubscriptionSucceeded(payload) => {
                store.initialize_scope(
                    scope,
                    payload
                        .members
                        .into_iter()
                        .map(|member| (member.id, member.info.status)),
                );
            }
            PresenceEvent::MemberAdded(member) => {
                store.join_scope(scope, member.id, member.info.status);
            }
            PresenceEvent::MemberRemoved(payload) => {
                store.leave_scope(scope, payload.id);
            }
            PresenceEvent::StatusChanged(payload) => {
                store.set_user_online(payload.user_id, payload.status);
            }
            PresenceEvent::Typing(payload) => {
                store.set_user_typing(payload.user_id, payload.user_name, payload.channel_id);
            }
            PresenceEvent::StoppedTyping(payload) => {
                store.remove_user_typing(payload.user_id, payload.channel_id);
            }
        }
    }
}

#[async_trait]
impl TypingPublisher for PresenceChannelAdapter {
    async fn publish_typing(&self, channel_id: ChannelId) -> Result<(), TransportError> {
        self.publish(PresenceEvent::Typing(Typing {
            user_id: self.local.id,
            user_name: self.local.info.name.clone(),
            channel_id,
        }))
        .await
    }

    async fn publish_stopped_typing(&self, channel_id: ChannelId) -> Result<(), TransportError> {
        self.publish(PresenceEvent::StoppedTyping(StoppedTyping {
            user_id: self.local.id,
            channel_id,
        }))
        .await
    }
}

impl Drop for PresenceChannelAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::presence::events::{MemberRemoved, SubscriptionSucceeded};
    use crate::presence::local::LocalPubSubHub;
    use domain::GroupId;
    use std::time::Duration;

    fn store() -> PresenceStore {
        PresenceStore::new(Arc::new(SystemClock), Duration::from_secs(3), 64)
    }

    #[test]
    fn test_member_removed_deletes_record() {
        let store = store();
        let scope = ChannelScope::Group(GroupId::generate());
        let alice =
            ChannelMember::new(UserId::generate(), "Alice").with_status(PresenceStatus::Dnd);

        PresenceChannelAdapter::apply(
            scope,
            &store,
            PresenceEvent::SubscriptionSucceeded(SubscriptionSucceeded {
                members: vec![alice.clone()],
            }),
        );
        assert_eq!(
            store.get_online_status(alice.id).unwrap().status,
            PresenceStatus::Dnd
        );

        PresenceChannelAdapter::apply(
            scope,
            &store,
            PresenceEvent::MemberRemoved(MemberRemoved { id: alice.id }),
        );
        assert_eq!(store.get_online_status(alice.id), None);
    }

    #[tokio::test]
    async fn test_bind_publish_and_unbind() {
        let hub = LocalPubSubHub::new(16);
        let scope = ChannelScope::Group(GroupId::generate());
        let alice = ChannelMember::new(UserId::generate(), "Alice");
        let bob = ChannelMember::new(UserId::generate(), "Bob");

        let alice_store = store();
        let bob_store = store();
        let alice_adapter = PresenceChannelAdapter::new(
            scope,
            alice.clone(),
            Arc::new(hub.connect()),
            alice_store.clone(),
        );
        let bob_adapter = PresenceChannelAdapter::new(
            scope,
            bob.clone(),
            Arc::new(hub.connect()),
            bob_store.clone(),
        );

        let mut alice_changes = alice_store.subscribe();
        alice_adapter.bind().await.unwrap();
        bob_adapter.bind().await.unwrap();
        assert!(alice_adapter.is_bound());

        // 等待 alice 看到 bob 加入
        while alice_store.get_online_status(bob.id).is_none() {
            alice_changes.recv().await.unwrap();
        }

        bob_adapter.publish_status(PresenceStatus::Idle).await.unwrap();
        assert_eq!(
            bob_store.get_online_status(bob.id).unwrap().status,
            PresenceStatus::Idle
        );
        while alice_store.get_online_status(bob.id).map(|r| r.status)
            != Some(PresenceStatus::Idle)
        {
            alice_changes.recv().await.unwrap();
        }

        bob_adapter.unbind().await;
        assert!(!bob_adapter.is_bound());
        while alice_store.get_online_status(bob.id).is_some() {
            alice_changes.recv().await.unwrap();
        }
    }
}
