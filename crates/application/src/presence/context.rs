//! 在线状态上下文
//!
//! 应用启动时创建一次并注入到需要的组件中。按作用域对订阅计数：第一个订阅者绑定频道，
//! 最后一个订阅者离开时解除绑定；没有任何作用域时清空存储并取消全部定时器。

use std::collections::HashMap;
use std::sync::Arc;

use config::PresenceConfig;
use domain::{ChannelScope, PresenceStatus, UserId};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::adapter::PresenceChannelAdapter;
use super::events::ChannelMember;
use super::store::PresenceStore;
use super::transport::{PubSubTransport, TransportError};
use crate::clock::Clock;
use crate::typing::TypingTrigger;

struct ScopeEntry {
    adapter: Arc<PresenceChannelAdapter>,
    subscribers: usize,
}

pub struct PresenceContext {
    transport: Arc<dyn PubSubTransport>,
    store: PresenceStore,
    local: ChannelMember,
    typing_idle: Duration,
    scopes: Mutex<HashMap<ChannelScope, ScopeEntry>>,
}

impl PresenceContext {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        store: PresenceStore,
        local: ChannelMember,
        typing_idle: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            local,
            typing_idle,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        transport: Arc<dyn PubSubTransport>,
        clock: Arc<dyn Clock>,
        local: ChannelMember,
        config: &PresenceConfig,
    ) -> Self {
        Self::new(
            transport,
            PresenceStore::from_config(clock, config),
            local,
            Duration::from_millis(config.typing_idle_ms),
        )
    }

    pub fn store(&self) -> &PresenceStore {
        &self.store
    }

    pub fn local_user(&self) -> UserId {
        self.local.id
    }

    /// 订阅作用域；第一个订阅者负责绑定频道
    pub async fn subscribe(
        &self,
        scope: ChannelScope,
    ) -> Result<Arc<PresenceChannelAdapter>, TransportError> {
        let mut scopes = self.scopes.lock().await;
        if let Some(entry) = scopes.get_mut(&scope) {
            entry.subscribers += 1;
            debug!(scope = %scope, subscribers = entry.subscribers, "复用已绑定的作用域");
            return Ok(Arc::clone(&entry.adapter));
        }

        let adapter = Arc::new(PresenceChannelAdapter::new(
            scope,
            self.local.clone(),
            Arc::clone(&self.transport),
            self.store.clone(),
        ));
        adapter.bind().await?;

        scopes.insert(
            scope,
            ScopeEntry {
                adapter: Arc::clone(&adapter),
                subscribers: 1,
            },
        );
        Ok(adapter)
    }

    /// 取消订阅；未订阅的作用域什么也不做
    pub async fn unsubscribe(&self, scope: ChannelScope) {
        let mut scopes = self.scopes.lock().await;
        let Some(entry) = scopes.get_mut(&scope) else {
            debug!(scope = %scope, "作用域未订阅，忽略取消订阅");
            return;
        };

        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }

        if let Some(entry) = scopes.remove(&scope) {
            entry.adapter.unbind().await;
        }
        if scopes.is_empty() {
            self.store.clear();
        }
    }

    /// 切换作用域（例如切换群组）：先释放旧频道，再订阅新频道
    pub async fn switch_scope(
        &self,
        from: Option<ChannelScope>,
        to: ChannelScope,
    ) -> Result<Arc<PresenceChannelAdapter>, TransportError> {
        if let Some(from) = from.filter(|from| *from != to) {
            self.unsubscribe(from).await;
        }
        self.subscribe(to).await
    }

    pub async fn adapter(&self, scope: ChannelScope) -> Option<Arc<PresenceChannelAdapter>> {
        self.scopes
            .lock()
            .await
            .get(&scope)
            .map(|entry| Arc::clone(&entry.adapter))
    }

    pub async fn active_scopes(&self) -> Vec<ChannelScope> {
        let mut scopes: Vec<ChannelScope> = self.scopes.lock().await.keys().copied().collect();
        scopes.sort();
        scopes
    }

    /// 为已订阅的作用域创建输入提示发布器
    pub async fn typing_trigger(&self, scope: ChannelScope) -> Option<TypingTrigger> {
        let adapter = self.adapter(scope).await?;
        Some(TypingTrigger::new(adapter, self.typing_idle))
    }

    /// 向所有已订阅的作用域发布本地用户状态
    ///
    /// 发布失败只记录日志，本地存储总是更新。
    pub async fn publish_status(&self, status: PresenceStatus) {
        let adapters: Vec<Arc<PresenceChannelAdapter>> = self
            .scopes
            .lock()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.adapter))
            .collect();

        for adapter in adapters {
            if let Err(e) = adapter.publish_status(status).await {
                warn!(scope = %adapter.scope(), error = %e, "发布在线状态失败");
            }
        }
        self.store.set_user_online(self.local.id, status);
    }

    /// 解除全部作用域并清空存储
    pub async fn shutdown(&self) {
        let entries: Vec<ScopeEntry> = self.scopes.lock().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.adapter.unbind().await;
        }
        self.store.clear();
    }
}
