//! 在线状态存储
//!
//! 进程级的内存投影：`userId -> PresenceRecord` 与 `(channelId, userId) -> TypingRecord`，
//! 由所有已订阅作用域的适配器共同写入。每个键最后写入者生效，不同键之间互不影响。
//! 输入状态在插入时安排删除定时器，同一个键重复插入会替换旧定时器。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use config::PresenceConfig;
use domain::{ChannelId, ChannelScope, PresenceRecord, PresenceStatus, TypingRecord, UserId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::clock::Clock;
use crate::expiring_map::ExpiringMap;

type TypingKey = (ChannelId, UserId);

/// 存储变更通知，供界面层订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    StatusUpdated(PresenceRecord),
    Removed(UserId),
    TypingStarted(TypingRecord),
    TypingStopped { user_id: UserId, channel_id: ChannelId },
    Cleared,
}

#[derive(Default)]
struct StoreState {
    presence: HashMap<UserId, PresenceRecord>,
    rosters: HashMap<ChannelScope, HashSet<UserId>>,
    typing: ExpiringMap<TypingKey, TypingRecord>,
    timers: HashMap<TypingKey, JoinHandle<()>>,
}

impl StoreState {
    fn in_any_roster(&self, user_id: &UserId) -> bool {
        self.rosters.values().any(|roster| roster.contains(user_id))
    }

    fn cancel_timer(&mut self, key: &TypingKey) {
        if let Some(timer) = self.timers.remove(key) {
            timer.abort();
        }
    }

    fn drop_user_typing(&mut self, user_id: UserId) -> Vec<TypingKey> {
        let removed = self.typing.remove_where(|(_, typing_user), _| *typing_user == user_id);
        for key in &removed {
            self.cancel_timer(key);
        }
        removed
    }

    /// 删除用户的在线记录与输入记录，返回需要发出的变更
    fn drop_user(&mut self, user_id: UserId) -> Vec<PresenceChange> {
        let mut changes: Vec<PresenceChange> = self
            .drop_user_typing(user_id)
            .into_iter()
            .map(|(channel_id, user_id)| PresenceChange::TypingStopped {
                user_id,
                channel_id,
            })
            .collect();

        if self.presence.remove(&user_id).is_some() {
            changes.push(PresenceChange::Removed(user_id));
        }
        changes
    }

    /// 显式状态优先；没有显式状态时保留已有状态，否则视为在线
    fn upsert(
        &mut self,
        user_id: UserId,
        status: Option<PresenceStatus>,
        now: domain::Timestamp,
    ) -> PresenceRecord {
        let status = status
            .or_else(|| self.presence.get(&user_id).map(|record| record.status))
            .unwrap_or_default();
        let record = PresenceRecord {
            user_id,
            status,
            last_seen: now,
        };
        self.presence.insert(user_id, record.clone());
        record
    }
}

struct Shared {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<PresenceChange>,
    clock: Arc<dyn Clock>,
    typing_ttl: Duration,
}

/// 在线状态存储，克隆得到的是同一份状态的句柄
#[derive(Clone)]
pub struct PresenceStore {
    shared: Arc<Shared>,
}

impl PresenceStore {
    pub fn new(clock: Arc<dyn Clock>, typing_ttl: Duration, change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                changes,
                clock,
                typing_ttl,
            }),
        }
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &PresenceConfig) -> Self {
        Self::new(
            clock,
            Duration::from_millis(config.typing_expiry_ms),
            config.event_buffer,
        )
    }

    /// 输入状态的存活时长
    pub fn typing_ttl(&self) -> Duration {
        self.shared.typing_ttl
    }

    /// 订阅变更通知
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.shared.changes.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        // 存储只是可丢弃的投影，锁中毒时继续使用内部数据
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, changes: Vec<PresenceChange>) {
        for change in changes {
            // 没有订阅者时发送失败，可以忽略
            let _ = self.shared.changes.send(change);
        }
    }

    /// 设置用户在线状态
    pub fn set_user_online(&self, user_id: UserId, status: PresenceStatus) {
        let now = self.shared.clock.now();
        let record = self.state().upsert(user_id, Some(status), now);
        debug!(user_id = %user_id, status = %status, "更新在线状态");
        self.emit(vec![PresenceChange::StatusUpdated(record)]);
    }

    /// 删除用户的在线记录（不是标记为离线），连同其输入状态
    pub fn set_user_offline(&self, user_id: UserId) {
        let changes = {
            let mut state = self.state();
            for roster in state.rosters.values_mut() {
                roster.remove(&user_id);
            }
            state.drop_user(user_id)
        };
        if !changes.is_empty() {
            debug!(user_id = %user_id, "删除在线记录");
        }
        self.emit(changes);
    }

    /// 记录用户正在输入，并（重新）安排到期删除
    pub fn set_user_typing(
        &self,
        user_id: UserId,
        user_name: impl Into<String>,
        channel_id: ChannelId,
    ) {
        let ttl = self.shared.typing_ttl;
        let key = (channel_id, user_id);
        let record = TypingRecord {
            user_id,
            user_name: user_name.into(),
            channel_id,
            expires_at: self.shared.clock.now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        let mut changes = Vec::new();
        {
            let mut state = self.state();
            let now = Instant::now();
            for (expired, _) in state.typing.evict_expired(now) {
                state.cancel_timer(&expired);
                let (expired_channel, expired_user) = expired;
                changes.push(PresenceChange::TypingStopped {
                    user_id: expired_user,
                    channel_id: expired_channel,
                });
            }

            let generation = state.typing.insert(key, record.clone(), ttl, now);
            state.cancel_timer(&key);

            // 没有运行时时依赖读取时的惰性过期，过期条目在下一次写入时清理
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let shared = Arc::downgrade(&self.shared);
                let timer = runtime.spawn(async move {
                    sleep(ttl).await;
                    if let Some(shared) = shared.upgrade() {
                        PresenceStore { shared }.expire_typing(key, generation);
                    }
                });
                state.timers.insert(key, timer);
            }
        }

        changes.push(PresenceChange::TypingStarted(record));
        self.emit(changes);
    }

    fn expire_typing(&self, key: TypingKey, generation: u64) {
        let expired = {
            let mut state = self.state();
            let expired = state.typing.remove_if_generation(&key, generation);
            if expired.is_some() {
                // 定时器自身的句柄，移除即可
                state.timers.remove(&key);
            }
            expired
        };

        if expired.is_some() {
            let (channel_id, user_id) = key;
            debug!(user_id = %user_id, channel_id = %channel_id, "输入状态到期");
            self.emit(vec![PresenceChange::TypingStopped {
                user_id,
                channel_id,
            }]);
        }
    }

    /// 移除输入状态；记录不存在时什么也不做
    pub fn remove_user_typing(&self, user_id: UserId, channel_id: ChannelId) {
        let key = (channel_id, user_id);
        let removed = {
            let mut state = self.state();
            state.cancel_timer(&key);
            state.typing.remove(&key)
        };

        if removed.is_some() {
            self.emit(vec![PresenceChange::TypingStopped {
                user_id,
                channel_id,
            }]);
        }
    }

    pub fn get_online_status(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.state().presence.get(&user_id).cloned()
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<PresenceRecord> = self.state().presence.values().cloned().collect();
        users.sort_by_key(|record| record.user_id);
        users
    }

    /// 频道内正在输入的用户，按名字排序
    pub fn get_typing_users(&self, channel_id: ChannelId) -> Vec<TypingRecord> {
        let now = Instant::now();
        let mut typing: Vec<TypingRecord> = self
            .state()
            .typing
            .live(now)
            .filter(|((channel, _), _)| *channel == channel_id)
            .map(|(_, record)| record.clone())
            .collect();
        typing.sort_by(|a, b| a.user_name.cmp(&b.user_name).then(a.user_id.cmp(&b.user_id)));
        typing
    }

    /// 同上，但排除指定用户（通常是本地用户自己）
    pub fn get_typing_users_except(
        &self,
        channel_id: ChannelId,
        exclude: UserId,
    ) -> Vec<TypingRecord> {
        self.get_typing_users(channel_id)
            .into_iter()
            .filter(|record| record.user_id != exclude)
            .collect()
    }

    /// 用作用域的当前成员列表重建该作用域
    ///
    /// 不在新列表中、也不属于任何其它作用域的旧成员被删除。
    pub fn initialize_scope<I>(&self, scope: ChannelScope, members: I)
    where
        I: IntoIterator<Item = (UserId, Option<PresenceStatus>)>,
    {
        let now = self.shared.clock.now();
        let members: Vec<(UserId, Option<PresenceStatus>)> = members.into_iter().collect();
        let roster: HashSet<UserId> = members.iter().map(|(user_id, _)| *user_id).collect();

        let changes = {
            let mut state = self.state();
            let previous = state.rosters.insert(scope, roster.clone()).unwrap_or_default();

            let mut changes = Vec::new();
            for stale in previous.difference(&roster) {
                if !state.in_any_roster(stale) {
                    changes.extend(state.drop_user(*stale));
                }
            }
            for (user_id, status) in members {
                let record = state.upsert(user_id, status, now);
                changes.push(PresenceChange::StatusUpdated(record));
            }
            changes
        };

        debug!(scope = %scope, members = roster.len(), "重建作用域成员");
        self.emit(changes);
    }

    /// 作用域新增成员
    pub fn join_scope(&self, scope: ChannelScope, user_id: UserId, status: Option<PresenceStatus>) {
        let now = self.shared.clock.now();
        let record = {
            let mut state = self.state();
            state.rosters.entry(scope).or_default().insert(user_id);
            state.upsert(user_id, status, now)
        };
        self.emit(vec![PresenceChange::StatusUpdated(record)]);
    }

    /// 作用域成员离开
    ///
    /// 用户不再属于任何作用域时整条在线记录被删除；仍在其它作用域中的用户保留。
    pub fn leave_scope(&self, scope: ChannelScope, user_id: UserId) {
        let changes = {
            let mut state = self.state();
            if let Some(roster) = state.rosters.get_mut(&scope) {
                roster.remove(&user_id);
            }
            if state.in_any_roster(&user_id) {
                Vec::new()
            } else {
                state.drop_user(user_id)
            }
        };
        debug!(
            scope = %scope,
            user_id = %user_id,
            removed = !changes.is_empty(),
            "成员离开作用域"
        );
        self.emit(changes);
    }

    /// 取消订阅作用域时释放其成员；仍属于其它作用域的用户保留
    pub fn release_scope(&self, scope: ChannelScope) {
        let changes = {
            let mut state = self.state();
            let Some(roster) = state.rosters.remove(&scope) else {
                return;
            };

            let mut changes = Vec::new();
            for user_id in roster {
                if !state.in_any_roster(&user_id) {
                    changes.extend(state.drop_user(user_id));
                }
            }
            changes
        };
        self.emit(changes);
    }

    /// 清空全部状态并取消所有到期定时器
    pub fn clear(&self) {
        {
            let mut state = self.state();
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.typing.clear();
            state.presence.clear();
            state.rosters.clear();
        }
        self.emit(vec![PresenceChange::Cleared]);
    }

    /// 尚未触发的输入到期定时器数量
    pub fn pending_typing_timers(&self) -> usize {
        self.state().timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use domain::GroupId;

    const TTL: Duration = Duration::from_secs(3);

    fn store() -> PresenceStore {
        PresenceStore::new(Arc::new(SystemClock), TTL, 64)
    }

    #[test]
    fn test_status_updates_are_per_user() {
        let store = store();
        let alice = UserId::generate();
        let bob = UserId::generate();

        store.set_user_online(alice, PresenceStatus::Online);
        store.set_user_online(bob, PresenceStatus::Dnd);
        store.set_user_online(alice, PresenceStatus::Idle);

        assert_eq!(store.get_online_status(alice).unwrap().status, PresenceStatus::Idle);
        assert_eq!(store.get_online_status(bob).unwrap().status, PresenceStatus::Dnd);
    }

    #[test]
    fn test_offline_removes_record_entirely() {
        let store = store();
        let alice = UserId::generate();
        store.set_user_online(alice, PresenceStatus::Online);
        store.set_user_offline(alice);
        assert_eq!(store.get_online_status(alice), None);

        // 重复删除是空操作
        store.set_user_offline(alice);
        assert!(store.online_users().is_empty());
    }

    #[test]
    fn test_typing_without_runtime_expires_lazily() {
        let store = PresenceStore::new(Arc::new(SystemClock), Duration::from_millis(0), 8);
        let channel = ChannelId::generate();
        store.set_user_typing(UserId::generate(), "Alice", channel);

        assert_eq!(store.pending_typing_timers(), 0);
        assert!(store.get_typing_users(channel).is_empty());
    }

    #[test]
    fn test_expired_typing_is_evicted_on_next_write() {
        let store = PresenceStore::new(Arc::new(SystemClock), Duration::from_millis(0), 8);
        let mut feed = store.subscribe();
        let channel = ChannelId::generate();
        let (alice, bob) = (UserId::generate(), UserId::generate());

        store.set_user_typing(alice, "Alice", channel);
        store.set_user_typing(bob, "Bob", channel);

        let mut changes = Vec::new();
        while let Ok(change) = feed.try_recv() {
            changes.push(change);
        }
        assert!(changes.contains(&PresenceChange::TypingStopped {
            user_id: alice,
            channel_id: channel,
        }));
        assert_eq!(store.state().typing.len(), 1);
    }

    #[test]
    fn test_initialize_scope_drops_stale_members() {
        let store = store();
        let scope = ChannelScope::Group(GroupId::generate());
        let other = ChannelScope::Group(GroupId::generate());
        let (alice, bob, carol) = (UserId::generate(), UserId::generate(), UserId::generate());

        store.initialize_scope(scope, [(alice, None), (bob, Some(PresenceStatus::Idle))]);
        store.initialize_scope(other, [(bob, None)]);
        store.set_user_online(carol, PresenceStatus::Online);

        store.initialize_scope(scope, [(carol, None)]);

        assert_eq!(store.get_online_status(alice), None);
        // bob 仍在另一个作用域中，保留原状态
        assert_eq!(store.get_online_status(bob).unwrap().status, PresenceStatus::Idle);
        assert!(store.get_online_status(carol).is_some());
    }

    #[test]
    fn test_release_scope_keeps_shared_members() {
        let store = store();
        let group = ChannelScope::Group(GroupId::generate());
        let me = ChannelScope::User(UserId::generate());
        let (alice, bob) = (UserId::generate(), UserId::generate());

        store.initialize_scope(group, [(alice, None), (bob, None)]);
        store.join_scope(me, bob, None);
        store.release_scope(group);

        assert_eq!(store.get_online_status(alice), None);
        assert!(store.get_online_status(bob).is_some());
    }

    #[test]
    fn test_leave_scope_keeps_members_of_other_scopes() {
        let store = store();
        let first = ChannelScope::Group(GroupId::generate());
        let second = ChannelScope::Group(GroupId::generate());
        let (alice, bob) = (UserId::generate(), UserId::generate());

        store.initialize_scope(first, [(alice, None), (bob, Some(PresenceStatus::Dnd))]);
        store.initialize_scope(second, [(bob, None)]);

        store.leave_scope(first, bob);
        assert_eq!(store.get_online_status(bob).unwrap().status, PresenceStatus::Dnd);

        store.leave_scope(second, bob);
        assert_eq!(store.get_online_status(bob), None);

        store.leave_scope(first, alice);
        assert!(store.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_change_feed() {
        let store = store();
        let mut changes = store.subscribe();
        let alice = UserId::generate();

        store.set_user_online(alice, PresenceStatus::Online);
        store.set_user_offline(alice);

        assert!(matches!(
            changes.recv().await.unwrap(),
            PresenceChange::StatusUpdated(record) if record.user_id == alice
        ));
        assert_eq!(changes.recv().await.unwrap(), PresenceChange::Removed(alice));
    }
}
