//! 带过期时间的映射
//!
//! 与定时器、界面框架无关的纯数据结构：插入时给出存活时长，重复插入同一个键会
//! 覆盖旧的截止时间并换发新的代号。过期条目对读取不可见，可以惰性清理，
//! 也可以由外部定时器按代号精确删除。

use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    deadline: Instant,
    generation: u64,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

#[derive(Debug, Clone)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_generation: u64,
}

impl<K, V> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或覆盖条目，返回本次插入的代号
    pub fn insert(&mut self, key: K, value: V, ttl: Duration, now: Instant) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            key,
            Entry {
                value,
                deadline: now + ttl,
                generation,
            },
        );
        generation
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.value)
    }

    /// 删除条目，不存在时什么也不做
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// 仅当条目仍是指定代号时删除；已被重新插入或已删除时返回 `None`
    pub fn remove_if_generation(&mut self, key: &K, generation: u64) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => self.remove(key),
            _ => None,
        }
    }

    /// 清理所有已过期条目并返回它们
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry.value)))
            .collect()
    }

    /// 遍历未过期条目
    pub fn live(&self, now: Instant) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key, &entry.value))
    }

    /// 按条件删除，返回被删除的键
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<K>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.entries.remove(key);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 包含尚未清理的过期条目
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3);

    #[test]
    fn test_entries_disappear_after_deadline() {
        let mut map = ExpiringMap::new();
        let t0 = Instant::now();
        map.insert("u1", "Alice", TTL, t0);

        assert_eq!(map.get(&"u1", t0 + Duration::from_millis(2999)), Some(&"Alice"));
        assert_eq!(map.get(&"u1", t0 + TTL), None);
        assert_eq!(map.len(), 1);

        let evicted = map.evict_expired(t0 + TTL);
        assert_eq!(evicted, vec![("u1", "Alice")]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_reinsert_extends_deadline() {
        let mut map = ExpiringMap::new();
        let t0 = Instant::now();
        let first = map.insert("u1", 1, TTL, t0);
        let second = map.insert("u1", 2, TTL, t0 + Duration::from_secs(1));

        assert_ne!(first, second);
        assert_eq!(map.get(&"u1", t0 + Duration::from_millis(3500)), Some(&2));
        assert_eq!(map.get(&"u1", t0 + Duration::from_secs(4)), None);

        // 旧代号的删除请求不影响新条目
        assert_eq!(map.remove_if_generation(&"u1", first), None);
        assert_eq!(map.remove_if_generation(&"u1", second), Some(2));
        assert_eq!(map.remove_if_generation(&"u1", second), None);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut map: ExpiringMap<&str, i32> = ExpiringMap::new();
        assert_eq!(map.remove(&"missing"), None);
        map.insert("k", 1, TTL, Instant::now());
        assert_eq!(map.remove(&"k"), Some(1));
        assert_eq!(map.remove(&"k"), None);
    }

    #[test]
    fn test_live_and_remove_where() {
        let mut map = ExpiringMap::new();
        let t0 = Instant::now();
        map.insert(("c1", "u1"), 1, TTL, t0);
        map.insert(("c1", "u2"), 2, Duration::from_secs(1), t0);
        map.insert(("c2", "u1"), 3, TTL, t0);

        let later = t0 + Duration::from_secs(2);
        let mut live: Vec<_> = map.live(later).map(|(_, v)| *v).collect();
        live.sort();
        assert_eq!(live, vec![1, 3]);

        let removed = map.remove_where(|(_, user), _| *user == "u1");
        assert_eq!(removed.len(), 2);
        assert_eq!(map.len(), 1);
    }
}
