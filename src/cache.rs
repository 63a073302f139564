use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Time-bounded cache. Each entry is locked independently; there is no
/// consistency guarantee across entries.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a live entry. An expired entry is dropped on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every entry whose key fails `keep`; returns how many went.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key));
        before - self.entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

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

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.insert("k".to_string(), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&"k".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_fresh_entries() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.insert(1, "old");
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert(2, "new");
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(&2), Some("new"));
    }

    #[test]
    fn test_retain_and_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(("a".to_string(), "/".to_string()), 1);
        cache.insert(("a".to_string(), "/x".to_string()), 2);
        cache.insert(("b".to_string(), "/".to_string()), 3);

        assert_eq!(cache.retain(|(server, _)| server != "a"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate(&("b".to_string(), "/".to_string())));
        assert!(!cache.invalidate(&("b".to_string(), "/".to_string())));
    }
}
