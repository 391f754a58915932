//! Process-local LRU cache pool.
//!
//! Shared by every engine created from one registry; writes are visible
//! immediately to later reads on the same process. Values are the same
//! string envelopes the remote cache stores (row envelope, search envelope
//! or the `"nil"` negative sentinel).

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Clone)]
pub struct LocalCachePool {
    code: String,
    lru: Arc<Mutex<LruCache<String, String>>>,
}

impl LocalCachePool {
    pub(crate) fn new(code: &str, size: usize) -> Self {
        let capacity = NonZeroUsize::new(size.max(1)).expect("capacity is at least 1");
        Self {
            code: code.to_string(),
            lru: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lru.lock().get(key).cloned()
    }

    pub fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        let mut guard = self.lru.lock();
        keys.iter().map(|key| guard.get(key).cloned()).collect()
    }

    pub fn set(&self, key: &str, value: String) {
        self.lru.lock().put(key.to_string(), value);
    }

    pub fn mset(&self, pairs: Vec<(String, String)>) {
        let mut guard = self.lru.lock();
        for (key, value) in pairs {
            guard.put(key, value);
        }
    }

    pub fn remove(&self, keys: &[String]) {
        let mut guard = self.lru.lock();
        for key in keys {
            guard.pop(key);
        }
    }

    pub fn clear(&self) {
        self.lru.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let pool = LocalCachePool::new("default", 10);
        pool.set("a", "1".to_string());
        assert_eq!(pool.get("a").as_deref(), Some("1"));
        pool.remove(&["a".to_string()]);
        assert_eq!(pool.get("a"), None);
    }

    #[test]
    fn test_mget_preserves_order() {
        let pool = LocalCachePool::new("default", 10);
        pool.mset(vec![("a".to_string(), "1".to_string()), ("c".to_string(), "3".to_string())]);
        let got = pool.mget(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(got, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let pool = LocalCachePool::new("default", 2);
        pool.set("a", "1".to_string());
        pool.set("b", "2".to_string());
        pool.set("c", "3".to_string());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get("a"), None);
        assert_eq!(pool.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_shared_between_clones() {
        let pool = LocalCachePool::new("default", 10);
        let clone = pool.clone();
        pool.set("a", "1".to_string());
        assert_eq!(clone.get("a").as_deref(), Some("1"));
    }
}
