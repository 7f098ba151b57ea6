//! # Prefixed Client Cache
//!
//! Client-side cache of node data, stats, children and ACLs, partitioned by a
//! caller-chosen prefix (typically one per watched subtree).
//!
//! Each prefix owns an independent [`LruCache`] behind its own mutex, so
//! traffic on one prefix never waits on another. The prefix table itself is
//! only write-locked when a prefix is created or wiped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::cache::lru::LruCache;
use crate::protocol::types::{empty_default, Acl, KeeperState, Stat, WatchedEvent, WatchedEventType};

/// Entries kept per prefix unless changed.
pub const DEFAULT_MAX_CAPACITY_PER_PREFIX: usize = 10_000;

bitflags! {
    /// Which parts of a [`DataEntry`] an operation reads or writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CachedKind: u8 {
        const NONE = 0;
        const NODE_DATA = 1;
        const NODE_STATS = 2;
        const NODE_CHILDREN = 4;
        const NODE_ACLS = 8;
        const ALL = 15;
    }
}

empty_default!(CachedKind);

/// Cached facts about one node. Absent parts are unknown, not empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataEntry {
    pub data: Option<Vec<u8>>,
    pub stat: Option<Stat>,
    pub children: Option<Vec<String>>,
    pub acls: Option<Vec<Acl>>,
}

impl DataEntry {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.stat.is_none() && self.children.is_none() && self.acls.is_none()
    }

    /// Copy the parts selected by `kind` from `source`.
    fn assign(&mut self, kind: CachedKind, source: &DataEntry) {
        if kind.contains(CachedKind::NODE_ACLS) {
            self.acls = source.acls.clone();
        }
        if kind.contains(CachedKind::NODE_DATA) {
            self.data = source.data.clone();
        }
        if kind.contains(CachedKind::NODE_CHILDREN) {
            self.children = source.children.clone();
        }
        if kind.contains(CachedKind::NODE_STATS) {
            self.stat = source.stat;
        }
    }
}

type Bucket = Arc<Mutex<LruCache<String, DataEntry>>>;

pub struct PrefixedClientCache {
    max_capacity_per_prefix: AtomicUsize,
    prefixes: RwLock<HashMap<String, Bucket>>,
}

impl Default for PrefixedClientCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixedClientCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY_PER_PREFIX)
    }

    pub fn with_capacity(max_capacity_per_prefix: usize) -> Self {
        Self {
            max_capacity_per_prefix: AtomicUsize::new(max_capacity_per_prefix),
            prefixes: RwLock::new(HashMap::new()),
        }
    }

    /// Parent of `path`: everything before the last `/`, or `""` when there
    /// is no `/`.
    pub fn get_parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(idx) => &path[..idx],
            None => "",
        }
    }

    pub fn max_capacity_per_prefix(&self) -> usize {
        self.max_capacity_per_prefix.load(Ordering::Relaxed)
    }

    /// Resize every existing prefix and every prefix created later.
    pub fn set_max_capacity_per_prefix(&self, capacity: usize) {
        self.max_capacity_per_prefix.store(capacity, Ordering::Relaxed);
        let prefixes = self.prefixes.read().unwrap_or_else(PoisonError::into_inner);
        for (prefix, bucket) in prefixes.iter() {
            let evicted = lock(bucket).set_capacity(capacity);
            if !evicted.is_empty() {
                debug!(%prefix, evicted = evicted.len(), capacity, "Cache prefix shrunk");
            }
        }
    }

    /// Copy the parts of the cached entry selected by `kind`.
    ///
    /// Returns `None` when nothing is cached for the path.
    pub fn try_get_info(&self, prefix: &str, path: &str, kind: CachedKind) -> Option<DataEntry> {
        let bucket = self.bucket(prefix)?;
        let mut cache = lock(&bucket);
        let Some(entry) = cache.get(&path.to_owned()) else {
            trace!(prefix, path, ?kind, "Cache miss");
            return None;
        };

        let mut copy = DataEntry::default();
        copy.assign(kind, entry);
        trace!(prefix, path, ?kind, "Cache hit");
        Some(copy)
    }

    /// Store the parts of `info` selected by `kind`; `None` invalidates the path.
    ///
    /// An entry left with no known part is dropped.
    pub fn set_info(&self, prefix: &str, path: &str, kind: CachedKind, info: Option<&DataEntry>) {
        let Some(info) = info else {
            self.invalidate(prefix, path);
            return;
        };

        let bucket = self.bucket_or_create(prefix);
        let mut cache = lock(&bucket);
        let key = path.to_owned();

        match cache.get_mut(&key) {
            Some(entry) => {
                entry.assign(kind, info);
                if entry.is_empty() {
                    cache.remove(&key);
                }
            }
            None => {
                let mut entry = DataEntry::default();
                entry.assign(kind, info);
                if !entry.is_empty() {
                    let evicted = cache.insert(key, entry);
                    if !evicted.is_empty() {
                        trace!(prefix, evicted = evicted.len(), "Cache entries evicted");
                    }
                }
            }
        }
        trace!(prefix, path, ?kind, "Cache set");
    }

    /// Drop the cached entry for `path`. Returns whether one existed.
    pub fn invalidate(&self, prefix: &str, path: &str) -> bool {
        let Some(bucket) = self.bucket(prefix) else {
            return false;
        };
        let removed = lock(&bucket).remove(&path.to_owned()).is_some();
        if removed {
            trace!(prefix, path, "Cache invalidated");
        }
        removed
    }

    /// Forget everything cached under `prefix`.
    pub fn wipe(&self, prefix: &str) {
        let removed = self
            .prefixes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(prefix);
        if removed.is_some() {
            debug!(prefix, "Cache prefix wiped");
        }
    }

    /// Apply a watcher notification to the cache.
    ///
    /// Returns `true` when the watcher was removed and the caller has to
    /// install a new one; the prefix has been wiped in that case.
    pub fn notify_watcher_event(&self, event: &WatchedEvent, prefix: &str) -> bool {
        if event.event_type == WatchedEventType::WatcherRemoved {
            self.wipe(prefix);
            return true;
        }

        if event.keeper_state == KeeperState::SyncConnected {
            if matches!(
                event.event_type,
                WatchedEventType::NodeCreated | WatchedEventType::NodeDeleted
            ) {
                self.invalidate(prefix, Self::get_parent(&event.path));
            }
            self.invalidate(prefix, &event.path);
        }
        false
    }

    /// Number of entries cached under `prefix`.
    pub fn len(&self, prefix: &str) -> usize {
        let Some(bucket) = self.bucket(prefix) else {
            return 0;
        };
        let len = lock(&bucket).len();
        len
    }

    fn bucket(&self, prefix: &str) -> Option<Bucket> {
        self.prefixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(prefix)
            .cloned()
    }

    fn bucket_or_create(&self, prefix: &str) -> Bucket {
        if let Some(bucket) = self.bucket(prefix) {
            return bucket;
        }

        let mut prefixes = self.prefixes.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(prefixes.entry(prefix.to_owned()).or_insert_with(|| {
            debug!(prefix, "Cache prefix created");
            Arc::new(Mutex::new(LruCache::new(self.max_capacity_per_prefix())))
        }))
    }
}

fn lock(bucket: &Bucket) -> MutexGuard<'_, LruCache<String, DataEntry>> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn data(bytes: &[u8]) -> DataEntry {
        DataEntry {
            data: Some(bytes.to_vec()),
            ..DataEntry::default()
        }
    }

    #[test]
    fn test_get_parent() {
        assert_eq!(PrefixedClientCache::get_parent("/a/b/c"), "/a/b");
        assert_eq!(PrefixedClientCache::get_parent("/a"), "");
        assert_eq!(PrefixedClientCache::get_parent("a"), "");
        assert_eq!(PrefixedClientCache::get_parent(""), "");
    }

    #[test]
    fn test_kind_selects_parts() {
        let cache = PrefixedClientCache::new();
        let full = DataEntry {
            data: Some(vec![1]),
            stat: Some(Stat::default()),
            children: Some(vec!["x".into()]),
            acls: Some(Vec::new()),
        };
        cache.set_info("p", "/n", CachedKind::NODE_DATA | CachedKind::NODE_STATS, Some(&full));

        let got = cache.try_get_info("p", "/n", CachedKind::ALL).unwrap();
        assert_eq!(got.data, Some(vec![1]));
        assert!(got.stat.is_some());
        assert!(got.children.is_none());
        assert!(got.acls.is_none());

        let only_stat = cache.try_get_info("p", "/n", CachedKind::NODE_STATS).unwrap();
        assert!(only_stat.data.is_none());
    }

    #[test]
    fn test_entry_emptied_by_set_is_dropped() {
        let cache = PrefixedClientCache::new();
        cache.set_info("p", "/n", CachedKind::NODE_DATA, Some(&data(b"v")));
        cache.set_info("p", "/n", CachedKind::NODE_DATA, Some(&DataEntry::default()));
        assert!(cache.try_get_info("p", "/n", CachedKind::ALL).is_none());
        assert_eq!(cache.len("p"), 0);
    }

    #[test]
    fn test_set_none_invalidates() {
        let cache = PrefixedClientCache::new();
        cache.set_info("p", "/n", CachedKind::NODE_DATA, Some(&data(b"v")));
        cache.set_info("p", "/n", CachedKind::NODE_DATA, None);
        assert!(cache.try_get_info("p", "/n", CachedKind::NODE_DATA).is_none());
    }

    #[test]
    fn test_prefixes_are_independent() {
        let cache = PrefixedClientCache::new();
        cache.set_info("a", "/n", CachedKind::NODE_DATA, Some(&data(b"1")));
        cache.set_info("b", "/n", CachedKind::NODE_DATA, Some(&data(b"2")));
        cache.wipe("a");
        assert!(cache.try_get_info("a", "/n", CachedKind::NODE_DATA).is_none());
        assert_eq!(
            cache.try_get_info("b", "/n", CachedKind::NODE_DATA).unwrap().data,
            Some(b"2".to_vec())
        );
    }
}
