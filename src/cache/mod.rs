//! # Client Cache
//!
//! Prefix-partitioned LRU cache of node information kept by RingMaster
//! clients and invalidated by watcher notifications.

pub mod lru;
pub mod prefixed;

pub use prefixed::{CachedKind, DataEntry, PrefixedClientCache};
