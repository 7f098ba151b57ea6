//! # Watchers
//!
//! Client-side routing of [`WatcherCall`]s to the callbacks that asked for
//! them. A watcher is registered once, receives an id to put in Exists,
//! GetData or GetChildren requests, and is dropped from the registry after its
//! first notification when it is a one-use watcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::types::{
    KeeperState, WatchedEvent, WatchedEventType, Watcher, WatcherCall, WatcherKind,
};

/// Callback notified of events on a watched path.
pub trait EventWatcher: Send + Sync {
    fn process(&self, event: &WatchedEvent);
}

impl<F> EventWatcher for F
where
    F: Fn(&WatchedEvent) + Send + Sync,
{
    fn process(&self, event: &WatchedEvent) {
        self(event)
    }
}

struct Registration {
    kind: WatcherKind,
    callback: Arc<dyn EventWatcher>,
}

/// Id-keyed table of live watchers. Ids start at 1; 0 means "no watcher".
pub struct WatcherRegistry {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, Registration>>,
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` and return the descriptor to send with requests.
    pub fn register(&self, kind: WatcherKind, callback: Arc<dyn EventWatcher>) -> Result<Watcher> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()?.insert(id, Registration { kind, callback });
        trace!(watcher_id = id, ?kind, "Watcher registered");
        Ok(Watcher::new(id, kind))
    }

    pub fn unregister(&self, id: u64) -> Result<bool> {
        Ok(self.lock()?.remove(&id).is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `call` to its watcher.
    ///
    /// Returns `false` when no watcher has that id. One-use watchers, and any
    /// watcher told it was removed, are unregistered before their callback
    /// runs, so the callback may re-register freely.
    pub fn deliver(&self, call: &WatcherCall) -> Result<bool> {
        let callback = {
            let mut watchers = self.lock()?;
            let Some(registration) = watchers.get(&call.watcher_id) else {
                debug!(watcher_id = call.watcher_id, "Notification for unknown watcher");
                return Ok(false);
            };

            let removed = call
                .event
                .as_ref()
                .is_some_and(|e| e.event_type == WatchedEventType::WatcherRemoved);
            let one_use = registration.kind.contains(WatcherKind::ONE_USE)
                || call.kind.contains(WatcherKind::ONE_USE);
            let callback = Arc::clone(&registration.callback);
            if one_use || removed {
                watchers.remove(&call.watcher_id);
            }
            callback
        };

        if let Some(event) = &call.event {
            callback.process(event);
        }
        Ok(true)
    }

    /// Unregister every watcher, telling each it was removed because the
    /// session is gone. Returns how many were dropped.
    pub fn drain(&self) -> Result<usize> {
        let drained: Vec<_> = self.lock()?.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Draining watchers");
        }
        let event = WatchedEvent::new(
            WatchedEventType::WatcherRemoved,
            KeeperState::Disconnected,
            "",
        );
        for (_, registration) in &drained {
            registration.callback.process(&event);
        }
        Ok(drained.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Registration>>> {
        self.watchers
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_WATCHERS_LOCK.to_string()))
    }
}
