//! Storage of client windows.
//!
//! The limiter never touches its records directly; it goes through a
//! [`WindowStore`] so the in-process tables here can be swapped for a shared
//! store when the serving layer runs as several processes.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::key::ClientKey;
use super::window::{Admission, ClientWindow};

/// Storage backend for client windows.
///
/// `update` is the admission critical section: implementations must run the
/// closure atomically with respect to other `update` and `sweep` calls for
/// the same key.
pub trait WindowStore: Send + Sync {
    /// Snapshot of the record for `key`.
    fn get(&self, key: &ClientKey) -> Option<ClientWindow>;

    /// Insert or replace the record for `key`.
    fn set(&self, key: ClientKey, window: ClientWindow);

    /// Remove the record for `key`, returning whether one existed.
    fn delete(&self, key: &ClientKey) -> bool;

    /// Atomically apply `f` to the record for `key`, inserting `init()` first
    /// when the key is unseen.
    fn update(
        &self,
        key: &ClientKey,
        init: &mut dyn FnMut() -> ClientWindow,
        f: &mut dyn FnMut(&mut ClientWindow) -> Admission,
    ) -> Admission;

    /// Remove every record for which `is_stale` returns true. Returns the
    /// number of removed records.
    fn sweep(&self, is_stale: &dyn Fn(&ClientWindow) -> bool) -> usize;

    /// Number of tracked records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all records.
    fn clear(&self);
}

/// Sharded in-memory store.
///
/// Updates hold the shard lock of their key only, so unrelated clients rarely
/// contend.
#[derive(Debug, Default)]
pub struct ShardedStore {
    windows: DashMap<ClientKey, ClientWindow>,
}

impl ShardedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowStore for ShardedStore {
    fn get(&self, key: &ClientKey) -> Option<ClientWindow> {
        self.windows.get(key).map(|w| w.value().clone())
    }

    fn set(&self, key: ClientKey, window: ClientWindow) {
        self.windows.insert(key, window);
    }

    fn delete(&self, key: &ClientKey) -> bool {
        self.windows.remove(key).is_some()
    }

    fn update(
        &self,
        key: &ClientKey,
        init: &mut dyn FnMut() -> ClientWindow,
        f: &mut dyn FnMut(&mut ClientWindow) -> Admission,
    ) -> Admission {
        // The entry guard holds the shard write lock until it is dropped.
        let mut entry = self.windows.entry(key.clone()).or_insert_with(init);
        f(entry.value_mut())
    }

    fn sweep(&self, is_stale: &dyn Fn(&ClientWindow) -> bool) -> usize {
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let stale = is_stale(&*window);
            removed += usize::from(stale);
            !stale
        });
        removed
    }

    fn len(&self) -> usize {
        self.windows.len()
    }

    fn clear(&self) {
        self.windows.clear();
    }
}

/// In-memory store behind a single lock.
#[derive(Debug, Default)]
pub struct LockedStore {
    windows: Mutex<HashMap<ClientKey, ClientWindow>>,
}

impl LockedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowStore for LockedStore {
    fn get(&self, key: &ClientKey) -> Option<ClientWindow> {
        self.windows.lock().get(key).cloned()
    }

    fn set(&self, key: ClientKey, window: ClientWindow) {
        self.windows.lock().insert(key, window);
    }

    fn delete(&self, key: &ClientKey) -> bool {
        self.windows.lock().remove(key).is_some()
    }

    fn update(
        &self,
        key: &ClientKey,
        init: &mut dyn FnMut() -> ClientWindow,
        f: &mut dyn FnMut(&mut ClientWindow) -> Admission,
    ) -> Admission {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.clone()).or_insert_with(init);
        f(window)
    }

    fn sweep(&self, is_stale: &dyn Fn(&ClientWindow) -> bool) -> usize {
        let mut removed = 0;
        self.windows.lock().retain(|_, window| {
            let stale = is_stale(&*window);
            removed += usize::from(stale);
            !stale
        });
        removed
    }

    fn len(&self) -> usize {
        self.windows.lock().len()
    }

    fn clear(&self) {
        self.windows.lock().clear();
    }
}
