//! Binding and subscription registries
//!
//! Process-local bookkeeping only. Locks are held for lookups and mutation,
//! never across file I/O: callers clone the `Arc` out and work on that.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use stated_core::Result;

use crate::queue::WatchToken;
use crate::store;

/// A claim to publish a name
#[derive(Debug)]
pub struct Binding {
    pub name: String,
    pub path: PathBuf,
    pub file: File,
}

/// Bindings by name
///
/// Binding a name twice keeps both entries; the most recent one is used for
/// publishing and is the first one released by `remove`.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: DashMap<String, Vec<Arc<Binding>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, binding: Binding) -> Arc<Binding> {
        let binding = Arc::new(binding);
        self.bindings
            .entry(binding.name.clone())
            .or_default()
            .push(Arc::clone(&binding));
        binding
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Binding>> {
        self.bindings
            .get(name)
            .and_then(|entries| entries.last().cloned())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Binding>> {
        let removed = self.bindings.get_mut(name)?.pop();
        self.bindings.remove_if(name, |_, entries| entries.is_empty());
        removed
    }

    /// Number of live bindings, duplicates included
    pub fn len(&self) -> usize {
        self.bindings.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&self) {
        self.bindings.clear();
    }
}

#[derive(Debug, Default)]
struct Cache {
    /// Read buffer, reused across reads
    buf: Vec<u8>,
    /// Payload of the last successful read
    value: Bytes,
}

/// A registration to observe a name
#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    pub path: PathBuf,
    pub file: File,
    pub token: WatchToken,
    cache: Mutex<Cache>,
}

impl Subscription {
    pub fn new(name: String, path: PathBuf, file: File, token: WatchToken) -> Self {
        Self {
            name,
            path,
            file,
            token,
            cache: Mutex::new(Cache::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the state file and return the new payload
    ///
    /// The cached value only changes when the read succeeds. The cache lock is
    /// held for the read itself, so concurrent refreshes of one subscription
    /// run one at a time and the cache always ends up with the latest read.
    pub fn refresh(&self, retry_limit: u32) -> Result<Bytes> {
        let mut cache = self.cache();
        let range = store::read_record(&self.file, &self.path, &mut cache.buf, retry_limit)?;
        cache.value = Bytes::copy_from_slice(&cache.buf[range]);
        Ok(cache.value.clone())
    }

    /// The payload seen by the last successful read
    pub fn cached(&self) -> Bytes {
        self.cache().value.clone()
    }

    /// Whether the watched file no longer has a directory entry
    pub fn is_unlinked(&self) -> bool {
        self.file
            .metadata()
            .map(|metadata| metadata.nlink() == 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct SubscriptionTable {
    by_token: HashMap<WatchToken, Arc<Subscription>>,
    by_name: HashMap<String, WatchToken>,
}

/// Subscriptions indexed by name and by watch token under one lock
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    table: Mutex<SubscriptionTable>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `subscription` unless its name or token is already taken
    ///
    /// Returns the subscription that blocked the insert.
    pub fn insert(&self, subscription: Arc<Subscription>) -> Option<Arc<Subscription>> {
        let mut table = self.table();
        if let Some(token) = table.by_name.get(&subscription.name) {
            return table.by_token.get(token).cloned();
        }
        if let Some(existing) = table.by_token.get(&subscription.token) {
            return Some(Arc::clone(existing));
        }

        table
            .by_name
            .insert(subscription.name.clone(), subscription.token);
        table.by_token.insert(subscription.token, subscription);
        None
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Subscription>> {
        let table = self.table();
        let token = table.by_name.get(name)?;
        table.by_token.get(token).cloned()
    }

    pub fn by_token(&self, token: WatchToken) -> Option<Arc<Subscription>> {
        self.table().by_token.get(&token).cloned()
    }

    pub fn remove_name(&self, name: &str) -> Option<Arc<Subscription>> {
        let mut table = self.table();
        let token = table.by_name.remove(name)?;
        table.by_token.remove(&token)
    }

    pub fn remove_token(&self, token: WatchToken) -> Option<Arc<Subscription>> {
        let mut table = self.table();
        let subscription = table.by_token.remove(&token)?;
        table.by_name.remove(&subscription.name);
        Some(subscription)
    }

    pub fn len(&self) -> usize {
        self.table().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every subscription
    pub fn drain(&self) -> Vec<Arc<Subscription>> {
        let mut table = self.table();
        table.by_name.clear();
        table.by_token.drain().map(|(_, subscription)| subscription).collect()
    }
}
