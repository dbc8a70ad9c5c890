//! In-process ordered store.
//!
//! Same ordering rules as a Redis sorted set (score, then member bytes).
//! Every call yields to the scheduler first so cooperative tasks
//! interleave at store-call boundaries the way they would against a
//! remote server. Supports fault injection and tracks open connections,
//! which is what the worker tests lean on.

use super::{OrderedStore, StoreConnector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn range(&self, start: isize, stop: isize) -> Vec<String> {
        let len = self.ordered.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Vec::new();
        }
        self.ordered
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(_, member)| member.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sets: HashMap<String, SortedSet>,
    /// Calls left to fail before the store recovers.
    failures_remaining: usize,
    unavailable: bool,
}

/// Shared in-memory sorted collections. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail as if the connection dropped.
    pub fn fail_next(&self, n: usize) {
        self.lock().failures_remaining = n;
    }

    /// Fail every operation until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a set half-updated,
        // so a poisoned lock is still safe to use.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock after applying any injected fault.
    async fn checked(&self, op: &str) -> Result<MutexGuard<'_, Inner>> {
        tokio::task::yield_now().await;
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(Error::Unavailable(format!("memory store offline ({op})")));
        }
        if inner.failures_remaining > 0 {
            inner.failures_remaining -= 1;
            return Err(Error::Unavailable(format!("injected failure ({op})")));
        }
        Ok(inner)
    }
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn add(&self, collection: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.checked("add").await?;
        Ok(inner
            .sets
            .entry(collection.to_string())
            .or_default()
            .insert(member, score))
    }

    async fn range_by_rank(
        &self,
        collection: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        let inner = self.checked("range").await?;
        Ok(inner
            .sets
            .get(collection)
            .map(|set| set.range(start, stop))
            .unwrap_or_default())
    }

    async fn remove(&self, collection: &str, member: &str) -> Result<u64> {
        let mut inner = self.checked("remove").await?;
        let removed = match inner.sets.get_mut(collection) {
            Some(set) => set.remove(member),
            None => false,
        };
        // Redis drops a sorted set once its last member goes.
        if inner.sets.get(collection).is_some_and(|s| s.ordered.is_empty()) {
            inner.sets.remove(collection);
        }
        Ok(u64::from(removed))
    }

    async fn cardinality(&self, collection: &str) -> Result<u64> {
        let inner = self.checked("cardinality").await?;
        Ok(inner
            .sets
            .get(collection)
            .map_or(0, |set| set.ordered.len() as u64))
    }

    async fn pop_min(&self, collection: &str) -> Result<Option<String>> {
        let mut inner = self.checked("pop_min").await?;
        let Some(set) = inner.sets.get_mut(collection) else {
            return Ok(None);
        };
        let popped = set.ordered.pop_first().map(|(_, member)| {
            set.scores.remove(&member);
            member
        });
        if set.ordered.is_empty() {
            inner.sets.remove(collection);
        }
        Ok(popped)
    }
}

/// Hands out connections to one shared [`MemoryStore`] and counts how
/// many are still open.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    open: Arc<AtomicUsize>,
    opened_total: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Connections handed out and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Connections handed out over the connector's lifetime.
    pub fn total_connections(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    /// Make `connect` fail, as if the server were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn OrderedStore>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("connection refused".to_string()));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            store: self.store.clone(),
            open: Arc::clone(&self.open),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One connection from a [`MemoryConnector`]. Dropping it closes it.
struct MemoryConnection {
    store: MemoryStore,
    open: Arc<AtomicUsize>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderedStore for MemoryConnection {
    async fn add(&self, collection: &str, member: &str, score: i64) -> Result<bool> {
        self.store.add(collection, member, score).await
    }

    async fn range_by_rank(
        &self,
        collection: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        self.store.range_by_rank(collection, start, stop).await
    }

    async fn remove(&self, collection: &str, member: &str) -> Result<u64> {
        self.store.remove(collection, member).await
    }

    async fn cardinality(&self, collection: &str) -> Result<u64> {
        self.store.cardinality(collection).await
    }

    async fn pop_min(&self, collection: &str) -> Result<Option<String>> {
        self.store.pop_min(collection).await
    }
}
