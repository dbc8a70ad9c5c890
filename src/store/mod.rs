//! Ordered-store adapters.
//!
//! A store is a remote sorted collection: members keyed by string, scored
//! by integer priority, ranged by rank. `PriorityQueue` only talks to
//! this trait, so the Redis adapter and the in-memory one are
//! interchangeable.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use self::memory::{MemoryConnector, MemoryStore};
pub use self::redis::{RedisConnector, RedisStore};

/// Sorted-set operations the queue protocol needs.
///
/// Ordering is by score, then lexicographically by member for equal
/// scores. Every call may fail with a connectivity or protocol error.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Add `member` with `score`. Returns true if the member was new.
    ///
    /// Redis keeps scores as doubles, so ordering is only exact for
    /// `|score| <= 2^53`; callers keep scores in that range.
    async fn add(&self, collection: &str, member: &str, score: i64) -> Result<bool>;

    /// Members ranked `start..=stop`. Negative indexes count from the end
    /// (`-1` is the last member).
    async fn range_by_rank(&self, collection: &str, start: isize, stop: isize)
    -> Result<Vec<String>>;

    /// Remove `member`. Returns how many members were removed (0 or 1).
    async fn remove(&self, collection: &str, member: &str) -> Result<u64>;

    /// Number of members in `collection`.
    async fn cardinality(&self, collection: &str) -> Result<u64>;

    /// Read and remove the lowest-ranked member as one atomic operation.
    async fn pop_min(&self, collection: &str) -> Result<Option<String>>;
}

/// Opens store connections.
///
/// Each worker calls `connect` once on start and drops the handle on
/// exit, so workers never share a connection.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn OrderedStore>>;

    /// Short description for logs. Must not contain credentials.
    fn describe(&self) -> String;
}
