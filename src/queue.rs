//! Priority queue protocol over an ordered store.
//!
//! Each named queue is one sorted collection. Items are scored by
//! priority, so the lowest score is the most urgent and is popped first.
//! Items with equal priority come out in the store's member order
//! (lexicographic on the encoded item), which is not insertion order.
//!
//! Store failures never escape these methods: they are logged, counted
//! and turned into `false` / `None` / `0` / `[]`. That makes "empty" and
//! "unreachable" look the same, so callers should treat a neutral result
//! as "try again later". [`PriorityQueue::try_length`] is the one
//! probe that reports store errors. Serialization errors and invalid
//! queue names are returned as errors.
//!
//! # Concurrent consumers
//!
//! In [`PopMode::TwoStep`] a pop reads the lowest member and then removes
//! it by value. Two consumers can read the same member before either
//! removes it. Only the consumer whose remove actually deleted the member
//! receives the item; the other gets `None` even if the queue still
//! holds more items, and will only see them on its next poll. An item is
//! never delivered twice this way, but a losing consumer can idle while
//! work is waiting. [`PopMode::Atomic`] uses the store's atomic
//! read-and-remove and has no such window.

use crate::error::{Error, Result};
use crate::model::{QueueItem, validate_priority, validate_queue_name};
use crate::store::{OrderedStore, StoreConnector};
use crate::telemetry::metrics::record_queue_op;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How `pop` takes the head of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PopMode {
    /// Read the lowest member, then remove it by value. Two store calls.
    #[default]
    TwoStep,
    /// One atomic read-and-remove in the store.
    Atomic,
}

impl fmt::Display for PopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PopMode::TwoStep => "two_step",
            PopMode::Atomic => "atomic",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two_step" | "two-step" => Ok(PopMode::TwoStep),
            "atomic" => Ok(PopMode::Atomic),
            other => Err(Error::Config(format!(
                "unknown pop mode {other:?} (expected two_step or atomic)"
            ))),
        }
    }
}

/// Queue operations over one store connection.
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct PriorityQueue {
    store: Arc<dyn OrderedStore>,
    pop_mode: PopMode,
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("pop_mode", &self.pop_mode)
            .finish_non_exhaustive()
    }
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn OrderedStore>) -> Self {
        Self {
            store,
            pop_mode: PopMode::default(),
        }
    }

    /// Open a connection and wrap it.
    pub async fn connect(connector: &dyn StoreConnector) -> Result<Self> {
        Ok(Self::new(connector.connect().await?))
    }

    pub fn with_pop_mode(mut self, pop_mode: PopMode) -> Self {
        self.pop_mode = pop_mode;
        self
    }

    pub fn pop_mode(&self) -> PopMode {
        self.pop_mode
    }

    /// Release this handle's share of the connection.
    pub fn disconnect(self) {
        debug!("releasing store connection");
        drop(self.store);
    }

    /// Add `payload` at `priority`. Visible to pops as soon as this
    /// returns.
    ///
    /// Returns `Ok(false)` if the store call failed; the caller decides
    /// whether to retry. Priorities beyond ±2^53 are rejected with
    /// [`Error::InvalidPriority`], since a Redis score cannot hold them
    /// exactly.
    pub async fn push(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<bool> {
        validate_queue_name(queue_name)?;
        validate_priority(priority)?;
        let item = QueueItem::new(payload, priority);
        let member = item.to_member()?;

        match self.store.add(queue_name, &member, priority).await {
            Ok(added) => {
                debug!(queue = queue_name, id = %item.id, priority, "pushed");
                record_queue_op(queue_name, "push", if added { "ok" } else { "exists" });
                Ok(added)
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "push failed");
                record_queue_op(queue_name, "push", "error");
                Ok(false)
            }
        }
    }

    /// Remove and return the most urgent item, or `None` if the queue is
    /// empty, the store failed, or another consumer took the head first
    /// (see the module docs).
    pub async fn pop(&self, queue_name: &str) -> Result<Option<QueueItem>> {
        validate_queue_name(queue_name)?;
        let member = match self.pop_mode {
            PopMode::TwoStep => self.pop_two_step(queue_name).await,
            PopMode::Atomic => self.pop_atomic(queue_name).await,
        };
        let Some(member) = member else {
            return Ok(None);
        };

        // The member is already gone from the store; a decode failure
        // drops it.
        match QueueItem::from_member(&member) {
            Ok(item) => {
                record_queue_op(queue_name, "pop", "ok");
                Ok(Some(item))
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "discarding malformed member");
                record_queue_op(queue_name, "pop", "error");
                Err(e)
            }
        }
    }

    async fn pop_two_step(&self, queue_name: &str) -> Option<String> {
        let head = match self.store.range_by_rank(queue_name, 0, 0).await {
            Ok(mut members) if !members.is_empty() => members.swap_remove(0),
            Ok(_) => {
                record_queue_op(queue_name, "pop", "empty");
                return None;
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "pop read failed");
                record_queue_op(queue_name, "pop", "error");
                return None;
            }
        };

        match self.store.remove(queue_name, &head).await {
            Ok(0) => {
                debug!(queue = queue_name, "head taken by another consumer");
                record_queue_op(queue_name, "pop", "lost_race");
                None
            }
            Ok(_) => Some(head),
            Err(e) => {
                warn!(queue = queue_name, error = %e, "pop remove failed");
                record_queue_op(queue_name, "pop", "error");
                None
            }
        }
    }

    async fn pop_atomic(&self, queue_name: &str) -> Option<String> {
        match self.store.pop_min(queue_name).await {
            Ok(Some(member)) => Some(member),
            Ok(None) => {
                record_queue_op(queue_name, "pop", "empty");
                None
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "atomic pop failed");
                record_queue_op(queue_name, "pop", "error");
                None
            }
        }
    }

    /// The item `pop` would return next, without removing it.
    pub async fn peek(&self, queue_name: &str) -> Result<Option<QueueItem>> {
        validate_queue_name(queue_name)?;
        match self.store.range_by_rank(queue_name, 0, 0).await {
            Ok(members) => {
                record_queue_op(queue_name, "peek", "ok");
                members
                    .first()
                    .map(|m| QueueItem::from_member(m))
                    .transpose()
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "peek failed");
                record_queue_op(queue_name, "peek", "error");
                Ok(None)
            }
        }
    }

    /// Number of items in the queue; 0 if the store failed.
    pub async fn length(&self, queue_name: &str) -> Result<u64> {
        match self.try_length(queue_name).await {
            Ok(len) => Ok(len),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(queue = queue_name, error = %e, "length failed");
                Ok(0)
            }
        }
    }

    /// Number of items in the queue, with store errors reported.
    pub async fn try_length(&self, queue_name: &str) -> Result<u64> {
        validate_queue_name(queue_name)?;
        let result = self.store.cardinality(queue_name).await;
        record_queue_op(
            queue_name,
            "length",
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    /// Every item in pop order. Does not remove anything.
    pub async fn drain_all(&self, queue_name: &str) -> Result<Vec<QueueItem>> {
        validate_queue_name(queue_name)?;
        match self.store.range_by_rank(queue_name, 0, -1).await {
            Ok(members) => {
                record_queue_op(queue_name, "drain", "ok");
                members.iter().map(|m| QueueItem::from_member(m)).collect()
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "drain failed");
                record_queue_op(queue_name, "drain", "error");
                Ok(Vec::new())
            }
        }
    }
}
