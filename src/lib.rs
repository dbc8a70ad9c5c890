//! # prioq-rs
//!
//! Priority work queue on an ordered-set store (Redis sorted sets), with
//! producer and consumer workers.
//!
//! Items are scored by priority; lower scores pop first. Workers run a
//! cooperative loop that stops on request, on SIGINT/SIGTERM, or on a
//! fatal error, and never on a transient store or callback failure.
//!
//! Delivery is at-most-once per item but not exactly-once: with the
//! default two-step pop, concurrent consumers can make one of them see an
//! empty queue while items remain. See [`queue`] for the details and
//! [`queue::PopMode::Atomic`] for the alternative.

pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use model::QueueItem;
pub use queue::{PopMode, PriorityQueue};
pub use worker::{Consumer, Producer, Schedule, Worker, WorkerConfig, WorkerState};
