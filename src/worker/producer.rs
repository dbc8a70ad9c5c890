//! Producer loop body: generate an item, push it, wait.

use super::{Tick, WorkerLoop, panic_message};
use crate::error::Error;
use crate::queue::PriorityQueue;
use async_trait::async_trait;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::{info, warn};

type Generator = Box<dyn FnMut() -> anyhow::Result<(serde_json::Value, i64)> + Send>;

/// Pushes one generated `(payload, priority)` per iteration.
pub struct Producer {
    generator: Generator,
    interval: Duration,
}

impl Producer {
    /// `generator` is called once per iteration. An error or a panic from
    /// it skips that iteration; the worker backs off and keeps going.
    pub fn new<F>(generator: F) -> Self
    where
        F: FnMut() -> anyhow::Result<(serde_json::Value, i64)> + Send + 'static,
    {
        Self {
            generator: Box::new(generator),
            interval: Duration::from_secs(1),
        }
    }

    /// Pause between pushes. Defaults to one second.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl WorkerLoop for Producer {
    fn kind(&self) -> &'static str {
        "producer"
    }

    async fn tick(&mut self, queue: &PriorityQueue, queue_name: &str) -> Tick {
        let generated = catch_unwind(AssertUnwindSafe(|| (self.generator)()));
        let (payload, priority) = match generated {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => return Tick::Retry(Error::Callback(e)),
            Err(panic) => {
                return Tick::Retry(Error::Callback(anyhow::anyhow!(
                    "generator panicked: {}",
                    panic_message(&*panic)
                )));
            }
        };

        match queue.push(queue_name, payload.clone(), priority).await {
            Ok(true) => info!(queue = queue_name, priority, %payload, "produced item"),
            Ok(false) => warn!(queue = queue_name, priority, "failed to produce item"),
            Err(e) => return Tick::from_error(e),
        }
        Tick::Continue(self.interval)
    }
}
