//! Consumer loop body: pop, process, repeat; poll when empty.

use super::{Tick, WorkerLoop, panic_message};
use crate::error::Error;
use crate::model::QueueItem;
use crate::queue::PriorityQueue;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, info};

type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Processor = Box<dyn FnMut(QueueItem) -> ProcessFuture + Send>;

/// Pops one item per iteration and hands it to a processor.
///
/// Processing finishes before the next pop, so a single consumer never
/// has more than one item in flight.
pub struct Consumer {
    processor: Processor,
    poll_interval: Duration,
}

impl Consumer {
    /// Process items with an async closure.
    ///
    /// Each processor future runs as its own task, so a panic in it is
    /// reported as a failed item and the loop keeps going.
    pub fn new<F, Fut>(mut processor: F) -> Self
    where
        F: FnMut(QueueItem) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_processor(Box::new(move |item| -> ProcessFuture {
            let task = tokio::spawn(processor(item));
            Box::pin(async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(join_failure(e)),
                }
            })
        }))
    }

    /// Process items with a synchronous closure on tokio's blocking pool,
    /// so slow processing does not stall other tasks on the runtime.
    pub fn blocking<F>(processor: F) -> Self
    where
        F: Fn(QueueItem) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let processor = Arc::new(processor);
        Self::from_processor(Box::new(move |item| -> ProcessFuture {
            let processor = Arc::clone(&processor);
            let task = tokio::task::spawn_blocking(move || processor(item));
            Box::pin(async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(join_failure(e)),
                }
            })
        }))
    }

    fn from_processor(processor: Processor) -> Self {
        Self {
            processor,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Pause before polling again after finding the queue empty.
    /// Defaults to one second.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl WorkerLoop for Consumer {
    fn kind(&self) -> &'static str {
        "consumer"
    }

    async fn tick(&mut self, queue: &PriorityQueue, queue_name: &str) -> Tick {
        let item = match queue.pop(queue_name).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(queue = queue_name, "queue empty");
                return Tick::Continue(self.poll_interval);
            }
            Err(e) => return Tick::from_error(e),
        };

        info!(queue = queue_name, id = %item.id, priority = item.priority, "processing item");
        let started = Instant::now();
        let result = (self.processor)(item).await;
        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("queue", queue_name.to_string())],
        );

        match result {
            Ok(()) => Tick::Continue(Duration::ZERO),
            Err(e) => Tick::Retry(Error::Callback(e)),
        }
    }
}

fn join_failure(e: JoinError) -> anyhow::Error {
    if e.is_panic() {
        anyhow::anyhow!("processor panicked: {}", panic_message(&*e.into_panic()))
    } else {
        anyhow::anyhow!("processor task cancelled")
    }
}
