//! Workers: long-running producer and consumer loops over one queue.
//!
//! A [`Worker`] owns the lifecycle (`Idle -> Running -> Stopping ->
//! Stopped`), a cancellation token, and a loop strategy ([`Producer`],
//! [`Consumer`], or any other [`WorkerLoop`]). The same loop runs either
//! as a tokio task on the caller's runtime or on a dedicated OS thread
//! with its own runtime, picked by [`Schedule`].
//!
//! Stopping is cooperative. The token is checked once per iteration; an
//! iteration in progress (including a slow processor) always finishes.
//! Pauses between iterations end early on cancellation.

pub mod consumer;
pub mod producer;
pub mod shutdown;

pub use consumer::Consumer;
pub use producer::Producer;

use crate::error::{Error, Result};
use crate::model::validate_queue_name;
use crate::queue::{PopMode, PriorityQueue};
use crate::store::StoreConnector;
use crate::telemetry::metrics;
use crate::telemetry::worker::{record_iterations, record_state_transition, start_worker_span};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Constructed, not started.
    Idle,
    /// Loop executing.
    Running,
    /// Stop requested; the current iteration is finishing.
    Stopping,
    /// Loop exited and connection released. Terminal.
    Stopped,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Idle, Stopped)       // stopped before ever starting
                | (Running, Stopping)
                | (Running, Stopped)    // connection failed on start
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Loop strategy
// ---------------------------------------------------------------------------

/// Outcome of one loop iteration.
#[derive(Debug)]
pub enum Tick {
    /// Iteration done; pause this long before the next one.
    Continue(Duration),
    /// Transient failure; back off by the worker's retry backoff.
    Retry(Error),
    /// Retrying cannot help; the worker stops.
    Fatal(Error),
}

impl Tick {
    /// `Fatal` for errors that retrying cannot fix, `Retry` otherwise.
    pub fn from_error(e: Error) -> Self {
        if e.is_fatal() {
            Tick::Fatal(e)
        } else {
            Tick::Retry(e)
        }
    }
}

/// The body of a worker's loop.
#[async_trait]
pub trait WorkerLoop: Send + 'static {
    /// Short label for logs and metrics ("producer", "consumer").
    fn kind(&self) -> &'static str;

    /// Run one iteration against `queue_name`.
    async fn tick(&mut self, queue: &PriorityQueue, queue_name: &str) -> Tick;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where a worker's loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    /// A tokio task on the runtime that calls `start`.
    #[default]
    Task,
    /// A dedicated OS thread driving its own single-threaded runtime.
    Thread,
}

/// Settings shared by every worker kind.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause after a failed iteration.
    pub retry_backoff: Duration,
    pub schedule: Schedule,
    pub pop_mode: PopMode,
    /// Stop on SIGINT / SIGTERM.
    pub handle_signals: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(1),
            schedule: Schedule::default(),
            pop_mode: PopMode::default(),
            handle_signals: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

type ShutdownTrigger = Pin<Box<dyn Future<Output = ()> + Send>>;

enum ExecutionHandle {
    Task(JoinHandle<Result<()>>),
    Thread(std::thread::JoinHandle<Result<()>>),
}

/// Shared view of the state, updated from inside the loop as well.
#[derive(Clone)]
struct Lifecycle {
    state: Arc<watch::Sender<WorkerState>>,
    span: Span,
}

impl Lifecycle {
    fn get(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn transition(&self, to: WorkerState) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            let from = *state;
            if from.can_transition_to(to) {
                *state = to;
                record_state_transition(&self.span, &from.to_string(), &to.to_string());
                true
            } else {
                outcome = Err(Error::InvalidTransition { from, to });
                false
            }
        });
        outcome
    }

    /// Transition if allowed; otherwise leave the state alone.
    fn advance(&self, to: WorkerState) {
        let _ = self.transition(to);
    }
}

/// Everything the loop needs once it is detached from the `Worker`.
struct LoopContext {
    kind: &'static str,
    queue_name: String,
    connector: Arc<dyn StoreConnector>,
    pop_mode: PopMode,
    retry_backoff: Duration,
    token: CancellationToken,
    lifecycle: Lifecycle,
}

/// A producer or consumer bound to one queue.
pub struct Worker {
    kind: &'static str,
    queue_name: String,
    connector: Arc<dyn StoreConnector>,
    config: WorkerConfig,
    strategy: Option<Box<dyn WorkerLoop>>,
    token: CancellationToken,
    lifecycle: Lifecycle,
    shutdown_trigger: Option<ShutdownTrigger>,
    handle: Option<ExecutionHandle>,
    watchers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("kind", &self.kind)
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build a worker around any loop strategy.
    ///
    /// Every worker opens its own store connection through `connector`
    /// when started; many workers may share one connector and queue name.
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        queue_name: impl Into<String>,
        strategy: impl WorkerLoop,
        config: WorkerConfig,
    ) -> Self {
        let queue_name = queue_name.into();
        let kind = strategy.kind();
        let span = start_worker_span(kind, &queue_name);
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            kind,
            queue_name,
            connector,
            config,
            strategy: Some(Box::new(strategy)),
            token: CancellationToken::new(),
            lifecycle: Lifecycle {
                state: Arc::new(state),
                span,
            },
            shutdown_trigger: None,
            handle: None,
            watchers: Vec::new(),
        }
    }

    pub fn producer(
        connector: Arc<dyn StoreConnector>,
        queue_name: impl Into<String>,
        producer: Producer,
        config: WorkerConfig,
    ) -> Self {
        Self::new(connector, queue_name, producer, config)
    }

    pub fn consumer(
        connector: Arc<dyn StoreConnector>,
        queue_name: impl Into<String>,
        consumer: Consumer,
        config: WorkerConfig,
    ) -> Self {
        Self::new(connector, queue_name, consumer, config)
    }

    /// Also stop when `parent` is cancelled. Cancelling this worker does
    /// not cancel `parent`, so one token can stop a whole group.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.token = parent.child_token();
        self
    }

    /// Stop when `trigger` resolves, instead of on process signals.
    pub fn with_shutdown_trigger<F>(mut self, trigger: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_trigger = Some(Box::pin(trigger));
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.lifecycle.state.subscribe()
    }

    /// The token this worker's loop observes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Connect and start the loop.
    ///
    /// Returns once the store connection is open and the loop is
    /// running, or with the connection error (the worker is then
    /// `Stopped`). A worker can be started once.
    pub async fn start(&mut self) -> Result<()> {
        validate_queue_name(&self.queue_name)?;
        self.lifecycle.transition(WorkerState::Running)?;
        let strategy = self
            .strategy
            .take()
            .ok_or_else(|| Error::Worker("worker loop already consumed".to_string()))?;

        if let Some(trigger) = self.shutdown_trigger.take() {
            self.watchers.push(shutdown::watch(self.token.clone(), trigger));
        } else if self.config.handle_signals {
            self.watchers
                .push(shutdown::watch(self.token.clone(), shutdown::termination_signal()));
        }

        // A stop request from any source shows up as Stopping right away,
        // not only when the loop next looks at the token.
        let token = self.token.clone();
        let lifecycle = self.lifecycle.clone();
        self.watchers.push(tokio::spawn(async move {
            token.cancelled().await;
            lifecycle.advance(WorkerState::Stopping);
        }));

        let ctx = LoopContext {
            kind: self.kind,
            queue_name: self.queue_name.clone(),
            connector: Arc::clone(&self.connector),
            pop_mode: self.config.pop_mode,
            retry_backoff: self.config.retry_backoff,
            token: self.token.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();

        info!(
            worker = self.kind,
            queue = %self.queue_name,
            store = %self.connector.describe(),
            schedule = ?self.config.schedule,
            "starting worker"
        );

        let handle = match self.config.schedule {
            Schedule::Task => {
                let span = self.lifecycle.span.clone();
                Ok(ExecutionHandle::Task(tokio::spawn(
                    connect_and_run(strategy, ctx, ready_tx).instrument(span),
                )))
            }
            Schedule::Thread => spawn_thread(strategy, ctx, ready_tx).map(ExecutionHandle::Thread),
        };
        match handle {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                self.lifecycle.advance(WorkerState::Stopped);
                self.release_watchers();
                return Err(e);
            }
        }

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(worker = self.kind, queue = %self.queue_name, error = %e, "worker failed to connect");
                self.join().await?;
                Err(e)
            }
            // The execution unit died before reporting; its join result
            // says why.
            Err(_) => {
                self.join().await?;
                Err(Error::Worker("worker exited before connecting".to_string()))
            }
        }
    }

    /// Request a stop and wait for the loop to exit.
    ///
    /// Returns the error that ended the loop early, if any.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            WorkerState::Idle => return self.lifecycle.transition(WorkerState::Stopped),
            WorkerState::Running => self.lifecycle.advance(WorkerState::Stopping),
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
        self.token.cancel();
        self.join().await
    }

    /// Wait for the loop to exit without requesting a stop, e.g. until a
    /// shutdown signal arrives.
    pub async fn wait(&mut self) -> Result<()> {
        self.join().await
    }

    /// Start, then wait until stopped by a signal, the token or a fatal
    /// error.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let result = match handle {
            ExecutionHandle::Task(task) => task
                .await
                .map_err(|e| Error::Worker(format!("worker task failed: {e}")))
                .and_then(|r| r),
            ExecutionHandle::Thread(thread) => tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| Error::Worker(format!("failed to join worker thread: {e}")))
                .and_then(|joined| {
                    joined.map_err(|_| Error::Worker("worker thread panicked".to_string()))
                })
                .and_then(|r| r),
        };

        // Normally already Stopped; this covers a panicked loop.
        self.lifecycle.advance(WorkerState::Stopping);
        self.lifecycle.advance(WorkerState::Stopped);
        self.release_watchers();
        result
    }

    fn release_watchers(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(worker = self.kind, queue = %self.queue_name, "worker dropped while running, cancelling");
            self.token.cancel();
        }
        self.release_watchers();
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn spawn_thread(
    strategy: Box<dyn WorkerLoop>,
    ctx: LoopContext,
    ready: oneshot::Sender<Result<()>>,
) -> Result<std::thread::JoinHandle<Result<()>>> {
    let span = ctx.lifecycle.span.clone();
    let handle = std::thread::Builder::new()
        .name(format!("prioq-{}", ctx.kind))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready.send(Err(Error::Io(e)));
                    return Ok(());
                }
            };
            runtime.block_on(connect_and_run(strategy, ctx, ready).instrument(span))
        })?;
    Ok(handle)
}

/// Open the connection, report readiness, run the loop, release.
///
/// Connection failures go to `ready`, not the return value, so the
/// `start` caller sees them.
async fn connect_and_run(
    mut strategy: Box<dyn WorkerLoop>,
    ctx: LoopContext,
    ready: oneshot::Sender<Result<()>>,
) -> Result<()> {
    let queue = match PriorityQueue::connect(ctx.connector.as_ref()).await {
        Ok(queue) => queue.with_pop_mode(ctx.pop_mode),
        Err(e) => {
            ctx.lifecycle.advance(WorkerState::Stopped);
            let _ = ready.send(Err(e));
            return Ok(());
        }
    };
    let _ = ready.send(Ok(()));
    info!(worker = ctx.kind, queue = %ctx.queue_name, "worker running");

    let mut exit = LoopExit {
        ctx: &ctx,
        finished: false,
    };
    // Bound after the guard so an unwind releases the connection first.
    let queue = queue;
    let result = drive(&mut strategy, &queue, &ctx).await;
    queue.disconnect();
    exit.finished = true;
    drop(exit);
    result
}

/// Settles the lifecycle when the loop ends, whether it returned or its
/// future was dropped mid-iteration (a panic unwinding through it).
struct LoopExit<'a> {
    ctx: &'a LoopContext,
    finished: bool,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        let ctx = self.ctx;
        ctx.lifecycle.advance(WorkerState::Stopping);
        ctx.lifecycle.advance(WorkerState::Stopped);
        // Releases the state watcher when the loop ended on its own.
        ctx.token.cancel();
        if self.finished {
            info!(worker = ctx.kind, queue = %ctx.queue_name, "worker stopped");
        } else {
            error!(worker = ctx.kind, queue = %ctx.queue_name, "worker loop aborted");
        }
    }
}

async fn drive(
    strategy: &mut Box<dyn WorkerLoop>,
    queue: &PriorityQueue,
    ctx: &LoopContext,
) -> Result<()> {
    let mut iterations: u64 = 0;

    let result = loop {
        if ctx.token.is_cancelled() {
            break Ok(());
        }
        iterations += 1;

        let (pause, outcome) = match strategy.tick(queue, &ctx.queue_name).await {
            Tick::Continue(pause) => (pause, "continue"),
            Tick::Retry(e) => {
                warn!(
                    worker = ctx.kind,
                    queue = %ctx.queue_name,
                    error = %e,
                    backoff_ms = ctx.retry_backoff.as_millis() as u64,
                    "iteration failed, backing off"
                );
                (ctx.retry_backoff, "retry")
            }
            Tick::Fatal(e) => {
                error!(worker = ctx.kind, queue = %ctx.queue_name, error = %e, "fatal worker error");
                record_iteration(ctx.kind, "fatal");
                break Err(e);
            }
        };
        record_iteration(ctx.kind, outcome);

        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = ctx.token.cancelled() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    };

    record_iterations(&ctx.lifecycle.span, iterations);
    result
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn record_iteration(kind: &'static str, outcome: &'static str) {
    metrics::worker_iterations().add(
        1,
        &[
            KeyValue::new("worker", kind),
            KeyValue::new("outcome", outcome),
        ],
    );
}
