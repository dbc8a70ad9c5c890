//! Worker lifecycle, loop policies and shutdown, on the in-memory store.

use async_trait::async_trait;
use prioq_rs::error::Error;
use prioq_rs::model::QueueItem;
use prioq_rs::queue::{PopMode, PriorityQueue};
use prioq_rs::store::{MemoryConnector, MemoryStore, OrderedStore};
use prioq_rs::worker::{Consumer, Producer, Schedule, Tick, Worker, WorkerConfig, WorkerLoop, WorkerState};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "task_queue";
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(2);

fn test_config(schedule: Schedule) -> WorkerConfig {
    WorkerConfig {
        retry_backoff: Duration::from_millis(10),
        schedule,
        pop_mode: PopMode::TwoStep,
        handle_signals: false,
    }
}

fn test_connector() -> Arc<MemoryConnector> {
    Arc::new(MemoryConnector::new(MemoryStore::new()))
}

async fn seed(store: &MemoryStore, items: &[(serde_json::Value, i64)]) {
    let queue = PriorityQueue::new(Arc::new(store.clone()));
    for (payload, priority) in items {
        assert!(queue.push(QUEUE, payload.clone(), *priority).await.unwrap());
    }
}

/// Poll `condition` until it holds or the budget runs out.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Consumer that records every delivered payload.
fn recording_consumer(seen: Arc<Mutex<Vec<serde_json::Value>>>) -> Consumer {
    Consumer::new(move |item: QueueItem| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(item.payload);
            Ok::<_, anyhow::Error>(())
        }
    })
    .poll_interval(Duration::from_millis(10))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_then_stop_walks_the_lifecycle() {
    let connector = test_connector();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(seen),
        test_config(Schedule::Task),
    );
    let mut states = worker.subscribe();

    assert_eq!(worker.state(), WorkerState::Idle);
    worker.start().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(connector.open_connections(), 1);

    timeout(SHUTDOWN_BUDGET, worker.stop())
        .await
        .expect("stop within budget")
        .unwrap();

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);
}

#[tokio::test]
async fn threaded_worker_stops_and_releases_its_connection() {
    let connector = test_connector();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(seen),
        test_config(Schedule::Thread),
    );

    worker.start().await.unwrap();
    assert!(worker.is_running());
    assert_eq!(connector.open_connections(), 1);

    timeout(SHUTDOWN_BUDGET, worker.stop())
        .await
        .expect("stop within budget")
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let mut worker = Worker::consumer(
        test_connector(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    );
    worker.start().await.unwrap();

    let err = worker.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: WorkerState::Running,
            to: WorkerState::Running
        }
    ));

    worker.stop().await.unwrap();
    assert!(worker.start().await.is_err());
}

#[tokio::test]
async fn stopping_an_idle_worker_is_terminal() {
    let mut worker = Worker::consumer(
        test_connector(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    );
    worker.stop().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(worker.start().await.is_err());
}

#[tokio::test]
async fn connection_failure_surfaces_from_start() {
    let connector = test_connector();
    connector.refuse_connections(true);
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    );

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn threaded_connection_failure_surfaces_from_start() {
    let connector = test_connector();
    connector.refuse_connections(true);
    let mut worker = Worker::consumer(
        connector,
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Thread),
    );

    assert!(worker.start().await.is_err());
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn invalid_queue_name_fails_start() {
    let mut worker = Worker::consumer(
        test_connector(),
        "no spaces allowed",
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    );
    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidQueueName(_)));
    assert_eq!(worker.state(), WorkerState::Idle);
}

// ---------------------------------------------------------------------------
// Shutdown triggers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn injected_shutdown_trigger_stops_the_worker() {
    let connector = test_connector();
    let (signal_tx, signal_rx) = oneshot::channel::<()>();
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    )
    .with_shutdown_trigger(async move {
        let _ = signal_rx.await;
    });

    worker.start().await.unwrap();
    signal_tx.send(()).unwrap();

    timeout(SHUTDOWN_BUDGET, worker.wait())
        .await
        .expect("worker should exit after the trigger")
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn parent_token_stops_a_group_of_workers() {
    let connector = test_connector();
    let group = CancellationToken::new();
    let mut workers: Vec<_> = (0..3)
        .map(|_| {
            Worker::consumer(
                connector.clone(),
                QUEUE,
                recording_consumer(Arc::new(Mutex::new(Vec::new()))),
                test_config(Schedule::Task),
            )
            .with_cancellation(&group)
        })
        .collect();

    for worker in &mut workers {
        worker.start().await.unwrap();
    }
    assert_eq!(connector.open_connections(), 3);

    group.cancel();
    for worker in &mut workers {
        timeout(SHUTDOWN_BUDGET, worker.wait())
            .await
            .expect("worker should exit")
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
    assert_eq!(connector.open_connections(), 0);
    assert_eq!(connector.total_connections(), 3);
}

#[tokio::test]
async fn stopping_one_worker_leaves_the_group_token_alone() {
    let group = CancellationToken::new();
    let mut worker = Worker::consumer(
        test_connector(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    )
    .with_cancellation(&group);

    worker.start().await.unwrap();
    worker.stop().await.unwrap();
    assert!(!group.is_cancelled());
}

#[tokio::test]
async fn cancelling_the_worker_token_stops_it() {
    let connector = test_connector();
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::new(Mutex::new(Vec::new()))),
        test_config(Schedule::Task),
    );

    worker.start().await.unwrap();
    worker.cancellation_token().cancel();
    timeout(SHUTDOWN_BUDGET, worker.wait())
        .await
        .expect("worker should exit")
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn stop_lets_the_in_flight_item_finish() {
    let connector = test_connector();
    seed(connector.store(), &[(json!("slow"), 1)]).await;

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let consumer = {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        Consumer::new(move |_item| {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
        .poll_interval(Duration::from_millis(10))
    };
    let mut worker = Worker::consumer(connector.clone(), QUEUE, consumer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("processing to start", || started.load(Ordering::SeqCst)).await;

    timeout(SHUTDOWN_BUDGET, worker.stop())
        .await
        .expect("stop within budget")
        .unwrap();
    assert!(finished.load(Ordering::SeqCst), "in-flight item was cut short");
    assert_eq!(connector.store().cardinality(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn stop_does_not_wait_out_a_long_interval() {
    let connector = test_connector();
    let producer = Producer::new(|| Ok((json!("tick"), 0))).interval(Duration::from_secs(60));
    let mut worker = Worker::producer(connector, QUEUE, producer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    timeout(Duration::from_millis(500), worker.stop())
        .await
        .expect("sleeping worker should stop promptly")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Consumer policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consumer_processes_in_priority_order() {
    let connector = test_connector();
    seed(
        connector.store(),
        &[
            (json!({"task_id": 1}), 1),
            (json!({"task_id": 2}), 3),
            (json!({"task_id": 3}), 2),
        ],
    )
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::clone(&seen)),
        test_config(Schedule::Task),
    );
    worker.start().await.unwrap();
    wait_until("three items", || seen.lock().unwrap().len() == 3).await;
    worker.stop().await.unwrap();

    let ids: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|p| p["task_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, [1, 3, 2]);
}

#[tokio::test]
async fn consumer_idles_on_an_empty_queue() {
    let connector = test_connector();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::clone(&seen)),
        test_config(Schedule::Task),
    );

    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(worker.is_running());
    assert!(seen.lock().unwrap().is_empty());

    // Items pushed later are picked up on the next poll.
    seed(connector.store(), &[(json!("late"), 0)]).await;
    wait_until("late item", || seen.lock().unwrap().len() == 1).await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn consumer_survives_store_outages() {
    let connector = test_connector();
    seed(connector.store(), &[(json!("after outage"), 0)]).await;
    connector.store().fail_next(5);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::clone(&seen)),
        test_config(Schedule::Task),
    );
    worker.start().await.unwrap();
    wait_until("item after outage", || seen.lock().unwrap().len() == 1).await;
    assert!(worker.is_running());
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn processor_errors_are_not_fatal() {
    let connector = test_connector();
    seed(connector.store(), &[(json!("bad"), 0), (json!("good"), 1)]).await;

    let handled = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let handled = Arc::clone(&handled);
        Consumer::new(move |item: QueueItem| {
            let handled = Arc::clone(&handled);
            async move {
                if item.payload == json!("bad") {
                    anyhow::bail!("cannot handle {}", item.payload);
                }
                handled.lock().unwrap().push(item.payload);
                Ok::<_, anyhow::Error>(())
            }
        })
        .poll_interval(Duration::from_millis(10))
    };
    let mut worker = Worker::consumer(connector, QUEUE, consumer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("good item", || handled.lock().unwrap().len() == 1).await;
    assert!(worker.is_running());
    worker.stop().await.unwrap();
    assert_eq!(handled.lock().unwrap()[0], json!("good"));
}

#[tokio::test]
async fn panicking_processor_does_not_stop_the_consumer() {
    let connector = test_connector();
    seed(connector.store(), &[(json!("boom"), 0), (json!("fine"), 1)]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let seen = Arc::clone(&seen);
        Consumer::new(move |item: QueueItem| {
            let seen = Arc::clone(&seen);
            async move {
                if item.payload == json!("boom") {
                    panic!("processor bug");
                }
                seen.lock().unwrap().push(item.payload);
                Ok::<_, anyhow::Error>(())
            }
        })
        .poll_interval(Duration::from_millis(10))
    };
    let mut worker = Worker::consumer(connector, QUEUE, consumer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("item after the panic", || seen.lock().unwrap().len() == 1).await;
    assert!(worker.is_running());
    worker.stop().await.unwrap();
    assert_eq!(seen.lock().unwrap()[0], json!("fine"));
}

#[tokio::test]
async fn panicking_blocking_processor_does_not_stop_the_consumer() {
    let connector = test_connector();
    seed(connector.store(), &[(json!("boom"), 0), (json!("fine"), 1)]).await;

    let count = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let count = Arc::clone(&count);
        Consumer::blocking(move |item| {
            if item.payload == json!("boom") {
                panic!("processor bug");
            }
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .poll_interval(Duration::from_millis(10))
    };
    let mut worker = Worker::consumer(connector, QUEUE, consumer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("item after the panic", || count.load(Ordering::SeqCst) == 1).await;
    assert!(worker.is_running());
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn blocking_processor_runs_to_completion() {
    let connector = test_connector();
    seed(connector.store(), &[(json!(1), 0), (json!(2), 0)]).await;

    let count = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let count = Arc::clone(&count);
        Consumer::blocking(move |_item| {
            std::thread::sleep(Duration::from_millis(20));
            count.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .poll_interval(Duration::from_millis(10))
    };
    let mut worker = Worker::consumer(connector, QUEUE, consumer, test_config(Schedule::Thread));

    worker.start().await.unwrap();
    wait_until("both items", || count.load(Ordering::SeqCst) == 2).await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_consumers_never_deliver_an_item_twice() {
    let connector = test_connector();
    let items: Vec<_> = (0..30).map(|i| (json!({"n": i}), i % 3)).collect();
    seed(connector.store(), &items).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut workers: Vec<_> = (0..3)
        .map(|i| {
            let schedule = if i == 0 { Schedule::Thread } else { Schedule::Task };
            Worker::consumer(
                connector.clone(),
                QUEUE,
                recording_consumer(Arc::clone(&seen)),
                test_config(schedule),
            )
        })
        .collect();
    for worker in &mut workers {
        worker.start().await.unwrap();
    }

    wait_until("all items", || seen.lock().unwrap().len() >= 30).await;
    for worker in &mut workers {
        worker.stop().await.unwrap();
    }

    let seen = seen.lock().unwrap();
    let distinct: HashSet<_> = seen.iter().map(|p| p["n"].as_i64().unwrap()).collect();
    assert_eq!(seen.len(), 30, "an item was delivered more than once");
    assert_eq!(distinct.len(), 30);
}

// ---------------------------------------------------------------------------
// Producer policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn producer_pushes_generated_items() {
    let connector = test_connector();
    let counter = Arc::new(AtomicUsize::new(0));
    let producer = {
        let counter = Arc::clone(&counter);
        Producer::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok((json!({"n": n}), (n % 3) as i64))
        })
        .interval(Duration::from_millis(5))
    };
    let mut worker = Worker::producer(connector.clone(), QUEUE, producer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("three pushes", || counter.load(Ordering::SeqCst) >= 3).await;
    worker.stop().await.unwrap();

    let queue = PriorityQueue::new(Arc::new(connector.store().clone()));
    let items = queue.drain_all(QUEUE).await.unwrap();
    assert!(items.len() >= 3);
    assert!(items.windows(2).all(|w| w[0].priority <= w[1].priority));
}

#[tokio::test]
async fn generator_errors_are_not_fatal() {
    let connector = test_connector();
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let calls = Arc::clone(&calls);
        Producer::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("generator hiccup");
            }
            Ok((json!("ok"), 0))
        })
        .interval(Duration::from_millis(5))
    };
    let mut worker = Worker::producer(connector.clone(), QUEUE, producer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    let store = connector.store().clone();
    wait_until("a successful push", || calls.load(Ordering::SeqCst) >= 3).await;
    worker.stop().await.unwrap();
    assert!(store.cardinality(QUEUE).await.unwrap() >= 1);
}

#[tokio::test]
async fn panicking_generator_does_not_stop_the_producer() {
    let connector = test_connector();
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let calls = Arc::clone(&calls);
        Producer::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("generator bug");
            }
            Ok((json!("ok"), 0))
        })
        .interval(Duration::from_millis(5))
    };
    let mut worker = Worker::producer(connector.clone(), QUEUE, producer, test_config(Schedule::Task));

    worker.start().await.unwrap();
    wait_until("pushes after the panic", || calls.load(Ordering::SeqCst) >= 3).await;
    assert!(worker.is_running());
    worker.stop().await.unwrap();
    assert!(connector.store().cardinality(QUEUE).await.unwrap() >= 1);
}

#[tokio::test]
async fn producer_and_consumer_on_separate_threads() {
    let connector = test_connector();
    let counter = Arc::new(AtomicUsize::new(0));
    let producer = {
        let counter = Arc::clone(&counter);
        Producer::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok((json!({"n": n}), 1))
        })
        .interval(Duration::from_millis(5))
    };
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut producer =
        Worker::producer(connector.clone(), QUEUE, producer, test_config(Schedule::Thread));
    let mut consumer = Worker::consumer(
        connector.clone(),
        QUEUE,
        recording_consumer(Arc::clone(&seen)),
        test_config(Schedule::Thread),
    );

    producer.start().await.unwrap();
    consumer.start().await.unwrap();
    wait_until("five consumed", || seen.lock().unwrap().len() >= 5).await;

    producer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    assert_eq!(connector.open_connections(), 0);

    let produced = counter.load(Ordering::SeqCst);
    let remaining = connector.store().cardinality(QUEUE).await.unwrap() as usize;
    assert_eq!(seen.lock().unwrap().len() + remaining, produced);
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

struct Misconfigured;

#[async_trait]
impl WorkerLoop for Misconfigured {
    fn kind(&self) -> &'static str {
        "misconfigured"
    }

    async fn tick(&mut self, _queue: &PriorityQueue, _queue_name: &str) -> Tick {
        Tick::from_error(Error::Config("missing processor settings".to_string()))
    }
}

#[tokio::test]
async fn fatal_tick_stops_the_worker() {
    let connector = test_connector();
    let mut worker = Worker::new(connector.clone(), QUEUE, Misconfigured, test_config(Schedule::Task));

    worker.start().await.unwrap();
    let err = timeout(SHUTDOWN_BUDGET, worker.wait())
        .await
        .expect("worker should stop itself")
        .unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(connector.open_connections(), 0);
}

struct Crashing;

#[async_trait]
impl WorkerLoop for Crashing {
    fn kind(&self) -> &'static str {
        "crashing"
    }

    async fn tick(&mut self, _queue: &PriorityQueue, _queue_name: &str) -> Tick {
        panic!("loop bug");
    }
}

async fn assert_crash_settles_state(schedule: Schedule) {
    let connector = test_connector();
    let mut worker = Worker::new(connector.clone(), QUEUE, Crashing, test_config(schedule));

    worker.start().await.unwrap();
    wait_until("loop exit", || worker.state() == WorkerState::Stopped).await;
    assert!(!worker.is_running());
    wait_until("connection release", || connector.open_connections() == 0).await;

    let err = timeout(SHUTDOWN_BUDGET, worker.wait())
        .await
        .expect("join within budget")
        .unwrap_err();
    assert!(matches!(err, Error::Worker(_)));
}

#[tokio::test]
async fn crashed_task_loop_reports_stopped_without_a_join() {
    assert_crash_settles_state(Schedule::Task).await;
}

#[tokio::test]
async fn crashed_thread_loop_reports_stopped_without_a_join() {
    assert_crash_settles_state(Schedule::Thread).await;
}
