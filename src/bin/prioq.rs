//! prioq CLI: run producers and consumers, inspect queues.

use prioq_rs::config::Config;
use prioq_rs::model::QueueItem;
use prioq_rs::queue::PriorityQueue;
use prioq_rs::store::RedisConnector;
use prioq_rs::telemetry::{TelemetryConfig, init_telemetry};
use prioq_rs::worker::{Consumer, Producer, Schedule, Worker};
use clap::{Parser, Subcommand};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "prioq", about = "Redis-backed priority work queue")]
struct Cli {
    /// Queue name (overrides QUEUE_NAME)
    #[arg(long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push generated mixed-priority demo tasks until interrupted
    Produce {
        /// Milliseconds between pushes (overrides PRODUCE_INTERVAL_MS)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Pop and process tasks until interrupted
    Consume {
        /// Milliseconds between polls of an empty queue (overrides POLL_INTERVAL_MS)
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        /// Simulated processing time per task
        #[arg(long, default_value_t = 2000)]
        work_ms: u64,
        /// Run the loop on a dedicated OS thread
        #[arg(long)]
        threaded: bool,
    },
    /// Push one JSON payload
    Push {
        /// JSON payload
        payload: String,
        /// Priority (lower = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Show the next item without removing it
    Peek,
    /// Show the number of queued items
    Len,
    /// List every queued item in pop order (non-destructive)
    Drain,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(queue) = cli.queue {
        config.queue_name = queue;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "prioq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let connector = Arc::new(RedisConnector::new(config.redis_url.clone()));

    match cli.command {
        Command::Produce { interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or(config.produce_interval);
            let producer = Producer::new(generate_mixed_priority_task).interval(interval);
            let mut worker = Worker::producer(
                connector,
                config.queue_name.clone(),
                producer,
                config.worker_config(),
            );
            println!("Producing to {} every {interval:?} (ctrl-c to stop)", config.queue_name);
            worker.run().await?;
        }
        Command::Consume {
            poll_interval_ms,
            work_ms,
            threaded,
        } => {
            let poll_interval = poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(config.poll_interval);
            let work = Duration::from_millis(work_ms);
            let consumer = Consumer::new(move |item| process_task(item, work))
                .poll_interval(poll_interval);
            let mut worker_config = config.worker_config();
            if threaded {
                worker_config.schedule = Schedule::Thread;
            }
            let mut worker =
                Worker::consumer(connector, config.queue_name.clone(), consumer, worker_config);
            println!("Consuming from {} (ctrl-c to stop)", config.queue_name);
            worker.run().await?;
        }
        Command::Push { payload, priority } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let queue = PriorityQueue::connect(connector.as_ref()).await?;
            if queue.push(&config.queue_name, payload, priority).await? {
                println!("Pushed to {} at priority {priority}", config.queue_name);
            } else {
                anyhow::bail!("push to {} failed", config.queue_name);
            }
        }
        Command::Peek => {
            let queue = PriorityQueue::connect(connector.as_ref()).await?;
            match queue.peek(&config.queue_name).await? {
                Some(item) => print_item(&item)?,
                None => println!("Queue {} is empty.", config.queue_name),
            }
        }
        Command::Len => {
            let queue = PriorityQueue::connect(connector.as_ref()).await?;
            println!("{}", queue.try_length(&config.queue_name).await?);
        }
        Command::Drain => {
            let queue = PriorityQueue::connect(connector.as_ref()).await?;
            let items = queue.drain_all(&config.queue_name).await?;
            if items.is_empty() {
                println!("Queue {} is empty.", config.queue_name);
                return Ok(());
            }
            println!("{:<8}  {:<4}  {:<19}  DATA", "ID", "PRI", "ENQUEUED");
            println!("{}", "-".repeat(80));
            for item in &items {
                println!(
                    "{:<8}  {:<4}  {:<19}  {}",
                    item.id,
                    item.priority,
                    item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    item.payload
                );
            }
            println!("\n{} item(s)", items.len());
        }
    }

    Ok(())
}

const TASK_TYPES: [&str; 4] = ["email", "notification", "report", "backup"];

/// Random demo task: priority 1 (high), 2 (medium) or 3 (low).
fn generate_mixed_priority_task() -> anyhow::Result<(serde_json::Value, i64)> {
    let mut rng = rand::thread_rng();
    let task_type = TASK_TYPES
        .choose(&mut rng)
        .ok_or_else(|| anyhow::anyhow!("no task types"))?;
    let priority: i64 = rng.gen_range(1..=3);
    let level = match priority {
        1 => "high",
        2 => "medium",
        _ => "low",
    };

    let data = serde_json::json!({
        "task_id": rng.gen_range(1000..10000),
        "task_type": task_type,
        "priority_level": level,
        "created_at": chrono::Local::now().format("%H:%M:%S").to_string(),
        "payload": format!("{level} priority {task_type} task"),
    });
    Ok((data, priority))
}

async fn process_task(item: QueueItem, work: Duration) -> anyhow::Result<()> {
    let task = &item.payload;
    println!(
        "[{}] task {} ({}, {}): {}",
        chrono::Local::now().format("%H:%M:%S"),
        task["task_id"],
        task["task_type"].as_str().unwrap_or("-"),
        task["priority_level"].as_str().unwrap_or("-"),
        task["payload"].as_str().unwrap_or("-"),
    );
    tokio::time::sleep(work).await;
    println!("  completed task {}", task["task_id"]);
    Ok(())
}

fn print_item(item: &QueueItem) -> anyhow::Result<()> {
    println!("ID:        {}", item.id.0);
    println!("Priority:  {}", item.priority);
    println!("Enqueued:  {}", item.enqueued_at);
    println!("Data:      {}", serde_json::to_string_pretty(&item.payload)?);
    Ok(())
}
