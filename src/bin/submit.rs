//! 向任务队列投递一个任务
//!
//! 用法: autored-submit <tenant> <phase> <target> [options-json]

use anyhow::{bail, Context};
use autored::config::load_config;
use autored::observability;
use autored::queue::{connect_broker, TaskDescriptor};
use serde_json::{Map, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!("usage: autored-submit <tenant> <phase> <target> [options-json]");
    }
    let options: Map<String, Value> = match args.get(3) {
        Some(raw) => serde_json::from_str(raw).context("options must be a JSON object")?,
        None => Map::new(),
    };

    let cfg = load_config(None).context("Failed to load configuration")?;
    let broker = connect_broker(&cfg.queue)
        .await
        .context("Failed to connect to task queue")?;

    let task = TaskDescriptor::generate(&args[0], &args[1], &args[2], options);
    let key = task.storage_key();
    broker.submit(&key, &task).await.context("Failed to submit task")?;

    println!("{}", task.task_id);
    tracing::info!(task_id = %task.task_id, key = %key, "Task submitted");
    Ok(())
}
