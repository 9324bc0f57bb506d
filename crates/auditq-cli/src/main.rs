use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use auditq_core::{
    AuditProcessor, EventKind, HandlerError, ProcessorConfig, TaskConfig, TaskEvent, TaskHandler,
    TaskRecord,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "auditq")]
#[command(about = "Run a batch of demo moderation tasks through the audit processor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Processor config as JSON (camelCase keys, durations in ms)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `concurrency` from the config file
    #[arg(long)]
    concurrency: Option<usize>,

    /// Number of demo tasks to submit
    #[arg(short, long, default_value_t = 10)]
    tasks: usize,

    /// Fail this many handler calls before succeeding (exercises retries)
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Per-task max retries
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Per-task retry delay in milliseconds
    #[arg(long, default_value_t = 200)]
    retry_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct PostPayload {
    content: String,
}

/// Rejects posts containing a blocked word.
struct KeywordModerator {
    blocked: Vec<&'static str>,
    remaining_failures: AtomicU32,
}

impl KeywordModerator {
    fn new(fail_first: u32) -> Self {
        Self {
            blocked: vec!["spam", "scam"],
            remaining_failures: AtomicU32::new(fail_first),
        }
    }
}

#[async_trait]
impl TaskHandler for KeywordModerator {
    async fn handle(&self, record: &TaskRecord) -> Result<Value, HandlerError> {
        let post: PostPayload = serde_json::from_value(record.task.data.clone())?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "intentional failure (left={left})"
            )));
        }

        sleep(Duration::from_millis(20)).await;
        let content = post.content.to_lowercase();
        let hits: Vec<&str> = self
            .blocked
            .iter()
            .copied()
            .filter(|word| content.contains(word))
            .collect();
        let verdict = if hits.is_empty() { "approve" } else { "reject" };
        Ok(json!({ "verdict": verdict, "matched": hits }))
    }
}

fn demo_tasks(cli: &Cli) -> Vec<TaskConfig> {
    let samples = [
        "great photo, thanks for sharing",
        "cheap pills, total spam",
        "meeting notes for tomorrow",
        "this is not a scam, trust me",
    ];
    (0..cli.tasks)
        .map(|i| {
            let content = samples[i % samples.len()];
            TaskConfig::new(format!("post-{i}"), "post", json!({ "content": content }))
                .with_priority((i % 3) as i32)
                .with_max_retries(cli.max_retries)
                .with_retry_delay(Duration::from_millis(cli.retry_delay_ms))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProcessorConfig::from_json_file(path)?,
        None => ProcessorConfig::default(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }

    let processor = AuditProcessor::builder()
        .config(config)
        .register("post", KeywordModerator::new(cli.fail_first))?
        .build()?;

    processor.on(EventKind::TaskFailed, |event| {
        if let TaskEvent::TaskFailed { task, error } = event {
            error!(task_id = %task.task.task_id, %error, "moderation failed");
        }
    });

    // verdicts come in over the broadcast stream
    let mut rx = processor.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let TaskEvent::TaskCompleted(record) = event {
                let verdict = record
                    .result
                    .as_ref()
                    .and_then(|result| result.get("verdict"))
                    .cloned()
                    .unwrap_or(Value::Null);
                println!("{} -> {}", record.task.task_id, verdict);
            }
        }
    });

    for (i, result) in processor
        .add_tasks_detailed(demo_tasks(&cli))
        .await
        .into_iter()
        .enumerate()
    {
        if let Err(err) = result {
            warn!(index = i, %err, "task not admitted");
        }
    }
    info!(tasks = cli.tasks, "tasks submitted");

    // 完了をポーリングで待つ
    loop {
        let status = processor.get_queue_status().await?;
        if status.size == 0 {
            println!("{}", serde_json::to_string_pretty(&status)?);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    processor.shutdown().await;
    // closes the event stream so the printer drains and exits
    drop(processor);
    printer.await?;
    Ok(())
}
