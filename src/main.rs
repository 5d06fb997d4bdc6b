use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sl_background::{BackgroundResponse, BackgroundService, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "statuslens")]
#[command(about = "Scores status update quality over a line-delimited JSON channel", long_about = None)]
struct Cli {
    /// Durable store file; omit to keep everything in memory
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Maximum simultaneous analyses
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Per-analysis timeout in seconds, 0 disables it
    #[arg(long)]
    analysis_timeout_secs: Option<u64>,

    /// Heap usage percentage that triggers cleanup
    #[arg(long)]
    memory_threshold: Option<f64>,

    /// Seconds between memory samples
    #[arg(long)]
    memory_interval_secs: Option<u64>,

    /// Heap limit in MB used for the usage percentage
    #[arg(long)]
    heap_limit_mb: Option<u64>,

    /// Do not observe the workspace mirror at startup
    #[arg(long)]
    no_monitoring: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Layer command-line flags over the environment configuration
    fn apply(&self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(path) = &self.data_file {
            config.data_file = Some(path.clone());
        }
        if let Some(max) = self.max_concurrent {
            config.queue.max_concurrent = max.max(1);
        }
        if let Some(secs) = self.analysis_timeout_secs {
            config.queue.analysis_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(threshold) = self.memory_threshold {
            config.memory.threshold_percent = threshold;
        }
        if let Some(secs) = self.memory_interval_secs {
            config.memory.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(limit) = self.heap_limit_mb {
            config.memory.heap_limit_mb = Some(limit);
        }
        if self.no_monitoring {
            config.start_monitoring = false;
        }
        config
    }
}

/// Serialize a response, echoing the caller's `requestId` when present
fn encode_response(response: &BackgroundResponse, request_id: Option<Value>) -> Result<String> {
    let mut value = serde_json::to_value(response)?;
    if let (Some(id), Value::Object(fields)) = (request_id, &mut value) {
        fields.insert("requestId".to_string(), id);
    }
    Ok(serde_json::to_string(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "statuslens=debug,sl_background=debug,sl_store=debug,sl_scoring=debug"
    } else {
        "statuslens=info,sl_background=info,sl_store=warn,sl_scoring=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.apply(ServiceConfig::from_env()?);
    config.validate()?;
    let service = Arc::new(
        BackgroundService::start(config)
            .await
            .context("Failed to start background service")?,
    );

    let (responses, mut outbox) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outbox.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut handlers = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read message channel")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        };
        let Some(line) = line else {
            debug!("message channel closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        while handlers.try_join_next().is_some() {}

        let service = service.clone();
        let responses = responses.clone();
        handlers.spawn(async move {
            let (response, request_id) = match serde_json::from_str::<Value>(&line) {
                Ok(message) => {
                    let request_id = message.get("requestId").cloned();
                    (service.handle_message(message).await, request_id)
                }
                Err(e) => (BackgroundResponse::failure(format!("Invalid message: {}", e)), None),
            };

            match encode_response(&response, request_id) {
                Ok(encoded) => {
                    let _ = responses.send(encoded);
                }
                Err(e) => warn!(error = %e, "failed to encode response"),
            }
        });
    }

    while handlers.join_next().await.is_some() {}
    drop(responses);
    writer.await??;

    service.shutdown().await;
    Ok(())
}
