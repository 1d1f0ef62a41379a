use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use whisper_dispatch::push::{PushError, PushNotification, PushNotifier};
use whisper_dispatch::storage::InMemoryMessageStore;
use whisper_dispatch::{DispatchConfig, DispatchContext};

// Runs the delivery fabric against a cache service with an in-memory message
// store and a push gateway that only logs.
//
// Usage:
//   cargo run -- --cache 127.0.0.1:6379
//   cargo run -- --config dispatch.json

#[derive(Parser, Debug)]
#[command(name = "whisper-dispatch", about = "Real-time message delivery fabric")]
struct Args {
    /// JSON configuration file; missing keys keep their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache service address, overrides the configuration file.
    #[arg(long)]
    cache: Option<String>,
}

struct LoggingNotifier;

#[async_trait]
impl PushNotifier for LoggingNotifier {
    async fn send_push(&self, notification: PushNotification) -> Result<(), PushError> {
        let body = serde_json::to_string(&notification)
            .map_err(|e| PushError::Transport(e.to_string()))?;
        info!(target: "Dispatch/Push", "Push: {body}");
        Ok(())
    }
}

fn load_config(args: &Args) -> anyhow::Result<DispatchConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            DispatchConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => DispatchConfig::default(),
    };
    if let Some(cache) = &args.cache {
        config.cache_address = cache.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = load_config(&args)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        let context = DispatchContext::with_cache(
            config,
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(LoggingNotifier),
        );
        context.start();

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {e}");
        }
        info!("Shutting down");
        context.shutdown().await;
    });

    Ok(())
}
