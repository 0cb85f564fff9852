//! warden デモ
//!
//! 1 つの in-memory store を N 個の instance で共有し、標準の watchdog 群を動かす。
//! 裏で demo writer が transaction を書き続け、ときどき commit せずに放置する
//! （stuck transaction の回収を見るため）。Ctrl-C か `--run-for-sec` で停止。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_core::app::{WardenBuilder, WardenConfig, WardenInstance};
use warden_core::domain::ResourceWrite;
use warden_core::impls::InMemoryCoordinationStore;
use warden_core::ports::{Clock, CoordinationStore, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Lease-based watchdog scheduler demo")]
struct Args {
    /// TOML file with process-level settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated instances sharing the store.
    #[arg(long, default_value_t = 2)]
    instances: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for_sec: Option<u64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One demo write. Every fifth transaction is left open on purpose.
async fn write_one(store: &dyn CoordinationStore, n: u64) -> warden_core::domain::Result<()> {
    let tx = store.begin_transaction().await?;
    let write = ResourceWrite::new("Observation", format!("obs-{}", n % 7), json!({ "n": n }));
    store.write_resources(tx, &[write]).await?;
    if n % 5 == 0 {
        info!(transaction_id = %tx, "demo writer abandoning transaction");
        return Ok(());
    }
    store.mark_resources_committed(tx).await?;
    store.commit_transaction(tx, None).await
}

async fn demo_writer(store: Arc<dyn CoordinationStore>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut n: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        n += 1;
        if let Err(err) = write_one(store.as_ref(), n).await {
            warn!(error = %err, "demo write failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => WardenConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => WardenConfig::default(),
    };
    anyhow::ensure!(args.instances > 0, "--instances must be at least 1");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CoordinationStore> =
        Arc::new(InMemoryCoordinationStore::new(Arc::clone(&clock)));
    let shutdown = CancellationToken::new();

    let mut instances: Vec<WardenInstance> = Vec::with_capacity(args.instances);
    for n in 1..=args.instances {
        let worker_id = format!("{}-{n}", config.instance_name);
        let instance = WardenBuilder::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            worker_id,
            shutdown.child_token(),
        )
        .with_default_watchdogs()?
        .build()?;
        instances.push(instance);
    }

    let mut handles = Vec::new();
    for instance in &instances {
        handles.extend(
            instance
                .start()
                .await
                .with_context(|| format!("starting {}", instance.worker_id()))?,
        );
    }
    let writer = tokio::spawn(demo_writer(Arc::clone(&store), shutdown.child_token()));
    info!(instances = instances.len(), "warden running");

    let run_for = async {
        match args.run_for_sec {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
        _ = run_for => info!("run time elapsed, shutting down"),
    }
    shutdown.cancel();

    for handle in handles {
        handle.join().await;
    }
    if let Err(err) = writer.await {
        warn!(error = %err, "demo writer ended abnormally");
    }

    let statuses: Vec<_> = instances.iter().flat_map(|i| i.statuses()).collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    let visibility = store.current_visibility().await?;
    info!(watermark = %visibility, "final visibility");
    Ok(())
}
