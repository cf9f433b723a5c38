use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use ostoredb::agent_reference::AgentReference;
use ostoredb::backend;
use ostoredb::catalogue::InMemoryCatalogue;
use ostoredb::garbage_collector::GarbageCollector;
use ostoredb::heartbeat::{spawn_garbage_collector, spawn_heartbeat};
use ostoredb::scheduler_db::OStoreDb;
use ostoredb::settings::AppConfig;
use ostoredb::trace;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Scheduler object store daemon: keeps this agent alive and garbage collects dead ones
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// run a single garbage collection pass and exit
    #[arg(long)]
    once: bool,
}

fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.log_format)?;

    let backend = backend::open(&cfg.backend).await?;
    info!(backend = %backend.describe(), "object store opened");

    let agent_ref = Arc::new(AgentReference::new("ostoredb", &host_name()));
    let catalogue = Arc::new(InMemoryCatalogue::new());
    let db = OStoreDb::new(
        backend.clone(),
        catalogue,
        agent_ref.clone(),
        cfg.scheduler.clone(),
        &cfg.agent,
    )
    .await?;

    if args.once {
        let mut collector = GarbageCollector::new(db.gc_context());
        let collected = collector.run_once().await?;
        info!(agents = ?collected, "single garbage collection pass done");
        db.shutdown().await?;
        return Ok(());
    }

    let heartbeat = spawn_heartbeat(
        agent_ref.clone(),
        backend.clone(),
        Duration::from_millis(cfg.agent.heartbeat_interval_ms),
    );
    let gc = spawn_garbage_collector(
        GarbageCollector::new(db.gc_context()),
        Duration::from_millis(cfg.agent.gc_interval_ms),
    );
    info!(agent = %agent_ref.address(), "running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    gc.stop().await;
    heartbeat.stop().await;
    db.shutdown().await?;
    Ok(())
}
