mod client;
mod metrics;
mod pipeline;
mod prompts;
mod publisher;
mod worker;
mod workspace;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use orc_agent::SubprocessBackend;
use orc_core::config::Config;
use orc_core::platform::CliPlatform;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::OrchestratorClient;
use metrics::Metrics;

#[derive(Parser, Debug)]
#[command(name = "orc-worker")]
struct Args {
    /// Stable identity reported on every heartbeat and outcome. A
    /// fresh UUID is assigned if not provided so restarts don't collide
    /// with a still-registered prior instance.
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Base URL of the orchestrator's HTTP control surface.
    #[arg(long, env = "ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8080")]
    orchestrator_url: String,

    /// Bind address for this worker's own `/health` endpoint.
    #[arg(long, env = "WORKER_HEALTH_BIND_ADDR", default_value = "0.0.0.0:9090")]
    health_bind_addr: String,

    /// Interval between background heartbeats, distinct from the work-pull
    /// request itself.
    #[arg(long, env = "WORKER_HEARTBEAT_INTERVAL_SECONDS", default_value_t = 30)]
    heartbeat_interval_seconds: u64,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "orc_worker=info,orc_core=info,orc_agent=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    let worker_id = args.worker_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        anyhow::bail!(e);
    }
    let config = Arc::new(config);

    let client = Arc::new(OrchestratorClient::new(args.orchestrator_url.clone()));
    let backend = Arc::new(SubprocessBackend::new(config.cli.bin.clone()));
    let platform = Arc::new(CliPlatform::new(config.platform.cli_bin.clone()));
    let metrics = Metrics::new();

    info!(worker_id = %worker_id, orchestrator_url = %args.orchestrator_url, "worker starting");

    let health_bind_addr = args.health_bind_addr.clone();
    let metrics_for_health = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_for_health, &health_bind_addr).await {
            warn!(error = %e, "health endpoint exited");
        }
    });
    tokio::spawn(heartbeat_loop(
        Arc::clone(&client),
        worker_id.clone(),
        Arc::clone(&metrics),
        args.heartbeat_interval_seconds,
    ));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                let current_issue = metrics.current_issue.load(Ordering::Relaxed);
                if current_issue >= 0 {
                    worker::report_shutdown_abandon(&client, &worker_id, current_issue).await;
                }
                break;
            }
            sleep_secs = poll_tick(&client, &worker_id, &*backend, &*platform, &config, &metrics) => {
                if sleep_secs > 0 {
                    tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
                }
            }
        }
    }

    Ok(())
}

async fn poll_tick(
    client: &OrchestratorClient,
    worker_id: &str,
    backend: &dyn orc_core::agent::AgentBackend,
    platform: &dyn orc_core::platform::HostingPlatform,
    config: &Config,
    metrics: &Metrics,
) -> u64 {
    worker::poll_once(client, worker_id, backend, platform, config, metrics).await
}

/// Background heartbeat, run on a fixed interval independent of the
/// work-pull request itself so a worker stuck mid-pipeline still
/// shows as alive rather than being reclaimed as dead.
async fn heartbeat_loop(client: Arc<OrchestratorClient>, worker_id: String, metrics: Arc<Metrics>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        interval.tick().await;
        let current_issue = metrics.current_issue.load(Ordering::Relaxed);
        let current_issue = if current_issue >= 0 { Some(current_issue) } else { None };
        if let Err(e) = client.heartbeat(&worker_id, current_issue).await {
            warn!(error = %e, "heartbeat failed");
        }
    }
}
