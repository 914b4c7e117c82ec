mod gate;
mod logbuffer;
mod poller;
mod routes;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use orc_core::{
    config::Config,
    db::Db,
    platform::{CliPlatform, HostingPlatform},
};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub platform: Arc<dyn HostingPlatform>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
    pub log_tx: broadcast::Sender<String>,
}

#[derive(Parser, Debug)]
#[command(name = "orc-orchestrator")]
struct Args {
    /// Override `BIND_ADDR`.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// Path to the SQLite database file.
    #[arg(long, env = "ORC_DB_PATH", default_value = "orc.db")]
    db_path: String,
}

fn init_logging() -> (Arc<Mutex<VecDeque<String>>>, broadcast::Sender<String>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "orc_orchestrator=info,orc_core=info,tower_http=warn".into());

    let (broadcast_layer, log_ring, log_tx) = logbuffer::BroadcastLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(broadcast_layer)
        .init();

    (log_ring, log_tx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_ring, log_tx) = init_logging();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }

    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        anyhow::bail!(e);
    }
    let config = Arc::new(config);

    let mut db = Db::open(&args.db_path)?;
    db.migrate()?;
    let db = Arc::new(db);

    let platform: Arc<dyn HostingPlatform> = Arc::new(CliPlatform::new(config.platform.cli_bin.clone()));

    let state = Arc::new(AppState {
        db: Arc::clone(&db),
        config: Arc::clone(&config),
        platform,
        log_ring,
        log_tx,
    });

    tokio::spawn(background_loop(Arc::clone(&state)));
    tokio::spawn(poller::poll_loop(Arc::clone(&state)));

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/workers", get(routes::list_workers))
        .route("/queue", get(routes::list_queue))
        .route("/work/next", get(routes::work_next))
        .route("/work/complete", post(routes::work_complete))
        .route("/work/failed", post(routes::work_failed))
        .route("/workers/heartbeat", post(routes::worker_heartbeat))
        .route("/logs", get(routes::recent_logs))
        .route("/pr-review/status", get(routes::pr_review_status))
        .route("/pr-review/approved/{n}", post(routes::pr_approved))
        .route("/pr-review/changes-requested/{n}", post(routes::pr_changes_requested))
        .route("/pr-review/merged/{n}", post(routes::pr_merged))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "orchestrator listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodic maintenance: `ExpireStaleAssignments`. Runs independently
/// of the HTTP surface and the issue poller.
async fn background_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        interval.tick().await;
        match state.db.expire_stale_assignments(state.config.stale_assignment_timeout_seconds) {
            Ok(0) => {}
            Ok(n) => info!(expired = n, "reclaimed stale work item assignments"),
            Err(e) => tracing::error!("expire_stale_assignments failed: {e}"),
        }
        match state.db.prune_dead_workers(state.config.stale_assignment_timeout_seconds * 4) {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "pruned dead worker records"),
            Err(e) => tracing::error!("prune_dead_workers failed: {e}"),
        }
    }
}
