use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;

/// Supplemental operational surface: a minimal counter set exposed
/// alongside a worker-local `/health` — not a full metrics export system.
#[derive(Default)]
pub struct Metrics {
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub credit_exhausted_events: AtomicU64,
    pub current_issue: AtomicI64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current_issue: AtomicI64::new(-1),
            ..Default::default()
        })
    }

    pub fn set_current_issue(&self, issue_number: Option<i64>) {
        self.current_issue.store(issue_number.unwrap_or(-1), Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_credit_exhausted(&self) {
        self.credit_exhausted_events.fetch_add(1, Ordering::Relaxed);
    }
}

async fn health(State(metrics): State<Arc<Metrics>>) -> Json<serde_json::Value> {
    let current_issue = metrics.current_issue.load(Ordering::Relaxed);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tasks_completed": metrics.tasks_completed.load(Ordering::Relaxed),
        "tasks_failed": metrics.tasks_failed.load(Ordering::Relaxed),
        "credit_exhausted_events": metrics.credit_exhausted_events.load(Ordering::Relaxed),
        "current_issue": if current_issue < 0 { None } else { Some(current_issue) },
    }))
}

/// Serves `/health` on `bind_addr` until the process exits; run as a
/// background task, never awaited from the main poll loop.
pub async fn serve(metrics: Arc<Metrics>, bind_addr: &str) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health)).with_state(metrics);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
