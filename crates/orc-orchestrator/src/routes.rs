use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use orc_core::types::{PrState, WorkItemState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::AppState;

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request/response bodies ───────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct NextQuery {
    pub worker_id: String,
}

#[derive(Deserialize)]
pub(crate) struct CompleteBody {
    pub worker_id: String,
    pub issue_number: i64,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub success: bool,
}

#[derive(Deserialize)]
pub(crate) struct FailedBody {
    pub worker_id: String,
    pub issue_number: i64,
    pub error: String,
    pub kind: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct HeartbeatBody {
    pub worker_id: String,
    pub current_issue: Option<i64>,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub workers: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub pr_review: PrReviewSummary,
}

#[derive(Serialize)]
pub(crate) struct PrReviewSummary {
    pub pending: usize,
    pub changes_requested: usize,
    pub approved: usize,
    pub queue_blocked: bool,
    pub blocking_reason: Option<String>,
}

fn pr_review_summary(state: &AppState, repository: &str) -> Result<PrReviewSummary, StatusCode> {
    let pending = state.db.list_pending_pr_numbers(repository).map_err(internal)?;
    let changes_requested = state.db.list_changes_requested_pr_numbers(repository).map_err(internal)?;
    let approved = state.db.count_approved_pr_entries(repository).map_err(internal)?;
    let (blocked, reason) = crate::gate::queue_blocked(&state.config.review, &pending, &changes_requested);
    Ok(PrReviewSummary {
        pending: pending.len(),
        changes_requested: changes_requested.len(),
        approved: approved as usize,
        queue_blocked: blocked,
        blocking_reason: reason,
    })
}

// ── Handlers ───────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let workers = state.db.list_workers().map_err(internal)?;
    let pending = state.db.list_work_items_by_state(WorkItemState::Pending).map_err(internal)?;
    let in_progress = state.db.list_work_items_by_state(WorkItemState::InProgress).map_err(internal)?;

    let repository = state
        .config
        .platform
        .repositories
        .first()
        .cloned()
        .unwrap_or_default();
    let pr_review = pr_review_summary(&state, &repository)?;

    Ok(Json(json!(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: workers.len(),
        in_progress: in_progress.len(),
        pending: pending.len(),
        pr_review,
    })))
}

pub(crate) async fn list_workers(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let workers = state.db.list_workers().map_err(internal)?;
    Ok(Json(json!(workers)))
}

pub(crate) async fn list_queue(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let pending = state.db.list_work_items_by_state(WorkItemState::Pending).map_err(internal)?;
    let in_progress = state.db.list_work_items_by_state(WorkItemState::InProgress).map_err(internal)?;
    let completed = state.db.list_work_items_by_state(WorkItemState::Completed).map_err(internal)?;
    Ok(Json(json!({
        "pending": pending,
        "in_progress": in_progress,
        "completed": completed,
    })))
}

pub(crate) async fn work_next(
    State(state): State<Arc<AppState>>,
    Query(q): Query<NextQuery>,
) -> Result<Json<Value>, StatusCode> {
    let repository = state
        .config
        .platform
        .repositories
        .first()
        .cloned()
        .unwrap_or_default();
    let summary = pr_review_summary(&state, &repository)?;
    if summary.queue_blocked {
        return Ok(Json(json!({
            "work_available": false,
            "blocked": true,
            "reason": summary.blocking_reason,
        })));
    }

    state.db.heartbeat_worker(&q.worker_id, None).map_err(internal)?;

    match state.db.assign_next(&q.worker_id).map_err(internal)? {
        None => Ok(Json(json!({ "work_available": false }))),
        Some(item) => {
            state
                .db
                .heartbeat_worker(&q.worker_id, Some(item.issue_number))
                .map_err(internal)?;

            // Label transition: moving an item off the ready queue is
            // advisory to the platform, not load-bearing for the state
            // machine, so a failure here is logged and never fails the
            // assignment itself.
            if let Err(e) = state.platform.add_label(&item.repository, item.issue_number, &state.config.platform.in_progress_label) {
                tracing::warn!(issue_number = item.issue_number, error = %e, "failed to add in-progress label");
            }
            if let Err(e) = state.platform.remove_label(&item.repository, item.issue_number, &state.config.platform.ready_label) {
                tracing::warn!(issue_number = item.issue_number, error = %e, "failed to remove ready label");
            }

            Ok(Json(json!({
                "work_available": true,
                "issue_number": item.issue_number,
                "title": item.title,
                "body": item.body,
                "labels": item.labels,
                "branch_name": item.feature_branch,
                "repository": item.repository,
            })))
        }
    }
}

pub(crate) async fn work_complete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompleteBody>,
) -> Result<StatusCode, StatusCode> {
    let item = state
        .db
        .list_work_items_by_state(WorkItemState::InProgress)
        .map_err(internal)?
        .into_iter()
        .find(|i| i.issue_number == body.issue_number)
        .ok_or(StatusCode::NOT_FOUND)?;

    if !body.success {
        state.db.fail_work_item_terminal(item.id).map_err(internal)?;
        notify_terminal_failure(&state, &item.repository, body.issue_number, item.id, "rejected", "product owner rejected the change").await;
        return Ok(StatusCode::OK);
    }

    state.db.complete_work_item(item.id).map_err(internal)?;

    if let Some(pr_number) = body.pr_number {
        state
            .db
            .open_pr_entry(&item.repository, body.issue_number, pr_number)
            .map_err(internal)?;
    }

    if let Err(e) = state.platform.add_label(&item.repository, body.issue_number, &state.config.platform.completed_label) {
        tracing::warn!(issue_number = body.issue_number, error = %e, "failed to add completed label");
    }
    if let Err(e) = state.platform.remove_label(&item.repository, body.issue_number, &state.config.platform.in_progress_label) {
        tracing::warn!(issue_number = body.issue_number, error = %e, "failed to remove in-progress label");
    }
    if let Err(e) = state.platform.close_issue(&item.repository, body.issue_number) {
        tracing::warn!(issue_number = body.issue_number, error = %e, "failed to close issue");
    }

    state.db.heartbeat_worker(&body.worker_id, None).map_err(internal)?;
    tracing::info!(
        issue_number = body.issue_number,
        pr_url = ?body.pr_url,
        "work item completed"
    );
    Ok(StatusCode::OK)
}

/// A work item that lands in `Failed` gets the failed label and a comment
/// with the error kind and a one-line detail — never a raw stack trace or
/// anything that could carry a secret.
async fn notify_terminal_failure(state: &Arc<AppState>, repository: &str, issue_number: i64, item_id: i64, kind: &str, detail: &str) {
    let terminal = matches!(
        state.db.get_work_item(item_id),
        Ok(Some(item)) if item.state == orc_core::types::WorkItemState::Failed
    );
    if !terminal {
        return;
    }
    if let Err(e) = state.platform.add_label(repository, issue_number, &state.config.platform.failed_label) {
        tracing::warn!(issue_number, error = %e, "failed to add failed label");
    }
    let comment = format!("{kind}: {detail}");
    if let Err(e) = state.platform.post_comment(repository, issue_number, &comment) {
        tracing::warn!(issue_number, error = %e, "failed to post failure comment");
    }
}

pub(crate) async fn work_failed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FailedBody>,
) -> Result<StatusCode, StatusCode> {
    let item = state
        .db
        .list_work_items_by_state(WorkItemState::InProgress)
        .map_err(internal)?
        .into_iter()
        .find(|i| i.issue_number == body.issue_number)
        .ok_or(StatusCode::NOT_FOUND)?;

    // `kind` drives the transient-vs-counted failure policy: a transient
    // kind (credit exhaustion, external network failure) is never charged
    // against the item's attempt count. A Product Owner rejection is a
    // deliberate terminal decision and skips the retry counter entirely.
    if body.kind.as_deref() == Some("rejected") {
        state.db.fail_work_item_terminal(item.id).map_err(internal)?;
    } else {
        let transient = matches!(body.kind.as_deref(), Some("credit_exhausted") | Some("transient_external"));
        state.db.fail_work_item(item.id, !transient).map_err(internal)?;
    }
    state.db.heartbeat_worker(&body.worker_id, None).map_err(internal)?;

    notify_terminal_failure(
        &state,
        &item.repository,
        body.issue_number,
        item.id,
        body.kind.as_deref().unwrap_or("unknown"),
        &body.error,
    )
    .await;

    tracing::warn!(
        issue_number = body.issue_number,
        error = %body.error,
        kind = ?body.kind,
        "work item failed"
    );
    Ok(StatusCode::OK)
}

/// Snapshot of the in-memory log ring — lets recent activity be inspected
/// without shipping logs to an external aggregator. The same
/// `AppState::log_tx` broadcast channel a streaming consumer would
/// subscribe to feeds this ring, so a snapshot here is never stale by more
/// than one event.
pub(crate) async fn recent_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let lines: Vec<String> = state.log_ring.lock().map(|r| r.iter().cloned().collect()).unwrap_or_default();
    Json(json!({ "lines": lines }))
}

pub(crate) async fn worker_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HeartbeatBody>,
) -> Result<StatusCode, StatusCode> {
    state.db.heartbeat_worker(&body.worker_id, body.current_issue).map_err(internal)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn pr_review_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let repository = state
        .config
        .platform
        .repositories
        .first()
        .cloned()
        .unwrap_or_default();
    let summary = pr_review_summary(&state, &repository)?;
    Ok(Json(json!({
        "pr_review": summary,
        "max_pending_prs": state.config.review.max_pending_prs,
        "block_on_changes_requested": state.config.review.block_on_changes_requested,
    })))
}

async fn transition_pr(state: Arc<AppState>, pr_number: i64, new_state: PrState) -> Result<StatusCode, StatusCode> {
    if state.db.get_pr_entry(pr_number).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    state.db.set_pr_state(pr_number, new_state).map_err(internal)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn pr_approved(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    transition_pr(state, pr_number, PrState::Approved).await
}

pub(crate) async fn pr_changes_requested(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    transition_pr(state, pr_number, PrState::ChangesRequested).await
}

pub(crate) async fn pr_merged(
    State(state): State<Arc<AppState>>,
    Path(pr_number): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    transition_pr(state, pr_number, PrState::Merged).await
}
