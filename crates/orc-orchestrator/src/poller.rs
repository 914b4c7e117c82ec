use std::sync::Arc;

use orc_core::platform::HostingPlatform;
use orc_core::types::WorkItem;
use tracing::{error, info};

use crate::AppState;

/// For each monitored repository, lists issues carrying the ready
/// label, skips ones already carrying the in-progress or failed label, and
/// enqueues any (repo, number) pair not already known. Idempotent: a
/// duplicate enqueue is a no-op (`enqueue_work_item`'s `ON CONFLICT DO
/// NOTHING`), so running concurrently with assignment is safe.
pub async fn poll_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(state.config.poll_interval_seconds));
    loop {
        interval.tick().await;
        for repository in state.config.platform.repositories.clone() {
            if let Err(e) = poll_repository(&state, state.platform.as_ref(), &repository) {
                error!(repository = %repository, error = %e, "issue poll failed");
            }
        }
    }
}

fn poll_repository(state: &Arc<AppState>, platform: &dyn HostingPlatform, repository: &str) -> anyhow::Result<()> {
    let issues = platform.list_issues_with_label(repository, &state.config.platform.ready_label)?;

    for issue in issues {
        let labels = issue.label_names();
        if labels.contains(&state.config.platform.in_progress_label)
            || labels.contains(&state.config.platform.failed_label)
        {
            continue;
        }

        let feature_branch = WorkItem::feature_branch_for(issue.number);
        let id = state.db.enqueue_work_item(
            repository,
            issue.number,
            &issue.title,
            &issue.body,
            &labels,
            &feature_branch,
            state.config.max_attempts,
        )?;
        info!(repository = %repository, issue_number = issue.number, work_item_id = id, "polled issue");
    }

    Ok(())
}
