use orc_core::agent::AgentBackend;
use orc_core::config::Config;
use orc_core::platform::HostingPlatform;
use orc_core::types::{IssueRef, Role, WorkflowRecord, WorkflowStatus};
use tracing::{error, info, warn};

use crate::client::{NextWork, OrchestratorClient, WorkPayload};
use crate::metrics::Metrics;
use crate::pipeline::{self, PipelineOutcome};
use crate::publisher;
use crate::workspace;

/// Minimum cooldown after a credit-exhausted report before the poll loop
/// resumes: the account needs real wall-clock time to refill, so
/// re-polling immediately would just draw the same error again.
pub const CREDIT_EXHAUSTED_COOLDOWN_SECONDS: u64 = 300;

fn issue_from_payload(payload: &WorkPayload) -> IssueRef {
    IssueRef {
        repository: payload.repository.clone(),
        issue_number: payload.issue_number,
        title: payload.title.clone(),
        body: payload.body.clone(),
        labels: payload.labels.clone(),
    }
}

/// One full pass: acquire a workspace, drive the pipeline, publish on
/// approval, report the outcome, and release the workspace on every exit
/// path. Returns `true` when the worker should cool down before its
/// next poll (credit exhaustion).
pub async fn run_one(
    client: &OrchestratorClient,
    worker_id: &str,
    backend: &dyn AgentBackend,
    platform: &dyn HostingPlatform,
    config: &Config,
    metrics: &Metrics,
    payload: WorkPayload,
) -> bool {
    let issue = issue_from_payload(&payload);
    metrics.set_current_issue(Some(issue.issue_number));

    if let Err(e) = workspace::validate_repository_slug(&issue.repository) {
        error!(issue_number = issue.issue_number, error = %e, "refusing malformed repository slug");
        report_failure(client, worker_id, &issue, "fatal_startup", &e.to_string()).await;
        metrics.set_current_issue(None);
        metrics.record_failed();
        return false;
    }

    let ws = match workspace::acquire(config, &issue.repository, issue.issue_number) {
        Ok(ws) => ws,
        Err(e) => {
            error!(issue_number = issue.issue_number, error = %e, "failed to acquire workspace");
            report_failure(client, worker_id, &issue, "transient_external", &e.to_string()).await;
            metrics.set_current_issue(None);
            metrics.record_failed();
            return false;
        }
    };

    let mut record = WorkflowRecord::new(issue.repository.clone(), issue.issue_number);
    let outcome = pipeline::run_pipeline(&ws.git, &ws.path, backend, config, &issue, &mut record).await;

    let cooldown = match outcome {
        Ok(PipelineOutcome::Approved) => {
            match publisher::publish(&ws.git, &ws.path, platform, config, &issue).await {
                Ok(result) => {
                    record.finish(WorkflowStatus::Approved, Some(result.pr_url.clone()));
                    log_record(&record);
                    if let Err(e) = client
                        .report_success(worker_id, issue.issue_number, Some(result.pr_number), Some(&result.pr_url))
                        .await
                    {
                        warn!(issue_number = issue.issue_number, error = %e, "failed to report success to orchestrator");
                    }
                    metrics.record_completed();
                    false
                }
                Err(failure) => {
                    record.finish(WorkflowStatus::Failed, None);
                    log_record(&record);
                    let is_credit = failure.kind == orc_core::error::ErrorKind::CreditExhausted;
                    report_failure(client, worker_id, &issue, wire_kind(failure.kind), &failure.detail).await;
                    metrics.record_failed();
                    is_credit
                }
            }
        }
        Ok(PipelineOutcome::Rejected) => {
            record.finish(WorkflowStatus::Rejected, None);
            log_record(&record);
            // A rejection is a deliberate terminal decision, not a system
            // failure, but the Work Item model has no distinct "rejected"
            // bucket — it is reported through the failure path with a
            // dedicated kind so the orchestrator marks it `failed`
            // immediately rather than counting it against retry attempts.
            report_failure(client, worker_id, &issue, "rejected", "product owner rejected the change").await;
            metrics.record_failed();
            false
        }
        Err(failure) => {
            record.finish(WorkflowStatus::Failed, None);
            log_record(&record);
            let is_credit = failure.kind == orc_core::error::ErrorKind::CreditExhausted;
            if is_credit {
                metrics.record_credit_exhausted();
            }
            report_failure(client, worker_id, &issue, wire_kind(failure.kind), &failure.detail).await;
            metrics.record_failed();
            is_credit
        }
    };

    workspace::release(&ws);
    metrics.set_current_issue(None);
    cooldown
}

async fn report_failure(client: &OrchestratorClient, worker_id: &str, issue: &IssueRef, kind: &str, detail: &str) {
    if let Err(e) = client.report_failure(worker_id, issue.issue_number, kind, detail).await {
        warn!(issue_number = issue.issue_number, error = %e, "failed to report failure to orchestrator");
    }
}

fn wire_kind(kind: orc_core::error::ErrorKind) -> &'static str {
    use orc_core::error::ErrorKind::*;
    match kind {
        CreditExhausted => "credit_exhausted",
        Timeout => "timeout",
        NonZeroExit => "non_zero_exit",
        AgentOutputMalformed => "agent_output_malformed",
        AgentReportedError => "agent_reported_error",
        SilentPhaseFailure => "silent_phase_failure",
        PushFailure => "push_failure",
        TransientExternal => "transient_external",
        FatalStartup => "fatal_startup",
    }
}

/// One structured log line per completed Work Item: the archived
/// `WorkflowRecord` is never written to disk by the worker itself, only
/// logged — the orchestrator's own store is the system of record.
fn log_record(record: &WorkflowRecord) {
    info!(
        issue_number = record.issue_number,
        repository = %record.repository,
        revision_count = record.revision_count,
        status = ?record.status,
        total_cost_usd = record.total_cost_usd,
        total_duration_ms = record.total_duration_ms,
        steps = record.steps.len(),
        "pipeline run finished"
    );
}

/// Polls the orchestrator for the next item and drives it to completion.
/// Returns the number of seconds the caller should sleep before polling
/// again: the configured interval on `None`/`Blocked`, the credit-exhausted
/// cooldown on that specific failure, or zero to poll again immediately.
pub async fn poll_once(
    client: &OrchestratorClient,
    worker_id: &str,
    backend: &dyn AgentBackend,
    platform: &dyn HostingPlatform,
    config: &Config,
    metrics: &Metrics,
) -> u64 {
    match client.next_work(worker_id).await {
        Ok(NextWork::Available(payload)) => {
            if run_one(client, worker_id, backend, platform, config, metrics, payload).await {
                CREDIT_EXHAUSTED_COOLDOWN_SECONDS
            } else {
                0
            }
        }
        Ok(NextWork::Blocked { reason }) => {
            info!(reason = %reason, "queue blocked, waiting");
            config.poll_interval_seconds
        }
        Ok(NextWork::None) => config.poll_interval_seconds,
        Err(e) => {
            warn!(error = %e, "failed to poll for work");
            config.poll_interval_seconds
        }
    }
}

/// Used only by the SIGTERM handler: any item the poll loop's last
/// attempt left assigned to this worker has no return path back through
/// `poll_once`, so the shutdown path reports it directly.
pub async fn report_shutdown_abandon(client: &OrchestratorClient, worker_id: &str, issue_number: i64) {
    if let Err(e) = client
        .report_failure(worker_id, issue_number, "transient_external", "worker shutting down")
        .await
    {
        warn!(issue_number, error = %e, "failed to report shutdown abandonment");
    }
}
