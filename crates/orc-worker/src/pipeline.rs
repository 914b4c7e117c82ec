use orc_agent::invoke_with_backoff;
use orc_core::agent::AgentBackend;
use orc_core::config::Config;
use orc_core::error::ErrorKind;
use orc_core::git::Git;
use orc_core::types::{AgentInvocation, Decision, IssueRef, Role, WorkflowRecord};
use tracing::{info, warn};

use crate::prompts;

/// Non-terminal outcome of a completed pipeline run; the caller (worker
/// main loop) still has to publish on `Approved` and report the result to
/// the orchestrator either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Approved,
    Rejected,
}

/// Crosses back to the worker main loop as a `{kind, detail}` pair, nothing
/// richer. The worker decides
/// requeue vs. terminal failure from `kind` alone.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

fn task_error(kind: ErrorKind, detail: impl Into<String>) -> PipelineFailure {
    PipelineFailure { kind, detail: detail.into() }
}

fn git_error(e: anyhow::Error) -> PipelineFailure {
    task_error(ErrorKind::TransientExternal, e.to_string())
}

/// Detects `main` vs `master` once at the start of the pipeline (S0).
pub fn detect_main_branch(git: &Git, dir: &str) -> Result<String, PipelineFailure> {
    if git.branch_exists(dir, "main").map_err(git_error)? {
        return Ok("main".to_string());
    }
    if git.branch_exists(dir, "master").map_err(git_error)? {
        return Ok("master".to_string());
    }
    Err(task_error(ErrorKind::FatalStartup, "workspace has neither main nor master"))
}

/// Half-merged-repo recovery: if an interrupted merge left the working
/// tree dirty, abort it and restore the prior branch before the pipeline
/// touches anything. The distributed publish path never invokes `git
/// merge` itself, but a reused workspace from a crashed prior attempt
/// might still carry one.
pub fn recover_from_half_merge(git: &Git, dir: &str) -> Result<(), PipelineFailure> {
    if git.status_clean(dir).map_err(git_error)? {
        return Ok(());
    }
    warn!(dir, "workspace was left dirty, attempting merge abort");
    let abort = git.abort_merge(dir).map_err(git_error)?;
    if !git.status_clean(dir).map_err(git_error)? {
        let _ = abort;
        return Err(task_error(
            ErrorKind::TransientExternal,
            "repository left half-merged and could not be recovered; workspace must be destroyed",
        ));
    }
    Ok(())
}

/// S2/S4/S6: a phase that produced zero commits beyond its parent is a
/// silent agent failure — fatal to the workflow, never retried.
fn check_commit_gate(git: &Git, dir: &str, branch: &str, parent: &str) -> Result<(), PipelineFailure> {
    let has_commits = git.branch_has_commits(dir, branch, parent).map_err(git_error)?;
    if !has_commits {
        return Err(task_error(
            ErrorKind::SilentPhaseFailure,
            format!("{branch} produced no commits beyond {parent}"),
        ));
    }
    Ok(())
}

/// `architect` is created fresh from `main` on the first iteration,
/// preserved across revisions, and recreated with a logged recovery event
/// if it has unexpectedly gone missing on a later revision.
fn ensure_architect_branch(git: &Git, dir: &str, main_branch: &str, revision: u32) -> Result<(), PipelineFailure> {
    let exists = git.branch_exists(dir, "architect").map_err(git_error)?;
    if revision == 0 {
        if exists {
            git.delete_branch(dir, "architect", true).map_err(git_error)?;
        }
        git.create_branch(dir, "architect", main_branch).map_err(git_error)?;
    } else if !exists {
        warn!(revision, "architect branch missing on revision, recreating from {main_branch}");
        git.create_branch(dir, "architect", main_branch).map_err(git_error)?;
    }
    Ok(())
}

/// `security`/`tester` are destroyed and recreated on every revision so
/// downstream stages never inherit stale state from the previous attempt.
fn reset_downstream_branches(git: &Git, dir: &str) -> Result<(), PipelineFailure> {
    git.delete_branch(dir, "tester", true).map_err(git_error)?;
    git.delete_branch(dir, "security", true).map_err(git_error)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_phase(
    backend: &dyn AgentBackend,
    config: &Config,
    role: Role,
    task_text: &str,
    dir: &str,
    revision: u32,
    record: &mut WorkflowRecord,
) -> Result<String, PipelineFailure> {
    let invocation = AgentInvocation {
        role,
        task_text: task_text.to_string(),
        system_prompt: prompts::system_prompt(role).to_string(),
        allowed_tools: config.cli.allowed_tools.clone(),
        workspace_path: dir.to_string(),
        timeout_secs: config.cli.timeout_seconds,
        attempt: 1,
    };

    let result = invoke_with_backoff(
        backend,
        &invocation,
        config.workflow.max_agent_retries,
        config.workflow.retry_backoff_base_seconds,
    )
    .await;

    let result_text = result.result_text.clone();
    let success = result.success;
    let error_kind = result.error_kind;
    let raw_output = result.raw_output.clone();
    record.record_step(role, revision, 1, result);

    if !success {
        let kind = error_kind.unwrap_or(ErrorKind::AgentOutputMalformed);
        let detail = if result_text.is_empty() { raw_output } else { result_text };
        return Err(task_error(kind, detail));
    }

    Ok(result_text)
}

/// Drives the full S0..S9 state machine for one Work Item, including the
/// revision loop. The workspace must already be at S0 (cloned,
/// identity configured) when this is called; publication (S9) is handled
/// separately by the caller once this returns `Approved`.
pub async fn run_pipeline(
    git: &Git,
    dir: &str,
    backend: &dyn AgentBackend,
    config: &Config,
    issue: &IssueRef,
    record: &mut WorkflowRecord,
) -> Result<PipelineOutcome, PipelineFailure> {
    recover_from_half_merge(git, dir)?;
    let main_branch = detect_main_branch(git, dir)?;

    let mut task_text = prompts::initial_task_text(issue);
    let mut revision: u32 = 0;

    loop {
        // S1/S2 — Architect
        ensure_architect_branch(git, dir, &main_branch, revision)?;
        git.checkout(dir, "architect").map_err(git_error)?;
        run_phase(backend, config, Role::Architect, &task_text, dir, revision, record).await?;
        check_commit_gate(git, dir, "architect", &main_branch)?;

        // S3/S4 — Security, cut from architect
        git.delete_branch(dir, "security", true).map_err(git_error)?;
        git.create_branch(dir, "security", "architect").map_err(git_error)?;
        git.checkout(dir, "security").map_err(git_error)?;
        run_phase(backend, config, Role::Security, &task_text, dir, revision, record).await?;
        check_commit_gate(git, dir, "security", "architect")?;

        // S5/S6 — Tester, cut from security
        git.delete_branch(dir, "tester", true).map_err(git_error)?;
        git.create_branch(dir, "tester", "security").map_err(git_error)?;
        git.checkout(dir, "tester").map_err(git_error)?;
        run_phase(backend, config, Role::Tester, &task_text, dir, revision, record).await?;
        check_commit_gate(git, dir, "tester", "security")?;

        // S7 — Product Owner reviews tracked files on `tester`, never the raw tree
        let tracked_files = git.list_files(dir, "tester").map_err(git_error)?;
        let po_task = prompts::po_review_task_text(issue, &tracked_files);
        let po_output = run_phase(backend, config, Role::ProductOwner, &po_task, dir, revision, record).await?;

        // S8 — Decision
        let decision = Decision::parse(&po_output);
        info!(issue_number = issue.issue_number, revision, ?decision, "product owner decision");

        match decision {
            Decision::Approve => return Ok(PipelineOutcome::Approved),
            Decision::Reject => return Ok(PipelineOutcome::Rejected),
            Decision::Revise => {
                if revision >= config.workflow.max_revisions as u32 {
                    return Ok(PipelineOutcome::Rejected);
                }
                // Step off `tester` before deleting it/`security` — git refuses
                // to delete the currently checked-out branch.
                git.checkout(dir, "architect").map_err(git_error)?;
                reset_downstream_branches(git, dir)?;
                revision += 1;
                record.revision_count = revision;
                task_text = prompts::with_revision_feedback(&task_text, &po_output);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orc_core::config::{CliConfig, PlatformConfig, ReviewConfig, WorkflowConfig, WorkspaceConfig};
    use orc_core::types::{AgentOutput, AgentResult};
    use std::process::Command;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn run_git(dir: &str, args: &[&str]) {
        let status = Command::new("git").arg("-C").arg(dir).args(args).status().expect("spawn git");
        assert!(status.success(), "git {args:?} failed in {dir}");
    }

    fn init_repo() -> TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().to_str().unwrap();
        run_git(dir, &["init", "-q", "-b", "main"]);
        run_git(dir, &["config", "user.email", "t@example.com"]);
        run_git(dir, &["config", "user.name", "t"]);
        std::fs::write(tmp.path().join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "-A"]);
        run_git(dir, &["commit", "-q", "-m", "init"]);
        tmp
    }

    fn test_config() -> Config {
        Config {
            workflow: WorkflowConfig {
                max_revisions: 1,
                max_agent_retries: 0,
                retry_backoff_base_seconds: 0,
                auto_merge_on_approval: false,
                require_tests_passing: true,
            },
            cli: CliConfig {
                bin: "claude".to_string(),
                timeout_seconds: 60,
                allowed_tools: vec!["Read".to_string()],
            },
            review: ReviewConfig {
                max_pending_prs: 3,
                block_on_changes_requested: true,
                allow_parallel_independent: false,
            },
            platform: PlatformConfig {
                pr_target_branch: "develop".to_string(),
                repositories: vec!["acme/widgets".to_string()],
                api_token: "token".to_string(),
                cli_bin: "gh".to_string(),
                ready_label: "ready".to_string(),
                in_progress_label: "in-progress".to_string(),
                failed_label: "failed".to_string(),
                completed_label: "completed".to_string(),
            },
            workspace: WorkspaceConfig {
                root: "/tmp".to_string(),
                max_size_mb: 1024,
                max_file_size_mb: 50,
                max_files: 1000,
            },
            stale_assignment_timeout_seconds: 1800,
            poll_interval_seconds: 60,
            max_attempts: 5,
            bind_addr: "0.0.0.0:8080".to_string(),
            forbidden_prefixes: vec!["/etc".to_string()],
        }
    }

    fn issue() -> IssueRef {
        IssueRef {
            repository: "acme/widgets".to_string(),
            issue_number: 7,
            title: "Add a feature".to_string(),
            body: "Please add it.".to_string(),
            labels: vec!["ready".to_string()],
        }
    }

    /// A fake agent backend that commits a file on every phase call and
    /// returns a scripted decision for the Product Owner phase.
    struct ScriptedBackend {
        decisions: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn invoke(&self, invocation: &AgentInvocation) -> AgentResult {
            if invocation.role != Role::ProductOwner {
                // Content keyed on task-text length so a revision's rewritten
                // task text (feedback appended) always produces a real diff,
                // even when the same marker file is touched again.
                let marker = format!("{}.txt", invocation.role.as_str());
                let content = format!("{}\n", invocation.task_text.len());
                std::fs::write(std::path::Path::new(&invocation.workspace_path).join(marker), content).unwrap();
                run_git(&invocation.workspace_path, &["add", "-A"]);
                run_git(&invocation.workspace_path, &["commit", "-q", "-m", "phase work"]);
                return AgentResult::ok(AgentOutput::default(), "ok".to_string());
            }
            let decision = self.decisions.lock().unwrap().remove(0);
            AgentResult::ok(
                AgentOutput {
                    result: format!("DECISION:{decision}\nrationale"),
                    ..Default::default()
                },
                "ok".to_string(),
            )
        }
    }

    #[tokio::test]
    async fn approves_on_first_pass() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let backend = ScriptedBackend { decisions: Mutex::new(vec!["APPROVE"]) };
        let config = test_config();
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let outcome = run_pipeline(&git, dir, &backend, &config, &issue(), &mut record).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Approved);
        assert!(git.branch_exists(dir, "architect").unwrap());
        assert!(git.branch_exists(dir, "security").unwrap());
        assert!(git.branch_exists(dir, "tester").unwrap());
        assert_eq!(record.revision_count, 0);
    }

    #[tokio::test]
    async fn revision_then_approve_preserves_architect_tip() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let backend = ScriptedBackend { decisions: Mutex::new(vec!["REVISE", "APPROVE"]) };
        let mut config = test_config();
        config.workflow.max_revisions = 2;
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let outcome = run_pipeline(&git, dir, &backend, &config, &issue(), &mut record).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Approved);
        // Architect accumulated commits across both iterations (two distinct marker files).
        let log = git.exec(dir, &["log", "architect", "--oneline"]).unwrap();
        assert!(log.stdout.lines().count() >= 3, "expected init + 2 architect commits, got:\n{}", log.stdout);
        assert_eq!(record.revision_count, 1);
    }

    #[tokio::test]
    async fn reject_terminates_without_publish() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let backend = ScriptedBackend { decisions: Mutex::new(vec!["REJECT"]) };
        let config = test_config();
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let outcome = run_pipeline(&git, dir, &backend, &config, &issue(), &mut record).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Rejected);
    }

    #[tokio::test]
    async fn max_revisions_zero_treats_revise_as_rejected() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let backend = ScriptedBackend { decisions: Mutex::new(vec!["REVISE"]) };
        let mut config = test_config();
        config.workflow.max_revisions = 0;
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let outcome = run_pipeline(&git, dir, &backend, &config, &issue(), &mut record).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Rejected);
    }

    struct SilentArchitect;
    #[async_trait]
    impl AgentBackend for SilentArchitect {
        async fn invoke(&self, _invocation: &AgentInvocation) -> AgentResult {
            AgentResult::ok(AgentOutput::default(), "ok".to_string())
        }
    }

    #[tokio::test]
    async fn silent_phase_failure_is_not_retried_and_fails_fast() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let config = test_config();
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let err = run_pipeline(&git, dir, &SilentArchitect, &config, &issue(), &mut record)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SilentPhaseFailure);
        assert!(!git.branch_exists(dir, "security").unwrap());
    }

    struct CreditExhaustedBackend;
    #[async_trait]
    impl AgentBackend for CreditExhaustedBackend {
        async fn invoke(&self, _invocation: &AgentInvocation) -> AgentResult {
            AgentResult::failed(ErrorKind::CreditExhausted, "credit balance is too low".to_string())
        }
    }

    #[tokio::test]
    async fn credit_exhausted_propagates_without_retry() {
        let tmp = init_repo();
        let dir = tmp.path().to_str().unwrap();
        let git = Git::new(dir.to_string());
        let config = test_config();
        let mut record = WorkflowRecord::new("acme/widgets", 7);

        let err = run_pipeline(&git, dir, &CreditExhaustedBackend, &config, &issue(), &mut record)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CreditExhausted);
        assert_eq!(record.steps.len(), 1);
    }
}
