use orc_core::config::Config;
use orc_core::error::ErrorKind;
use orc_core::git::Git;
use orc_core::platform::HostingPlatform;
use orc_core::types::{IssueRef, WorkItem};
use tracing::info;

use crate::pipeline::PipelineFailure;

pub struct PublishResult {
    pub pr_number: i64,
    pub pr_url: String,
    pub base_branch: String,
}

fn task_error(kind: ErrorKind, detail: impl Into<String>) -> PipelineFailure {
    PipelineFailure { kind, detail: detail.into() }
}

/// S9: cuts the feature branch from `tester`, pushes it, and opens a pull
/// request against the best available base branch. Never merges to `main`
/// — that is reserved for human review.
pub async fn publish(
    git: &Git,
    dir: &str,
    platform: &dyn HostingPlatform,
    config: &Config,
    issue: &IssueRef,
) -> Result<PublishResult, PipelineFailure> {
    let feature_branch = WorkItem::feature_branch_for(issue.issue_number);

    git.checkout(dir, "tester")
        .map_err(|e| task_error(ErrorKind::TransientExternal, e.to_string()))?;
    git.delete_branch(dir, &feature_branch, true)
        .map_err(|e| task_error(ErrorKind::TransientExternal, e.to_string()))?;
    git.create_branch(dir, &feature_branch, "tester")
        .map_err(|e| task_error(ErrorKind::TransientExternal, e.to_string()))?;
    git.checkout(dir, &feature_branch)
        .map_err(|e| task_error(ErrorKind::TransientExternal, e.to_string()))?;

    git.push_branch(dir, &feature_branch)
        .map_err(|e| task_error(e.kind, e.detail))?;

    let base_branch = resolve_base_branch(platform, config, issue);

    let title = format!("Issue #{}: {}", issue.issue_number, issue.title);
    let body = format!(
        "Closes #{}\n\nAutomated change produced by the Architect \u{2192} Security \u{2192} Tester \u{2192} Product Owner pipeline.",
        issue.issue_number
    );

    let pr_number = platform
        .open_pull_request(&issue.repository, &title, &feature_branch, &base_branch, &body)
        .map_err(|e| task_error(ErrorKind::TransientExternal, e.to_string()))?;

    let pr_url = format!("https://github.com/{}/pull/{}", issue.repository, pr_number);
    info!(issue_number = issue.issue_number, pr_number, base_branch = %base_branch, "opened pull request");

    Ok(PublishResult { pr_number, pr_url, base_branch })
}

/// Prefers the configured pre-production branch; if it does not exist on
/// the remote, falls back to `main` (dynamic, logged at publication time).
fn resolve_base_branch(platform: &dyn HostingPlatform, config: &Config, issue: &IssueRef) -> String {
    let preferred = &config.platform.pr_target_branch;
    match platform.remote_branch_exists(&issue.repository, preferred) {
        Ok(true) => preferred.clone(),
        Ok(false) => {
            info!(
                preferred = %preferred,
                "configured PR target branch not found on remote, falling back to main"
            );
            "main".to_string()
        }
        Err(e) => {
            info!(preferred = %preferred, error = %e, "could not check remote branch, falling back to main");
            "main".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::platform::RemoteIssue;
    use std::sync::Mutex;

    struct FakePlatform {
        exists: bool,
        opened: Mutex<Vec<(String, String, String)>>,
    }

    impl HostingPlatform for FakePlatform {
        fn list_issues_with_label(&self, _repository: &str, _label: &str) -> anyhow::Result<Vec<RemoteIssue>> {
            Ok(vec![])
        }
        fn add_label(&self, _repository: &str, _issue_number: i64, _label: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn remove_label(&self, _repository: &str, _issue_number: i64, _label: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn post_comment(&self, _repository: &str, _issue_number: i64, _body: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn close_issue(&self, _repository: &str, _issue_number: i64) -> anyhow::Result<()> {
            Ok(())
        }
        fn remote_branch_exists(&self, _repository: &str, _branch: &str) -> anyhow::Result<bool> {
            Ok(self.exists)
        }
        fn open_pull_request(
            &self,
            repository: &str,
            title: &str,
            head_branch: &str,
            base_branch: &str,
            _body: &str,
        ) -> anyhow::Result<i64> {
            self.opened.lock().unwrap().push((repository.to_string(), head_branch.to_string(), base_branch.to_string()));
            Ok(101)
        }
    }

    fn config() -> Config {
        use orc_core::config::{CliConfig, PlatformConfig, ReviewConfig, WorkflowConfig, WorkspaceConfig};
        Config {
            workflow: WorkflowConfig {
                max_revisions: 3,
                max_agent_retries: 2,
                retry_backoff_base_seconds: 5,
                auto_merge_on_approval: false,
                require_tests_passing: true,
            },
            cli: CliConfig { bin: "claude".to_string(), timeout_seconds: 60, allowed_tools: vec![] },
            review: ReviewConfig { max_pending_prs: 3, block_on_changes_requested: true, allow_parallel_independent: false },
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
            workspace: WorkspaceConfig { root: "/tmp".to_string(), max_size_mb: 1024, max_file_size_mb: 50, max_files: 1000 },
            stale_assignment_timeout_seconds: 1800,
            poll_interval_seconds: 60,
            max_attempts: 5,
            bind_addr: "0.0.0.0:8080".to_string(),
            forbidden_prefixes: vec![],
        }
    }

    fn issue() -> IssueRef {
        IssueRef {
            repository: "acme/widgets".to_string(),
            issue_number: 42,
            title: "Fix it".to_string(),
            body: "body".to_string(),
            labels: vec![],
        }
    }

    #[test]
    fn uses_preferred_base_branch_when_present() {
        let platform = FakePlatform { exists: true, opened: Mutex::new(vec![]) };
        let base = resolve_base_branch(&platform, &config(), &issue());
        assert_eq!(base, "develop");
    }

    #[test]
    fn falls_back_to_main_when_preferred_absent() {
        let platform = FakePlatform { exists: false, opened: Mutex::new(vec![]) };
        let base = resolve_base_branch(&platform, &config(), &issue());
        assert_eq!(base, "main");
    }
}
