use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;

/// `WORKFLOW.*` options.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_revisions: i64,
    pub max_agent_retries: u32,
    pub retry_backoff_base_seconds: u64,
    pub auto_merge_on_approval: bool,
    pub require_tests_passing: bool,
}

/// `CLI.*` options — the code-generation subprocess invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub bin: String,
    pub timeout_seconds: u64,
    pub allowed_tools: Vec<String>,
}

/// `REVIEW.*` options — the PR-review gate.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub max_pending_prs: u32,
    pub block_on_changes_requested: bool,
    pub allow_parallel_independent: bool,
}

/// `PLATFORM.*` options.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub pr_target_branch: String,
    pub repositories: Vec<String>,
    pub api_token: String,
    /// Path to the hosting platform's command-line client (`gh`, by default).
    pub cli_bin: String,
    /// Label the poller looks for; items carrying `in_progress_label` or
    /// `failed_label` are skipped.
    pub ready_label: String,
    pub in_progress_label: String,
    pub failed_label: String,
    pub completed_label: String,
}

/// `WORKSPACE.*` options.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root: String,
    pub max_size_mb: u64,
    pub max_file_size_mb: u64,
    pub max_files: u64,
}

/// Immutable configuration value constructed once at startup, replacing a
/// global singleton pattern. Validated as a single unit before any server
/// or poll loop begins; never mutated after construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub workflow: WorkflowConfig,
    pub cli: CliConfig,
    pub review: ReviewConfig,
    pub platform: PlatformConfig,
    pub workspace: WorkspaceConfig,

    /// `REVIEW.stale_assignment_timeout_seconds` — drives `ExpireStaleAssignments`.
    pub stale_assignment_timeout_seconds: i64,
    /// Poll interval for the Issue Poller. Default 60s.
    pub poll_interval_seconds: u64,
    /// Per-issue retry ceiling (`MaxAttempts`).
    pub max_attempts: i64,
    /// Address the orchestrator HTTP surface binds to.
    pub bind_addr: String,
    /// Forbidden path prefixes the workspace root must not resolve inside.
    pub forbidden_prefixes: Vec<String>,
}

/// Minimal `.env` parser: `KEY=VALUE` lines, `#` comments, blank lines
/// ignored. Environment variables always win over file contents.
fn parse_dotenv(path: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    map
}

struct Env(HashMap<String, String>);

impl Env {
    fn get_str(&self, key: &str, default: &str) -> String {
        std::env::var(key)
            .ok()
            .or_else(|| self.0.get(key).cloned())
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_str(key, if default { "true" } else { "false" })
            .parse()
            .unwrap_or(default)
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_str(key, &default.to_string()).parse().unwrap_or(default)
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get_str(key, &default.to_string()).parse().unwrap_or(default)
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_str(key, &default.to_string()).parse().unwrap_or(default)
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key, "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Config {
    /// Load from environment, falling back to a `.env` file in the current
    /// directory (env wins over file, matching the reference loader).
    pub fn from_env() -> Self {
        let env = Env(parse_dotenv(".env"));

        let workflow = WorkflowConfig {
            max_revisions: env.get_i64("WORKFLOW_MAX_REVISIONS", 3),
            max_agent_retries: env.get_u32("WORKFLOW_MAX_AGENT_RETRIES", 2),
            retry_backoff_base_seconds: env.get_u64("WORKFLOW_RETRY_BACKOFF_BASE_SECONDS", 5),
            auto_merge_on_approval: env.get_bool("WORKFLOW_AUTO_MERGE_ON_APPROVAL", false),
            require_tests_passing: env.get_bool("WORKFLOW_REQUIRE_TESTS_PASSING", true),
        };

        let cli = CliConfig {
            bin: env.get_str("CLI_BIN", "claude"),
            timeout_seconds: env.get_u64("CLI_TIMEOUT_SECONDS", 2400),
            allowed_tools: {
                let tools = env.get_list("CLI_ALLOWED_TOOLS");
                if tools.is_empty() {
                    vec!["Read".into(), "Glob".into(), "Grep".into(), "Write".into(), "Edit".into(), "Bash".into()]
                } else {
                    tools
                }
            },
        };

        let review = ReviewConfig {
            max_pending_prs: env.get_u32("REVIEW_MAX_PENDING_PRS", 3),
            block_on_changes_requested: env.get_bool("REVIEW_BLOCK_ON_CHANGES_REQUESTED", true),
            allow_parallel_independent: env.get_bool("REVIEW_ALLOW_PARALLEL_INDEPENDENT", false),
        };

        let platform = PlatformConfig {
            pr_target_branch: env.get_str("PLATFORM_PR_TARGET_BRANCH", "develop"),
            repositories: env.get_list("PLATFORM_REPOSITORIES"),
            api_token: env.get_str("PLATFORM_API_TOKEN", ""),
            cli_bin: env.get_str("PLATFORM_CLI_BIN", "gh"),
            ready_label: env.get_str("PLATFORM_READY_LABEL", "ready"),
            in_progress_label: env.get_str("PLATFORM_IN_PROGRESS_LABEL", "in-progress"),
            failed_label: env.get_str("PLATFORM_FAILED_LABEL", "failed"),
            completed_label: env.get_str("PLATFORM_COMPLETED_LABEL", "completed"),
        };

        let workspace = WorkspaceConfig {
            root: env.get_str("WORKSPACE_ROOT", "/var/lib/orc/workspaces"),
            max_size_mb: env.get_u64("WORKSPACE_MAX_SIZE_MB", 2048),
            max_file_size_mb: env.get_u64("WORKSPACE_MAX_FILE_SIZE_MB", 50),
            max_files: env.get_u64("WORKSPACE_MAX_FILES", 50_000),
        };

        Self {
            workflow,
            cli,
            review,
            platform,
            workspace,
            stale_assignment_timeout_seconds: env.get_i64("STALE_ASSIGNMENT_TIMEOUT_SECONDS", 1800),
            poll_interval_seconds: env.get_u64("POLL_INTERVAL_SECONDS", 60),
            max_attempts: env.get_i64("MAX_ATTEMPTS", 5),
            bind_addr: env.get_str("BIND_ADDR", "0.0.0.0:8080"),
            forbidden_prefixes: {
                let configured = env.get_list("WORKSPACE_FORBIDDEN_PREFIXES");
                if configured.is_empty() {
                    vec!["/".into(), "/etc".into(), "/usr".into(), "/bin".into(), "/sbin".into(), "/root".into()]
                } else {
                    configured
                }
            },
        }
    }

    /// Startup validation: rejects nonexistent workspace root, invalid
    /// branch names, `max_revisions < 0`, `timeout_seconds < 60`, missing
    /// credentials — one error message per violated rule, aborting the
    /// process before any background loop starts.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !Path::new(&self.workspace.root).exists() {
            errors.push(format!(
                "WORKSPACE.root does not exist: {}",
                self.workspace.root
            ));
        } else if let Ok(resolved) = std::fs::canonicalize(&self.workspace.root) {
            let resolved = resolved.to_string_lossy().to_string();
            for prefix in &self.forbidden_prefixes {
                if resolved == *prefix || resolved.starts_with(&format!("{prefix}/")) {
                    if prefix == "/" && resolved != "/" {
                        continue;
                    }
                    errors.push(format!(
                        "WORKSPACE.root resolves inside forbidden prefix {prefix}: {resolved}"
                    ));
                    break;
                }
            }
        }

        if self.workflow.max_revisions < 0 {
            errors.push(format!(
                "WORKFLOW.max_revisions must be >= 0, got {}",
                self.workflow.max_revisions
            ));
        }

        if self.cli.timeout_seconds < 60 {
            errors.push(format!(
                "CLI.timeout_seconds must be >= 60, got {}",
                self.cli.timeout_seconds
            ));
        }

        if self.workflow.auto_merge_on_approval {
            errors.push(
                "WORKFLOW.auto_merge_on_approval must be false: the single-machine \
                 auto-merge path is mutually exclusive with distributed publication"
                    .to_string(),
            );
        }

        if self.platform.api_token.is_empty() {
            errors.push("missing credential: PLATFORM_API_TOKEN".to_string());
        }

        if self.review.max_pending_prs == 0 {
            errors.push("REVIEW.max_pending_prs must be >= 1".to_string());
        }

        for branch in ["architect", "security", "tester"] {
            if let Err(e) = crate::git::validate_branch_name(branch) {
                errors.push(format!("internal fixed branch name {branch} invalid: {e}"));
            }
        }

        if !errors.is_empty() {
            return Err(anyhow!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(workspace_root: String) -> Config {
        Config {
            workflow: WorkflowConfig {
                max_revisions: 3,
                max_agent_retries: 2,
                retry_backoff_base_seconds: 5,
                auto_merge_on_approval: false,
                require_tests_passing: true,
            },
            cli: CliConfig {
                bin: "claude".to_string(),
                timeout_seconds: 2400,
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
                root: workspace_root,
                max_size_mb: 2048,
                max_file_size_mb: 50,
                max_files: 50_000,
            },
            stale_assignment_timeout_seconds: 1800,
            poll_interval_seconds: 60,
            max_attempts: 5,
            bind_addr: "0.0.0.0:8080".to_string(),
            forbidden_prefixes: vec!["/".into(), "/etc".into()],
        }
    }

    #[test]
    fn valid_config_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = base_config(dir.path().to_string_lossy().into_owned());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_nonexistent_workspace_root() {
        let mut config = base_config("/no/such/path/at/all".to_string());
        config.platform.api_token = "token".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn rejects_forbidden_workspace_root() {
        let config = base_config("/etc".to_string());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("forbidden prefix"));
    }

    #[test]
    fn rejects_auto_merge_on_approval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(dir.path().to_string_lossy().into_owned());
        config.workflow.auto_merge_on_approval = true;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("auto_merge_on_approval"));
    }

    #[test]
    fn rejects_short_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(dir.path().to_string_lossy().into_owned());
        config.cli.timeout_seconds = 10;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("timeout_seconds"));
    }

    #[test]
    fn rejects_missing_api_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(dir.path().to_string_lossy().into_owned());
        config.platform.api_token = String::new();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("PLATFORM_API_TOKEN"));
    }

    #[test]
    fn dotenv_parses_simple_assignments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "FOO=bar\n# comment\nBAZ=\"quoted\"\n\nEMPTY_LINE_ABOVE=1\n").unwrap();
        let map = parse_dotenv(env_path.to_str().unwrap());
        assert_eq!(map.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(map.get("BAZ"), Some(&"quoted".to_string()));
        assert_eq!(map.get("EMPTY_LINE_ABOVE"), Some(&"1".to_string()));
    }
}
