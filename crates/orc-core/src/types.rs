use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Issue Ref / Work Item ────────────────────────────────────────────────

/// A labeled issue on a monitored repository, as discovered by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub repository: String,
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One pipeline execution targeting one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub repository: String,
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub feature_branch: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub state: WorkItemState,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn feature_branch_for(issue_number: i64) -> String {
        format!("feature/issue-{issue_number}")
    }
}

// ── Agent / Pipeline roles ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Architect,
    Security,
    Tester,
    ProductOwner,
}

impl Role {
    pub fn branch_name(&self) -> Option<&'static str> {
        match self {
            Self::Architect => Some("architect"),
            Self::Security => Some("security"),
            Self::Tester => Some("tester"),
            Self::ProductOwner => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Security => "security",
            Self::Tester => "tester",
            Self::ProductOwner => "product_owner",
        }
    }
}

/// One decision parsed from the Product Owner's free-text output (S8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Revise,
    Reject,
}

impl Decision {
    /// Parse by case-insensitive substring match per the fixed prefixes in
    /// the pipeline spec; absence of a recognized marker defaults to `Revise`.
    pub fn parse(output: &str) -> Self {
        let lower = output.to_lowercase();
        if lower.contains("decision:approve") || lower.contains("decision: approve") {
            Self::Approve
        } else if lower.contains("decision:reject") || lower.contains("decision: reject") {
            Self::Reject
        } else {
            Self::Revise
        }
    }
}

// ── Agent Invocation / Agent Result ──────────────────────────────────────

/// Input to a single subprocess invocation (one phase attempt).
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub role: Role,
    pub task_text: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub workspace_path: String,
    pub timeout_secs: u64,
    pub attempt: u32,
}

/// Raw JSON object emitted on stdout by the code-generation subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub session_id: String,
}

/// Outcome of one Agent Invocation, after error classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub error_kind: Option<crate::error::ErrorKind>,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u64,
    pub result_text: String,
    pub raw_output: String,
}

impl AgentResult {
    pub fn ok(output: AgentOutput, raw_output: String) -> Self {
        Self {
            success: !output.is_error,
            error_kind: if output.is_error {
                Some(crate::error::ErrorKind::AgentReportedError)
            } else {
                None
            },
            cost_usd: output.total_cost_usd,
            duration_ms: output.duration_ms,
            num_turns: output.num_turns,
            result_text: output.result,
            raw_output,
        }
    }

    pub fn failed(kind: crate::error::ErrorKind, raw_output: String) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            cost_usd: 0.0,
            duration_ms: 0,
            num_turns: 0,
            result_text: String::new(),
            raw_output,
        }
    }
}

// ── Workflow Record ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Approved,
    Rejected,
    Failed,
}

/// One phase attempt archived into a Workflow Record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub role: Role,
    pub revision: u32,
    pub attempt: u32,
    pub result: AgentResult,
    pub timestamp: DateTime<Utc>,
}

/// The terminal record of one Work Item's pipeline run, emitted once as a
/// structured log event and archived as an append-only JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub issue_number: i64,
    pub repository: String,
    pub revision_count: u32,
    pub steps: Vec<WorkflowStep>,
    pub status: Option<WorkflowStatus>,
    pub pr_url: Option<String>,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn new(repository: impl Into<String>, issue_number: i64) -> Self {
        Self {
            issue_number,
            repository: repository.into(),
            revision_count: 0,
            steps: Vec::new(),
            status: None,
            pr_url: None,
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_step(&mut self, role: Role, revision: u32, attempt: u32, result: AgentResult) {
        self.total_cost_usd += result.cost_usd;
        self.total_duration_ms += result.duration_ms;
        self.steps.push(WorkflowStep {
            role,
            revision,
            attempt,
            result,
            timestamp: Utc::now(),
        });
    }

    pub fn finish(&mut self, status: WorkflowStatus, pr_url: Option<String>) {
        self.status = Some(status);
        self.pr_url = pr_url;
        self.finished_at = Some(Utc::now());
    }
}

// ── PR Entry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Pending,
    ChangesRequested,
    Approved,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "changes_requested" => Some(Self::ChangesRequested),
            "approved" => Some(Self::Approved),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrEntry {
    pub issue_number: i64,
    pub pr_number: i64,
    pub state: PrState,
    pub opened_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

// ── Worker Record ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub current_issue: Option<i64>,
    pub registered_at: DateTime<Utc>,
}
