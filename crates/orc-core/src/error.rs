use serde::{Deserialize, Serialize};

/// Closed error taxonomy. Replaces a dynamic-dispatch catch-all with a fixed
/// set of variants; this is the only shape that crosses the
/// worker/orchestrator HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credit balance exhausted on the code-generation subprocess. Never
    /// retried locally; the worker returns the item without incrementing
    /// attempt and cools down before resuming polling.
    #[error("credit exhausted")]
    CreditExhausted,
    /// Wall-clock timeout on an agent invocation.
    #[error("agent invocation timed out")]
    Timeout,
    /// Subprocess exited non-zero.
    #[error("agent subprocess exited non-zero")]
    NonZeroExit,
    /// Zero exit but stdout was not a parseable result object.
    #[error("agent output malformed")]
    AgentOutputMalformed,
    /// Parsed output with `is_error=true`.
    #[error("agent reported an error")]
    AgentReportedError,
    /// A phase produced zero commits beyond its parent branch.
    #[error("phase produced no commits")]
    SilentPhaseFailure,
    /// Source-control push failed; stderr is carried in the detail string.
    #[error("push failed")]
    PushFailure,
    /// Network/API-level failure external to the agent and source control.
    #[error("transient external failure")]
    TransientExternal,
    /// Config/startup error; the process must abort before serving traffic.
    #[error("fatal startup error")]
    FatalStartup,
}

impl ErrorKind {
    /// Retriable: retried up to `MaxAgentRetries` with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::NonZeroExit
                | Self::AgentOutputMalformed
                | Self::AgentReportedError
                | Self::PushFailure
        )
    }

    /// Transient: the Work Item returns to pending with attempt unchanged
    /// rather than incremented.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CreditExhausted | Self::TransientExternal)
    }
}

/// An error paired with a human detail string, the shape that crosses the
/// worker/orchestrator boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for TaskError {}

pub type Result<T> = anyhow::Result<T>;
