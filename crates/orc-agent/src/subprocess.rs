use std::process::Stdio;

use async_trait::async_trait;
use orc_core::agent::AgentBackend;
use orc_core::error::ErrorKind;
use orc_core::types::{AgentInvocation, AgentOutput, AgentResult};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Known phrases the code-generation subprocess emits on its stdout/stderr
/// when the underlying account has run out of credit. Checked before any
/// other error classification so it is never mistaken for a generic agent
/// failure.
const CREDIT_EXHAUSTED_MARKERS: &[&str] = &[
    "credit balance is too low",
    "insufficient credit",
    "credit_exhausted",
];

/// Runs the configured code-generation CLI as a subprocess. The binary is
/// opaque: one JSON object on stdout, a tool allowlist, the workspace as
/// `cwd`, no other side channel.
pub struct SubprocessBackend {
    pub bin: String,
}

impl SubprocessBackend {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl AgentBackend for SubprocessBackend {
    async fn invoke(&self, invocation: &AgentInvocation) -> AgentResult {
        let allowed_tools = invocation.allowed_tools.join(",");

        info!(
            role = invocation.role.as_str(),
            attempt = invocation.attempt,
            workspace = %invocation.workspace_path,
            "spawning agent subprocess"
        );

        let mut cmd = Command::new(&self.bin);
        cmd.current_dir(&invocation.workspace_path)
            .arg("--system-prompt")
            .arg(&invocation.system_prompt)
            .arg("--allowed-tools")
            .arg(&allowed_tools)
            .arg("--print")
            .arg(&invocation.task_text)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentResult::failed(ErrorKind::NonZeroExit, format!("failed to spawn agent subprocess: {e}"))
            }
        };

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let io_future = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (stdout_res, stderr_res, wait_res) = tokio::join!(
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
                child.wait(),
            );
            stdout_res?;
            stderr_res?;
            let status = wait_res?;
            anyhow::Ok((out, err, status.success()))
        };

        let timeout = std::time::Duration::from_secs(invocation.timeout_secs);
        let (stdout_bytes, stderr_bytes, success) = match tokio::time::timeout(timeout, io_future).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return AgentResult::failed(ErrorKind::NonZeroExit, e.to_string()),
            Err(_elapsed) => {
                warn!(role = invocation.role.as_str(), timeout_secs = invocation.timeout_secs, "agent subprocess timed out");
                return AgentResult::failed(ErrorKind::Timeout, format!("timed out after {}s", invocation.timeout_secs));
            }
        };

        let stdout_text = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();
        let combined = format!("{stdout_text}\n{stderr_text}");
        let raw = format!("stdout:\n{stdout_text}\nstderr:\n{stderr_text}");

        if is_credit_exhausted(&combined) {
            return AgentResult::failed(ErrorKind::CreditExhausted, raw);
        }

        if !success {
            return AgentResult::failed(ErrorKind::NonZeroExit, raw);
        }

        match serde_json::from_str::<AgentOutput>(stdout_text.trim()) {
            Ok(output) => {
                info!(
                    role = invocation.role.as_str(),
                    is_error = output.is_error,
                    duration_ms = output.duration_ms,
                    "agent subprocess finished"
                );
                AgentResult::ok(output, raw)
            }
            Err(e) => {
                warn!(role = invocation.role.as_str(), error = %e, "agent stdout was not a parseable result object");
                AgentResult::failed(ErrorKind::AgentOutputMalformed, raw)
            }
        }
    }
}

fn is_credit_exhausted(text: &str) -> bool {
    let lower = text.to_lowercase();
    CREDIT_EXHAUSTED_MARKERS.iter().any(|marker| lower.contains(marker))
}
