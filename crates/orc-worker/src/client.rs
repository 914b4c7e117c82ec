use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Thin wrapper over the orchestrator's HTTP control surface. The
/// worker never touches the queue store directly — every assignment,
/// heartbeat, and outcome report crosses this client.
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NextWork {
    Available(WorkPayload),
    Blocked { reason: String },
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkPayload {
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub branch_name: String,
    pub repository: String,
}

/// Manual deserialization: the three shapes the `/work/next` response can
/// take differ only by which keys are present, so `#[serde(untagged)]` alone
/// would accept a `{work_available:false}` body as `None` before ever
/// trying `Blocked` — but untagged also accepts the reverse order depending
/// on field layout, which is fragile. We parse the raw JSON explicitly.
impl NextWork {
    fn from_value(value: serde_json::Value) -> Result<Self> {
        let work_available = value.get("work_available").and_then(|v| v.as_bool()).unwrap_or(false);
        if work_available {
            let payload: WorkPayload = serde_json::from_value(value).context("parsing work payload")?;
            return Ok(Self::Available(payload));
        }
        if value.get("blocked").and_then(|v| v.as_bool()).unwrap_or(false) {
            let reason = value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("blocked")
                .to_string();
            return Ok(Self::Blocked { reason });
        }
        Ok(Self::None)
    }
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn next_work(&self, worker_id: &str) -> Result<NextWork> {
        let url = format!("{}/work/next", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("worker_id", worker_id)])
            .send()
            .await
            .context("GET /work/next")?
            .error_for_status()
            .context("/work/next returned an error status")?;
        let value: serde_json::Value = resp.json().await.context("parsing /work/next body")?;
        NextWork::from_value(value)
    }

    pub async fn heartbeat(&self, worker_id: &str, current_issue: Option<i64>) -> Result<()> {
        let url = format!("{}/workers/heartbeat", self.base_url);
        self.http
            .post(&url)
            .json(&json!({ "worker_id": worker_id, "current_issue": current_issue }))
            .send()
            .await
            .context("POST /workers/heartbeat")?
            .error_for_status()
            .context("/workers/heartbeat returned an error status")?;
        Ok(())
    }

    pub async fn report_success(
        &self,
        worker_id: &str,
        issue_number: i64,
        pr_number: Option<i64>,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/work/complete", self.base_url);
        self.http
            .post(&url)
            .json(&json!({
                "worker_id": worker_id,
                "issue_number": issue_number,
                "pr_number": pr_number,
                "pr_url": pr_url,
                "success": true,
            }))
            .send()
            .await
            .context("POST /work/complete")?
            .error_for_status()
            .context("/work/complete returned an error status")?;
        Ok(())
    }

    pub async fn report_failure(
        &self,
        worker_id: &str,
        issue_number: i64,
        kind: &str,
        detail: &str,
    ) -> Result<()> {
        let url = format!("{}/work/failed", self.base_url);
        self.http
            .post(&url)
            .json(&json!({
                "worker_id": worker_id,
                "issue_number": issue_number,
                "error": detail,
                "kind": kind,
            }))
            .send()
            .await
            .context("POST /work/failed")?
            .error_for_status()
            .context("/work/failed returned an error status")?;
        Ok(())
    }
}

/// A JSON-serializable summary of a completed or failed pipeline run, used
/// only for the worker's own structured log line — not sent to the
/// orchestrator, which gets the flattened fields above.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub issue_number: i64,
    pub outcome: &'a str,
    pub revision_count: u32,
    pub total_cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_available_payload() {
        let value = json!({
            "work_available": true,
            "issue_number": 42,
            "title": "t",
            "body": "b",
            "labels": ["ready"],
            "branch_name": "feature/issue-42",
            "repository": "acme/widgets",
        });
        match NextWork::from_value(value).unwrap() {
            NextWork::Available(p) => assert_eq!(p.issue_number, 42),
            other => panic!("expected Available, got {other:?}"),
        }
    }

    #[test]
    fn parses_blocked() {
        let value = json!({ "work_available": false, "blocked": true, "reason": "too many pending PRs: #1" });
        match NextWork::from_value(value).unwrap() {
            NextWork::Blocked { reason } => assert!(reason.contains("#1")),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn parses_empty() {
        let value = json!({ "work_available": false });
        assert!(matches!(NextWork::from_value(value).unwrap(), NextWork::None));
    }
}
