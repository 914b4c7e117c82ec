use std::process::Command;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Treated as an external collaborator: list issues by label,
/// add/remove labels, post a comment, close an issue, open a pull request,
/// check whether a branch exists on the remote. Both the Issue Poller and
/// the worker's Publisher depend on this surface.
pub trait HostingPlatform: Send + Sync {
    fn list_issues_with_label(&self, repository: &str, label: &str) -> Result<Vec<RemoteIssue>>;
    fn add_label(&self, repository: &str, issue_number: i64, label: &str) -> Result<()>;
    fn remove_label(&self, repository: &str, issue_number: i64, label: &str) -> Result<()>;
    fn post_comment(&self, repository: &str, issue_number: i64, body: &str) -> Result<()>;
    fn close_issue(&self, repository: &str, issue_number: i64) -> Result<()>;
    fn remote_branch_exists(&self, repository: &str, branch: &str) -> Result<bool>;
    fn open_pull_request(
        &self,
        repository: &str,
        title: &str,
        head_branch: &str,
        base_branch: &str,
        body: &str,
    ) -> Result<i64>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteIssue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<RemoteLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLabel {
    pub name: String,
}

impl RemoteIssue {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

/// Shells out to the hosting platform's command-line client (`gh`, by
/// default), the same `-C`-style explicit-directory pattern the source
/// control wrapper uses: every argument is passed on the command line, never
/// via shell interpolation.
pub struct CliPlatform {
    pub bin: String,
}

impl CliPlatform {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn {} {}", self.bin, args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed: {}",
                self.bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl HostingPlatform for CliPlatform {
    fn list_issues_with_label(&self, repository: &str, label: &str) -> Result<Vec<RemoteIssue>> {
        let stdout = self.run(&[
            "issue", "list",
            "--repo", repository,
            "--label", label,
            "--state", "open",
            "--json", "number,title,body,labels",
        ])?;
        serde_json::from_str(&stdout).context("failed to parse issue list JSON")
    }

    fn add_label(&self, repository: &str, issue_number: i64, label: &str) -> Result<()> {
        self.run(&[
            "issue", "edit", &issue_number.to_string(),
            "--repo", repository,
            "--add-label", label,
        ])?;
        Ok(())
    }

    fn remove_label(&self, repository: &str, issue_number: i64, label: &str) -> Result<()> {
        self.run(&[
            "issue", "edit", &issue_number.to_string(),
            "--repo", repository,
            "--remove-label", label,
        ])?;
        Ok(())
    }

    fn post_comment(&self, repository: &str, issue_number: i64, body: &str) -> Result<()> {
        self.run(&[
            "issue", "comment", &issue_number.to_string(),
            "--repo", repository,
            "--body", body,
        ])?;
        Ok(())
    }

    fn close_issue(&self, repository: &str, issue_number: i64) -> Result<()> {
        self.run(&[
            "issue", "close", &issue_number.to_string(),
            "--repo", repository,
        ])?;
        Ok(())
    }

    fn remote_branch_exists(&self, repository: &str, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let result = Command::new("git")
            .args(["ls-remote", "--exit-code", &format!("https://github.com/{repository}"), &refname])
            .output()
            .context("failed to spawn git ls-remote")?;
        Ok(result.status.success())
    }

    fn open_pull_request(
        &self,
        repository: &str,
        title: &str,
        head_branch: &str,
        base_branch: &str,
        body: &str,
    ) -> Result<i64> {
        let stdout = self.run(&[
            "pr", "create",
            "--repo", repository,
            "--title", title,
            "--head", head_branch,
            "--base", base_branch,
            "--body", body,
        ])?;
        let url = stdout.trim().lines().last().unwrap_or_default();
        url.rsplit('/')
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| anyhow!("could not parse PR number from gh output: {url:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_issue_collects_label_names() {
        let issue = RemoteIssue {
            number: 1,
            title: "t".to_string(),
            body: "b".to_string(),
            labels: vec![RemoteLabel { name: "ready".to_string() }, RemoteLabel { name: "bug".to_string() }],
        };
        assert_eq!(issue.label_names(), vec!["ready".to_string(), "bug".to_string()]);
    }
}
