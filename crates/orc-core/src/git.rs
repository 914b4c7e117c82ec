use std::process::Command;

use anyhow::{anyhow, Context, Result};
use regex::Regex;

use crate::error::{ErrorKind, TaskError};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Validate a branch name: `[A-Za-z0-9/_-]+` plus prohibitions on a leading
/// dot, `..`, a trailing `/`, `//`, `@{`, and shell-meta characters. Invalid
/// inputs fail fast with a descriptive error.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let pattern = Regex::new(r"^[A-Za-z0-9/_-]+$").expect("static regex is valid");
    if name.is_empty() {
        return Err(anyhow!("branch name must not be empty"));
    }
    if !pattern.is_match(name) {
        return Err(anyhow!(
            "branch name {name:?} contains characters outside [A-Za-z0-9/_-]"
        ));
    }
    if name.starts_with('.') {
        return Err(anyhow!("branch name {name:?} must not start with a dot"));
    }
    if name.contains("..") {
        return Err(anyhow!("branch name {name:?} must not contain '..'"));
    }
    if name.ends_with('/') {
        return Err(anyhow!("branch name {name:?} must not end with '/'"));
    }
    if name.contains("//") {
        return Err(anyhow!("branch name {name:?} must not contain '//'"));
    }
    if name.contains("@{") {
        return Err(anyhow!("branch name {name:?} must not contain '@{{'"));
    }
    const SHELL_META: &[char] = &[
        ';', '&', '|', '$', '`', '\\', '"', '\'', '<', '>', '(', ')', '{', '}', '*', '?', '[', ']',
        '~', '\n', ' ',
    ];
    if name.chars().any(|c| SHELL_META.contains(&c)) {
        return Err(anyhow!("branch name {name:?} contains shell-meta characters"));
    }
    Ok(())
}

/// Sanitize a commit message: strip null bytes, strip control characters
/// with code point < 32 except `\n`, cap length.
pub fn sanitize_commit_message(message: &str) -> String {
    const MAX_LEN: usize = 8192;
    let cleaned: String = message
        .chars()
        .filter(|&c| c != '\0' && (c == '\n' || c as u32 >= 32))
        .collect();
    cleaned.chars().take(MAX_LEN).collect()
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Every invocation carries `dir` explicitly as `-C <dir>`; the process's
    /// own working directory is never mutated.
    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(dir, args, &[])
    }

    pub fn exec_env(&self, dir: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn clone_repo(&self, url: &str, dir: &str) -> Result<()> {
        let parent = std::path::Path::new(dir)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let result = self.exec(&parent, &["clone", url, dir])?;
        if !result.success() {
            return Err(anyhow!("git clone {url} -> {dir} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn branch_exists(&self, dir: &str, name: &str) -> Result<bool> {
        validate_branch_name(name)?;
        let result = self.exec(dir, &["rev-parse", "--verify", "--quiet", name])?;
        Ok(result.success())
    }

    /// True iff `name` has commits not reachable from `base` (used for the
    /// post-phase commit gate).
    pub fn branch_has_commits(&self, dir: &str, name: &str, base: &str) -> Result<bool> {
        validate_branch_name(name)?;
        validate_branch_name(base)?;
        let result = self.exec(dir, &["rev-list", &format!("{base}..{name}"), "--count"])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-list {base}..{name} failed: {}",
                result.combined_output()
            ));
        }
        let count: u64 = result.stdout.trim().parse().unwrap_or(0);
        Ok(count > 0)
    }

    /// Creates `name` from `from`; fails if `name` already exists.
    pub fn create_branch(&self, dir: &str, name: &str, from: &str) -> Result<()> {
        validate_branch_name(name)?;
        validate_branch_name(from)?;
        if self.branch_exists(dir, name)? {
            return Err(anyhow!("branch {name:?} already exists"));
        }
        let result = self.exec(dir, &["branch", name, from])?;
        if !result.success() {
            return Err(anyhow!(
                "git branch {name} {from} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn checkout(&self, dir: &str, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let result = self.exec(dir, &["checkout", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git checkout {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Tolerates a nonexistent branch.
    pub fn delete_branch(&self, dir: &str, name: &str, force: bool) -> Result<()> {
        validate_branch_name(name)?;
        if !self.branch_exists(dir, name)? {
            return Ok(());
        }
        let flag = if force { "-D" } else { "-d" };
        let result = self.exec(dir, &["branch", flag, name])?;
        if !result.success() {
            return Err(anyhow!(
                "git branch {flag} {name} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Files tracked by source control on `branch` — the PO reads this list
    /// rather than scanning the raw workspace tree.
    pub fn list_files(&self, dir: &str, branch: &str) -> Result<Vec<String>> {
        validate_branch_name(branch)?;
        let result = self.exec(dir, &["ls-tree", "-r", "--name-only", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git ls-tree -r --name-only {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    /// Stages all changes and commits with a sanitized message. Returns
    /// `Ok(false)` when there was nothing to commit (no-op, not an error).
    pub fn commit_all(&self, dir: &str, message: &str, author: Option<(&str, &str)>) -> Result<bool> {
        let add = self.exec(dir, &["add", "-A"])?;
        if !add.success() {
            return Err(anyhow!("git add -A failed in {dir}: {}", add.combined_output()));
        }

        let status = self.exec(dir, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        let sanitized = sanitize_commit_message(message);
        let mut args = vec!["commit", "-m", sanitized.as_str()];
        let author_str;
        if let Some((name, email)) = author {
            author_str = format!("{name} <{email}>");
            args.push("--author");
            args.push(&author_str);
        }

        let result = self.exec(dir, &args)?;
        if !result.success() {
            return Err(anyhow!("git commit failed in {dir}: {}", result.combined_output()));
        }
        Ok(true)
    }

    /// Pushes `branch`; a non-zero exit becomes a `TaskError` carrying the
    /// captured stderr. `dir` is mandatory.
    pub fn push_branch(&self, dir: &str, branch: &str) -> std::result::Result<(), TaskError> {
        validate_branch_name(branch).map_err(|e| TaskError::new(ErrorKind::FatalStartup, e.to_string()))?;
        let result = self
            .exec(dir, &["push", "origin", branch])
            .map_err(|e| TaskError::new(ErrorKind::PushFailure, e.to_string()))?;
        if !result.success() {
            return Err(TaskError::new(ErrorKind::PushFailure, result.stderr.trim().to_string()));
        }
        Ok(())
    }

    pub fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    pub fn current_branch(&self, dir: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse --abbrev-ref HEAD failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Aborts an in-progress merge and reports whether the repository was
    /// left clean afterward.
    pub fn abort_merge(&self, dir: &str) -> Result<ExecResult> {
        self.exec(dir, &["merge", "--abort"])
    }

    pub fn rev_parse(&self, dir: &str, refname: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn fetch_origin(&self, dir: &str) -> Result<()> {
        let result = self.exec(dir, &["fetch", "origin"])?;
        if !result.success() {
            return Err(anyhow!("git fetch origin failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn reset_hard(&self, dir: &str, ref_: &str) -> Result<()> {
        let result = self.exec(dir, &["reset", "--hard", ref_])?;
        if !result.success() {
            return Err(anyhow!(
                "git reset --hard {ref_} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn set_author_config(&self, dir: &str, name: &str, email: &str) -> Result<()> {
        let name_result = self.exec(dir, &["config", "user.name", name])?;
        if !name_result.success() {
            return Err(anyhow!("git config user.name failed: {}", name_result.combined_output()));
        }
        let email_result = self.exec(dir, &["config", "user.email", email])?;
        if !email_result.success() {
            return Err(anyhow!("git config user.email failed: {}", email_result.combined_output()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_branch_name("architect").is_ok());
        assert!(validate_branch_name("feature/issue-42").is_ok());
        assert!(validate_branch_name("a_b-c/d").is_ok());
    }

    #[test]
    fn rejects_leading_dot() {
        assert!(validate_branch_name(".hidden").is_err());
    }

    #[test]
    fn rejects_dotdot() {
        assert!(validate_branch_name("foo..bar").is_err());
    }

    #[test]
    fn rejects_trailing_slash() {
        assert!(validate_branch_name("foo/").is_err());
    }

    #[test]
    fn rejects_double_slash() {
        assert!(validate_branch_name("foo//bar").is_err());
    }

    #[test]
    fn rejects_at_brace() {
        assert!(validate_branch_name("foo@{1}").is_err());
    }

    #[test]
    fn rejects_shell_meta() {
        for name in ["foo;rm -rf /", "foo$(whoami)", "foo`id`", "foo|bar"] {
            assert!(validate_branch_name(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn sanitize_strips_null_bytes() {
        let msg = sanitize_commit_message("hello\0world");
        assert!(!msg.contains('\0'));
    }

    #[test]
    fn sanitize_strips_control_chars_but_keeps_newline() {
        let msg = sanitize_commit_message("line one\nline\x07two\x01");
        assert_eq!(msg, "line one\nlinetwo");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(20_000);
        let msg = sanitize_commit_message(&long);
        assert_eq!(msg.chars().count(), 8192);
    }

    #[test]
    fn sanitize_is_noop_on_clean_message() {
        let msg = sanitize_commit_message("fix: add input validation\n\nDetails here.");
        assert_eq!(msg, "fix: add input validation\n\nDetails here.");
    }
}
