use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Resolves the per-issue workspace path and rejects it if it
/// resolves inside a configured-forbidden prefix. A path under a temporary
/// root is allowed but logged by the caller as a warning, not rejected here
/// — this function only enforces the hard invariant.
pub fn resolve_workspace_path(root: &str, issue_number: i64, forbidden_prefixes: &[String]) -> Result<PathBuf> {
    let candidate = Path::new(root).join(format!("issue-{issue_number}"));

    let parent = candidate.parent().unwrap_or(Path::new(root));
    std::fs::create_dir_all(parent)
        .map_err(|e| anyhow!("failed to create workspace parent {}: {e}", parent.display()))?;

    let resolved = if candidate.exists() {
        std::fs::canonicalize(&candidate)?
    } else {
        std::fs::canonicalize(parent)?.join(format!("issue-{issue_number}"))
    };

    let resolved_str = resolved.to_string_lossy().to_string();
    for prefix in forbidden_prefixes {
        let is_root_prefix = prefix == "/";
        let inside = resolved_str == *prefix || resolved_str.starts_with(&format!("{prefix}/"));
        if inside && !(is_root_prefix && resolved_str == "/") {
            return Err(anyhow!(
                "workspace path {resolved_str} resolves inside forbidden prefix {prefix}"
            ));
        }
    }

    Ok(resolved)
}

/// True iff the workspace root is under a system temp directory — surfaced
/// by the caller as a warning, never a hard rejection.
pub fn is_temporary_root(root: &str) -> bool {
    root.starts_with("/tmp") || root.starts_with("/var/tmp") || root.starts_with(std::env::temp_dir().to_string_lossy().as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_path_outside_forbidden_prefixes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_string_lossy().into_owned();
        let resolved = resolve_workspace_path(&root, 42, &["/etc".to_string()]).expect("resolve");
        assert!(resolved.to_string_lossy().contains("issue-42"));
    }

    #[test]
    fn rejects_forbidden_prefix() {
        let result = resolve_workspace_path("/etc", 1, &["/etc".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_temporary_root() {
        assert!(is_temporary_root("/tmp/orc-workspaces"));
    }
}
