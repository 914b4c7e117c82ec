use orc_core::types::{IssueRef, Role};

/// Role-specific system prompts. The subprocess is opaque; these
/// strings are the only lever the pipeline has over what each phase does.
pub fn system_prompt(role: Role) -> &'static str {
    match role {
        Role::Architect => {
            "You are the Architect. Read the issue and design and implement the \
             change on the current branch. Commit your work with a descriptive \
             message. Do not add tests or security hardening beyond what the \
             issue requires; later phases will cover that."
        }
        Role::Security => {
            "You are the Security reviewer. Inspect the changes on the current \
             branch for vulnerabilities (injection, unsafe deserialization, \
             secret handling, path traversal) and fix what you find. Commit \
             your fixes with a descriptive message. If nothing needs fixing, \
             make the smallest possible hardening commit you can justify."
        }
        Role::Tester => {
            "You are the Tester. Write and run tests for the change on the \
             current branch, fixing any bugs the tests reveal. Commit the \
             tests and any fixes with a descriptive message."
        }
        Role::ProductOwner => {
            "You are the Product Owner. Review the tracked files on the current \
             branch against the original issue. Respond with a line starting \
             `DECISION:APPROVE`, `DECISION:REVISE`, or `DECISION:REJECT`, \
             followed by a short rationale. Use REVISE when the implementation \
             is close but needs changes; REJECT when the approach is wrong; \
             APPROVE when it satisfies the issue."
        }
    }
}

/// Builds the initial task text for the Architect's first pass (revision 0).
pub fn initial_task_text(issue: &IssueRef) -> String {
    format!(
        "Issue #{}: {}\n\n{}",
        issue.issue_number, issue.title, issue.body
    )
}

/// Appends the Product Owner's REVISE feedback to the task text carried
/// into the next revision's Architect invocation.
pub fn with_revision_feedback(task_text: &str, feedback: &str) -> String {
    format!(
        "{task_text}\n\n--- Product Owner feedback (revision) ---\n{}",
        feedback.trim()
    )
}

/// Task text for the Product Owner phase: the original issue plus the list
/// of source-control-tracked files, never a raw filesystem scan.
pub fn po_review_task_text(issue: &IssueRef, tracked_files: &[String]) -> String {
    let listing = if tracked_files.is_empty() {
        "(no tracked files)".to_string()
    } else {
        tracked_files.join("\n")
    };
    format!(
        "Issue #{}: {}\n\n{}\n\nTracked files on this branch:\n{listing}",
        issue.issue_number, issue.title, issue.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> IssueRef {
        IssueRef {
            repository: "acme/widgets".to_string(),
            issue_number: 42,
            title: "Add input validation".to_string(),
            body: "Validate the form fields.".to_string(),
            labels: vec!["ready".to_string()],
        }
    }

    #[test]
    fn initial_task_text_includes_issue_number_and_title() {
        let text = initial_task_text(&issue());
        assert!(text.contains("#42"));
        assert!(text.contains("Add input validation"));
    }

    #[test]
    fn revision_feedback_is_appended_not_replaced() {
        let base = initial_task_text(&issue());
        let revised = with_revision_feedback(&base, "add input validation");
        assert!(revised.starts_with(&base));
        assert!(revised.contains("add input validation"));
    }

    #[test]
    fn po_review_lists_tracked_files() {
        let text = po_review_task_text(&issue(), &["src/lib.rs".to_string(), "tests/a.rs".to_string()]);
        assert!(text.contains("src/lib.rs"));
        assert!(text.contains("tests/a.rs"));
    }

    #[test]
    fn po_review_handles_empty_file_list() {
        let text = po_review_task_text(&issue(), &[]);
        assert!(text.contains("no tracked files"));
    }
}
