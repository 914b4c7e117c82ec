use orc_core::config::ReviewConfig;

/// Pure blocking decision for the PR-review gate. Takes the counts
/// the tracker already maintains and returns whether the queue is blocked
/// plus a human-readable reason, never touching the database itself so it
/// stays unit-testable without a store.
pub fn queue_blocked(
    review: &ReviewConfig,
    pending_pr_numbers: &[i64],
    changes_requested_pr_numbers: &[i64],
) -> (bool, Option<String>) {
    if review.block_on_changes_requested && !changes_requested_pr_numbers.is_empty() {
        let listed = format_pr_list(changes_requested_pr_numbers);
        return (true, Some(format!("changes requested on PRs: {listed}")));
    }

    if pending_pr_numbers.len() as u32 >= review.max_pending_prs {
        let listed = format_pr_list(pending_pr_numbers);
        return (true, Some(format!("too many pending PRs: {listed}")));
    }

    (false, None)
}

fn format_pr_list(numbers: &[i64]) -> String {
    numbers.iter().map(|n| format!("#{n}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(max_pending_prs: u32, block_on_changes_requested: bool) -> ReviewConfig {
        ReviewConfig {
            max_pending_prs,
            block_on_changes_requested,
            allow_parallel_independent: false,
        }
    }

    #[test]
    fn unblocked_below_threshold() {
        let (blocked, reason) = queue_blocked(&review(3, true), &[1, 2], &[]);
        assert!(!blocked);
        assert!(reason.is_none());
    }

    #[test]
    fn blocked_at_threshold() {
        let (blocked, reason) = queue_blocked(&review(2, true), &[1, 2], &[]);
        assert!(blocked);
        assert!(reason.unwrap().contains("#1"));
    }

    #[test]
    fn blocked_on_changes_requested_regardless_of_count() {
        let (blocked, reason) = queue_blocked(&review(5, true), &[1], &[7]);
        assert!(blocked);
        assert_eq!(reason.unwrap(), "changes requested on PRs: #7");
    }

    #[test]
    fn changes_requested_ignored_when_disabled() {
        let (blocked, _) = queue_blocked(&review(5, false), &[1], &[7]);
        assert!(!blocked);
    }
}
