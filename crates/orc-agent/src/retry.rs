use orc_core::agent::AgentBackend;
use orc_core::types::{AgentInvocation, AgentResult};
use tracing::warn;

/// Invokes `backend` up to `max_retries + 1` times with exponential backoff
/// (`base * 2^(attempt-1)`). Stops immediately on success, on a
/// transient error (propagated as-is so the worker main loop can back off
/// and resume rather than burn retries), or once retries are exhausted.
pub async fn invoke_with_backoff(
    backend: &dyn AgentBackend,
    invocation: &AgentInvocation,
    max_retries: u32,
    backoff_base_seconds: u64,
) -> AgentResult {
    let mut attempt = 1;
    loop {
        let mut this_attempt = invocation.clone();
        this_attempt.attempt = attempt;
        let result = backend.invoke(&this_attempt).await;

        if result.success {
            return result;
        }

        let Some(kind) = result.error_kind else {
            return result;
        };

        if kind.is_transient() {
            return result;
        }

        if !kind.is_retriable() || attempt > max_retries {
            return result;
        }

        let backoff = backoff_base_seconds.saturating_mul(1u64 << (attempt - 1));
        warn!(
            role = invocation.role.as_str(),
            attempt,
            max_retries,
            backoff_seconds = backoff,
            ?kind,
            "agent invocation failed, retrying after backoff"
        );
        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orc_core::error::ErrorKind;
    use orc_core::types::Role;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentBackend for FlakyBackend {
        async fn invoke(&self, _invocation: &AgentInvocation) -> AgentResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                AgentResult::failed(ErrorKind::NonZeroExit, "boom".to_string())
            } else {
                AgentResult::ok(Default::default(), "ok".to_string())
            }
        }
    }

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            role: Role::Architect,
            task_text: "do the thing".to_string(),
            system_prompt: "you are an architect".to_string(),
            allowed_tools: vec!["Read".to_string()],
            workspace_path: "/tmp/ws".to_string(),
            timeout_secs: 60,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn succeeds_after_retriable_failures() {
        let backend = FlakyBackend { fail_times: 2, calls: AtomicU32::new(0) };
        let result = invoke_with_backoff(&backend, &invocation(), 3, 0).await;
        assert!(result.success);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let backend = FlakyBackend { fail_times: 10, calls: AtomicU32::new(0) };
        let result = invoke_with_backoff(&backend, &invocation(), 2, 0).await;
        assert!(!result.success);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failure_short_circuits_retries() {
        struct AlwaysTransient;
        #[async_trait]
        impl AgentBackend for AlwaysTransient {
            async fn invoke(&self, _invocation: &AgentInvocation) -> AgentResult {
                AgentResult::failed(ErrorKind::CreditExhausted, "no credit".to_string())
            }
        }
        let backend = AlwaysTransient;
        let result = invoke_with_backoff(&backend, &invocation(), 5, 0).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::CreditExhausted));
    }
}
