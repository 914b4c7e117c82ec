use async_trait::async_trait;

use crate::types::{AgentInvocation, AgentResult};

/// The Agent Supervisor's view of the code-generation subprocess. One
/// invocation is one attempt at one phase; retries are the caller's
/// responsibility, not the backend's.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, invocation: &AgentInvocation) -> AgentResult;
}
