use async_trait::async_trait;
use relay_core::{RelayError, Result, RunScope, ToolCall, ToolResult};

/// The execution environment a run talks to: tool execution plus problem reporting.
///
/// Features may wrap or replace it through the environment-transforming fold.
#[async_trait]
pub trait AgentEnvironment: Send + Sync {
    async fn execute_tool(&self, scope: &RunScope, call: ToolCall) -> Result<ToolResult>;

    /// Execute calls one after another, in the given order.
    async fn execute_tools(&self, scope: &RunScope, calls: Vec<ToolCall>) -> Result<Vec<ToolResult>> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_tool(scope, call).await?);
        }
        Ok(results)
    }

    /// Report a failure that is about to end the run.
    async fn report_problem(&self, scope: &RunScope, error: &RelayError) -> Result<()>;
}
