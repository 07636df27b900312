use async_trait::async_trait;
use relay_core::{RelayError, Result, RunScope, ToolCall, ToolResult};
use relay_pipeline::{AgentEnvironment, AgentPipeline};
use std::sync::Arc;
use tracing::{debug, error};

use crate::tools::ToolRegistry;

/// The default environment: executes registry tools and fires tool events.
///
/// Tool-level failures (unknown tool, invalid arguments, executor errors) are
/// returned as error results so the workflow can react; only handler errors
/// propagate.
pub struct ToolEnvironment {
    registry: Arc<ToolRegistry>,
    pipeline: Arc<AgentPipeline>,
}

impl ToolEnvironment {
    pub fn new(registry: Arc<ToolRegistry>, pipeline: Arc<AgentPipeline>) -> Self {
        Self { registry, pipeline }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl AgentEnvironment for ToolEnvironment {
    async fn execute_tool(&self, scope: &RunScope, call: ToolCall) -> Result<ToolResult> {
        self.pipeline.on_tool_call_starting(scope, &call).await?;

        let Some((tool, executor)) = self.registry.resolve(&call.tool_name) else {
            let message = RelayError::ToolNotFound(call.tool_name.clone()).to_string();
            self.pipeline.on_tool_call_failed(scope, &call, &message).await?;
            return Ok(ToolResult::failure(&call, message));
        };

        if let Err(reason) = tool.validate_arguments(&call.arguments) {
            debug!(tool = %call.tool_name, %reason, "tool arguments rejected");
            self.pipeline
                .on_tool_validation_failed(scope, &call, &reason)
                .await?;
            return Ok(ToolResult::failure(&call, reason));
        }

        debug!(tool = %call.tool_name, path = %scope.path(), "executing tool");
        match executor.execute(&call).await {
            Ok(result) if result.is_error => {
                self.pipeline
                    .on_tool_call_failed(scope, &call, &result.content)
                    .await?;
                Ok(result)
            }
            Ok(result) => {
                self.pipeline
                    .on_tool_call_completed(scope, &call, &result)
                    .await?;
                Ok(result)
            }
            Err(e) => {
                let message = RelayError::ToolExecution {
                    tool: call.tool_name.clone(),
                    reason: e.to_string(),
                }
                .to_string();
                self.pipeline.on_tool_call_failed(scope, &call, &message).await?;
                Ok(ToolResult::failure(&call, message))
            }
        }
    }

    async fn report_problem(&self, scope: &RunScope, problem: &RelayError) -> Result<()> {
        error!(
            agent_id = %scope.agent_id,
            run_id = %scope.run_id,
            path = %scope.path(),
            error = %problem,
            "agent run reported a problem"
        );
        Ok(())
    }
}
