//! The per-run context handed to workflows.
//!
//! An [`AgentContext`] is cheap to clone and always points at one position in
//! the run. Entering a node or subgraph yields a context one level deeper;
//! every event fired through it reports that position.

use relay_core::{
    ExecutionInfo, Message, Prompt, PromptExecutor, RelayError, Result, RunScope, StreamFrame,
    Tool, ToolCall, ToolResult,
};
use relay_pipeline::{AgentEnvironment, AgentPipeline, NodeRef};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::RunStateManager;
use crate::storage::AgentStorage;

#[derive(Clone)]
pub struct AgentContext {
    scope: RunScope,
    pipeline: Arc<AgentPipeline>,
    environment: Arc<dyn AgentEnvironment>,
    prompt_executor: Option<Arc<dyn PromptExecutor>>,
    model: String,
    system_prompt: Option<String>,
    tools: Arc<[Tool]>,
    storage: AgentStorage,
    state: RunStateManager,
    cancellation: CancellationToken,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scope: RunScope,
        pipeline: Arc<AgentPipeline>,
        environment: Arc<dyn AgentEnvironment>,
        prompt_executor: Option<Arc<dyn PromptExecutor>>,
        model: String,
        system_prompt: Option<String>,
        tools: Arc<[Tool]>,
        storage: AgentStorage,
        state: RunStateManager,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            scope,
            pipeline,
            environment,
            prompt_executor,
            model,
            system_prompt,
            tools,
            storage,
            state,
            cancellation,
        }
    }

    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    pub fn run_id(&self) -> &str {
        &self.scope.run_id
    }

    pub fn agent_id(&self) -> &str {
        &self.scope.agent_id
    }

    pub fn execution_info(&self) -> &Arc<ExecutionInfo> {
        &self.scope.execution_info
    }

    pub fn pipeline(&self) -> &Arc<AgentPipeline> {
        &self.pipeline
    }

    pub fn environment(&self) -> &Arc<dyn AgentEnvironment> {
        &self.environment
    }

    pub fn storage(&self) -> &AgentStorage {
        &self.storage
    }

    pub fn state(&self) -> &RunStateManager {
        &self.state
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Tools available to model calls made through this context.
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The same run, one level deeper.
    pub fn subgraph(&self, name: impl Into<String>) -> AgentContext {
        AgentContext {
            scope: self.scope.child(name),
            ..self.clone()
        }
    }

    /// Run `body` as node `name`, firing node starting, then completed or failed.
    ///
    /// `body` receives a context positioned at the node.
    pub async fn node<I, O, F, Fut>(&self, name: &str, input: I, body: F) -> Result<O>
    where
        I: Serialize + Clone + Send + Sync,
        O: Serialize + Send + Sync,
        F: FnOnce(AgentContext, I) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        let node = NodeRef::new(name);
        let ctx = self.subgraph(name);
        self.pipeline
            .on_node_starting(&ctx.scope, &node, &input)
            .await?;

        match body(ctx.clone(), input.clone()).await {
            Ok(output) => {
                self.pipeline
                    .on_node_completed(&ctx.scope, &node, &input, &output)
                    .await?;
                Ok(output)
            }
            Err(error) => {
                if let Err(e) = self
                    .pipeline
                    .on_node_execution_failed(&ctx.scope, &node, &input, &error)
                    .await
                {
                    warn!(node = name, error = %e, "node failure handler failed");
                }
                Err(error)
            }
        }
    }

    pub async fn execute_tool(&self, call: ToolCall) -> Result<ToolResult> {
        self.environment.execute_tool(&self.scope, call).await
    }

    pub async fn execute_tools(&self, calls: Vec<ToolCall>) -> Result<Vec<ToolResult>> {
        self.environment.execute_tools(&self.scope, calls).await
    }

    fn prompt_executor(&self) -> Result<&Arc<dyn PromptExecutor>> {
        self.prompt_executor
            .as_ref()
            .ok_or_else(|| RelayError::Model("no prompt executor configured".into()))
    }

    /// Send `prompt` to the configured model, firing model-call events around it.
    pub async fn call_model(&self, prompt: Prompt) -> Result<Vec<Message>> {
        let executor = self.prompt_executor()?;
        let prompt = Arc::new(prompt);
        self.pipeline
            .on_llm_call_starting(&self.scope, &prompt, &self.model, &self.tools)
            .await?;
        let responses = executor.execute(&prompt, &self.model, &self.tools).await?;
        self.pipeline
            .on_llm_call_completed(&self.scope, &prompt, &self.model, &self.tools, &responses)
            .await?;
        Ok(responses)
    }

    /// Stream a model response, firing one event per received frame.
    ///
    /// Returns every frame up to and including the end frame. An error frame,
    /// or failure to open the stream, fires streaming-failed and is returned
    /// as a model error.
    pub async fn call_model_streaming(&self, prompt: Prompt) -> Result<Vec<StreamFrame>> {
        let executor = self.prompt_executor()?;
        let prompt = Arc::new(prompt);
        self.pipeline
            .on_streaming_starting(&self.scope, &prompt, &self.model, &self.tools)
            .await?;

        let mut rx = match executor
            .execute_streaming(&prompt, &self.model, &self.tools)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.pipeline
                    .on_streaming_failed(&self.scope, &prompt, &self.model, &e)
                    .await?;
                return Err(e);
            }
        };

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            self.pipeline
                .on_stream_frame_received(&self.scope, &prompt, &self.model, &frame)
                .await?;
            match frame {
                StreamFrame::Error { message } => {
                    let error = RelayError::Model(message);
                    self.pipeline
                        .on_streaming_failed(&self.scope, &prompt, &self.model, &error)
                        .await?;
                    return Err(error);
                }
                StreamFrame::End { .. } => {
                    frames.push(frame);
                    break;
                }
                frame => frames.push(frame),
            }
        }
        debug!(frames = frames.len(), "model stream finished");

        self.pipeline
            .on_streaming_completed(&self.scope, &prompt, &self.model)
            .await?;
        Ok(frames)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("run_id", &self.scope.run_id)
            .field("path", &self.scope.path())
            .field("model", &self.model)
            .finish()
    }
}
