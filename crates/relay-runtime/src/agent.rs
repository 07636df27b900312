use parking_lot::Mutex;
use relay_config::RelayConfig;
use relay_core::{
    AgentId, ExecutionInfo, PromptExecutor, Result, RunScope, Tool, ToolExecutor, new_run_id,
};
use relay_pipeline::{AgentEnvironment, AgentPipeline, Feature, FeatureKey};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::concurrency::RunGuard;
use crate::environment::ToolEnvironment;
use crate::session::{AgentRunState, RunSession};
use crate::strategy::WorkflowExecutor;
use crate::tools::ToolRegistry;

pub const DEFAULT_AGENT_ID: &str = "relay-agent";
pub const DEFAULT_MODEL: &str = "mock/echo";

/// An agent: a workflow plus the pipeline of features observing it.
///
/// Features are installed through [`AgentBuilder`] and fixed once the agent is
/// built. One instance accepts at most one run at a time.
pub struct Agent<W: WorkflowExecutor> {
    id: AgentId,
    model: String,
    system_prompt: Option<String>,
    workflow: Arc<W>,
    pipeline: Arc<AgentPipeline>,
    tools: Arc<[Tool]>,
    environment: Arc<dyn AgentEnvironment>,
    prompt_executor: Option<Arc<dyn PromptExecutor>>,
    resource_concurrency: usize,
    path_separator: String,
    guard: RunGuard,
}

impl<W: WorkflowExecutor> Agent<W> {
    pub fn builder(workflow: W) -> AgentBuilder<W> {
        AgentBuilder::new(workflow)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pipeline(&self) -> &Arc<AgentPipeline> {
        &self.pipeline
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// The retained implementation of an installed feature.
    pub fn feature<T: Send + Sync + 'static>(&self, key: &FeatureKey) -> Option<Arc<T>> {
        self.pipeline.feature::<T>(key)
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// State of the most recent run, `NotStarted` if there was none.
    pub fn last_run_state(&self) -> AgentRunState {
        self.guard
            .latest()
            .map_or(AgentRunState::NotStarted, |state| state.current())
    }

    /// Run the workflow on `input`.
    pub async fn run(&self, input: W::Input) -> Result<W::Output> {
        self.run_with_cancellation(input, CancellationToken::new())
            .await
    }

    /// Run the workflow, ending with `Cancelled` if `cancellation` fires first.
    pub async fn run_with_cancellation(
        &self,
        input: W::Input,
        cancellation: CancellationToken,
    ) -> Result<W::Output> {
        let scope = RunScope::new(new_run_id(), &self.id, ExecutionInfo::root(&self.id));
        self.session(scope, cancellation).run(input).await
    }

    /// A session positioned at `scope`. Only top-level scopes can be run.
    pub fn session(&self, scope: RunScope, cancellation: CancellationToken) -> RunSession<W> {
        RunSession {
            scope,
            pipeline: Arc::clone(&self.pipeline),
            workflow: Arc::clone(&self.workflow),
            base_environment: Arc::clone(&self.environment),
            prompt_executor: self.prompt_executor.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            tools: Arc::clone(&self.tools),
            resource_concurrency: self.resource_concurrency,
            path_separator: self.path_separator.clone(),
            guard: self.guard.clone(),
            state: Default::default(),
            cancellation,
            environment: Mutex::new(None),
        }
    }
}

/// Builds an [`Agent`].
///
/// # Example
/// ```ignore
/// let agent = Agent::builder(strategy)
///     .id("support-bot")
///     .tool(Arc::new(search_tool))
///     .prompt_executor(Arc::new(MockPromptExecutor::new()))
///     .install(&EventTrace, |config| {
///         config.add_writer(writer.clone());
///         Ok(())
///     })?
///     .build();
/// ```
pub struct AgentBuilder<W: WorkflowExecutor> {
    id: AgentId,
    model: String,
    system_prompt: Option<String>,
    workflow: W,
    pipeline: AgentPipeline,
    tools: ToolRegistry,
    environment: Option<Arc<dyn AgentEnvironment>>,
    prompt_executor: Option<Arc<dyn PromptExecutor>>,
    resource_concurrency: usize,
    path_separator: String,
}

impl<W: WorkflowExecutor> AgentBuilder<W> {
    pub fn new(workflow: W) -> Self {
        Self {
            id: DEFAULT_AGENT_ID.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            workflow,
            pipeline: AgentPipeline::new(),
            tools: ToolRegistry::new(),
            environment: None,
            prompt_executor: None,
            resource_concurrency: relay_config::DEFAULT_RESOURCE_INIT_CONCURRENCY,
            path_separator: relay_core::DEFAULT_PATH_SEPARATOR.to_string(),
        }
    }

    pub fn id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Apply the `[agent]` and `[pipeline]` sections of a loaded config.
    pub fn with_config(mut self, config: &RelayConfig) -> Self {
        self.id = config.agent.id.clone();
        self.model = config.agent.model.clone();
        if config.agent.system_prompt.is_some() {
            self.system_prompt = config.agent.system_prompt.clone();
        }
        self.resource_concurrency = config.pipeline.resource_init_concurrency;
        self.path_separator = config.pipeline.path_separator.clone();
        self
    }

    pub fn resource_init_concurrency(mut self, concurrency: usize) -> Self {
        self.resource_concurrency = concurrency;
        self
    }

    pub fn tool(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools.register(executor);
        self
    }

    pub fn prompt_executor(mut self, executor: Arc<dyn PromptExecutor>) -> Self {
        self.prompt_executor = Some(executor);
        self
    }

    /// Replace the default tool environment.
    pub fn environment(mut self, environment: Arc<dyn AgentEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Install a feature on the agent's pipeline.
    pub fn install<F, C>(mut self, feature: &F, configure: C) -> Result<Self>
    where
        F: Feature,
        C: FnOnce(&mut F::Config) -> Result<()>,
    {
        self.pipeline.install(feature, configure)?;
        Ok(self)
    }

    pub fn build(self) -> Agent<W> {
        let pipeline = Arc::new(self.pipeline);
        let tools: Arc<[Tool]> = self.tools.tools().into();
        let environment = self.environment.unwrap_or_else(|| {
            Arc::new(ToolEnvironment::new(
                Arc::new(self.tools),
                Arc::clone(&pipeline),
            ))
        });
        info!(
            agent_id = %self.id,
            model = %self.model,
            features = pipeline.installed_features().len(),
            tools = tools.len(),
            "agent built"
        );
        Agent {
            id: self.id,
            model: self.model,
            system_prompt: self.system_prompt,
            workflow: Arc::new(self.workflow),
            pipeline,
            tools,
            environment,
            prompt_executor: self.prompt_executor,
            resource_concurrency: self.resource_concurrency,
            path_separator: self.path_separator,
            guard: RunGuard::new(),
        }
    }
}
