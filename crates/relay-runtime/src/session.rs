//! Run sessions and the run lifecycle state machine.
//!
//! A [`RunSession`] drives one execution of an agent:
//!
//! ```text
//!   NotStarted → Starting → Running → Finished
//!                    │          │
//!                    └──────────┴───→ Failed
//! ```
//!
//! Everything after admission runs inside a scoped region whose exit always
//! fires the closing notification and closes feature resources, whether the
//! run succeeded, failed, was cancelled, or its future was dropped.

use parking_lot::Mutex;
use relay_core::{ExecutionInfo, PromptExecutor, RelayError, Result, RunId, RunScope, Tool};
use relay_pipeline::{AgentEnvironment, AgentPipeline};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::concurrency::{RunGuard, RunPermit};
use crate::context::AgentContext;
use crate::storage::AgentStorage;
use crate::strategy::WorkflowExecutor;

// ── Run state ──────────────────────────────────────────────────

/// Where one run is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentRunState {
    NotStarted,
    Starting,
    Running {
        run_id: RunId,
        execution_info: Arc<ExecutionInfo>,
    },
    Finished {
        result: Value,
    },
    Failed {
        error: String,
    },
}

impl AgentRunState {
    fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Running { .. } => 2,
            Self::Finished { .. } | Self::Failed { .. } => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for AgentRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared handle on one run's state. Only the owning session advances it.
#[derive(Debug, Clone)]
pub struct RunStateManager {
    state: Arc<Mutex<AgentRunState>>,
}

impl Default for RunStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentRunState::NotStarted)),
        }
    }

    pub fn current(&self) -> AgentRunState {
        self.state.lock().clone()
    }

    /// Move to `next`; anything that is not strictly forward is rejected.
    pub fn advance(&self, next: AgentRunState) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_terminal() || next.rank() <= state.rank() {
            return Err(RelayError::InvalidTransition {
                from: state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        debug!(from = %*state, to = %next, "run state transition");
        *state = next;
        Ok(())
    }

    /// Mark the run failed unless it already reached a terminal state.
    pub(crate) fn fail_if_active(&self, error: &str) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = AgentRunState::Failed {
                error: error.to_string(),
            };
        }
    }

    /// Whether both handles track the same run.
    pub fn same_run(&self, other: &RunStateManager) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

// ── Cleanup ────────────────────────────────────────────────────

/// The closing half of the scoped region.
struct Cleanup {
    pipeline: Arc<AgentPipeline>,
    scope: RunScope,
    permit: RunPermit,
}

impl Cleanup {
    async fn run(self) -> Result<()> {
        let closing = self.pipeline.on_agent_closing(&self.scope).await;
        if let Err(e) = &closing {
            warn!(run_id = %self.scope.run_id, error = %e, "agent closing handler failed");
        }
        let closed = self.pipeline.close_features().await;
        if let Err(e) = &closed {
            warn!(run_id = %self.scope.run_id, error = %e, "failed to release feature resources");
        }
        drop(self.permit);
        debug!(run_id = %self.scope.run_id, "run cleanup finished");
        closing.and(closed)
    }
}

/// Runs [`Cleanup`] exactly once: explicitly via `finish`, or from `Drop` when
/// the run future is abandoned.
struct CleanupGuard {
    pending: Option<Cleanup>,
    state: RunStateManager,
}

impl CleanupGuard {
    async fn finish(mut self) -> Result<()> {
        let Some(cleanup) = self.pending.take() else {
            return Ok(());
        };
        // Spawned so that dropping the caller cannot interrupt it.
        tokio::spawn(cleanup.run())
            .await
            .map_err(|e| RelayError::Agent(format!("run cleanup task failed: {e}")))?
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.pending.take() else {
            return;
        };
        self.state.fail_if_active("run dropped before completion");
        match Handle::try_current() {
            Ok(handle) => {
                warn!(run_id = %cleanup.scope.run_id, "run dropped before completion, scheduling cleanup");
                handle.spawn(async move {
                    let _ = cleanup.run().await;
                });
            }
            Err(_) => {
                warn!(run_id = %cleanup.scope.run_id, "run dropped outside a runtime, skipping closing notification");
            }
        }
    }
}

// ── Session ────────────────────────────────────────────────────

/// Everything one run needs, assembled by the agent.
pub struct RunSession<W: WorkflowExecutor> {
    pub(crate) scope: RunScope,
    pub(crate) pipeline: Arc<AgentPipeline>,
    pub(crate) workflow: Arc<W>,
    pub(crate) base_environment: Arc<dyn AgentEnvironment>,
    pub(crate) prompt_executor: Option<Arc<dyn PromptExecutor>>,
    pub(crate) model: String,
    pub(crate) system_prompt: Option<String>,
    pub(crate) tools: Arc<[Tool]>,
    pub(crate) resource_concurrency: usize,
    pub(crate) path_separator: String,
    pub(crate) guard: RunGuard,
    pub(crate) state: RunStateManager,
    pub(crate) cancellation: CancellationToken,
    /// The transformed environment, once the fold has run.
    pub(crate) environment: Mutex<Option<Arc<dyn AgentEnvironment>>>,
}

impl<W: WorkflowExecutor> RunSession<W> {
    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    pub fn state(&self) -> &RunStateManager {
        &self.state
    }

    /// Execute the run end to end.
    ///
    /// Returns the workflow's output, or the original error once the run has
    /// reached `Failed` and its cleanup has completed.
    pub async fn run(self, input: W::Input) -> Result<W::Output> {
        if !self.scope.execution_info.is_top_level() {
            return Err(RelayError::NotTopLevel {
                path: self.scope.execution_info.path_with(&self.path_separator),
            });
        }
        let permit = self.guard.try_acquire(&self.scope.agent_id, &self.state)?;
        self.state.advance(AgentRunState::Starting)?;
        info!(
            agent_id = %self.scope.agent_id,
            run_id = %self.scope.run_id,
            workflow = self.workflow.name(),
            "agent run starting"
        );

        let cleanup = CleanupGuard {
            pending: Some(Cleanup {
                pipeline: Arc::clone(&self.pipeline),
                scope: self.scope.clone(),
                permit,
            }),
            state: self.state.clone(),
        };

        let outcome = tokio::select! {
            outcome = self.execute(input) => outcome,
            _ = self.cancellation.cancelled() => Err(RelayError::Cancelled),
        };
        let outcome = match outcome {
            Ok(output) => match self.complete(&output).await {
                Ok(()) => Ok(output),
                Err(e) => Err(self.fail(e).await),
            },
            Err(e) => Err(self.fail(e).await),
        };

        let cleaned = cleanup.finish().await;
        match (outcome, cleaned) {
            (Ok(_), Err(e)) => Err(e),
            (outcome, _) => outcome,
        }
    }

    /// The body of the scoped region, up to the workflow's result.
    async fn execute(&self, input: W::Input) -> Result<W::Output> {
        self.pipeline
            .prepare_features(self.resource_concurrency)
            .await?;

        let environment = self
            .pipeline
            .on_agent_environment_transforming(&self.scope, Arc::clone(&self.base_environment))
            .await?;
        *self.environment.lock() = Some(Arc::clone(&environment));

        let ctx = AgentContext::new(
            self.scope.clone(),
            Arc::clone(&self.pipeline),
            environment,
            self.prompt_executor.clone(),
            self.model.clone(),
            self.system_prompt.clone(),
            Arc::clone(&self.tools),
            AgentStorage::new(),
            self.state.clone(),
            self.cancellation.clone(),
        );

        self.pipeline.on_agent_starting(&self.scope).await?;
        self.state.advance(AgentRunState::Running {
            run_id: self.scope.run_id.clone(),
            execution_info: Arc::clone(&self.scope.execution_info),
        })?;

        self.workflow
            .execute(&ctx, input)
            .await?
            .ok_or_else(|| RelayError::EmptyResult {
                run_id: self.scope.run_id.clone(),
            })
    }

    async fn complete(&self, output: &W::Output) -> Result<()> {
        self.pipeline.on_agent_completed(&self.scope, output).await?;
        self.state.advance(AgentRunState::Finished {
            result: serde_json::to_value(output)?,
        })?;
        info!(
            agent_id = %self.scope.agent_id,
            run_id = %self.scope.run_id,
            "agent run finished"
        );
        Ok(())
    }

    /// Report `error`, fire the failure event, and move to `Failed`.
    ///
    /// Failures of these steps are logged; `error` is always what is returned.
    async fn fail(&self, error: RelayError) -> RelayError {
        let environment = self
            .environment
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.base_environment));
        if let Err(e) = environment.report_problem(&self.scope, &error).await {
            warn!(run_id = %self.scope.run_id, error = %e, "failed to report problem to environment");
        }
        if let Err(e) = self
            .pipeline
            .on_agent_execution_failed(&self.scope, &error)
            .await
        {
            warn!(run_id = %self.scope.run_id, error = %e, "agent failure handler failed");
        }
        if let Err(e) = self.state.advance(AgentRunState::Failed {
            error: error.to_string(),
        }) {
            warn!(run_id = %self.scope.run_id, error = %e, "could not mark run as failed");
        }
        info!(
            agent_id = %self.scope.agent_id,
            run_id = %self.scope.run_id,
            error = %error,
            "agent run failed"
        );
        error
    }
}
