use thiserror::Error;

/// Unified error type for the entire Relay runtime.
#[derive(Error, Debug)]
pub enum RelayError {
    // ── Usage errors ───────────────────────────────────────────
    #[error("agent is already running: {agent_id}")]
    AlreadyRunning { agent_id: String },

    #[error("event filter is locked for feature {feature}: it requires an unfiltered event stream")]
    FilterLocked { feature: String },

    #[error("run must start from a top-level execution, got path {path}")]
    NotTopLevel { path: String },

    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ── Run errors ─────────────────────────────────────────────
    #[error("workflow produced no result for run {run_id}")]
    EmptyResult { run_id: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("agent error: {0}")]
    Agent(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    // ── Feature errors ─────────────────────────────────────────
    #[error("feature error: {feature}: {reason}")]
    Feature { feature: String, reason: String },

    #[error("feature resource error: {resource}: {reason}")]
    Resource { resource: String, reason: String },

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Model errors ───────────────────────────────────────────
    #[error("model call failed: {0}")]
    Model(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Whether this error reports a misuse of the API rather than a runtime failure.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. }
                | Self::FilterLocked { .. }
                | Self::NotTopLevel { .. }
                | Self::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
