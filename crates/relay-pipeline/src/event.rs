//! Lifecycle event contexts.
//!
//! Each event category has its own immutable context struct, built by the
//! pipeline at fire time and shared (behind an `Arc`) with every interceptor
//! registered for that category. [`EventRef`] is the closed sum over all
//! categories, used by feature filters and exporters that handle every event
//! the same way.

use relay_core::{
    AgentId, EventId, ExecutionInfo, Message, Prompt, RunId, StreamFrame, Tool, ToolResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Behaviour shared by every event context.
pub trait EventContext: fmt::Debug + Serialize + Send + Sync + 'static {
    const KIND: EventKind;

    fn event_id(&self) -> EventId;
    fn run_id(&self) -> &str;
    fn execution_info(&self) -> &Arc<ExecutionInfo>;
    fn as_event(&self) -> EventRef<'_>;
}

/// A graph node as seen by node events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
}

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// ── Agent events ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AgentStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub agent_id: AgentId,
    pub result: Value,
    pub result_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentExecutionFailedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub agent_id: AgentId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentClosingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentEnvironmentTransformingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub agent_id: AgentId,
}

// ── Strategy events ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub strategy_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub strategy_name: String,
    pub result: Value,
    pub result_type: String,
}

// ── Node events ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NodeStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub node: NodeRef,
    pub input: Value,
    pub input_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub node: NodeRef,
    pub input: Value,
    pub input_type: String,
    pub output: Value,
    pub output_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeExecutionFailedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub node: NodeRef,
    pub input: Value,
    pub input_type: String,
    pub error: String,
}

// ── Tool events ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolValidationFailedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallFailedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    pub result: ToolResult,
}

// ── Model-call events ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LlmCallStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmCallCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
    pub tools: Vec<Tool>,
    pub responses: Vec<Message>,
}

// ── Streaming events ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StreamingStartingContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamFrameReceivedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
    pub frame: StreamFrame,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingFailedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingCompletedContext {
    pub event_id: EventId,
    pub run_id: RunId,
    pub execution_info: Arc<ExecutionInfo>,
    pub prompt: Arc<Prompt>,
    pub model: String,
}

// ── Taxonomy ───────────────────────────────────────────────────

macro_rules! lifecycle_events {
    ($( $variant:ident => $ctx:ident, $name:literal; )*) => {
        /// Every lifecycle event category the pipeline can fire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum EventKind {
            $( $variant, )*
        }

        impl EventKind {
            pub const ALL: &'static [EventKind] = &[$( EventKind::$variant, )*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }
        }

        /// A borrowed view of any event context.
        #[derive(Debug, Clone, Copy, Serialize)]
        #[serde(tag = "event", rename_all = "snake_case")]
        pub enum EventRef<'a> {
            $( $variant(&'a $ctx), )*
        }

        impl<'a> EventRef<'a> {
            pub fn kind(&self) -> EventKind {
                match self {
                    $( Self::$variant(_) => EventKind::$variant, )*
                }
            }

            pub fn event_id(&self) -> EventId {
                match self {
                    $( Self::$variant(ctx) => ctx.event_id, )*
                }
            }

            pub fn run_id(&self) -> &'a str {
                match self {
                    $( Self::$variant(ctx) => &ctx.run_id, )*
                }
            }

            pub fn execution_info(&self) -> &'a Arc<ExecutionInfo> {
                match self {
                    $( Self::$variant(ctx) => &ctx.execution_info, )*
                }
            }

            fn payload(&self) -> serde_json::Result<Value> {
                match self {
                    $( Self::$variant(ctx) => serde_json::to_value(ctx), )*
                }
            }
        }

        $(
            impl EventContext for $ctx {
                const KIND: EventKind = EventKind::$variant;

                fn event_id(&self) -> EventId {
                    self.event_id
                }

                fn run_id(&self) -> &str {
                    &self.run_id
                }

                fn execution_info(&self) -> &Arc<ExecutionInfo> {
                    &self.execution_info
                }

                fn as_event(&self) -> EventRef<'_> {
                    EventRef::$variant(self)
                }
            }
        )*
    };
}

lifecycle_events! {
    AgentStarting => AgentStartingContext, "agent_starting";
    AgentCompleted => AgentCompletedContext, "agent_completed";
    AgentExecutionFailed => AgentExecutionFailedContext, "agent_execution_failed";
    AgentClosing => AgentClosingContext, "agent_closing";
    AgentEnvironmentTransforming => AgentEnvironmentTransformingContext, "agent_environment_transforming";
    StrategyStarting => StrategyStartingContext, "strategy_starting";
    StrategyCompleted => StrategyCompletedContext, "strategy_completed";
    NodeStarting => NodeStartingContext, "node_starting";
    NodeCompleted => NodeCompletedContext, "node_completed";
    NodeExecutionFailed => NodeExecutionFailedContext, "node_execution_failed";
    ToolCallStarting => ToolCallStartingContext, "tool_call_starting";
    ToolValidationFailed => ToolValidationFailedContext, "tool_validation_failed";
    ToolCallFailed => ToolCallFailedContext, "tool_call_failed";
    ToolCallCompleted => ToolCallCompletedContext, "tool_call_completed";
    LlmCallStarting => LlmCallStartingContext, "llm_call_starting";
    LlmCallCompleted => LlmCallCompletedContext, "llm_call_completed";
    StreamingStarting => StreamingStartingContext, "streaming_starting";
    StreamFrameReceived => StreamFrameReceivedContext, "stream_frame_received";
    StreamingFailed => StreamingFailedContext, "streaming_failed";
    StreamingCompleted => StreamingCompletedContext, "streaming_completed";
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventRef<'_> {
    /// An owned copy of this event for exporters that outlive the dispatch.
    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            kind: self.kind(),
            event_id: self.event_id(),
            run_id: self.run_id().to_string(),
            path: self.execution_info().path(),
            payload: self.payload().unwrap_or(Value::Null),
        }
    }
}

/// An owned, serializable record of one fired event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub kind: EventKind,
    pub event_id: EventId,
    pub run_id: RunId,
    pub path: String,
    pub payload: Value,
}
