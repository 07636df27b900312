//! # relay-runtime
//!
//! The agent run engine. Wraps a workflow with the lifecycle pipeline and
//! guarantees that every run is observed the same way.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐
//!              │    Agent     │  ← builder, features, tools, run guard
//!              └──────┬───────┘
//!                     │ run(input)
//!                     ▼
//!              ┌──────────────┐
//!              │  RunSession  │
//!              │              │
//!              │  1. Admit    │  ← at most one active run
//!              │  2. Prepare  │  ← feature resources, bounded concurrency
//!              │  3. Wrap     │  ← environment transformers
//!              │  4. Start    │  ← agent starting
//!              │  5. Execute  │  ← workflow: strategy, nodes, tools, model
//!              │  6. Finish   │  ← completed, or report + failed
//!              │  7. Close    │  ← closing + resource release, always
//!              └──────────────┘
//!                     │
//!         ┌───────────┼───────────┐
//!         ▼           ▼           ▼
//!    ┌─────────┐ ┌─────────┐ ┌──────────┐
//!    │  Tools  │ │ Prompt  │ │ Features │
//!    │ Registry│ │Executor │ │ Pipeline │
//!    └─────────┘ └─────────┘ └──────────┘
//! ```

pub mod agent;
pub mod concurrency;
pub mod context;
pub mod environment;
pub mod features;
pub mod mock;
pub mod session;
pub mod storage;
pub mod strategy;
pub mod tools;

pub use agent::{Agent, AgentBuilder};
pub use concurrency::RunGuard;
pub use context::AgentContext;
pub use environment::ToolEnvironment;
pub use features::{
    EventHandler, EventHandlerConfig, EventTrace, EventTraceHandle, FileTraceWriter,
    InstalledEventHandler, MemoryTraceWriter, TraceRecord, TraceWriter,
};
pub use mock::MockPromptExecutor;
pub use session::{AgentRunState, RunSession, RunStateManager};
pub use storage::{AgentStorage, StorageKey};
pub use strategy::{FunctionalStrategy, WorkflowExecutor};
pub use tools::{FunctionTool, ToolRegistry};
