//! # relay-core
//!
//! Core types, traits, and primitives for the Relay agent runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! the unified error type, hierarchical execution positions, prompts and messages,
//! tool descriptors, and the collaborator traits the runtime calls out to.

pub mod error;
pub mod execution;
pub mod message;
pub mod tool;
pub mod types;

pub use error::{RelayError, Result};
pub use execution::{DEFAULT_PATH_SEPARATOR, ExecutionInfo, RunScope};
pub use message::{Message, Prompt, PromptExecutor, Role, StreamFrame};
pub use tool::{Tool, ToolCall, ToolExecutor, ToolResult};
pub use types::*;
