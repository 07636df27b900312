//! # relay-config
//!
//! Configuration system for the Relay runtime. Reads from `relay.toml` and
//! environment variables, in that precedence order.

pub mod loader;
pub mod schema;

pub use loader::{CONFIG_PATH_ENV, ConfigLoader, ConfigOrigin};
pub use schema::RelayConfig;
pub use schema::{
    AgentConfig, ConfigWarning, DEFAULT_RESOURCE_INIT_CONCURRENCY, LoggingConfig, PipelineConfig,
    TraceConfig, WarningSeverity,
};
