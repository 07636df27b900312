//! # relay-pipeline
//!
//! The lifecycle event pipeline: event contexts, features and their
//! configuration, per-category handler registries, and the environment
//! abstraction features can wrap.

pub mod environment;
pub mod event;
pub mod feature;
pub mod handlers;
pub mod pipeline;
pub mod resources;

pub use environment::AgentEnvironment;
pub use event::*;
pub use feature::{
    EventFilter, Feature, FeatureConfig, FeatureConfiguration, FeatureKey, FeatureResource,
};
pub use handlers::{EnvironmentTransformer, HandlerSlots, Interceptable, Interceptor, Interceptors};
pub use pipeline::AgentPipeline;
