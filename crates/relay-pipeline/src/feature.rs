//! Features: pluggable extensions installed once per pipeline.
//!
//! A feature offers a default configuration and an `install` entry point. The
//! pipeline builds the configuration, lets the caller adjust it, then hands both
//! to `install`, which registers the feature's interceptors on the pipeline it
//! is given.

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::event::EventRef;
use crate::pipeline::AgentPipeline;

/// Stable, type-tagged identity of a feature.
///
/// Used as the slot key in every handler registry, so re-installing the same
/// feature replaces its handlers instead of duplicating them.
#[derive(Clone, Copy)]
pub struct FeatureKey {
    name: &'static str,
    type_id: TypeId,
}

impl FeatureKey {
    /// Key for the feature type `F`.
    pub fn of<F: 'static>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<F>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for FeatureKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for FeatureKey {}

impl Hash for FeatureKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureKey({})", self.name)
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Predicate deciding whether an event reaches a feature's interceptors.
pub type EventFilter = Arc<dyn Fn(EventRef<'_>) -> bool + Send + Sync>;

/// A long-lived resource owned by a feature: initialized before a run, closed after it.
#[async_trait]
pub trait FeatureResource: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Configuration every feature carries: its event filter and its resources.
#[derive(Clone, Default)]
pub struct FeatureConfig {
    filter: Option<EventFilter>,
    /// Set for features that require an unfiltered event stream.
    locked_by: Option<&'static str>,
    resources: Vec<Arc<dyn FeatureResource>>,
}

impl FeatureConfig {
    /// Accepts every event until a filter is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that refuses custom filters, for features that must see every event.
    pub fn unfiltered(feature: &'static str) -> Self {
        Self {
            locked_by: Some(feature),
            ..Self::default()
        }
    }

    pub fn is_filter_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub(crate) fn locked_by(&self) -> Option<&'static str> {
        self.locked_by
    }

    /// Fails if a lock present in the feature's default config is gone, or a
    /// filter was set on a locked config.
    pub(crate) fn ensure_lock_kept(&self, default_lock: Option<&'static str>) -> Result<()> {
        let Some(feature) = default_lock.or(self.locked_by) else {
            return Ok(());
        };
        if self.locked_by != Some(feature) || self.filter.is_some() {
            return Err(RelayError::FilterLocked {
                feature: feature.to_string(),
            });
        }
        Ok(())
    }

    /// Replace the acceptance predicate.
    pub fn set_event_filter<F>(&mut self, filter: F) -> Result<()>
    where
        F: Fn(EventRef<'_>) -> bool + Send + Sync + 'static,
    {
        if let Some(feature) = self.locked_by {
            return Err(RelayError::FilterLocked {
                feature: feature.to_string(),
            });
        }
        self.filter = Some(Arc::new(filter));
        Ok(())
    }

    pub fn is_accepted(&self, event: EventRef<'_>) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(event))
    }

    pub fn add_resource(&mut self, resource: Arc<dyn FeatureResource>) {
        self.resources.push(resource);
    }

    pub fn resources(&self) -> &[Arc<dyn FeatureResource>] {
        &self.resources
    }
}

impl fmt::Debug for FeatureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureConfig")
            .field("filtered", &self.filter.is_some())
            .field("locked_by", &self.locked_by)
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// Access to the [`FeatureConfig`] embedded in a feature-specific configuration.
pub trait FeatureConfiguration: Send + 'static {
    fn base(&self) -> &FeatureConfig;

    fn base_mut(&mut self) -> &mut FeatureConfig;

    fn set_event_filter<F>(&mut self, filter: F) -> Result<()>
    where
        F: Fn(EventRef<'_>) -> bool + Send + Sync + 'static,
        Self: Sized,
    {
        self.base_mut().set_event_filter(filter)
    }
}

impl FeatureConfiguration for FeatureConfig {
    fn base(&self) -> &FeatureConfig {
        self
    }

    fn base_mut(&mut self) -> &mut FeatureConfig {
        self
    }
}

/// A feature descriptor.
pub trait Feature: Send + Sync + 'static {
    type Config: FeatureConfiguration;
    type Implementation: Send + Sync + 'static;

    fn key(&self) -> FeatureKey;

    /// Default configuration, before the caller's adjustments.
    fn create_initial_config(&self) -> Self::Config;

    /// Build the feature and register its interceptors on `pipeline`.
    fn install(
        &self,
        config: Self::Config,
        pipeline: &mut AgentPipeline,
    ) -> Result<Self::Implementation>;
}

/// One entry of the feature registry.
pub(crate) struct RegisteredFeature {
    pub(crate) config: FeatureConfig,
    pub(crate) implementation: Arc<dyn Any + Send + Sync>,
}
