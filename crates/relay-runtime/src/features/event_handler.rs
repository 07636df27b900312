//! `EventHandler`: attach plain callbacks to lifecycle events.
//!
//! ```ignore
//! builder.install(&EventHandler::new(), |config| {
//!     config
//!         .on_agent_starting(|ctx| async move { /* ... */ Ok(()) })
//!         .on_tool_call_starting(|ctx| async move { /* ... */ Ok(()) });
//!     Ok(())
//! })?;
//! ```
//!
//! Any number of callbacks may be added per category; they run in the order
//! they were added, under the feature's single handler slot.

use futures::future::BoxFuture;
use relay_core::Result;
use relay_pipeline::*;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Type-erased list of callbacks for one category.
struct CallbackList {
    callbacks: Box<dyn Any + Send>,
    len: usize,
    register: fn(Box<dyn Any + Send>, &FeatureKey, &mut AgentPipeline),
}

impl CallbackList {
    fn new<C: Interceptable>() -> Self {
        Self {
            callbacks: Box::new(Vec::<Interceptor<C>>::new()),
            len: 0,
            register: register_callbacks::<C>,
        }
    }

    fn push<C: Interceptable>(&mut self, callback: Interceptor<C>) {
        if let Some(list) = self.callbacks.downcast_mut::<Vec<Interceptor<C>>>() {
            list.push(callback);
            self.len += 1;
        }
    }
}

fn register_callbacks<C: Interceptable>(
    callbacks: Box<dyn Any + Send>,
    key: &FeatureKey,
    pipeline: &mut AgentPipeline,
) {
    let Ok(callbacks) = callbacks.downcast::<Vec<Interceptor<C>>>() else {
        return;
    };
    let callbacks: Arc<[Interceptor<C>]> = Arc::from(*callbacks);
    pipeline.intercept::<C, _, _>(key, move |ctx: Arc<C>| {
        let callbacks = Arc::clone(&callbacks);
        async move {
            for callback in callbacks.iter() {
                callback(Arc::clone(&ctx)).await?;
            }
            Ok(())
        }
    });
}

/// Configuration for [`EventHandler`]: its filter plus the callbacks to attach.
#[derive(Default)]
pub struct EventHandlerConfig {
    base: FeatureConfig,
    callbacks: HashMap<EventKind, CallbackList>,
    transformers: Vec<EnvironmentTransformer>,
}

impl FeatureConfiguration for EventHandlerConfig {
    fn base(&self) -> &FeatureConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut FeatureConfig {
        &mut self.base
    }
}

impl EventHandlerConfig {
    /// Add a callback for category `C`.
    pub fn on<C, F, Fut>(&mut self, callback: F) -> &mut Self
    where
        C: Interceptable,
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: Interceptor<C> =
            Arc::new(move |ctx: Arc<C>| -> BoxFuture<'static, Result<()>> { Box::pin(callback(ctx)) });
        self.callbacks
            .entry(C::KIND)
            .or_insert_with(CallbackList::new::<C>)
            .push(callback);
        self
    }

    /// Add an environment transformer. Several compose in the order added.
    pub fn on_environment_transforming<F, Fut>(&mut self, transformer: F) -> &mut Self
    where
        F: Fn(Arc<AgentEnvironmentTransformingContext>, Arc<dyn AgentEnvironment>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Arc<dyn AgentEnvironment>>> + Send + 'static,
    {
        self.transformers.push(Arc::new(
            move |ctx: Arc<AgentEnvironmentTransformingContext>,
                  env: Arc<dyn AgentEnvironment>|
                  -> BoxFuture<'static, Result<Arc<dyn AgentEnvironment>>> {
                Box::pin(transformer(ctx, env))
            },
        ));
        self
    }

    /// Number of callbacks added for `kind`.
    pub fn callback_count(&self, kind: EventKind) -> usize {
        if kind == EventKind::AgentEnvironmentTransforming {
            return self.transformers.len();
        }
        self.callbacks.get(&kind).map_or(0, |list| list.len)
    }
}

macro_rules! named_callbacks {
    ($( $method:ident => $ctx:ident; )*) => {
        impl EventHandlerConfig {
            $(
                #[doc = concat!("Add a callback for [`", stringify!($ctx), "`].")]
                pub fn $method<F, Fut>(&mut self, callback: F) -> &mut Self
                where
                    F: Fn(Arc<$ctx>) -> Fut + Send + Sync + 'static,
                    Fut: Future<Output = Result<()>> + Send + 'static,
                {
                    self.on::<$ctx, F, Fut>(callback)
                }
            )*
        }
    };
}

named_callbacks! {
    on_agent_starting => AgentStartingContext;
    on_agent_completed => AgentCompletedContext;
    on_agent_execution_failed => AgentExecutionFailedContext;
    on_agent_closing => AgentClosingContext;
    on_strategy_starting => StrategyStartingContext;
    on_strategy_completed => StrategyCompletedContext;
    on_node_starting => NodeStartingContext;
    on_node_completed => NodeCompletedContext;
    on_node_execution_failed => NodeExecutionFailedContext;
    on_tool_call_starting => ToolCallStartingContext;
    on_tool_validation_failed => ToolValidationFailedContext;
    on_tool_call_failed => ToolCallFailedContext;
    on_tool_call_completed => ToolCallCompletedContext;
    on_llm_call_starting => LlmCallStartingContext;
    on_llm_call_completed => LlmCallCompletedContext;
    on_streaming_starting => StreamingStartingContext;
    on_stream_frame_received => StreamFrameReceivedContext;
    on_streaming_failed => StreamingFailedContext;
    on_streaming_completed => StreamingCompletedContext;
}

/// Feature descriptor. Several handlers can coexist under different names.
#[derive(Debug, Clone, Copy)]
pub struct EventHandler {
    name: &'static str,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler {
    pub const DEFAULT_NAME: &'static str = "event-handler";

    pub fn new() -> Self {
        Self::named(Self::DEFAULT_NAME)
    }

    pub fn named(name: &'static str) -> Self {
        Self { name }
    }
}

/// What an installed [`EventHandler`] intercepts.
#[derive(Debug, Clone)]
pub struct InstalledEventHandler {
    pub kinds: Vec<EventKind>,
}

impl Feature for EventHandler {
    type Config = EventHandlerConfig;
    type Implementation = InstalledEventHandler;

    fn key(&self) -> FeatureKey {
        FeatureKey::of::<EventHandler>(self.name)
    }

    fn create_initial_config(&self) -> EventHandlerConfig {
        EventHandlerConfig::default()
    }

    fn install(
        &self,
        config: EventHandlerConfig,
        pipeline: &mut AgentPipeline,
    ) -> Result<InstalledEventHandler> {
        let key = self.key();
        let mut kinds: Vec<EventKind> = config.callbacks.keys().copied().collect();

        for list in config.callbacks.into_values() {
            (list.register)(list.callbacks, &key, pipeline);
        }

        if !config.transformers.is_empty() {
            kinds.push(EventKind::AgentEnvironmentTransforming);
            let transformers: Arc<[EnvironmentTransformer]> = config.transformers.into();
            pipeline.intercept_environment_transforming(&key, move |ctx, env| {
                let transformers = Arc::clone(&transformers);
                async move {
                    let mut env = env;
                    for transformer in transformers.iter() {
                        env = transformer(Arc::clone(&ctx), env).await?;
                    }
                    Ok(env)
                }
            });
        }

        kinds.sort_by_key(|kind| EventKind::ALL.iter().position(|k| k == kind));
        Ok(InstalledEventHandler { kinds })
    }
}
