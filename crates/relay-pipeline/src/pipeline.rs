//! The per-agent event pipeline.
//!
//! `AgentPipeline` owns the feature registry and one handler registry per event
//! category. Firing methods (`on_*`) build the category's context, then invoke
//! each feature's handler sequentially in registration order. A handler error
//! stops the dispatch and is returned to the caller unchanged.

use futures::future::BoxFuture;
use relay_core::{
    Message, Prompt, RelayError, Result, RunScope, StreamFrame, Tool, ToolCall, ToolResult,
    new_event_id, short_type_name,
};
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::environment::AgentEnvironment;
use crate::event::*;
use crate::feature::{
    Feature, FeatureConfig, FeatureConfiguration, FeatureKey, FeatureResource, RegisteredFeature,
};
use crate::handlers::{
    EnvironmentTransformer, HandlerSlots, Interceptable, Interceptor, Interceptors,
};
use crate::resources;

#[derive(Default)]
pub struct AgentPipeline {
    features: HandlerSlots<RegisteredFeature>,
    interceptors: Interceptors,
    transformers: HandlerSlots<EnvironmentTransformer>,
}

impl AgentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Features ───────────────────────────────────────────────

    /// Install `feature`, letting `configure` adjust its default configuration.
    ///
    /// Any previous registration under the same key is overwritten. Resources
    /// must be added to the configuration before the feature's own `install`
    /// runs, which is the case for anything `configure` adds.
    pub fn install<F, C>(&mut self, feature: &F, configure: C) -> Result<Arc<F::Implementation>>
    where
        F: Feature,
        C: FnOnce(&mut F::Config) -> Result<()>,
    {
        let key = feature.key();
        let mut config = feature.create_initial_config();
        let default_lock = config.base().locked_by();
        configure(&mut config)?;
        config.base().ensure_lock_kept(default_lock)?;
        let base = config.base().clone();

        // A failed install must not leave its interceptors behind.
        let saved = (self.interceptors.clone(), self.transformers.clone());
        let implementation = match feature.install(config, self) {
            Ok(implementation) => Arc::new(implementation),
            Err(e) => {
                (self.interceptors, self.transformers) = saved;
                warn!(feature = %key, error = %e, "feature install failed, handlers rolled back");
                return Err(e);
            }
        };
        let erased: Arc<dyn Any + Send + Sync> = implementation.clone();
        let replaced = self.features.set(
            key,
            RegisteredFeature {
                config: base,
                implementation: erased,
            },
        );
        info!(feature = %key, replaced, "feature installed");
        Ok(implementation)
    }

    /// The implementation retained for `key`, if it was installed as a `T`.
    pub fn feature<T: Send + Sync + 'static>(&self, key: &FeatureKey) -> Option<Arc<T>> {
        let registered = self.features.get(key)?;
        Arc::clone(&registered.implementation).downcast::<T>().ok()
    }

    pub fn feature_config(&self, key: &FeatureKey) -> Option<&FeatureConfig> {
        self.features.get(key).map(|f| &f.config)
    }

    /// Installed feature keys, in installation order.
    pub fn installed_features(&self) -> Vec<FeatureKey> {
        self.features.keys().copied().collect()
    }

    /// Whether `key`'s filter lets `event` through. Unregistered keys accept everything.
    pub fn is_accepted(&self, key: &FeatureKey, event: EventRef<'_>) -> bool {
        self.features
            .get(key)
            .is_none_or(|f| f.config.is_accepted(event))
    }

    // ── Registration ───────────────────────────────────────────

    /// Register or replace `key`'s interceptor for category `C`.
    pub fn intercept<C, F, Fut>(&mut self, key: &FeatureKey, handler: F)
    where
        C: Interceptable,
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let interceptor: Interceptor<C> =
            Arc::new(move |ctx: Arc<C>| -> BoxFuture<'static, Result<()>> { Box::pin(handler(ctx)) });
        let replaced = C::slots_mut(&mut self.interceptors).set(*key, interceptor);
        debug!(feature = %key, event = %C::KIND, replaced, "interceptor registered");
    }

    /// Register or replace `key`'s environment transformer.
    pub fn intercept_environment_transforming<F, Fut>(&mut self, key: &FeatureKey, transformer: F)
    where
        F: Fn(Arc<AgentEnvironmentTransformingContext>, Arc<dyn AgentEnvironment>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Arc<dyn AgentEnvironment>>> + Send + 'static,
    {
        let transformer: EnvironmentTransformer = Arc::new(
            move |ctx: Arc<AgentEnvironmentTransformingContext>,
                  env: Arc<dyn AgentEnvironment>|
                  -> BoxFuture<'static, Result<Arc<dyn AgentEnvironment>>> {
                Box::pin(transformer(ctx, env))
            },
        );
        let replaced = self.transformers.set(*key, transformer);
        debug!(feature = %key, replaced, "environment transformer registered");
    }

    /// Register one snapshot handler for every broadcast category.
    pub fn intercept_all_events<F, Fut>(&mut self, key: &FeatureKey, handler: F)
    where
        F: Fn(EventSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.interceptors.set_all(*key, Arc::new(handler));
        debug!(feature = %key, "catch-all interceptor registered");
    }

    /// Number of handlers registered for category `C`.
    pub fn interceptor_count<C: Interceptable>(&self) -> usize {
        C::slots(&self.interceptors).len()
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    async fn dispatch<C: Interceptable>(&self, ctx: C) -> Result<()> {
        let slots = C::slots(&self.interceptors);
        if slots.is_empty() {
            return Ok(());
        }
        let ctx = Arc::new(ctx);
        for (key, handler) in slots.iter() {
            if !self.is_accepted(key, ctx.as_event()) {
                debug!(feature = %key, event = %C::KIND, "event filtered out");
                continue;
            }
            handler(Arc::clone(&ctx)).await?;
        }
        Ok(())
    }

    // ── Agent events ───────────────────────────────────────────

    pub async fn on_agent_starting(&self, scope: &RunScope) -> Result<()> {
        self.dispatch(AgentStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            agent_id: scope.agent_id.clone(),
        })
        .await
    }

    pub async fn on_agent_completed<T: Serialize + ?Sized>(
        &self,
        scope: &RunScope,
        result: &T,
    ) -> Result<()> {
        self.dispatch(AgentCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            agent_id: scope.agent_id.clone(),
            result: serde_json::to_value(result)?,
            result_type: short_type_name::<T>().to_string(),
        })
        .await
    }

    pub async fn on_agent_execution_failed(&self, scope: &RunScope, error: &RelayError) -> Result<()> {
        self.dispatch(AgentExecutionFailedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            agent_id: scope.agent_id.clone(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn on_agent_closing(&self, scope: &RunScope) -> Result<()> {
        self.dispatch(AgentClosingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            agent_id: scope.agent_id.clone(),
        })
        .await
    }

    /// Thread `base` through every accepted transformer in registration order.
    ///
    /// With transformers T1 then T2 the result is `T2(T1(base))`.
    pub async fn on_agent_environment_transforming(
        &self,
        scope: &RunScope,
        base: Arc<dyn AgentEnvironment>,
    ) -> Result<Arc<dyn AgentEnvironment>> {
        let ctx = Arc::new(AgentEnvironmentTransformingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            agent_id: scope.agent_id.clone(),
        });
        let mut environment = base;
        for (key, transformer) in self.transformers.iter() {
            if !self.is_accepted(key, ctx.as_event()) {
                debug!(feature = %key, "environment transformer filtered out");
                continue;
            }
            environment = transformer(Arc::clone(&ctx), environment).await?;
        }
        Ok(environment)
    }

    // ── Strategy events ────────────────────────────────────────

    pub async fn on_strategy_starting(&self, scope: &RunScope, strategy_name: &str) -> Result<()> {
        self.dispatch(StrategyStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            strategy_name: strategy_name.to_string(),
        })
        .await
    }

    pub async fn on_strategy_completed<T: Serialize + ?Sized>(
        &self,
        scope: &RunScope,
        strategy_name: &str,
        result: &T,
    ) -> Result<()> {
        self.dispatch(StrategyCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            strategy_name: strategy_name.to_string(),
            result: serde_json::to_value(result)?,
            result_type: short_type_name::<T>().to_string(),
        })
        .await
    }

    // ── Node events ────────────────────────────────────────────

    pub async fn on_node_starting<I: Serialize + ?Sized>(
        &self,
        scope: &RunScope,
        node: &NodeRef,
        input: &I,
    ) -> Result<()> {
        self.dispatch(NodeStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            node: node.clone(),
            input: serde_json::to_value(input)?,
            input_type: short_type_name::<I>().to_string(),
        })
        .await
    }

    pub async fn on_node_completed<I, O>(
        &self,
        scope: &RunScope,
        node: &NodeRef,
        input: &I,
        output: &O,
    ) -> Result<()>
    where
        I: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        self.dispatch(NodeCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            node: node.clone(),
            input: serde_json::to_value(input)?,
            input_type: short_type_name::<I>().to_string(),
            output: serde_json::to_value(output)?,
            output_type: short_type_name::<O>().to_string(),
        })
        .await
    }

    pub async fn on_node_execution_failed<I: Serialize + ?Sized>(
        &self,
        scope: &RunScope,
        node: &NodeRef,
        input: &I,
        error: &RelayError,
    ) -> Result<()> {
        self.dispatch(NodeExecutionFailedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            node: node.clone(),
            input: serde_json::to_value(input)?,
            input_type: short_type_name::<I>().to_string(),
            error: error.to_string(),
        })
        .await
    }

    // ── Tool events ────────────────────────────────────────────

    pub async fn on_tool_call_starting(&self, scope: &RunScope, call: &ToolCall) -> Result<()> {
        self.dispatch(ToolCallStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        })
        .await
    }

    pub async fn on_tool_validation_failed(
        &self,
        scope: &RunScope,
        call: &ToolCall,
        error: &str,
    ) -> Result<()> {
        self.dispatch(ToolValidationFailedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn on_tool_call_failed(&self, scope: &RunScope, call: &ToolCall, error: &str) -> Result<()> {
        self.dispatch(ToolCallFailedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn on_tool_call_completed(
        &self,
        scope: &RunScope,
        call: &ToolCall,
        result: &ToolResult,
    ) -> Result<()> {
        self.dispatch(ToolCallCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result: result.clone(),
        })
        .await
    }

    // ── Model-call events ──────────────────────────────────────

    pub async fn on_llm_call_starting(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
        tools: &[Tool],
    ) -> Result<()> {
        self.dispatch(LlmCallStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
            tools: tools.to_vec(),
        })
        .await
    }

    pub async fn on_llm_call_completed(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
        tools: &[Tool],
        responses: &[Message],
    ) -> Result<()> {
        self.dispatch(LlmCallCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
            tools: tools.to_vec(),
            responses: responses.to_vec(),
        })
        .await
    }

    // ── Streaming events ───────────────────────────────────────

    pub async fn on_streaming_starting(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
        tools: &[Tool],
    ) -> Result<()> {
        self.dispatch(StreamingStartingContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
            tools: tools.to_vec(),
        })
        .await
    }

    pub async fn on_stream_frame_received(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
        frame: &StreamFrame,
    ) -> Result<()> {
        self.dispatch(StreamFrameReceivedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
            frame: frame.clone(),
        })
        .await
    }

    pub async fn on_streaming_failed(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
        error: &RelayError,
    ) -> Result<()> {
        self.dispatch(StreamingFailedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn on_streaming_completed(
        &self,
        scope: &RunScope,
        prompt: &Arc<Prompt>,
        model: &str,
    ) -> Result<()> {
        self.dispatch(StreamingCompletedContext {
            event_id: new_event_id(),
            run_id: scope.run_id.clone(),
            execution_info: Arc::clone(&scope.execution_info),
            prompt: Arc::clone(prompt),
            model: model.to_string(),
        })
        .await
    }

    // ── Resources ──────────────────────────────────────────────

    /// Every installed feature's resources, in installation order.
    pub fn resources(&self) -> Vec<Arc<dyn FeatureResource>> {
        self.features
            .iter()
            .flat_map(|(_, f)| f.config.resources().iter().cloned())
            .collect()
    }

    /// Initialize all feature resources, at most `concurrency` at a time.
    pub async fn prepare_features(&self, concurrency: usize) -> Result<()> {
        let resources = self.resources();
        debug!(count = resources.len(), concurrency, "preparing feature resources");
        resources::initialize_resources(resources, concurrency).await
    }

    /// Close all feature resources. Every resource is attempted; the first error is returned.
    pub async fn close_features(&self) -> Result<()> {
        resources::close_resources(&self.resources()).await
    }
}

impl std::fmt::Debug for AgentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPipeline")
            .field("features", &self.installed_features())
            .field("transformers", &self.transformers.len())
            .finish()
    }
}
