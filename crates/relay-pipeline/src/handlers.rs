//! Handler registries: one ordered slot map per event category.

use futures::future::BoxFuture;
use relay_core::Result;
use std::future::Future;
use std::sync::Arc;

use crate::environment::AgentEnvironment;
use crate::event::*;
use crate::feature::FeatureKey;
use crate::pipeline::AgentPipeline;

/// A boxed interceptor for event category `C`.
pub type Interceptor<C> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A boxed environment transformer.
pub type EnvironmentTransformer = Arc<
    dyn Fn(
            Arc<AgentEnvironmentTransformingContext>,
            Arc<dyn AgentEnvironment>,
        ) -> BoxFuture<'static, Result<Arc<dyn AgentEnvironment>>>
        + Send
        + Sync,
>;

/// Ordered `FeatureKey -> handler` map.
///
/// Iteration follows first registration. Setting a key that is already present
/// overwrites its handler in place.
#[derive(Clone)]
pub struct HandlerSlots<H> {
    slots: Vec<(FeatureKey, H)>,
}

impl<H> Default for HandlerSlots<H> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<H> HandlerSlots<H> {
    /// Insert or replace; returns `true` when an existing slot was replaced.
    pub fn set(&mut self, key: FeatureKey, handler: H) -> bool {
        match self.slots.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => {
                slot.1 = handler;
                true
            }
            None => {
                self.slots.push((key, handler));
                false
            }
        }
    }

    pub fn get(&self, key: &FeatureKey) -> Option<&H> {
        self.slots.iter().find(|(k, _)| k == key).map(|(_, h)| h)
    }

    pub fn contains(&self, key: &FeatureKey) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeatureKey, &H)> {
        self.slots.iter().map(|(k, h)| (k, h))
    }

    pub fn keys(&self) -> impl Iterator<Item = &FeatureKey> {
        self.slots.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Event categories that can be intercepted with a broadcast handler.
pub trait Interceptable: EventContext + Sized {
    fn slots(interceptors: &Interceptors) -> &HandlerSlots<Interceptor<Self>>;

    fn slots_mut(interceptors: &mut Interceptors) -> &mut HandlerSlots<Interceptor<Self>>;
}

macro_rules! interceptor_registry {
    ($( $field:ident: $ctx:ident => $intercept:ident; )*) => {
        /// Per-category handler registries of one pipeline.
        #[derive(Clone, Default)]
        pub struct Interceptors {
            $( $field: HandlerSlots<Interceptor<$ctx>>, )*
        }

        impl Interceptors {
            /// Register one snapshot handler into every broadcast category.
            pub(crate) fn set_all<F, Fut>(&mut self, key: FeatureKey, handler: Arc<F>)
            where
                F: Fn(EventSnapshot) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<()>> + Send + 'static,
            {
                $(
                    let h = Arc::clone(&handler);
                    self.$field.set(
                        key,
                        Arc::new(move |ctx: Arc<$ctx>| -> BoxFuture<'static, Result<()>> {
                            Box::pin(h(ctx.as_event().snapshot()))
                        }),
                    );
                )*
            }

            /// Number of categories holding a handler for `key`.
            pub fn count_for(&self, key: &FeatureKey) -> usize {
                [$( self.$field.contains(key), )*].iter().filter(|present| **present).count()
            }
        }

        $(
            impl Interceptable for $ctx {
                fn slots(interceptors: &Interceptors) -> &HandlerSlots<Interceptor<Self>> {
                    &interceptors.$field
                }

                fn slots_mut(interceptors: &mut Interceptors) -> &mut HandlerSlots<Interceptor<Self>> {
                    &mut interceptors.$field
                }
            }
        )*

        impl AgentPipeline {
            $(
                #[doc = concat!("Register or replace `key`'s interceptor for [`", stringify!($ctx), "`].")]
                pub fn $intercept<F, Fut>(&mut self, key: &FeatureKey, handler: F)
                where
                    F: Fn(Arc<$ctx>) -> Fut + Send + Sync + 'static,
                    Fut: Future<Output = Result<()>> + Send + 'static,
                {
                    self.intercept::<$ctx, F, Fut>(key, handler);
                }
            )*
        }
    };
}

interceptor_registry! {
    agent_starting: AgentStartingContext => intercept_agent_starting;
    agent_completed: AgentCompletedContext => intercept_agent_completed;
    agent_execution_failed: AgentExecutionFailedContext => intercept_agent_execution_failed;
    agent_closing: AgentClosingContext => intercept_agent_closing;
    strategy_starting: StrategyStartingContext => intercept_strategy_starting;
    strategy_completed: StrategyCompletedContext => intercept_strategy_completed;
    node_starting: NodeStartingContext => intercept_node_starting;
    node_completed: NodeCompletedContext => intercept_node_completed;
    node_execution_failed: NodeExecutionFailedContext => intercept_node_execution_failed;
    tool_call_starting: ToolCallStartingContext => intercept_tool_call_starting;
    tool_validation_failed: ToolValidationFailedContext => intercept_tool_validation_failed;
    tool_call_failed: ToolCallFailedContext => intercept_tool_call_failed;
    tool_call_completed: ToolCallCompletedContext => intercept_tool_call_completed;
    llm_call_starting: LlmCallStartingContext => intercept_llm_call_starting;
    llm_call_completed: LlmCallCompletedContext => intercept_llm_call_completed;
    streaming_starting: StreamingStartingContext => intercept_streaming_starting;
    stream_frame_received: StreamFrameReceivedContext => intercept_stream_frame_received;
    streaming_failed: StreamingFailedContext => intercept_streaming_failed;
    streaming_completed: StreamingCompletedContext => intercept_streaming_completed;
}
