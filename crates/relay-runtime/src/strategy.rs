use async_trait::async_trait;
use relay_core::Result;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;

use crate::context::AgentContext;

/// Produces a run's output from its input, firing strategy, node, tool, and
/// model events through the context as it goes.
///
/// Returning `Ok(None)` is an invariant violation: the run fails with
/// `EmptyResult` instead of succeeding with nothing.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Serialize + Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn execute(&self, ctx: &AgentContext, input: Self::Input) -> Result<Option<Self::Output>>;
}

/// A workflow defined by a single async closure.
pub struct FunctionalStrategy<I, O, F> {
    name: String,
    body: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> FunctionalStrategy<I, O, F>
where
    F: Fn(AgentContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<O>>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F, Fut> WorkflowExecutor for FunctionalStrategy<I, O, F>
where
    I: Send + 'static,
    O: Serialize + Send + Sync + 'static,
    F: Fn(AgentContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<O>>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &AgentContext, input: I) -> Result<Option<O>> {
        let ctx = ctx.subgraph(self.name.as_str());
        ctx.pipeline()
            .on_strategy_starting(ctx.scope(), &self.name)
            .await?;
        let result = (self.body)(ctx.clone(), input).await?;
        if let Some(output) = &result {
            ctx.pipeline()
                .on_strategy_completed(ctx.scope(), &self.name, output)
                .await?;
        }
        Ok(result)
    }
}
