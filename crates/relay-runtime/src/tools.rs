//! Tool registry and closure-backed tools.

use async_trait::async_trait;
use futures::future::BoxFuture;
use relay_core::{Result, Tool, ToolCall, ToolExecutor, ToolResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves tools by name to the executor that provides them.
///
/// A later registration of an existing tool name takes over that name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    index: HashMap<String, (usize, Arc<dyn ToolExecutor>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool `executor` lists.
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) {
        for tool in executor.tools() {
            match self.index.get(&tool.name) {
                Some((position, _)) => {
                    warn!(tool = %tool.name, "tool already registered, replacing");
                    let position = *position;
                    self.tools[position] = tool.clone();
                    self.index
                        .insert(tool.name.clone(), (position, Arc::clone(&executor)));
                }
                None => {
                    debug!(tool = %tool.name, "registered tool");
                    self.index
                        .insert(tool.name.clone(), (self.tools.len(), Arc::clone(&executor)));
                    self.tools.push(tool);
                }
            }
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// The tool descriptor and its executor.
    pub fn resolve(&self, name: &str) -> Option<(&Tool, &Arc<dyn ToolExecutor>)> {
        self.index
            .get(name)
            .map(|(position, executor)| (&self.tools[*position], executor))
    }

    /// Tool descriptors in registration order.
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

type ToolFn = Arc<dyn Fn(ToolCall) -> BoxFuture<'static, Result<ToolResult>> + Send + Sync>;

/// A single tool backed by an async closure.
pub struct FunctionTool {
    tool: Tool,
    handler: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(tool: Tool, handler: F) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            tool,
            handler: Arc::new(move |call: ToolCall| -> BoxFuture<'static, Result<ToolResult>> {
                Box::pin(handler(call))
            }),
        }
    }
}

#[async_trait]
impl ToolExecutor for FunctionTool {
    fn tools(&self) -> Vec<Tool> {
        vec![self.tool.clone()]
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        (self.handler)(call.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(name: &str, reply: &'static str) -> Arc<dyn ToolExecutor> {
        Arc::new(FunctionTool::new(
            Tool::new(name, "echo", json!({"type": "object"})),
            move |call| async move { Ok(ToolResult::success(&call, reply)) },
        ))
    }

    #[tokio::test]
    async fn later_registration_takes_over_name() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("a", "first"));
        registry.register(echo("b", "other"));
        registry.register(echo("a", "second"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tools()[0].name, "a");

        let (_, executor) = registry.resolve("a").unwrap();
        let result = executor.execute(&ToolCall::new("a", json!({}))).await.unwrap();
        assert_eq!(result.content, "second");
        assert!(registry.resolve("missing").is_none());
    }
}
