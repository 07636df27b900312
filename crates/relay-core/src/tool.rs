use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a tool that can be called by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name, e.g. "calculator.add", "file.read".
    pub name: String,
    /// Human-readable description for the model.
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Property names listed under `required` in the parameter schema.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Check a call's arguments against the parameter schema.
    ///
    /// Arguments must be a JSON object carrying every required property.
    pub fn validate_arguments(&self, arguments: &Value) -> std::result::Result<(), String> {
        let Some(object) = arguments.as_object() else {
            return Err(format!("arguments for {} must be a JSON object", self.name));
        };
        let missing: Vec<&str> = self
            .required_parameters()
            .into_iter()
            .filter(|name| !object.contains_key(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "missing required argument(s) for {}: {}",
                self.name,
                missing.join(", ")
            ))
        }
    }
}

/// A request from the model to call a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; absent for calls issued directly by a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// The result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
    /// Optional structured data returned alongside the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            content: content.into(),
            is_error: false,
            data: None,
        }
    }

    pub fn failure(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            content: message.into(),
            is_error: true,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Trait implemented by anything that can execute tool calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// List all tools this executor provides.
    fn tools(&self) -> Vec<Tool>;

    /// Execute a single tool call and return the result.
    async fn execute(&self, call: &ToolCall) -> crate::Result<ToolResult>;
}
