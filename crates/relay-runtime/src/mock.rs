//! Mock prompt executor for deterministic testing.
//!
//! Returns pre-configured responses without talking to any model.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{
    Message, Prompt, PromptExecutor, RelayError, Result, Role, StreamFrame, Tool, ToolCall,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A pre-configured response from the mock executor.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    /// If set, the executor fails with this message instead.
    pub error: Option<String>,
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

/// One request the mock received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub prompt: Prompt,
    pub model: String,
    pub tools: Vec<Tool>,
    pub streaming: bool,
}

/// A prompt executor that replays queued responses in order.
///
/// # Example
/// ```
/// use relay_runtime::mock::MockPromptExecutor;
/// let executor = MockPromptExecutor::new().with_response("Hello, world!");
/// ```
#[derive(Default)]
pub struct MockPromptExecutor {
    responses: Mutex<Vec<MockResponse>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockPromptExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push(MockResponse::text(text));
        self
    }

    /// Queue a tool call response.
    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        self.responses.lock().push(MockResponse {
            tool_calls: vec![
                ToolCall::new(name, args).with_id(format!("call_{}", uuid::Uuid::new_v4())),
            ],
            ..Default::default()
        });
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push(MockResponse::error(error));
        self
    }

    pub fn with_mock_response(self, response: MockResponse) -> Self {
        self.responses.lock().push(response);
        self
    }

    /// All requests received so far.
    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, prompt: &Prompt, model: &str, tools: &[Tool], streaming: bool) {
        self.requests.lock().push(RecordedRequest {
            prompt: prompt.clone(),
            model: model.to_string(),
            tools: tools.to_vec(),
            streaming,
        });
    }

    /// Pop the next queued response, or a default "no response queued" message.
    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            MockResponse::text("(mock: no more queued responses)")
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl PromptExecutor for MockPromptExecutor {
    async fn execute(&self, prompt: &Prompt, model: &str, tools: &[Tool]) -> Result<Vec<Message>> {
        self.record(prompt, model, tools, false);
        let mock = self.next_response();
        if let Some(error) = mock.error {
            return Err(RelayError::Model(error));
        }

        let mut messages = Vec::new();
        if !mock.text.is_empty() {
            messages.push(Message::text(Role::Assistant, mock.text));
        }
        if !mock.tool_calls.is_empty() {
            messages.push(Message::tool_calls(mock.tool_calls));
        }
        Ok(messages)
    }

    async fn execute_streaming(
        &self,
        prompt: &Prompt,
        model: &str,
        tools: &[Tool],
    ) -> Result<mpsc::Receiver<StreamFrame>> {
        self.record(prompt, model, tools, true);
        let mock = self.next_response();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            if let Some(message) = mock.error {
                let _ = tx.send(StreamFrame::Error { message }).await;
                return;
            }
            // Stream the text word by word
            for word in mock.text.split_whitespace() {
                let _ = tx
                    .send(StreamFrame::Append {
                        text: format!("{word} "),
                    })
                    .await;
            }
            for call in mock.tool_calls {
                let _ = tx.send(StreamFrame::ToolCall { call }).await;
            }
            let _ = tx
                .send(StreamFrame::End {
                    finish_reason: Some("stop".into()),
                })
                .await;
        });

        Ok(rx)
    }
}
