//! The demonstration agent behind `relay run`.
//!
//! A three-node workflow (`plan`, `act`, `respond`) over a mock model that
//! always asks for the `word_count` tool once and then answers.

use relay_config::RelayConfig;
use relay_core::{
    Prompt, RelayError, Result, StreamFrame, Tool, ToolCall, ToolResult,
};
use relay_runtime::{
    Agent, AgentContext, EventHandler, EventTrace, FileTraceWriter, FunctionTool,
    FunctionalStrategy, MockPromptExecutor, WorkflowExecutor,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

fn word_count_tool() -> FunctionTool {
    FunctionTool::new(
        Tool::new(
            "word_count",
            "Count the words in a text",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        ),
        |call: ToolCall| async move {
            let text = call.arguments["text"].as_str().unwrap_or_default();
            let count = text.split_whitespace().count();
            Ok(ToolResult::success(&call, count.to_string()).with_data(json!({ "count": count })))
        },
    )
}

async fn answer(ctx: AgentContext, question: String, stream: bool) -> Result<Option<String>> {
    let mut prompt = Prompt::new("demo");
    if let Some(system) = ctx.system_prompt() {
        prompt = prompt.system(system);
    }
    let prompt = prompt.user(question.clone());

    let planning = prompt.clone();
    let calls = ctx
        .node("plan", question, |ctx, _question: String| async move {
            let responses = ctx.call_model(planning).await?;
            Ok::<_, RelayError>(
                responses
                    .into_iter()
                    .flat_map(|m| m.tool_calls)
                    .collect::<Vec<ToolCall>>(),
            )
        })
        .await?;

    let results = ctx
        .node("act", calls, |ctx, calls: Vec<ToolCall>| async move {
            ctx.execute_tools(calls).await
        })
        .await?;

    let reply = ctx
        .node("respond", results, |ctx, _results: Vec<ToolResult>| async move {
            if stream {
                let frames = ctx.call_model_streaming(prompt).await?;
                let text: String = frames
                    .into_iter()
                    .filter_map(|frame| match frame {
                        StreamFrame::Append { text } => Some(text),
                        _ => None,
                    })
                    .collect();
                Ok::<_, RelayError>(text.trim_end().to_string())
            } else {
                let responses = ctx.call_model(prompt).await?;
                Ok(responses
                    .into_iter()
                    .next()
                    .map(|m| m.content)
                    .unwrap_or_default())
            }
        })
        .await?;

    Ok(Some(reply))
}

/// Build the demonstration agent for `input` from `config`.
pub fn build_agent(
    config: &RelayConfig,
    input: &str,
    stream: bool,
) -> Result<Agent<impl WorkflowExecutor<Input = String, Output = String>>> {
    let words = input.split_whitespace().count();
    let executor = MockPromptExecutor::new()
        .with_tool_call("word_count", json!({ "text": input }))
        .with_response(&format!("Your message has {words} words."));

    let strategy = FunctionalStrategy::new("demo", move |ctx: AgentContext, question: String| {
        answer(ctx, question, stream)
    });

    let mut builder = Agent::builder(strategy)
        .with_config(config)
        .tool(Arc::new(word_count_tool()))
        .prompt_executor(Arc::new(executor))
        .install(&EventHandler::named("console"), |handler| {
            handler
                .on_tool_call_completed(|ctx| async move {
                    info!(tool = %ctx.tool_name, result = %ctx.result.content, "tool finished");
                    Ok(())
                })
                .on_agent_completed(|ctx| async move {
                    info!(run_id = %ctx.run_id, result = %ctx.result, "agent finished");
                    Ok(())
                });
            Ok(())
        })?;

    if config.trace.enabled {
        let file = config.trace.file.clone();
        builder = builder.install(&EventTrace, move |trace| {
            if let Some(path) = file {
                trace.add_writer(Arc::new(FileTraceWriter::new(path)));
            }
            Ok(())
        })?;
    }

    Ok(builder.build())
}
