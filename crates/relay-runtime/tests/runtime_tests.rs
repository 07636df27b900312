#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_config::RelayConfig;
    use relay_core::*;
    use relay_pipeline::{AgentEnvironment, EventKind, Feature};
    use relay_runtime::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    // ── Helpers ────────────────────────────────────────────────────

    async fn greet(ctx: AgentContext, input: String) -> Result<Option<usize>> {
        let echoed = ctx
            .node("echo", input, |_ctx, input: String| async move {
                Ok::<_, RelayError>(input)
            })
            .await?;
        Ok(Some(echoed.len()))
    }

    fn greeter() -> AgentBuilder<impl WorkflowExecutor<Input = String, Output = usize>> {
        Agent::builder(FunctionalStrategy::new("greet", greet)).id("agent")
    }

    fn with_trace<W: WorkflowExecutor>(
        builder: AgentBuilder<W>,
    ) -> (AgentBuilder<W>, Arc<MemoryTraceWriter>) {
        let writer = Arc::new(MemoryTraceWriter::new());
        let w = Arc::clone(&writer);
        let builder = builder
            .install(&EventTrace, move |config| {
                config.add_writer(w);
                Ok(())
            })
            .unwrap();
        (builder, writer)
    }

    fn count_closings<W: WorkflowExecutor>(
        builder: AgentBuilder<W>,
    ) -> (AgentBuilder<W>, Arc<AtomicUsize>) {
        let closings = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closings);
        let builder = builder
            .install(&EventHandler::named("closing-counter"), move |config| {
                config.on_agent_closing(move |_ctx| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                Ok(())
            })
            .unwrap();
        (builder, closings)
    }

    fn adder() -> Arc<dyn ToolExecutor> {
        Arc::new(FunctionTool::new(
            Tool::new(
                "add",
                "Add two numbers",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                }),
            ),
            |call: ToolCall| async move {
                let a = call.arguments["a"].as_i64().unwrap_or_default();
                let b = call.arguments["b"].as_i64().unwrap_or_default();
                Ok(ToolResult::success(&call, (a + b).to_string()))
            },
        ))
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ── Lifecycle tests ────────────────────────────────────────────

    #[tokio::test]
    async fn test_successful_run_event_order() {
        let (builder, writer) = with_trace(greeter());
        let agent = builder.build();

        let output = agent.run("hello".to_string()).await.unwrap();
        assert_eq!(output, 5);

        assert_eq!(
            writer.kinds(),
            vec![
                EventKind::AgentEnvironmentTransforming,
                EventKind::AgentStarting,
                EventKind::StrategyStarting,
                EventKind::NodeStarting,
                EventKind::NodeCompleted,
                EventKind::StrategyCompleted,
                EventKind::AgentCompleted,
                EventKind::AgentClosing,
            ]
        );
        assert_eq!(writer.times_initialized(), 1);
        assert_eq!(writer.times_closed(), 1);
        assert_eq!(
            agent.last_run_state(),
            AgentRunState::Finished { result: json!(5) }
        );
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_events_report_nested_paths() {
        let (builder, writer) = with_trace(greeter());
        let agent = builder.build();
        agent.run("hi".to_string()).await.unwrap();

        let records = writer.records();
        let path_of = |kind: EventKind| {
            records
                .iter()
                .find(|r| r.event.kind == kind)
                .map(|r| r.event.path.clone())
                .unwrap()
        };
        assert_eq!(path_of(EventKind::AgentStarting), "agent");
        assert_eq!(path_of(EventKind::StrategyStarting), "agent/greet");
        assert_eq!(path_of(EventKind::NodeStarting), "agent/greet/echo");

        let run_ids: std::collections::HashSet<_> =
            records.iter().map(|r| r.event.run_id.clone()).collect();
        assert_eq!(run_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_runs_reopen_resources() {
        let (builder, writer) = with_trace(greeter());
        let agent = builder.build();

        agent.run("one".to_string()).await.unwrap();
        agent.run("three".to_string()).await.unwrap();

        assert_eq!(writer.times_initialized(), 2);
        assert_eq!(writer.times_closed(), 2);

        let handle = agent
            .feature::<EventTraceHandle>(&EventTrace.key())
            .unwrap();
        assert_eq!(handle.events_traced(), 16);
    }

    #[tokio::test]
    async fn test_workflow_error_fails_run() {
        let strategy = FunctionalStrategy::new("broken", |_ctx: AgentContext, _input: u32| async move {
            Err::<Option<u32>, _>(RelayError::Workflow("boom".into()))
        });
        let (builder, writer) = with_trace(Agent::builder(strategy));
        let agent = builder.build();

        let err = agent.run(1).await.unwrap_err();
        assert!(matches!(err, RelayError::Workflow(ref m) if m == "boom"));

        let kinds = writer.kinds();
        assert_eq!(
            &kinds[kinds.len() - 2..],
            &[EventKind::AgentExecutionFailed, EventKind::AgentClosing]
        );
        assert!(!kinds.contains(&EventKind::AgentCompleted));
        assert_eq!(writer.times_closed(), 1);
        assert!(matches!(agent.last_run_state(), AgentRunState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_empty_result_is_a_failure() {
        let strategy = FunctionalStrategy::new("silent", |_ctx: AgentContext, _input: u32| async move {
            Ok::<Option<u32>, RelayError>(None)
        });
        let agent = Agent::builder(strategy).build();

        let err = agent.run(1).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyResult { .. }));
        match agent.last_run_state() {
            AgentRunState::Failed { error } => assert!(error.contains("no result")),
            other => panic!("unexpected state {other}"),
        }
    }

    #[tokio::test]
    async fn test_node_failure_fires_failed_event() {
        async fn failing(ctx: AgentContext, input: u32) -> Result<Option<u32>> {
            let out = ctx
                .node("explode", input, |_ctx, _input: u32| async move {
                    Err::<u32, _>(RelayError::Workflow("node broke".into()))
                })
                .await?;
            Ok(Some(out))
        }
        let (builder, writer) = with_trace(Agent::builder(FunctionalStrategy::new("s", failing)));
        let agent = builder.build();

        assert!(agent.run(7).await.is_err());
        let records = writer.records();
        let failed = records
            .iter()
            .find(|r| r.event.kind == EventKind::NodeExecutionFailed)
            .unwrap();
        assert_eq!(failed.event.payload["node"]["name"], "explode");
        assert!(!writer.kinds().contains(&EventKind::NodeCompleted));
    }

    #[tokio::test]
    async fn test_handler_error_is_fail_fast() {
        let reached = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reached);
        let strategy = FunctionalStrategy::new("guarded", move |_ctx: AgentContext, input: u32| {
            let r = Arc::clone(&r);
            async move {
                r.store(true, Ordering::SeqCst);
                Ok::<_, RelayError>(Some(input))
            }
        });
        let (builder, closings) = count_closings(Agent::builder(strategy));
        let agent = builder
            .install(&EventHandler::new(), |config| {
                config.on_strategy_starting(|_ctx| async move {
                    Err(RelayError::Feature {
                        feature: "veto".into(),
                        reason: "not today".into(),
                    })
                });
                Ok(())
            })
            .unwrap()
            .build();

        let err = agent.run(1).await.unwrap_err();
        assert!(matches!(err, RelayError::Feature { ref feature, .. } if feature == "veto"));
        assert!(!reached.load(Ordering::SeqCst));
        assert_eq!(closings.load(Ordering::SeqCst), 1);
        assert!(matches!(agent.last_run_state(), AgentRunState::Failed { .. }));
    }

    /// A trace writer whose close always fails.
    struct UnclosableWriter;

    #[async_trait]
    impl relay_pipeline::FeatureResource for UnclosableWriter {
        fn name(&self) -> &str {
            "unclosable"
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Err(RelayError::Resource {
                resource: "unclosable".into(),
                reason: "close".into(),
            })
        }
    }

    #[async_trait]
    impl TraceWriter for UnclosableWriter {
        async fn write(&self, _record: &TraceRecord) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_failure_surfaces_only_on_success() {
        let strategy = FunctionalStrategy::new("maybe", |_ctx: AgentContext, fail: bool| async move {
            if fail {
                return Err(RelayError::Workflow("wf".into()));
            }
            Ok::<_, RelayError>(Some(true))
        });
        let agent = Agent::builder(strategy)
            .install(&EventTrace, |config| {
                config.add_writer(Arc::new(UnclosableWriter));
                Ok(())
            })
            .unwrap()
            .build();

        let err = agent.run(true).await.unwrap_err();
        assert!(matches!(err, RelayError::Workflow(ref m) if m == "wf"));
        assert!(matches!(agent.last_run_state(), AgentRunState::Failed { .. }));

        let err = agent.run(false).await.unwrap_err();
        assert!(matches!(err, RelayError::Resource { ref resource, .. } if resource == "unclosable"));
        assert_eq!(
            agent.last_run_state(),
            AgentRunState::Finished { result: json!(true) }
        );
        assert!(!agent.is_running());
    }

    // ── Concurrency tests ──────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_at_most_one_active_run() {
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        let strategy = FunctionalStrategy::new("slow", move |_ctx: AgentContext, input: u32| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok::<_, RelayError>(Some(input))
            }
        });
        let agent = Arc::new(Agent::builder(strategy).id("solo").build());

        let first = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.run(1).await })
        };
        wait_until(|| agent.last_run_state().name() == "running").await;

        let err = agent.run(2).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyRunning { ref agent_id } if agent_id == "solo"));
        // The refused run must not disturb the active one.
        assert_eq!(agent.last_run_state().name(), "running");

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert!(!agent.is_running());

        release.notify_one();
        assert_eq!(agent.run(3).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_still_cleans_up() {
        let strategy = FunctionalStrategy::new("forever", |_ctx: AgentContext, _input: u32| async move {
            std::future::pending::<()>().await;
            Ok::<Option<u32>, RelayError>(None)
        });
        let (builder, closings) = count_closings(Agent::builder(strategy));
        let (builder, writer) = with_trace(builder);
        let agent = Arc::new(builder.build());

        let token = CancellationToken::new();
        let run = {
            let (agent, token) = (Arc::clone(&agent), token.clone());
            tokio::spawn(async move { agent.run_with_cancellation(0, token).await })
        };
        wait_until(|| agent.last_run_state().name() == "running").await;
        token.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
        assert_eq!(closings.load(Ordering::SeqCst), 1);
        assert_eq!(writer.times_closed(), 1);
        assert!(writer.kinds().contains(&EventKind::AgentExecutionFailed));
        assert!(!agent.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_run_still_cleans_up() {
        let strategy = FunctionalStrategy::new("forever", |_ctx: AgentContext, _input: u32| async move {
            std::future::pending::<()>().await;
            Ok::<Option<u32>, RelayError>(None)
        });
        let (builder, closings) = count_closings(Agent::builder(strategy));
        let (builder, writer) = with_trace(builder);
        let agent = Arc::new(builder.build());

        let run = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.run(0).await })
        };
        wait_until(|| agent.last_run_state().name() == "running").await;
        run.abort();

        wait_until(|| !agent.is_running()).await;
        assert_eq!(closings.load(Ordering::SeqCst), 1);
        assert_eq!(writer.times_closed(), 1);
        assert!(matches!(agent.last_run_state(), AgentRunState::Failed { .. }));
        assert!(!writer.kinds().contains(&EventKind::AgentCompleted));
    }

    #[tokio::test]
    async fn test_nested_scope_is_rejected() {
        let mut config = RelayConfig::default();
        config.agent.id = "nested".into();
        config.pipeline.path_separator = "::".into();
        let (builder, closings) = count_closings(greeter().with_config(&config));
        let agent = builder.build();
        assert_eq!(agent.id(), "nested");

        let scope = RunScope::new(
            new_run_id(),
            "nested",
            ExecutionInfo::root("parent").with_child("nested"),
        );
        let err = agent
            .session(scope, CancellationToken::new())
            .run("x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotTopLevel { ref path } if path == "parent::nested"));
        assert_eq!(agent.last_run_state(), AgentRunState::NotStarted);
        assert_eq!(closings.load(Ordering::SeqCst), 0);
    }

    // ── Tool tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_tool_events() {
        async fn use_tools(ctx: AgentContext, _input: ()) -> Result<Option<Vec<String>>> {
            let results = ctx
                .execute_tools(vec![
                    ToolCall::new("add", json!({"a": 2, "b": 3})),
                    ToolCall::new("add", json!({"a": 2})),
                    ToolCall::new("missing", json!({})),
                ])
                .await?;
            Ok(Some(results.into_iter().map(|r| r.content).collect()))
        }

        let (builder, writer) =
            with_trace(Agent::builder(FunctionalStrategy::new("tools", use_tools)).tool(adder()));
        let agent = builder.build();
        assert_eq!(agent.tools().len(), 1);

        let contents = agent.run(()).await.unwrap();
        assert_eq!(contents[0], "5");
        assert!(contents[1].contains("missing required argument"));
        assert!(contents[2].contains("missing"));

        let tool_kinds: Vec<EventKind> = writer
            .kinds()
            .into_iter()
            .filter(|k| k.as_str().starts_with("tool_"))
            .collect();
        assert_eq!(
            tool_kinds,
            vec![
                EventKind::ToolCallStarting,
                EventKind::ToolCallCompleted,
                EventKind::ToolCallStarting,
                EventKind::ToolValidationFailed,
                EventKind::ToolCallStarting,
                EventKind::ToolCallFailed,
            ]
        );
    }

    struct CountingEnvironment {
        inner: Arc<dyn AgentEnvironment>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentEnvironment for CountingEnvironment {
        async fn execute_tool(&self, scope: &RunScope, call: ToolCall) -> Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute_tool(scope, call).await
        }

        async fn report_problem(&self, scope: &RunScope, error: &RelayError) -> Result<()> {
            self.inner.report_problem(scope, error).await
        }
    }

    #[tokio::test]
    async fn test_environment_transformer_wraps_tool_calls() {
        async fn add_once(ctx: AgentContext, _input: ()) -> Result<Option<String>> {
            let result = ctx
                .execute_tool(ToolCall::new("add", json!({"a": 1, "b": 1})))
                .await?;
            Ok(Some(result.content))
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let agent = Agent::builder(FunctionalStrategy::new("wrapped", add_once))
            .tool(adder())
            .install(&EventHandler::new(), move |config| {
                config.on_environment_transforming(move |_ctx, env| {
                    let calls = Arc::clone(&c);
                    async move {
                        let wrapped: Arc<dyn AgentEnvironment> =
                            Arc::new(CountingEnvironment { inner: env, calls });
                        Ok(wrapped)
                    }
                });
                Ok(())
            })
            .unwrap()
            .build();

        assert_eq!(agent.run(()).await.unwrap(), "2");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Model tests ────────────────────────────────────────────────

    async fn ask(ctx: AgentContext, question: String) -> Result<Option<String>> {
        let responses = ctx
            .call_model(Prompt::new("ask").user(question))
            .await?;
        Ok(responses.into_iter().next().map(|m| m.content))
    }

    #[tokio::test]
    async fn test_model_call_events() {
        let executor = Arc::new(MockPromptExecutor::new().with_response("forty-two"));
        let (builder, writer) = with_trace(
            Agent::builder(FunctionalStrategy::new("ask", ask))
                .tool(adder())
                .prompt_executor(executor.clone()),
        );
        let agent = builder.build();

        assert_eq!(agent.run("meaning?".to_string()).await.unwrap(), "forty-two");

        let kinds = writer.kinds();
        let starting = kinds.iter().position(|k| *k == EventKind::LlmCallStarting).unwrap();
        let completed = kinds.iter().position(|k| *k == EventKind::LlmCallCompleted).unwrap();
        assert!(starting < completed);

        let requests = executor.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "mock/echo");
        assert_eq!(requests[0].tools[0].name, "add");
        assert!(!requests[0].streaming);
    }

    #[tokio::test]
    async fn test_model_call_without_executor_fails() {
        let agent = Agent::builder(FunctionalStrategy::new("ask", ask)).build();
        let err = agent.run("?".to_string()).await.unwrap_err();
        assert!(matches!(err, RelayError::Model(_)));
    }

    async fn stream(ctx: AgentContext, question: String) -> Result<Option<usize>> {
        let frames = ctx
            .call_model_streaming(Prompt::new("stream").user(question))
            .await?;
        Ok(Some(frames.len()))
    }

    #[tokio::test]
    async fn test_streaming_events() {
        let executor = Arc::new(MockPromptExecutor::new().with_response("hello world"));
        let (builder, writer) = with_trace(
            Agent::builder(FunctionalStrategy::new("stream", stream)).prompt_executor(executor),
        );
        let agent = builder.build();

        assert_eq!(agent.run("go".to_string()).await.unwrap(), 3);

        let streaming: Vec<EventKind> = writer
            .kinds()
            .into_iter()
            .filter(|k| k.as_str().starts_with("stream"))
            .collect();
        assert_eq!(
            streaming,
            vec![
                EventKind::StreamingStarting,
                EventKind::StreamFrameReceived,
                EventKind::StreamFrameReceived,
                EventKind::StreamFrameReceived,
                EventKind::StreamingCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_streaming_error_frame() {
        let executor = Arc::new(MockPromptExecutor::new().with_error("overloaded"));
        let (builder, writer) = with_trace(
            Agent::builder(FunctionalStrategy::new("stream", stream)).prompt_executor(executor),
        );
        let agent = builder.build();

        let err = agent.run("go".to_string()).await.unwrap_err();
        assert!(matches!(err, RelayError::Model(ref m) if m == "overloaded"));
        let kinds = writer.kinds();
        assert!(kinds.contains(&EventKind::StreamingFailed));
        assert!(!kinds.contains(&EventKind::StreamingCompleted));
    }

    // ── Feature tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_event_handler_callbacks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&log), Arc::clone(&log));
        let agent = greeter()
            .install(&EventHandler::new(), move |config| {
                config
                    .on_agent_starting(move |_ctx| {
                        let log = Arc::clone(&first);
                        async move {
                            log.lock().push("first");
                            Ok(())
                        }
                    })
                    .on_agent_starting(move |_ctx| {
                        let log = Arc::clone(&second);
                        async move {
                            log.lock().push("second");
                            Ok(())
                        }
                    });
                assert_eq!(config.callback_count(EventKind::AgentStarting), 2);
                Ok(())
            })
            .unwrap()
            .build();

        let installed = agent
            .feature::<InstalledEventHandler>(&EventHandler::new().key())
            .unwrap();
        assert_eq!(installed.kinds, vec![EventKind::AgentStarting]);

        agent.run("x".to_string()).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    const VISITS: StorageKey<u32> = StorageKey::new("visits");

    #[tokio::test]
    async fn test_storage_is_shared_across_nodes_and_reset_per_run() {
        async fn visit(ctx: AgentContext, _input: ()) -> Result<Option<u32>> {
            for name in ["a", "b"] {
                ctx.node(name, (), |ctx, _input: ()| async move {
                    let visits = ctx.storage().get(&VISITS).map_or(0, |v| *v);
                    ctx.storage().set(&VISITS, visits + 1);
                    Ok::<_, RelayError>(())
                })
                .await?;
            }
            Ok(ctx.storage().get(&VISITS).map(|v| *v))
        }

        let agent = Agent::builder(FunctionalStrategy::new("visit", visit)).build();
        assert_eq!(agent.run(()).await.unwrap(), 2);
        assert_eq!(agent.run(()).await.unwrap(), 2);
    }
}
