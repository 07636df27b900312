#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_core::*;
    use relay_pipeline::resources::{close_resources, initialize_resources};
    use relay_pipeline::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn scope() -> RunScope {
        RunScope::new("run-1", "agent", ExecutionInfo::root("agent"))
    }

    /// Records agent-starting and tool-call-starting events under its name.
    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
        tag: &'static str,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail: false,
                tag: "",
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn tagged(mut self, tag: &'static str) -> Self {
            self.tag = tag;
            self
        }
    }

    impl Feature for Recorder {
        type Config = FeatureConfig;
        type Implementation = &'static str;

        fn key(&self) -> FeatureKey {
            FeatureKey::of::<Recorder>(self.name)
        }

        fn create_initial_config(&self) -> FeatureConfig {
            FeatureConfig::new()
        }

        fn install(&self, _config: FeatureConfig, pipeline: &mut AgentPipeline) -> Result<&'static str> {
            let key = self.key();
            let (name, tag, fail) = (self.name, self.tag, self.fail);

            let log = Arc::clone(&self.log);
            pipeline.intercept_agent_starting(&key, move |ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(format!("{name}{tag}:start:{}", ctx.agent_id));
                    if fail {
                        return Err(RelayError::Feature {
                            feature: name.to_string(),
                            reason: "boom".into(),
                        });
                    }
                    Ok(())
                }
            });

            let log = Arc::clone(&self.log);
            pipeline.intercept_tool_call_starting(&key, move |ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(format!("{name}{tag}:tool:{}", ctx.tool_name));
                    Ok(())
                }
            });
            Ok(name)
        }
    }

    /// A feature that requires the unfiltered stream.
    struct Locked;

    impl Feature for Locked {
        type Config = FeatureConfig;
        type Implementation = ();

        fn key(&self) -> FeatureKey {
            FeatureKey::of::<Locked>("locked")
        }

        fn create_initial_config(&self) -> FeatureConfig {
            FeatureConfig::unfiltered("locked")
        }

        fn install(&self, _config: FeatureConfig, _pipeline: &mut AgentPipeline) -> Result<()> {
            Ok(())
        }
    }

    /// Registers an agent-starting handler, then optionally fails its install.
    struct HalfInstalled {
        hits: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Feature for HalfInstalled {
        type Config = FeatureConfig;
        type Implementation = ();

        fn key(&self) -> FeatureKey {
            FeatureKey::of::<HalfInstalled>("half")
        }

        fn create_initial_config(&self) -> FeatureConfig {
            FeatureConfig::new()
        }

        fn install(&self, _config: FeatureConfig, pipeline: &mut AgentPipeline) -> Result<()> {
            let (hits, fail) = (Arc::clone(&self.hits), self.fail);
            pipeline.intercept_agent_starting(&self.key(), move |_ctx| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(if fail { 100 } else { 1 }, Ordering::SeqCst);
                    Ok(())
                }
            });
            pipeline.intercept_environment_transforming(&self.key(), |_ctx, env| async move { Ok(env) });
            if self.fail {
                return Err(RelayError::Feature {
                    feature: "half".into(),
                    reason: "install failed".into(),
                });
            }
            Ok(())
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    // ── Dispatch tests ─────────────────────────────────────────

    #[tokio::test]
    async fn test_handlers_fire_in_installation_order() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        pipeline.install(&Recorder::new("a", &log), |_| Ok(())).unwrap();
        pipeline.install(&Recorder::new("b", &log), |_| Ok(())).unwrap();

        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert_eq!(entries(&log), vec!["a:start:agent", "b:start:agent"]);
    }

    #[tokio::test]
    async fn test_reinstall_replaces_handler_in_place() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        pipeline.install(&Recorder::new("a", &log), |_| Ok(())).unwrap();
        pipeline.install(&Recorder::new("b", &log), |_| Ok(())).unwrap();
        pipeline
            .install(&Recorder::new("a", &log).tagged("2"), |_| Ok(()))
            .unwrap();

        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert_eq!(entries(&log), vec!["a2:start:agent", "b:start:agent"]);
        assert_eq!(pipeline.installed_features().len(), 2);
        assert_eq!(pipeline.interceptor_count::<AgentStartingContext>(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_later_handlers() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        pipeline.install(&Recorder::new("a", &log).failing(), |_| Ok(())).unwrap();
        pipeline.install(&Recorder::new("b", &log), |_| Ok(())).unwrap();
        pipeline.install(&Recorder::new("c", &log), |_| Ok(())).unwrap();

        let err = pipeline.on_agent_starting(&scope()).await.unwrap_err();
        assert!(matches!(err, RelayError::Feature { ref feature, .. } if feature == "a"));
        assert_eq!(entries(&log), vec!["a:start:agent"]);
    }

    #[tokio::test]
    async fn test_no_handlers_is_a_no_op() {
        let pipeline = AgentPipeline::new();
        pipeline.on_agent_closing(&scope()).await.unwrap();
        pipeline
            .on_node_completed(&scope(), &NodeRef::new("n"), &1, &"out")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_same_context_instance_reaches_every_handler() {
        let seen: Arc<Mutex<Vec<EventId>>> = Arc::default();
        let mut pipeline = AgentPipeline::new();
        for name in ["x", "y"] {
            let key = FeatureKey::of::<Locked>(name);
            let seen = Arc::clone(&seen);
            pipeline.intercept_node_starting(&key, move |ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(ctx.event_id);
                    Ok(())
                }
            });
        }
        pipeline
            .on_node_starting(&scope(), &NodeRef::new("n"), &json!({"k": 1}))
            .await
            .unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    // ── Filter tests ───────────────────────────────────────────

    #[tokio::test]
    async fn test_filter_gates_only_its_feature() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        pipeline
            .install(&Recorder::new("a", &log), |config| {
                config.set_event_filter(|event| match event {
                    EventRef::ToolCallStarting(ctx) => ctx.tool_name != "secret",
                    _ => true,
                })
            })
            .unwrap();
        pipeline.install(&Recorder::new("b", &log), |_| Ok(())).unwrap();

        let call = ToolCall::new("secret", json!({}));
        pipeline.on_tool_call_starting(&scope(), &call).await.unwrap();
        assert_eq!(entries(&log), vec!["b:tool:secret"]);

        let call = ToolCall::new("search", json!({}));
        pipeline.on_tool_call_starting(&scope(), &call).await.unwrap();
        assert_eq!(
            entries(&log),
            vec!["b:tool:secret", "a:tool:search", "b:tool:search"]
        );
    }

    #[tokio::test]
    async fn test_filter_is_read_from_registry_at_dispatch() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        pipeline
            .install(&Recorder::new("a", &log), |config| {
                config.set_event_filter(|_| false)
            })
            .unwrap();
        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert!(entries(&log).is_empty());

        pipeline.install(&Recorder::new("a", &log), |_| Ok(())).unwrap();
        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert_eq!(entries(&log), vec!["a:start:agent"]);
    }

    #[test]
    fn test_locked_filter_is_a_usage_error() {
        let mut pipeline = AgentPipeline::new();
        let err = pipeline
            .install(&Locked, |config| config.set_event_filter(|_| true))
            .unwrap_err();
        assert!(matches!(err, RelayError::FilterLocked { .. }));
        assert!(err.is_usage_error());
        assert!(pipeline.installed_features().is_empty());
    }

    #[test]
    fn test_locked_filter_survives_base_replacement() {
        let mut pipeline = AgentPipeline::new();
        let err = pipeline
            .install(&Locked, |config| {
                *config.base_mut() = FeatureConfig::new();
                config.set_event_filter(|_| false)
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::FilterLocked { ref feature } if feature == "locked"));
        assert!(pipeline.installed_features().is_empty());

        // Replacing the base without setting a filter is refused as well.
        let err = pipeline
            .install(&Locked, |config| {
                *config = FeatureConfig::new();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::FilterLocked { .. }));
    }

    // ── Feature registry tests ─────────────────────────────────

    #[tokio::test]
    async fn test_failed_install_leaves_no_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pipeline = AgentPipeline::new();
        let failing = HalfInstalled {
            hits: Arc::clone(&hits),
            fail: true,
        };
        assert!(pipeline.install(&failing, |_| Ok(())).is_err());

        assert!(pipeline.installed_features().is_empty());
        assert_eq!(pipeline.interceptor_count::<AgentStartingContext>(), 0);
        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_reinstall_keeps_previous_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pipeline = AgentPipeline::new();
        pipeline
            .install(
                &HalfInstalled {
                    hits: Arc::clone(&hits),
                    fail: false,
                },
                |_| Ok(()),
            )
            .unwrap();
        let failing = HalfInstalled {
            hits: Arc::clone(&hits),
            fail: true,
        };
        assert!(pipeline.install(&failing, |_| Ok(())).is_err());

        pipeline.on_agent_starting(&scope()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.installed_features(), vec![failing.key()]);
    }


    #[test]
    fn test_feature_lookup_downcasts() {
        let log: Log = Arc::default();
        let mut pipeline = AgentPipeline::new();
        let recorder = Recorder::new("a", &log);
        let installed = pipeline.install(&recorder, |_| Ok(())).unwrap();
        assert_eq!(*installed, "a");

        let found = pipeline.feature::<&'static str>(&recorder.key()).unwrap();
        assert_eq!(*found, "a");
        assert!(pipeline.feature::<u32>(&recorder.key()).is_none());
        assert!(pipeline.feature::<&'static str>(&Locked.key()).is_none());
    }

    #[tokio::test]
    async fn test_intercept_all_events_snapshots() {
        let snapshots: Arc<Mutex<Vec<EventSnapshot>>> = Arc::default();
        let mut pipeline = AgentPipeline::new();
        let key = FeatureKey::of::<Locked>("all");
        let sink = Arc::clone(&snapshots);
        pipeline.intercept_all_events(&key, move |snapshot| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(snapshot);
                Ok(())
            }
        });
        assert_eq!(pipeline.interceptors().count_for(&key), EventKind::ALL.len() - 1);

        let nested = scope().child("node-a");
        pipeline.on_agent_starting(&scope()).await.unwrap();
        pipeline
            .on_tool_call_starting(&nested, &ToolCall::new("search", json!({"q": 1})).with_id("c1"))
            .await
            .unwrap();

        let snapshots = snapshots.lock();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].kind, EventKind::AgentStarting);
        assert_eq!(snapshots[1].path, "agent/node-a");
        assert_eq!(snapshots[1].payload["tool_call_id"], "c1");
    }

    // ── Environment fold tests ─────────────────────────────────

    struct Labelled(String);

    #[async_trait]
    impl AgentEnvironment for Labelled {
        async fn execute_tool(&self, _scope: &RunScope, call: ToolCall) -> Result<ToolResult> {
            Ok(ToolResult::success(&call, self.0.clone()))
        }

        async fn report_problem(&self, _scope: &RunScope, _error: &RelayError) -> Result<()> {
            Ok(())
        }
    }

    async fn label_of(env: &Arc<dyn AgentEnvironment>) -> String {
        env.execute_tool(&scope(), ToolCall::new("lookup", json!({})))
            .await
            .unwrap()
            .content
    }

    fn wrap(pipeline: &mut AgentPipeline, name: &'static str) {
        let key = FeatureKey::of::<Labelled>(name);
        pipeline.intercept_environment_transforming(&key, move |_ctx, env| async move {
            let inner = label_of(&env).await;
            Ok(Arc::new(Labelled(format!("{name}({inner})"))) as Arc<dyn AgentEnvironment>)
        });
    }

    #[tokio::test]
    async fn test_environment_transform_folds_in_order() {
        let mut pipeline = AgentPipeline::new();
        wrap(&mut pipeline, "T1");
        wrap(&mut pipeline, "T2");

        let base: Arc<dyn AgentEnvironment> = Arc::new(Labelled("E".into()));
        let env = pipeline
            .on_agent_environment_transforming(&scope(), base)
            .await
            .unwrap();
        assert_eq!(label_of(&env).await, "T2(T1(E))");
    }

    #[tokio::test]
    async fn test_environment_transform_without_transformers_returns_base() {
        let pipeline = AgentPipeline::new();
        let base: Arc<dyn AgentEnvironment> = Arc::new(Labelled("E".into()));
        let env = pipeline
            .on_agent_environment_transforming(&scope(), Arc::clone(&base))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&env, &base));
    }

    // ── Resource tests ─────────────────────────────────────────

    #[derive(Default)]
    struct Counting {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        initialized: AtomicUsize,
        closed: AtomicUsize,
    }

    struct TrackedResource {
        name: String,
        counters: Arc<Counting>,
        fail_init: bool,
        fail_close: bool,
    }

    #[async_trait]
    impl FeatureResource for TrackedResource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&self) -> Result<()> {
            let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(RelayError::Resource {
                    resource: self.name.clone(),
                    reason: "init failed".into(),
                });
            }
            self.counters.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(RelayError::Resource {
                    resource: self.name.clone(),
                    reason: "close failed".into(),
                });
            }
            Ok(())
        }
    }

    fn tracked_resources(counters: &Arc<Counting>, n: usize) -> Vec<Arc<dyn FeatureResource>> {
        (0..n)
            .map(|i| {
                Arc::new(TrackedResource {
                    name: format!("resource-{i}"),
                    counters: Arc::clone(counters),
                    fail_init: false,
                    fail_close: false,
                }) as Arc<dyn FeatureResource>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_resource_initialization_is_bounded() {
        let counters = Arc::new(Counting::default());
        initialize_resources(tracked_resources(&counters, 12), 5).await.unwrap();
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 12);
        let peak = counters.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrency was {peak}");
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_resource_initialization_failure_fails_preparation() {
        let counters = Arc::new(Counting::default());
        let mut resources = tracked_resources(&counters, 3);
        resources.push(Arc::new(TrackedResource {
            name: "bad".into(),
            counters: Arc::clone(&counters),
            fail_init: true,
            fail_close: false,
        }));
        let err = initialize_resources(resources, 5).await.unwrap_err();
        assert!(matches!(err, RelayError::Resource { ref resource, .. } if resource == "bad"));
    }

    #[tokio::test]
    async fn test_close_attempts_all_and_keeps_first_error() {
        let counters = Arc::new(Counting::default());
        let resources: Vec<Arc<dyn FeatureResource>> = ["r1", "r2", "r3"]
            .into_iter()
            .map(|name| {
                Arc::new(TrackedResource {
                    name: name.into(),
                    counters: Arc::clone(&counters),
                    fail_init: false,
                    fail_close: name != "r3",
                }) as Arc<dyn FeatureResource>
            })
            .collect();
        let err = close_resources(&resources).await.unwrap_err();
        assert!(matches!(err, RelayError::Resource { ref resource, .. } if resource == "r1"));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 3);
    }

    /// Installs one resource per feature instance.
    struct WithResource {
        name: &'static str,
        counters: Arc<Counting>,
    }

    impl Feature for WithResource {
        type Config = FeatureConfig;
        type Implementation = ();

        fn key(&self) -> FeatureKey {
            FeatureKey::of::<WithResource>(self.name)
        }

        fn create_initial_config(&self) -> FeatureConfig {
            let mut config = FeatureConfig::new();
            config.add_resource(Arc::new(TrackedResource {
                name: self.name.into(),
                counters: Arc::clone(&self.counters),
                fail_init: false,
                fail_close: false,
            }));
            config
        }

        fn install(&self, _config: FeatureConfig, _pipeline: &mut AgentPipeline) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipeline_prepares_and_closes_feature_resources() {
        let counters = Arc::new(Counting::default());
        let mut pipeline = AgentPipeline::new();
        for name in ["one", "two"] {
            let feature = WithResource {
                name,
                counters: Arc::clone(&counters),
            };
            pipeline.install(&feature, |_| Ok(())).unwrap();
        }
        let names: Vec<String> = pipeline.resources().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["one", "two"]);

        pipeline.prepare_features(5).await.unwrap();
        pipeline.close_features().await.unwrap();
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }
}
