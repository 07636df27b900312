//! `EventTrace`: a full-fidelity record of every lifecycle event.
//!
//! The trace must see the complete event stream, so its configuration refuses
//! custom event filters. Every event is logged on the `relay::trace` target
//! and written to each configured [`TraceWriter`]. Writers are feature
//! resources: opened before each run and closed after it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{RelayError, Result};
use relay_pipeline::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One traced event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventSnapshot,
}

impl TraceRecord {
    pub fn new(event: EventSnapshot) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// A sink for trace records.
#[async_trait]
pub trait TraceWriter: FeatureResource {
    async fn write(&self, record: &TraceRecord) -> Result<()>;
}

// ── Configuration ──────────────────────────────────────────────

pub struct EventTraceConfig {
    base: FeatureConfig,
    writers: Vec<Arc<dyn TraceWriter>>,
}

impl EventTraceConfig {
    /// Add a writer; it is also registered as a resource of the feature.
    pub fn add_writer<W: TraceWriter + 'static>(&mut self, writer: Arc<W>) -> &mut Self {
        self.base.add_resource(writer.clone());
        self.writers.push(writer);
        self
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

impl FeatureConfiguration for EventTraceConfig {
    fn base(&self) -> &FeatureConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut FeatureConfig {
        &mut self.base
    }
}

// ── Feature ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct EventTrace;

impl EventTrace {
    pub const NAME: &'static str = "event-trace";
}

/// Handle kept by the pipeline for an installed trace.
#[derive(Debug, Clone, Default)]
pub struct EventTraceHandle {
    traced: Arc<AtomicU64>,
}

impl EventTraceHandle {
    /// Number of events traced since installation.
    pub fn events_traced(&self) -> u64 {
        self.traced.load(Ordering::Relaxed)
    }
}

async fn trace(
    writers: &[Arc<dyn TraceWriter>],
    traced: &AtomicU64,
    event: EventSnapshot,
) -> Result<()> {
    debug!(
        target: "relay::trace",
        event = %event.kind,
        run_id = %event.run_id,
        path = %event.path,
        payload = %event.payload,
        "lifecycle event"
    );
    traced.fetch_add(1, Ordering::Relaxed);
    let record = TraceRecord::new(event);
    for writer in writers {
        writer.write(&record).await?;
    }
    Ok(())
}

impl Feature for EventTrace {
    type Config = EventTraceConfig;
    type Implementation = EventTraceHandle;

    fn key(&self) -> FeatureKey {
        FeatureKey::of::<EventTrace>(Self::NAME)
    }

    fn create_initial_config(&self) -> EventTraceConfig {
        EventTraceConfig {
            base: FeatureConfig::unfiltered(Self::NAME),
            writers: Vec::new(),
        }
    }

    fn install(
        &self,
        config: EventTraceConfig,
        pipeline: &mut AgentPipeline,
    ) -> Result<EventTraceHandle> {
        let key = self.key();
        let writers: Arc<[Arc<dyn TraceWriter>]> = config.writers.into();
        let handle = EventTraceHandle::default();

        let (w, t) = (Arc::clone(&writers), Arc::clone(&handle.traced));
        pipeline.intercept_all_events(&key, move |event| {
            let (writers, traced) = (Arc::clone(&w), Arc::clone(&t));
            async move { trace(&writers, &traced, event).await }
        });

        let (w, t) = (writers, Arc::clone(&handle.traced));
        pipeline.intercept_environment_transforming(&key, move |ctx, env| {
            let (writers, traced) = (Arc::clone(&w), Arc::clone(&t));
            async move {
                trace(&writers, &traced, ctx.as_event().snapshot()).await?;
                Ok(env)
            }
        });

        Ok(handle)
    }
}

// ── Writers ────────────────────────────────────────────────────

/// Appends records to a file as JSON lines.
pub struct FileTraceWriter {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileTraceWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl ToString) -> RelayError {
        RelayError::Resource {
            resource: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl FeatureResource for FileTraceWriter {
    fn name(&self) -> &str {
        "file-trace-writer"
    }

    async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        *self.file.lock().await = Some(file);
        debug!(path = %self.path.display(), "trace file opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TraceWriter for FileTraceWriter {
    async fn write(&self, record: &TraceRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.error("trace file is not open"))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemoryTraceWriter {
    records: Mutex<Vec<TraceRecord>>,
    initialized: AtomicUsize,
    closed: AtomicUsize,
}

impl MemoryTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    /// Event kinds in the order they were traced.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.records.lock().iter().map(|r| r.event.kind).collect()
    }

    pub fn times_initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn times_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureResource for MemoryTraceWriter {
    fn name(&self) -> &str {
        "memory-trace-writer"
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TraceWriter for MemoryTraceWriter {
    async fn write(&self, record: &TraceRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
