//! Built-in features.

pub mod event_handler;
pub mod trace;

pub use event_handler::{EventHandler, EventHandlerConfig, InstalledEventHandler};
pub use trace::{
    EventTrace, EventTraceConfig, EventTraceHandle, FileTraceWriter, MemoryTraceWriter,
    TraceRecord, TraceWriter,
};
