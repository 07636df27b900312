use uuid::Uuid;

/// Unique identifier for an agent instance.
pub type AgentId = String;

/// Unique identifier for one run of an agent.
pub type RunId = String;

/// Unique identifier for one fired lifecycle event.
pub type EventId = Uuid;

/// Generate a fresh run identifier.
pub fn new_run_id() -> RunId {
    Uuid::new_v4().to_string()
}

/// Generate a fresh event identifier.
pub fn new_event_id() -> EventId {
    Uuid::new_v4()
}

/// Short, stable type name used in event payloads (`alloc::string::String` -> `String`).
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Tuples, slices, arrays, references and pointers are left as they are.
    if full.starts_with(['(', '[', '&', '*']) {
        return full;
    }
    // Generic arguments keep their full paths; only the outer path is trimmed.
    let outer_len = full.find('<').unwrap_or(full.len());
    match full[..outer_len].rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
