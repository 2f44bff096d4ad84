//! The structured build event stream.
//!
//! Every observable step of a build is reported as a typed [`Event`] on the
//! [`EventBus`]. Events are a user-facing data channel consumed by terminal
//! renderers and log collectors; internal diagnostics go through `tracing`
//! instead. Emission is synchronous and lossless: the core never drops an
//! event.
//!
//! Events are correlated through context ids. Each thread keeps a stack of
//! contexts; [`EventBus::push_context`] returns a guard that restores the
//! previous context when dropped, and events emitted on that thread carry the
//! innermost context id. Work handed to other threads passes its context id
//! explicitly via [`EventBus::emit_with_context`].

use crate::utils;
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Identifies one nested logging context, unique per [`EventBus`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Severity of an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One record on the event stream.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    /// Milliseconds since the unix epoch.
    pub timestamp_ms: u64,
    pub level: EventLevel,
    /// The innermost logging context this event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextId>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Kind-specific payload of an [`Event`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventPayload {
    BuildStarted { target: String },
    BuildLayerStarted { index: usize, jobs: Vec<String> },
    BuildLayerCompleted { index: usize },
    JobStarted { job: String, instance: u64 },
    JobFinished { job: String, duration_ms: u64 },
    JobFailed { job: String, error: String },
    BuildCompleted { duration_ms: u64 },
    BuildFailed { job: Option<String>, error: String },
    ScriptLog { message: String },
    CommandStdout { job: String, line: String },
    CommandStderr { job: String, line: String },
    CacheHit { artifact: String, fingerprint: String },
    CacheMiss { artifact: String, fingerprint: String },
}

/// Receives every event emitted on a bus.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn handle(&self, event: &Event) {
        (**self).handle(event)
    }
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextId>> = const { RefCell::new(Vec::new()) };
}

/// Dispatches [`Event`]s to the configured sinks and manages logging
/// contexts.
pub struct EventBus {
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
    next_context: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { sinks: Mutex::new(Vec::new()), next_context: AtomicU64::new(1) }
    }

    /// Registers a sink; all subsequent events are delivered to it.
    pub fn add_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().expect("event sink lock poisoned").push(sink);
    }

    /// Opens a fresh logging context on the current thread.
    ///
    /// The returned guard restores the previous context when dropped; the
    /// executor relies on this to release the context on every exit path of
    /// a job.
    pub fn push_context(&self) -> ContextGuard {
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(id));
        ContextGuard { id, _not_send: PhantomData }
    }

    /// The innermost context on the current thread.
    pub fn current_context(&self) -> Option<ContextId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().copied())
    }

    /// Emits an event under the current thread's context.
    pub fn emit(&self, level: EventLevel, payload: EventPayload) {
        self.emit_with_context(self.current_context(), level, payload);
    }

    /// Emits an event under an explicitly provided context.
    ///
    /// Used when work is executed on a different thread than the one that
    /// opened the context, e.g. shell output readers.
    pub fn emit_with_context(
        &self,
        context: Option<ContextId>,
        level: EventLevel,
        payload: EventPayload,
    ) {
        let event = Event { timestamp_ms: utils::unix_millis(), level, context, payload };
        let sinks = self.sinks.lock().expect("event sink lock poisoned");
        for sink in sinks.iter() {
            sink.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Restores the previous logging context when dropped.
///
/// Not `Send`: contexts are a per-thread stack.
pub struct ContextGuard {
    id: ContextId,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.last(), Some(&self.id));
            stack.pop();
        });
    }
}

/// A sink that retains every event; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("collecting sink lock poisoned").clone()
    }
}

impl EventSink for CollectingSink {
    fn handle(&self, event: &Event) {
        self.events.lock().expect("collecting sink lock poisoned").push(event.clone());
    }
}

/// Mirrors every event onto the `tracing` diagnostics stream.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &Event) {
        match event.level {
            EventLevel::Debug => debug!(context = ?event.context, payload = ?event.payload, "event"),
            EventLevel::Info => info!(context = ?event.context, payload = ?event.payload, "event"),
            EventLevel::Warn => warn!(context = ?event.context, payload = ?event.payload, "event"),
            EventLevel::Error => error!(context = ?event.context, payload = ?event.payload, "event"),
        }
    }
}

/// One captured script log line, stored in the artifact cache so it can be
/// replayed verbatim on cache hits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: EventLevel,
    pub message: String,
}

/// The log handle passed to artifact blueprints.
///
/// Messages are emitted as `script-log` events and captured so a successful
/// build can store them alongside its cache entry.
pub struct LogSink {
    bus: std::sync::Arc<EventBus>,
    context: Option<ContextId>,
    captured: Mutex<Vec<LogEntry>>,
}

impl LogSink {
    pub fn new(bus: std::sync::Arc<EventBus>, context: Option<ContextId>) -> Self {
        Self { bus, context, captured: Mutex::new(Vec::new()) }
    }

    pub fn log(&self, level: EventLevel, message: impl Into<String>) {
        let message = message.into();
        self.bus.emit_with_context(
            self.context,
            level,
            EventPayload::ScriptLog { message: message.clone() },
        );
        self.captured.lock().expect("log sink lock poisoned").push(LogEntry { level, message });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(EventLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(EventLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(EventLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(EventLevel::Error, message)
    }

    /// All entries captured so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.captured.lock().expect("log sink lock poisoned").clone()
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("context", &self.context).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn context_stack_nests_and_restores() {
        let bus = EventBus::new();
        assert_eq!(bus.current_context(), None);
        let outer = bus.push_context();
        assert_eq!(bus.current_context(), Some(outer.id()));
        {
            let inner = bus.push_context();
            assert_eq!(bus.current_context(), Some(inner.id()));
        }
        assert_eq!(bus.current_context(), Some(outer.id()));
        drop(outer);
        assert_eq!(bus.current_context(), None);
    }

    #[test]
    fn events_carry_current_context() {
        let bus = EventBus::new();
        let sink = Arc::new(CollectingSink::new());
        bus.add_sink(Box::new(sink.clone()));

        bus.emit(EventLevel::Info, EventPayload::ScriptLog { message: "outside".into() });
        let guard = bus.push_context();
        bus.emit(EventLevel::Info, EventPayload::ScriptLog { message: "inside".into() });

        let events = sink.events();
        assert_eq!(events[0].context, None);
        assert_eq!(events[1].context, Some(guard.id()));
    }

    #[test]
    fn event_kind_serializes_kebab_case() {
        let bus = EventBus::new();
        let sink = Arc::new(CollectingSink::new());
        bus.add_sink(Box::new(sink.clone()));
        bus.emit(EventLevel::Info, EventPayload::BuildLayerStarted { index: 0, jobs: vec![] });

        let json = serde_json::to_value(&sink.events()[0]).unwrap();
        assert_eq!(json["kind"], "build-layer-started");
        assert_eq!(json["level"], "info");
    }

    #[test]
    fn log_sink_captures_what_it_emits() {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(CollectingSink::new());
        bus.add_sink(Box::new(sink.clone()));

        let log = LogSink::new(bus, None);
        log.info("first");
        log.warn("second");

        assert_eq!(
            log.entries(),
            vec![
                LogEntry { level: EventLevel::Info, message: "first".into() },
                LogEntry { level: EventLevel::Warn, message: "second".into() },
            ]
        );
        assert_eq!(sink.events().len(), 2);
    }
}
