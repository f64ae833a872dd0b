//! Observation registry: start/stop hooks around one unit of work.
//!
//! Handlers see `on_start` in registration order and `on_stop` in reverse,
//! so nested resources (spans, timers) unwind cleanly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::metrics::Tags;

/// Mutable state shared by all handlers of one observation.
pub struct ObservationContext {
    pub name: String,
    pub low_cardinality: Tags,
    pub high_cardinality: Tags,
    pub error: Option<String>,
    attributes: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl ObservationContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            low_cardinality: Tags::new(),
            high_cardinality: Tags::new(),
            error: None,
            attributes: HashMap::new(),
        }
    }

    /// Insert or replace a low-cardinality key value; keeps the vector sorted.
    pub fn low(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.low_cardinality, key, value.into());
        self
    }

    pub fn high(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.high_cardinality, key, value.into());
        self
    }

    pub fn low_value(&self, key: &str) -> Option<&str> {
        self.low_cardinality
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Handler-private state, keyed by a handler-chosen name.
    pub fn put<T: Any + Send + Sync>(&mut self, key: &'static str, value: T) {
        self.attributes.insert(key, Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &'static str) -> Option<&T> {
        self.attributes.get(key).and_then(|b| b.downcast_ref::<T>())
    }

    pub fn take<T: Any + Send + Sync>(&mut self, key: &'static str) -> Option<T> {
        let boxed = self.attributes.remove(key)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }
}

fn upsert(tags: &mut Tags, key: &str, value: String) {
    match tags.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value,
        None => {
            tags.push((key.to_string(), value));
            tags.sort();
        }
    }
}

pub trait ObservationHandler: Send + Sync {
    fn on_start(&self, _ctx: &mut ObservationContext) {}
    fn on_error(&self, _ctx: &mut ObservationContext) {}
    fn on_stop(&self, _ctx: &mut ObservationContext) {}
}

/// Shared handler list. No handlers means every observation is a no-op.
#[derive(Clone, Default)]
pub struct ObservationRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn ObservationHandler>>>>,
}

impl ObservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn ObservationHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(handler);
    }

    pub fn is_noop(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ObservationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// A started observation. Stop is idempotent; drop stops it if still open.
pub struct Observation {
    ctx: ObservationContext,
    handlers: Vec<Arc<dyn ObservationHandler>>,
    stopped: bool,
}

impl Observation {
    /// Start with the handlers registered right now.
    pub fn start(mut ctx: ObservationContext, registry: &ObservationRegistry) -> Self {
        let handlers = registry.snapshot();
        for h in &handlers {
            h.on_start(&mut ctx);
        }
        Self {
            ctx,
            handlers,
            stopped: false,
        }
    }

    pub fn context(&self) -> &ObservationContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ObservationContext {
        &mut self.ctx
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.ctx.error = Some(message.into());
        for h in &self.handlers {
            h.on_error(&mut self.ctx);
        }
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for h in self.handlers.iter().rev() {
            h.on_stop(&mut self.ctx);
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.stop();
    }
}

const SPAN_KEY: &str = "tracing.span";

/// Opens a `tracing` span for each observation's lifetime.
#[derive(Default)]
pub struct TracingObservationHandler;

impl ObservationHandler for TracingObservationHandler {
    fn on_start(&self, ctx: &mut ObservationContext) {
        let span = tracing::info_span!(
            "observation",
            name = %ctx.name,
            method = ctx.low_value("method").unwrap_or(""),
            uri = ctx.low_value("uri").unwrap_or(""),
            status = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        span.in_scope(|| tracing::debug!("observation started"));
        ctx.put(SPAN_KEY, span);
    }

    fn on_error(&self, ctx: &mut ObservationContext) {
        if let (Some(span), Some(err)) = (ctx.get::<tracing::Span>(SPAN_KEY), ctx.error.as_deref()) {
            span.in_scope(|| tracing::debug!(error = %err, "observation error"));
        }
    }

    fn on_stop(&self, ctx: &mut ObservationContext) {
        if let Some(span) = ctx.take::<tracing::Span>(SPAN_KEY) {
            if let Some(status) = ctx.low_value("status") {
                span.record("status", status);
            }
            if let Some(outcome) = ctx.low_value("outcome") {
                span.record("outcome", outcome);
            }
            span.in_scope(|| tracing::debug!("observation stopped"));
        }
    }
}
