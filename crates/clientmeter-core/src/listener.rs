//! Request lifecycle listeners and the host-side registry that drives them.
//!
//! A client owns one [`RequestListeners`] and calls its `notify_*` methods as
//! each request progresses. For a single request the order is always
//! `queued -> begin -> headers? -> (success | failure) -> complete`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::error::{ClientMeterError, Result};
use crate::request::{Failure, RequestInfo, RequestResult};

/// Typed lifecycle hooks. Every hook defaults to a no-op.
///
/// Hooks run on the task driving the request and must not block. Errors are
/// logged by the dispatcher and never reach the request path.
pub trait RequestListener: Send + Sync {
    fn on_queued(&self, _req: &RequestInfo) -> Result<()> {
        Ok(())
    }
    fn on_begin(&self, _req: &RequestInfo) -> Result<()> {
        Ok(())
    }
    fn on_headers(&self, _req: &RequestInfo, _status: u16) -> Result<()> {
        Ok(())
    }
    fn on_success(&self, _req: &RequestInfo, _result: &RequestResult) -> Result<()> {
        Ok(())
    }
    fn on_failure(&self, _req: &RequestInfo, _failure: &Failure) -> Result<()> {
        Ok(())
    }
    fn on_complete(&self, _req: &RequestInfo, _result: &RequestResult) -> Result<()> {
        Ok(())
    }
}

/// Implemented by clients that accept request listeners.
pub trait ListenerHost {
    /// `None` when this client cannot host listeners.
    fn request_listeners(&self) -> Option<&RequestListeners>;
}

/// Register `listener` on `host`, or fail if the host has no listener hook.
pub fn attach(host: &dyn ListenerHost, listener: Arc<dyn RequestListener>) -> Result<()> {
    let listeners = host
        .request_listeners()
        .ok_or(ClientMeterError::ListenerUnsupported)?;
    listeners.add_listener(listener);
    Ok(())
}

/// Ordered, thread-safe listener list with per-listener failure isolation.
#[derive(Default)]
pub struct RequestListeners {
    inner: RwLock<Vec<Arc<dyn RequestListener>>>,
}

impl RequestListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn RequestListener>) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        guard.push(listener);
    }

    pub fn remove_all(&self) {
        self.inner.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_queued(&self, req: &RequestInfo) {
        self.dispatch("queued", req, |l| l.on_queued(req));
    }

    pub fn notify_begin(&self, req: &RequestInfo) {
        self.dispatch("begin", req, |l| l.on_begin(req));
    }

    pub fn notify_headers(&self, req: &RequestInfo, status: u16) {
        self.dispatch("headers", req, |l| l.on_headers(req, status));
    }

    pub fn notify_success(&self, req: &RequestInfo, result: &RequestResult) {
        self.dispatch("success", req, |l| l.on_success(req, result));
    }

    pub fn notify_failure(&self, req: &RequestInfo, failure: &Failure) {
        self.dispatch("failure", req, |l| l.on_failure(req, failure));
    }

    pub fn notify_complete(&self, req: &RequestInfo, result: &RequestResult) {
        self.dispatch("complete", req, |l| l.on_complete(req, result));
    }

    fn dispatch<F>(&self, hook: &'static str, req: &RequestInfo, f: F)
    where
        F: Fn(&dyn RequestListener) -> Result<()>,
    {
        // Snapshot so listeners may register others without deadlocking.
        let listeners: Vec<Arc<dyn RequestListener>> =
            self.inner.read().unwrap_or_else(|p| p.into_inner()).clone();

        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(request_id=%req.id, hook, error=%e, "request listener failed");
                }
                Err(_) => {
                    tracing::warn!(request_id=%req.id, hook, "request listener panicked");
                }
            }
        }
    }
}
