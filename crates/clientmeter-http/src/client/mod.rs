//! HTTP client that reports every request's lifecycle to its listeners.
//!
//! For each request the client fires `queued`, `begin`, `headers` (when a
//! response head arrives), then `success` or `failure`, and finally
//! `complete`. The terminal pair fires exactly once, including when the
//! request times out, the client is stopped, or the caller drops the future.

pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::USER_AGENT;
use hyper::{HeaderMap, Method, Request};
use tokio::sync::watch;

use clientmeter_core::error::{ClientMeterError, Result};
use clientmeter_core::{Failure, ListenerHost, RequestId, RequestInfo, RequestListeners, RequestResult};

use crate::config::ClientSection;
pub use transport::{HyperTransport, Transport};

/// Shared by every client so one listener can serve many clients.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Fully collected response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
pub struct InstrumentedClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    listeners: RequestListeners,
    stopped: watch::Sender<bool>,
    timeout: Duration,
    user_agent: String,
}

impl InstrumentedClient {
    pub fn new(cfg: &ClientSection) -> Self {
        Self::with_transport(cfg, HyperTransport::new())
    }

    pub fn with_transport(cfg: &ClientSection, transport: impl Transport) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                transport: Arc::new(transport),
                listeners: RequestListeners::new(),
                stopped,
                timeout: cfg.request_timeout(),
                user_agent: cfg.user_agent.clone(),
            }),
        }
    }

    pub fn listeners(&self) -> &RequestListeners {
        &self.inner.listeners
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.send(Method::GET, url, Bytes::new()).await
    }

    pub async fn send(&self, method: Method, url: &str, body: Bytes) -> Result<HttpResponse> {
        if self.is_stopped() {
            return Err(ClientMeterError::ClientStopped);
        }
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| ClientMeterError::BadRequest(format!("invalid uri {url}: {e}")))?;
        let info = RequestInfo::new(
            RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            method.as_str(),
            url,
        )
        .with_content_length(body.len() as u64);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, self.inner.user_agent.as_str())
            .body(Full::new(body))
            .map_err(|e| ClientMeterError::BadRequest(e.to_string()))?;

        // Subscribe before notifying so a concurrent stop() is never missed.
        let mut stop_rx = self.inner.stopped.subscribe();
        let mut guard = InFlight {
            inner: Arc::clone(&self.inner),
            info,
            done: false,
        };
        self.inner.listeners.notify_queued(&guard.info);
        self.inner.listeners.notify_begin(&guard.info);

        let mut head_status = None;
        let result = {
            let exchange = exchange(&self.inner, &guard.info, request, &mut head_status);
            tokio::select! {
                r = tokio::time::timeout(self.inner.timeout, exchange) => {
                    r.unwrap_or(Err(ClientMeterError::Timeout))
                }
                _ = stopped(&mut stop_rx) => Err(ClientMeterError::ClientStopped),
            }
        };

        guard.finish(&result, head_status);
        result
    }

    /// Abort in-flight requests and reject new ones.
    pub fn stop(&self) {
        self.inner.stopped.send_replace(true);
        tracing::debug!("client stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }
}

impl ListenerHost for InstrumentedClient {
    fn request_listeners(&self) -> Option<&RequestListeners> {
        Some(&self.inner.listeners)
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

async fn exchange(
    inner: &ClientInner,
    info: &RequestInfo,
    request: Request<Full<Bytes>>,
    head_status: &mut Option<u16>,
) -> Result<HttpResponse> {
    let resp = inner.transport.send(request).await?;
    let status = resp.status().as_u16();
    *head_status = Some(status);
    inner.listeners.notify_headers(info, status);

    let (parts, body) = resp.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ClientMeterError::Transport(format!("read body failed: {e}")))?
        .to_bytes();
    Ok(HttpResponse {
        status,
        headers: parts.headers,
        body,
    })
}

/// Guarantees the terminal callbacks fire once, even if the future is dropped.
struct InFlight {
    inner: Arc<ClientInner>,
    info: RequestInfo,
    done: bool,
}

impl InFlight {
    fn finish(&mut self, result: &Result<HttpResponse>, head_status: Option<u16>) {
        self.done = true;
        let listeners = &self.inner.listeners;
        match result {
            Ok(resp) => {
                let r = RequestResult::succeeded(resp.status, resp.body.len() as u64);
                listeners.notify_success(&self.info, &r);
                listeners.notify_complete(&self.info, &r);
            }
            Err(e) => {
                let failure = Failure::from(e);
                tracing::debug!(request_id=%self.info.id, error=%e, "request failed");
                listeners.notify_failure(&self.info, &failure);
                listeners.notify_complete(&self.info, &RequestResult::failed(head_status, failure));
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            self.finish(&Err(ClientMeterError::Cancelled), None);
        }
    }
}
