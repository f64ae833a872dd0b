//! Request listener that turns client lifecycle events into meters.
//!
//! Per request it keeps one [`RequestContext`] in a side table keyed by
//! [`RequestId`]. `begin` inserts the context through `DashMap::entry`, and
//! the terminal `complete` removes it, so each request increments the active
//! timer once and records one completion no matter how many callbacks the
//! client fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use clientmeter_core::error::Result;
use clientmeter_core::{
    attach, Failure, ListenerHost, Outcome, RequestId, RequestInfo, RequestListener, RequestResult,
};

use crate::config::MetricsSection;
use crate::obs::metrics::{LongTaskSample, MeterRegistry, Tags};
use crate::obs::observation::{Observation, ObservationContext, ObservationRegistry};

/// Tag value used once `max_uri_tags` distinct uris have been seen.
pub const OTHER_URI: &str = "OTHER";

const UNKNOWN_STATUS: &str = "UNKNOWN";
const NO_EXCEPTION: &str = "None";

/// Maps a request (and its result, once known) to the `uri` tag value.
pub trait TagExtractor: Send + Sync {
    fn uri(&self, req: &RequestInfo, result: Option<&RequestResult>) -> String;
}

impl<F> TagExtractor for F
where
    F: Fn(&RequestInfo, Option<&RequestResult>) -> String + Send + Sync,
{
    fn uri(&self, req: &RequestInfo, result: Option<&RequestResult>) -> String {
        self(req, result)
    }
}

/// Uses the raw request path. Only safe when paths are low cardinality.
pub struct UriPath;

impl TagExtractor for UriPath {
    fn uri(&self, req: &RequestInfo, _result: Option<&RequestResult>) -> String {
        req.path.clone()
    }
}

#[derive(Debug, Clone)]
pub struct MetricNames {
    pub requests: String,
    pub active: String,
    pub request_size: String,
    pub response_size: String,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            requests: "client.requests".into(),
            active: "client.requests.active".into(),
            request_size: "client.request.size".into(),
            response_size: "client.response.size".into(),
        }
    }
}

struct RequestContext {
    started: Instant,
    active: LongTaskSample,
    uri: String,
    method: String,
    observation: Option<Observation>,
}

pub struct RequestMetricsListener {
    registry: MeterRegistry,
    extractor: Box<dyn TagExtractor>,
    observations: Option<ObservationRegistry>,
    observation_name: Option<String>,
    names: MetricNames,
    extra_tags: Tags,
    max_uri_tags: usize,
    seen_uris: DashSet<String>,
    uri_overflow_logged: AtomicBool,
    in_flight: DashMap<RequestId, RequestContext>,
}

pub struct RequestMetricsListenerBuilder {
    registry: MeterRegistry,
    extractor: Box<dyn TagExtractor>,
    observations: Option<ObservationRegistry>,
    observation_name: Option<String>,
    names: MetricNames,
    extra_tags: Tags,
    max_uri_tags: usize,
}

impl RequestMetricsListenerBuilder {
    pub fn observation_registry(mut self, registry: ObservationRegistry) -> Self {
        self.observations = Some(registry);
        self
    }

    /// Observation name; defaults to the request timer name.
    pub fn observation_name(mut self, name: impl Into<String>) -> Self {
        self.observation_name = Some(name.into());
        self
    }

    /// Tags added to every completion timer and size summary.
    pub fn extra_tags(mut self, tags: Tags) -> Self {
        self.extra_tags = tags;
        self
    }

    pub fn max_uri_tags(mut self, max: usize) -> Self {
        self.max_uri_tags = max;
        self
    }

    pub fn names(mut self, names: MetricNames) -> Self {
        self.names = names;
        self
    }

    /// Apply names, uri cap and extra tags from config.
    pub fn configure(mut self, section: &MetricsSection) -> Self {
        self.names.requests = section.requests_name.clone();
        self.names.active = section.active_name.clone();
        self.max_uri_tags = section.max_uri_tags;
        let mut extra: Tags = section
            .extra_tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        extra.sort();
        self.extra_tags = extra;
        self
    }

    pub fn build(self) -> RequestMetricsListener {
        RequestMetricsListener {
            registry: self.registry,
            extractor: self.extractor,
            observations: self.observations.filter(|o| !o.is_noop()),
            observation_name: self.observation_name,
            names: self.names,
            extra_tags: self.extra_tags,
            max_uri_tags: self.max_uri_tags,
            seen_uris: DashSet::new(),
            uri_overflow_logged: AtomicBool::new(false),
            in_flight: DashMap::new(),
        }
    }
}

impl RequestMetricsListener {
    pub fn builder(
        registry: MeterRegistry,
        extractor: impl TagExtractor + 'static,
    ) -> RequestMetricsListenerBuilder {
        RequestMetricsListenerBuilder {
            registry,
            extractor: Box::new(extractor),
            observations: None,
            observation_name: None,
            names: MetricNames::default(),
            extra_tags: Tags::new(),
            max_uri_tags: 1000,
        }
    }

    /// Register on `host`. Fails with `ListenerUnsupported` if it has no hook.
    pub fn attach_to(self: &Arc<Self>, host: &dyn ListenerHost) -> Result<()> {
        attach(host, Arc::clone(self) as Arc<dyn RequestListener>)
    }

    /// Requests begun but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn names(&self) -> &MetricNames {
        &self.names
    }

    /// Start tracking a request. A second begin for the same id is ignored.
    ///
    /// The extractor and observation handlers run outside the side-table
    /// lock, so they may call back into this listener.
    pub fn on_request_begin(&self, req: &RequestInfo) -> Result<()> {
        if self.in_flight.contains_key(&req.id) {
            tracing::debug!(request_id=%req.id, "duplicate begin ignored");
            return Ok(());
        }
        let uri = self.uri_tag(req);

        match self.in_flight.entry(req.id) {
            Entry::Occupied(_) => {
                tracing::debug!(request_id=%req.id, "duplicate begin ignored");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                let active_tags = vec![
                    ("method".to_string(), req.method.clone()),
                    ("uri".to_string(), uri.clone()),
                ];
                let active = self
                    .registry
                    .long_task_timer(&self.names.active, active_tags)?
                    .start();
                slot.insert(RequestContext {
                    started: Instant::now(),
                    active,
                    uri: uri.clone(),
                    method: req.method.clone(),
                    observation: None,
                });
            }
        }

        if let Some(obs) = self.start_observation(req, &uri) {
            match self.in_flight.get_mut(&req.id) {
                Some(mut ctx) => ctx.observation = Some(obs),
                // Completed while handlers ran; dropping `obs` stops it.
                None => drop(obs),
            }
        }
        Ok(())
    }

    /// Finish a request. Only the first call per id records anything.
    pub fn on_request_complete(&self, req: &RequestInfo, result: &RequestResult) -> Result<()> {
        let Some((_, ctx)) = self.in_flight.remove(&req.id) else {
            tracing::debug!(request_id=%req.id, "complete without open context ignored");
            return Ok(());
        };
        let elapsed = ctx.started.elapsed();
        ctx.active.stop();

        let status = result
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
        let outcome = Outcome::for_optional_status(result.status);
        let exception = exception_tag(result.failure.as_ref());

        if let Some(mut obs) = ctx.observation {
            obs.context_mut()
                .low("status", status.as_str())
                .low("outcome", outcome.as_str())
                .low("exception", exception);
            if let Some(f) = &result.failure {
                obs.error(f.message.as_str());
            }
            obs.stop();
        }

        let mut tags: Tags = vec![
            ("exception".to_string(), exception.to_string()),
            ("host".to_string(), req.host.clone()),
            ("method".to_string(), ctx.method),
            ("outcome".to_string(), outcome.as_str().to_string()),
            ("status".to_string(), status),
            ("uri".to_string(), ctx.uri),
        ];
        for (k, v) in &self.extra_tags {
            match tags.iter_mut().find(|(ek, _)| ek == k) {
                Some(slot) => slot.1 = v.clone(),
                None => tags.push((k.clone(), v.clone())),
            }
        }
        tags.sort();

        tracing::debug!(
            request_id=%req.id,
            outcome=outcome.as_str(),
            elapsed_ms=elapsed.as_millis() as u64,
            "request recorded"
        );

        self.registry
            .timer(&self.names.requests, tags.clone())?
            .record(elapsed);
        self.registry
            .summary(&self.names.request_size, tags.clone())?
            .record(req.content_length);
        self.registry
            .summary(&self.names.response_size, tags)?
            .record(result.response_length);
        Ok(())
    }

    fn uri_tag(&self, req: &RequestInfo) -> String {
        let uri = self.extractor.uri(req, None);
        if self.seen_uris.contains(&uri) {
            return uri;
        }
        // Concurrent first sightings may overshoot the cap by a few entries.
        if self.seen_uris.len() >= self.max_uri_tags {
            if !self.uri_overflow_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    max_uri_tags = self.max_uri_tags,
                    "uri tag limit reached; further uris are tagged OTHER"
                );
            }
            return OTHER_URI.to_string();
        }
        self.seen_uris.insert(uri.clone());
        uri
    }

    fn start_observation(&self, req: &RequestInfo, uri: &str) -> Option<Observation> {
        let registry = self.observations.as_ref()?;
        let name = self.observation_name.as_deref().unwrap_or(&self.names.requests);
        let mut ctx = ObservationContext::new(name);
        ctx.low("method", req.method.as_str())
            .low("uri", uri)
            .high("http.url", req.uri.as_str());
        Some(Observation::start(ctx, registry))
    }
}

fn exception_tag(failure: Option<&Failure>) -> &'static str {
    failure.map(|f| f.kind.as_str()).unwrap_or(NO_EXCEPTION)
}

impl RequestListener for RequestMetricsListener {
    fn on_begin(&self, req: &RequestInfo) -> Result<()> {
        self.on_request_begin(req)
    }

    fn on_failure(&self, req: &RequestInfo, failure: &Failure) -> Result<()> {
        tracing::debug!(request_id=%req.id, kind=failure.kind.as_str(), error=%failure.message, "request failed");
        Ok(())
    }

    fn on_complete(&self, req: &RequestInfo, result: &RequestResult) -> Result<()> {
        self.on_request_complete(req, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientmeter_core::ErrorKind;
    use clientmeter_core::RequestListeners;
    use std::sync::Mutex;

    use crate::obs::observation::ObservationHandler;

    fn listener(registry: &MeterRegistry) -> RequestMetricsListener {
        RequestMetricsListener::builder(registry.clone(), |r: &RequestInfo, _: Option<&RequestResult>| {
            r.path.clone()
        })
        .build()
    }

    fn get(id: u64, path: &str) -> RequestInfo {
        RequestInfo::new(RequestId(id), "GET", format!("http://localhost:1{path}"))
    }

    fn active(registry: &MeterRegistry, uri: &str) -> usize {
        registry
            .find("client.requests.active")
            .tags(&[("uri", uri), ("method", "GET")])
            .long_task_timer()
            .map(|t| t.active_tasks())
            .unwrap_or(0)
    }

    #[test]
    fn begin_then_complete_nets_zero() {
        let reg = MeterRegistry::new();
        let l = listener(&reg);
        let req = get(1, "/ok");

        l.on_request_begin(&req).unwrap();
        assert_eq!(active(&reg, "/ok"), 1);
        assert_eq!(l.in_flight(), 1);

        l.on_request_complete(&req, &RequestResult::succeeded(200, 2)).unwrap();
        assert_eq!(active(&reg, "/ok"), 0);
        assert_eq!(l.in_flight(), 0);

        let t = reg
            .get("client.requests")
            .tags(&[("outcome", "SUCCESS"), ("status", "200"), ("uri", "/ok")])
            .timer()
            .unwrap();
        assert_eq!(t.count(), 1);
        let resp = reg.get("client.response.size").tag("uri", "/ok").summary().unwrap();
        assert_eq!(resp.total(), 2);
    }

    #[test]
    fn duplicate_callbacks_count_once() {
        let reg = MeterRegistry::new();
        let l = listener(&reg);
        let req = get(2, "/dup");

        l.on_request_begin(&req).unwrap();
        l.on_request_begin(&req).unwrap();
        assert_eq!(active(&reg, "/dup"), 1);

        let failed = RequestResult::failed(
            None,
            Failure { kind: ErrorKind::Transport, message: "reset".into() },
        );
        l.on_request_complete(&req, &failed).unwrap();
        l.on_request_complete(&req, &RequestResult::succeeded(200, 0)).unwrap();

        assert_eq!(active(&reg, "/dup"), 0);
        let timers = reg.find("client.requests").tag("uri", "/dup").timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].count(), 1);
        let t = reg
            .get("client.requests")
            .tags(&[("outcome", "UNKNOWN"), ("status", "UNKNOWN"), ("exception", "Transport")])
            .timer()
            .unwrap();
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn complete_without_begin_records_nothing() {
        let reg = MeterRegistry::new();
        let l = listener(&reg);
        l.on_request_complete(&get(3, "/x"), &RequestResult::succeeded(200, 0)).unwrap();
        assert!(reg.find("client.requests").timer().is_none());
    }

    #[test]
    fn completion_reuses_begin_tags() {
        let reg = MeterRegistry::new();
        let calls = Arc::new(Mutex::new(0u32));
        let c = calls.clone();
        let l = RequestMetricsListener::builder(reg.clone(), move |_: &RequestInfo, _: Option<&RequestResult>| {
            let mut n = c.lock().unwrap();
            *n += 1;
            format!("/v{n}")
        })
        .build();
        let req = get(4, "/anything");
        l.on_request_begin(&req).unwrap();
        l.on_request_complete(&req, &RequestResult::succeeded(204, 0)).unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(reg.find("client.requests").tags(&[("uri", "/v1"), ("method", "GET")]).timer().is_some());
    }

    #[test]
    fn uri_cardinality_is_capped() {
        let reg = MeterRegistry::new();
        let l = RequestMetricsListener::builder(reg.clone(), UriPath).max_uri_tags(2).build();
        for (i, p) in ["/a", "/b", "/c", "/a"].iter().enumerate() {
            let req = get(10 + i as u64, p);
            l.on_request_begin(&req).unwrap();
            l.on_request_complete(&req, &RequestResult::succeeded(200, 0)).unwrap();
        }
        assert_eq!(reg.get("client.requests").tag("uri", "/a").timer().unwrap().count(), 2);
        assert_eq!(reg.get("client.requests").tag("uri", OTHER_URI).timer().unwrap().count(), 1);
        assert!(reg.find("client.requests").tag("uri", "/c").timer().is_none());
    }

    #[test]
    fn extra_tags_land_on_completion() {
        let reg = MeterRegistry::new();
        let l = RequestMetricsListener::builder(reg.clone(), UriPath)
            .extra_tags(crate::obs::tags(&[("app", "billing")]))
            .build();
        let req = get(20, "/ok");
        l.on_request_begin(&req).unwrap();
        l.on_request_complete(&req, &RequestResult::succeeded(200, 0)).unwrap();
        assert!(reg.find("client.requests").tag("app", "billing").timer().is_some());
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<String>>);

    impl ObservationHandler for Seen {
        fn on_start(&self, ctx: &mut ObservationContext) {
            self.0.lock().unwrap().push(format!("start {:?}", ctx.low_value("uri")));
        }
        fn on_stop(&self, ctx: &mut ObservationContext) {
            self.0
                .lock()
                .unwrap()
                .push(format!("stop {:?} {:?}", ctx.low_value("outcome"), ctx.error));
        }
    }

    #[test]
    fn observation_spans_request_lifetime() {
        let reg = MeterRegistry::new();
        let obs = ObservationRegistry::new();
        let seen = Arc::new(Seen::default());
        obs.add_handler(seen.clone());
        let l = RequestMetricsListener::builder(reg, UriPath)
            .observation_registry(obs)
            .build();

        let req = get(30, "/ok");
        l.on_request_begin(&req).unwrap();
        assert_eq!(seen.0.lock().unwrap().len(), 1);
        let failed = RequestResult::failed(
            None,
            Failure { kind: ErrorKind::Timeout, message: "request timed out".into() },
        );
        l.on_request_complete(&req, &failed).unwrap();
        l.on_request_complete(&req, &failed).unwrap();

        assert_eq!(
            *seen.0.lock().unwrap(),
            vec![
                "start Some(\"/ok\")".to_string(),
                "stop Some(\"UNKNOWN\") Some(\"request timed out\")".to_string()
            ]
        );
    }

    /// Reads the listener's side table from inside `on_start`.
    #[derive(Default)]
    struct Reentrant {
        listener: std::sync::OnceLock<std::sync::Weak<RequestMetricsListener>>,
        seen_in_flight: Mutex<Option<usize>>,
        name: Mutex<Option<String>>,
    }

    impl ObservationHandler for Reentrant {
        fn on_start(&self, ctx: &mut ObservationContext) {
            *self.name.lock().unwrap() = Some(ctx.name.clone());
            if let Some(l) = self.listener.get().and_then(|w| w.upgrade()) {
                *self.seen_in_flight.lock().unwrap() = Some(l.in_flight());
            }
        }
    }

    #[test]
    fn handlers_may_call_back_into_listener() {
        let reg = MeterRegistry::new();
        let obs = ObservationRegistry::new();
        let handler = Arc::new(Reentrant::default());
        obs.add_handler(handler.clone());
        let l = Arc::new(
            RequestMetricsListener::builder(reg.clone(), UriPath)
                .observation_registry(obs)
                .build(),
        );
        handler.listener.set(Arc::downgrade(&l)).unwrap();

        let req = get(50, "/ok");
        l.on_request_begin(&req).unwrap();
        assert_eq!(*handler.seen_in_flight.lock().unwrap(), Some(1));
        l.on_request_complete(&req, &RequestResult::succeeded(200, 0)).unwrap();
        assert_eq!(l.in_flight(), 0);
        assert_eq!(reg.get("client.requests").tag("uri", "/ok").timer().unwrap().count(), 1);
    }

    #[test]
    fn observation_name_overrides_timer_name() {
        let obs = ObservationRegistry::new();
        let handler = Arc::new(Reentrant::default());
        obs.add_handler(handler.clone());
        let l = RequestMetricsListener::builder(MeterRegistry::new(), UriPath)
            .observation_registry(obs.clone())
            .observation_name("outbound.call")
            .build();
        l.on_request_begin(&get(60, "/ok")).unwrap();
        assert_eq!(handler.name.lock().unwrap().as_deref(), Some("outbound.call"));

        let l = RequestMetricsListener::builder(MeterRegistry::new(), UriPath)
            .observation_registry(obs)
            .build();
        l.on_request_begin(&get(61, "/ok")).unwrap();
        assert_eq!(handler.name.lock().unwrap().as_deref(), Some("client.requests"));
    }

    #[test]
    fn dispatch_through_listener_list() {
        let reg = MeterRegistry::new();
        let l = Arc::new(listener(&reg));
        let list = RequestListeners::new();
        list.add_listener(l.clone());
        let req = get(40, "/ok");
        list.notify_begin(&req);
        list.notify_complete(&req, &RequestResult::succeeded(500, 0));
        assert_eq!(
            reg.get("client.requests").tag("outcome", "SERVER_ERROR").timer().unwrap().count(),
            1
        );
        assert_eq!(l.in_flight(), 0);
    }
}
