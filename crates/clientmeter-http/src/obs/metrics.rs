//! In-process meter registry.
//!
//! Meters are keyed by name plus a sorted tag vector and stored in a `DashMap`;
//! creation goes through `entry().or_insert_with` so concurrent first use of a
//! tag set never races into two meters. Timer buckets are fixed in
//! microseconds to avoid floating point math on the hot path.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clientmeter_core::error::{ClientMeterError, Result};

/// Sorted `(key, value)` label pairs.
pub type Tags = Vec<(String, String)>;

/// Build a sorted tag vector. Later duplicates of a key win.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    normalize(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Sort by key and keep only the last value given for each key.
fn normalize(raw: Tags) -> Tags {
    let mut out: Tags = Vec::with_capacity(raw.len());
    for (k, v) in raw {
        match out.iter_mut().find(|(ek, _)| *ek == k) {
            Some(slot) => slot.1 = v,
            None => out.push((k, v)),
        }
    }
    out.sort();
    out
}

/// Helper to escape label values.
fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn label_str(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}=\"{}\"", k.replace('.', "_"), escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn prom_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeterId {
    pub name: String,
    pub tags: Tags,
}

impl MeterId {
    pub fn new(name: &str, tags: Tags) -> Self {
        Self { name: name.to_string(), tags }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn contains_all(&self, required: &[(String, String)]) -> bool {
        required.iter().all(|(k, v)| self.tag(k) == Some(v.as_str()))
    }
}

// ─── Long-task timer ─────────────────────────────────────────────

/// Tracks operations that are still running.
#[derive(Default)]
pub struct LongTaskTimer {
    next_task: AtomicU64,
    active: DashMap<u64, Instant>,
}

impl LongTaskTimer {
    /// Begin timing a task. The returned sample stops exactly once.
    pub fn start(self: &Arc<Self>) -> LongTaskSample {
        let task = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.active.insert(task, Instant::now());
        LongTaskSample {
            timer: Arc::clone(self),
            task,
            stopped: false,
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.len()
    }

    /// Cumulative running time of all active tasks.
    pub fn duration(&self) -> Duration {
        self.active.iter().map(|e| e.value().elapsed()).sum()
    }

    /// Running time of the oldest active task.
    pub fn max(&self) -> Duration {
        self.active
            .iter()
            .map(|e| e.value().elapsed())
            .max()
            .unwrap_or_default()
    }

    fn stop_task(&self, task: u64) -> Duration {
        self.active
            .remove(&task)
            .map(|(_, started)| started.elapsed())
            .unwrap_or_default()
    }
}

/// Handle to one running task on a [`LongTaskTimer`]. Dropping it stops it.
pub struct LongTaskSample {
    timer: Arc<LongTaskTimer>,
    task: u64,
    stopped: bool,
}

impl LongTaskSample {
    pub fn stop(mut self) -> Duration {
        self.stopped = true;
        self.timer.stop_task(self.task)
    }
}

impl Drop for LongTaskSample {
    fn drop(&mut self) {
        if !self.stopped {
            self.timer.stop_task(self.task);
        }
    }
}

// ─── Timer ───────────────────────────────────────────────────────

// Upper bounds: 100us, 500us, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s, 10s
const BUCKETS_MICROS: [u64; 11] = [
    100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 10_000_000,
];

/// Count, total, max and cumulative buckets of completed durations.
pub struct Timer {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
    buckets: [AtomicU64; BUCKETS_MICROS.len()],
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            max_nanos: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Timer {
    pub fn record(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);

        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);

        // Cumulative: every bucket at or above the value.
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if nanos <= b * 1_000 {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed))
    }

    pub fn mean(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            n => self.total_time() / u32::try_from(n).unwrap_or(u32::MAX),
        }
    }
}

// ─── Distribution summary ────────────────────────────────────────

#[derive(Default)]
pub struct DistributionSummary {
    count: AtomicU64,
    total: AtomicU64,
    max: AtomicU64,
}

impl DistributionSummary {
    pub fn record(&self, amount: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.max.fetch_max(amount, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

// ─── Registry ────────────────────────────────────────────────────

#[derive(Clone)]
enum Meter {
    LongTaskTimer(Arc<LongTaskTimer>),
    Timer(Arc<Timer>),
    Summary(Arc<DistributionSummary>),
}

impl Meter {
    fn kind(&self) -> &'static str {
        match self {
            Meter::LongTaskTimer(_) => "long task timer",
            Meter::Timer(_) => "timer",
            Meter::Summary(_) => "distribution summary",
        }
    }
}

/// Shared meter registry. Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct MeterRegistry {
    meters: Arc<DashMap<MeterId, Meter>>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn long_task_timer(&self, name: &str, tags: Tags) -> Result<Arc<LongTaskTimer>> {
        match self.get_or_create(name, tags, || Meter::LongTaskTimer(Arc::default()))? {
            Meter::LongTaskTimer(t) => Ok(t),
            other => Err(kind_conflict(name, other.kind())),
        }
    }

    pub fn timer(&self, name: &str, tags: Tags) -> Result<Arc<Timer>> {
        match self.get_or_create(name, tags, || Meter::Timer(Arc::default()))? {
            Meter::Timer(t) => Ok(t),
            other => Err(kind_conflict(name, other.kind())),
        }
    }

    pub fn summary(&self, name: &str, tags: Tags) -> Result<Arc<DistributionSummary>> {
        match self.get_or_create(name, tags, || Meter::Summary(Arc::default()))? {
            Meter::Summary(s) => Ok(s),
            other => Err(kind_conflict(name, other.kind())),
        }
    }

    fn get_or_create(&self, name: &str, tags: Tags, make: impl FnOnce() -> Meter) -> Result<Meter> {
        if name.is_empty() {
            return Err(ClientMeterError::Instrumentation("meter name must not be empty".into()));
        }
        let id = MeterId::new(name, normalize(tags));
        Ok(self.meters.entry(id).or_insert_with(make).value().clone())
    }

    /// Lenient lookup: `None` when nothing matches.
    pub fn find(&self, name: &str) -> Search<'_> {
        Search {
            registry: self,
            name: name.to_string(),
            tags: Vec::new(),
        }
    }

    /// Strict lookup: `MeterNotFound` when nothing matches.
    pub fn get(&self, name: &str) -> RequiredSearch<'_> {
        RequiredSearch(self.find(name))
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn clear(&self) {
        self.meters.clear();
    }

    fn sorted(&self) -> Vec<(MeterId, Meter)> {
        let mut all: Vec<(MeterId, Meter)> = self
            .meters
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Point-in-time view of every meter, for JSON output.
    pub fn snapshot(&self) -> Vec<MeterSnapshot> {
        self.sorted()
            .into_iter()
            .map(|(id, meter)| {
                let (kind, count, total, max) = match &meter {
                    Meter::LongTaskTimer(t) => (
                        "long_task_timer",
                        t.active_tasks() as u64,
                        t.duration().as_secs_f64(),
                        t.max().as_secs_f64(),
                    ),
                    Meter::Timer(t) => (
                        "timer",
                        t.count(),
                        t.total_time().as_secs_f64(),
                        t.max().as_secs_f64(),
                    ),
                    Meter::Summary(s) => ("summary", s.count(), s.total() as f64, s.max() as f64),
                };
                MeterSnapshot {
                    name: id.name,
                    kind,
                    tags: id.tags.into_iter().collect(),
                    count,
                    total,
                    max,
                }
            })
            .collect()
    }

    /// Render in Prometheus text exposition format.
    ///
    /// Each metric family gets one `# TYPE` line followed by all of its
    /// samples, whatever tag sets they carry.
    pub fn render(&self) -> String {
        let mut expo = Exposition::default();

        for (id, meter) in self.sorted() {
            let labels = label_str(&id.tags);
            let prefix = if labels.is_empty() { String::new() } else { format!("{labels},") };

            match meter {
                Meter::LongTaskTimer(t) => {
                    let name = format!("{}_seconds", prom_name(&id.name));
                    let _ = writeln!(
                        expo.family(&format!("{name}_active_count"), "gauge"),
                        "{name}_active_count{{{labels}}} {}",
                        t.active_tasks()
                    );
                    let _ = writeln!(
                        expo.family(&format!("{name}_duration_sum"), "gauge"),
                        "{name}_duration_sum{{{labels}}} {}",
                        t.duration().as_secs_f64()
                    );
                    let _ = writeln!(
                        expo.family(&format!("{name}_max"), "gauge"),
                        "{name}_max{{{labels}}} {}",
                        t.max().as_secs_f64()
                    );
                }
                Meter::Timer(t) => {
                    let name = format!("{}_seconds", prom_name(&id.name));
                    let out = expo.family(&name, "histogram");
                    for (i, &le) in BUCKETS_MICROS.iter().enumerate() {
                        let count = t.buckets[i].load(Ordering::Relaxed);
                        let le = le as f64 / 1_000_000.0;
                        let _ = writeln!(out, "{name}_bucket{{{prefix}le=\"{le}\"}} {count}");
                    }
                    let _ = writeln!(out, "{name}_bucket{{{prefix}le=\"+Inf\"}} {}", t.count());
                    let _ = writeln!(out, "{name}_sum{{{labels}}} {}", t.total_time().as_secs_f64());
                    let _ = writeln!(out, "{name}_count{{{labels}}} {}", t.count());
                    let _ = writeln!(
                        expo.family(&format!("{name}_max"), "gauge"),
                        "{name}_max{{{labels}}} {}",
                        t.max().as_secs_f64()
                    );
                }
                Meter::Summary(s) => {
                    let name = format!("{}_bytes", prom_name(&id.name));
                    let out = expo.family(&name, "summary");
                    let _ = writeln!(out, "{name}_sum{{{labels}}} {}", s.total());
                    let _ = writeln!(out, "{name}_count{{{labels}}} {}", s.count());
                    let _ = writeln!(
                        expo.family(&format!("{name}_max"), "gauge"),
                        "{name}_max{{{labels}}} {}",
                        s.max()
                    );
                }
            }
        }
        expo.finish()
    }
}

/// Sample lines grouped by metric family, in first-seen order.
#[derive(Default)]
struct Exposition {
    families: Vec<(String, &'static str, String)>,
}

impl Exposition {
    fn family(&mut self, name: &str, kind: &'static str) -> &mut String {
        let idx = match self.families.iter().position(|(n, _, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.families.push((name.to_string(), kind, String::new()));
                self.families.len() - 1
            }
        };
        &mut self.families[idx].2
    }

    fn finish(self) -> String {
        let mut out = String::new();
        for (name, kind, lines) in self.families {
            let _ = writeln!(out, "# TYPE {name} {kind}");
            out.push_str(&lines);
        }
        out
    }
}

fn kind_conflict(name: &str, existing: &str) -> ClientMeterError {
    ClientMeterError::Instrumentation(format!("meter {name} already registered as a {existing}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterSnapshot {
    pub name: String,
    pub kind: &'static str,
    pub tags: std::collections::BTreeMap<String, String>,
    /// Active tasks for long task timers, sample count otherwise.
    pub count: u64,
    /// Seconds for timers, base units for summaries.
    pub total: f64,
    pub max: f64,
}

/// Tag-subset lookup started by [`MeterRegistry::find`].
pub struct Search<'a> {
    registry: &'a MeterRegistry,
    name: String,
    tags: Vec<(String, String)>,
}

impl<'a> Search<'a> {
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn tags(mut self, pairs: &[(&str, &str)]) -> Self {
        for (k, v) in pairs {
            self.tags.push((k.to_string(), v.to_string()));
        }
        self
    }

    fn matching(&self) -> Vec<Meter> {
        self.registry
            .sorted()
            .into_iter()
            .filter(|(id, _)| id.name == self.name && id.contains_all(&self.tags))
            .map(|(_, m)| m)
            .collect()
    }

    pub fn long_task_timer(&self) -> Option<Arc<LongTaskTimer>> {
        self.long_task_timers().into_iter().next()
    }

    pub fn long_task_timers(&self) -> Vec<Arc<LongTaskTimer>> {
        self.matching()
            .into_iter()
            .filter_map(|m| match m {
                Meter::LongTaskTimer(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn timer(&self) -> Option<Arc<Timer>> {
        self.timers().into_iter().next()
    }

    pub fn timers(&self) -> Vec<Arc<Timer>> {
        self.matching()
            .into_iter()
            .filter_map(|m| match m {
                Meter::Timer(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> Option<Arc<DistributionSummary>> {
        self.matching().into_iter().find_map(|m| match m {
            Meter::Summary(s) => Some(s),
            _ => None,
        })
    }

    fn describe(&self) -> String {
        format!("{}{:?}", self.name, self.tags)
    }
}

/// Strict variant of [`Search`].
pub struct RequiredSearch<'a>(Search<'a>);

impl<'a> RequiredSearch<'a> {
    pub fn tag(self, key: &str, value: &str) -> Self {
        Self(self.0.tag(key, value))
    }

    pub fn tags(self, pairs: &[(&str, &str)]) -> Self {
        Self(self.0.tags(pairs))
    }

    pub fn long_task_timer(&self) -> Result<Arc<LongTaskTimer>> {
        self.0
            .long_task_timer()
            .ok_or_else(|| ClientMeterError::MeterNotFound(self.0.describe()))
    }

    pub fn timer(&self) -> Result<Arc<Timer>> {
        self.0
            .timer()
            .ok_or_else(|| ClientMeterError::MeterNotFound(self.0.describe()))
    }

    pub fn summary(&self) -> Result<Arc<DistributionSummary>> {
        self.0
            .summary()
            .ok_or_else(|| ClientMeterError::MeterNotFound(self.0.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_meter() {
        let reg = MeterRegistry::new();
        let a = reg.timer("t", tags(&[("b", "2"), ("a", "1")])).unwrap();
        let b = reg.timer("t", tags(&[("a", "1"), ("b", "2")])).unwrap();
        a.record(Duration::from_millis(3));
        assert_eq!(b.count(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn raw_tag_order_and_duplicates_share_a_meter() {
        let reg = MeterRegistry::new();
        let raw = |pairs: &[(&str, &str)]| -> Tags {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let a = reg.timer("t", raw(&[("b", "2"), ("a", "1")])).unwrap();
        let b = reg.timer("t", raw(&[("a", "1"), ("b", "2")])).unwrap();
        let c = reg.timer("t", raw(&[("a", "0"), ("b", "2"), ("a", "1")])).unwrap();
        a.record(Duration::from_millis(1));
        assert_eq!(b.count(), 1);
        assert_eq!(c.count(), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.find("t").tags(&[("a", "1"), ("b", "2")]).timer().is_some());
    }

    #[test]
    fn kind_conflict_is_instrumentation_error() {
        let reg = MeterRegistry::new();
        reg.timer("x", Tags::new()).unwrap();
        let err = reg.long_task_timer("x", Tags::new()).err().unwrap();
        assert_eq!(err.kind().as_str(), "Instrumentation");
    }

    #[test]
    fn long_task_sample_stops_once() {
        let ltt: Arc<LongTaskTimer> = Arc::default();
        let s1 = ltt.start();
        let s2 = ltt.start();
        assert_eq!(ltt.active_tasks(), 2);
        s1.stop();
        assert_eq!(ltt.active_tasks(), 1);
        drop(s2);
        assert_eq!(ltt.active_tasks(), 0);
    }

    #[test]
    fn find_matches_tag_subset() {
        let reg = MeterRegistry::new();
        reg.timer("req", tags(&[("uri", "/ok"), ("status", "200")]))
            .unwrap()
            .record(Duration::from_millis(1));
        reg.timer("req", tags(&[("uri", "/ok"), ("status", "500")])).unwrap();

        assert_eq!(reg.find("req").tag("uri", "/ok").timers().len(), 2);
        let t = reg.get("req").tag("status", "200").timer().unwrap();
        assert_eq!(t.count(), 1);
        assert!(reg.find("req").tag("status", "404").timer().is_none());
        assert_eq!(
            reg.get("nope").timer().err().unwrap().kind().as_str(),
            "MeterNotFound"
        );
    }

    #[test]
    fn timer_buckets_are_cumulative() {
        let t = Timer::default();
        t.record(Duration::from_micros(50));
        t.record(Duration::from_millis(200));
        assert_eq!(t.buckets[0].load(Ordering::Relaxed), 1);
        assert_eq!(t.buckets[7].load(Ordering::Relaxed), 2);
        assert_eq!(t.max(), Duration::from_millis(200));
    }

    #[test]
    fn sub_micro_overshoot_misses_bucket() {
        let t = Timer::default();
        t.record(Duration::from_nanos(100_900));
        t.record(Duration::from_nanos(100_000));
        assert_eq!(t.buckets[0].load(Ordering::Relaxed), 1);
        assert_eq!(t.buckets[1].load(Ordering::Relaxed), 2);
    }

    #[test]
    fn render_exposition() {
        let reg = MeterRegistry::new();
        reg.timer("client.requests", tags(&[("uri", "/ok")]))
            .unwrap()
            .record(Duration::from_millis(2));
        reg.summary("client.response.size", tags(&[("uri", "/ok")]))
            .unwrap()
            .record(11);
        let _sample = reg
            .long_task_timer("client.requests.active", tags(&[("uri", "/ok")]))
            .unwrap()
            .start();

        let out = reg.render();
        assert!(out.contains("# TYPE client_requests_seconds histogram"));
        assert!(out.contains("client_requests_seconds_count{uri=\"/ok\"} 1"));
        assert!(out.contains("client_requests_seconds_bucket{uri=\"/ok\",le=\"+Inf\"} 1"));
        assert!(out.contains("client_requests_active_seconds_active_count{uri=\"/ok\"} 1"));
        assert!(out.contains("client_response_size_bytes_sum{uri=\"/ok\"} 11"));
    }

    #[test]
    fn one_type_line_per_family() {
        let reg = MeterRegistry::new();
        for uri in ["/a", "/b"] {
            reg.timer("client.requests", tags(&[("uri", uri)]))
                .unwrap()
                .record(Duration::from_millis(1));
            reg.summary("client.request.size", tags(&[("uri", uri)])).unwrap().record(3);
            let _sample = reg
                .long_task_timer("client.requests.active", tags(&[("uri", uri)]))
                .unwrap()
                .start();
        }

        let out = reg.render();
        let type_lines: Vec<&str> = out.lines().filter(|l| l.starts_with("# TYPE")).collect();
        let mut unique = type_lines.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(type_lines.len(), unique.len(), "{out}");
        for expected in [
            "# TYPE client_requests_seconds histogram",
            "# TYPE client_requests_seconds_max gauge",
            "# TYPE client_request_size_bytes summary",
            "# TYPE client_request_size_bytes_max gauge",
            "# TYPE client_requests_active_seconds_active_count gauge",
            "# TYPE client_requests_active_seconds_duration_sum gauge",
            "# TYPE client_requests_active_seconds_max gauge",
        ] {
            assert!(type_lines.contains(&expected), "missing {expected} in {out}");
        }

        // Every sample sits under the TYPE line of its own family.
        let mut family = "";
        for line in out.lines() {
            match line.strip_prefix("# TYPE ") {
                Some(rest) => family = rest.split(' ').next().unwrap(),
                None => {
                    let sample = line.split('{').next().unwrap();
                    let suffix = sample.strip_prefix(family).unwrap_or_else(|| panic!("{line} under {family}"));
                    assert!(
                        matches!(suffix, "" | "_bucket" | "_sum" | "_count"),
                        "{line} under {family}"
                    );
                }
            }
        }
    }
}
