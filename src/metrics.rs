//! Metric emission interface.
//!
//! The provisioner reports counters, durations, and gauges through a
//! [`MetricSink`]. The wire format and egress are out of scope for the
//! core: the binary installs a sink (or the default no-op), and subsystems
//! take `&dyn MetricSink`. Sink failures are swallowed by contract; no
//! operation ever fails because a metric could not be emitted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Destination for operational metrics.
///
/// Implementations must be infallible from the caller's point of view:
/// errors are logged or dropped inside the sink.
pub trait MetricSink: Send + Sync {
    /// Bump a named counter by one.
    fn increment(&self, name: &str);

    /// Record how long a named operation took.
    fn observe_duration(&self, name: &str, elapsed: Duration);

    /// Record a point-in-time value.
    fn observe_gauge(&self, name: &str, value: u64);
}

/// Sink that discards everything. The default for library consumers that
/// do not care about metrics.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn increment(&self, _name: &str) {}
    fn observe_duration(&self, _name: &str, _elapsed: Duration) {}
    fn observe_gauge(&self, _name: &str, _value: u64) {}
}

/// In-memory sink that records everything it is given. Used by the test
/// suites to assert on emitted metrics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<String, u64>,
    durations: Vec<(String, Duration)>,
    gauges: Vec<(String, u64)>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .expect("metric state poisoned")
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of duration observations recorded under `name`.
    pub fn duration_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .expect("metric state poisoned")
            .durations
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    /// All gauge observations recorded under `name`, in emission order.
    pub fn gauges(&self, name: &str) -> Vec<u64> {
        self.inner
            .lock()
            .expect("metric state poisoned")
            .gauges
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl MetricSink for RecordingSink {
    fn increment(&self, name: &str) {
        let mut inner = self.inner.lock().expect("metric state poisoned");
        *inner.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    fn observe_duration(&self, name: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().expect("metric state poisoned");
        inner.durations.push((name.to_string(), elapsed));
    }

    fn observe_gauge(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().expect("metric state poisoned");
        inner.gauges.push((name.to_string(), value));
    }
}

/// Measures the duration of an operation and reports it on drop.
///
/// Dropping the timer always emits, including on error paths, which is the
/// behavior the duration metrics want (failed creates count too).
pub struct Timer<'a> {
    sink: &'a dyn MetricSink,
    name: &'static str,
    started: Instant,
}

impl<'a> Timer<'a> {
    /// Start timing `name` against `sink`.
    pub fn start(sink: &'a dyn MetricSink, name: &'static str) -> Self {
        Self {
            sink,
            name,
            started: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.sink.observe_duration(self.name, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts() {
        let sink = RecordingSink::new();
        sink.increment("create.fail");
        sink.increment("create.fail");
        assert_eq!(sink.counter("create.fail"), 2);
        assert_eq!(sink.counter("never"), 0);
    }

    #[test]
    fn timer_reports_on_drop() {
        let sink = RecordingSink::new();
        {
            let _t = Timer::start(&sink, "op");
        }
        assert_eq!(sink.duration_count("op"), 1);
    }

    #[test]
    fn gauges_preserve_order() {
        let sink = RecordingSink::new();
        sink.observe_gauge("bytes.reclaimed", 10);
        sink.observe_gauge("bytes.reclaimed", 20);
        assert_eq!(sink.gauges("bytes.reclaimed"), vec![10, 20]);
    }
}
