#![forbid(unsafe_code)]

// Signaling metrics: request counters and latency per request type, plus
// media entity gauges sampled at scrape time

use crate::media::types::ErrorCategory;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Request types with their own series. Frames that never parsed land in the last slot.
const REQUEST_TYPES: [&str; 8] = [
    "get-capabilities",
    "create-transport",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "close-producer",
    "unparsed",
];
const UNPARSED: usize = REQUEST_TYPES.len() - 1;

/// Outcome labels; errors use the category names clients see
const OUTCOMES: [&str; 4] = ["ok", "malformed-request", "precondition-failed", "engine-failure"];

/// Latency bucket bounds in microseconds, paired with their `le` label
const LATENCY_BUCKETS: [(u64, &str); 8] = [
    (250, "0.00025"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (20_000, "0.02"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (2_000_000, "2"),
    (10_000_000, "10"),
];

fn request_index(kind: &str) -> usize {
    REQUEST_TYPES.iter().position(|t| *t == kind).unwrap_or(UNPARSED)
}

fn outcome_index(outcome: Result<(), ErrorCategory>) -> usize {
    match outcome {
        Ok(()) => 0,
        Err(ErrorCategory::MalformedRequest) => 1,
        Err(ErrorCategory::PreconditionFailed) => 2,
        Err(ErrorCategory::EngineFailure) => 3,
    }
}

/// Handling time of one request type. Each observation lands in exactly one
/// bucket; rendering accumulates them.
#[derive(Default)]
struct Latency {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    overflow: AtomicU64,
    sum_us: AtomicU64,
}

impl Latency {
    fn observe(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        match LATENCY_BUCKETS.iter().position(|(bound, _)| us <= *bound) {
            Some(i) => self.buckets[i].fetch_add(1, Relaxed),
            None => self.overflow.fetch_add(1, Relaxed),
        };
    }

    fn render(&self, kind: &str, out: &mut String) {
        const NAME: &str = "sfu_request_duration_seconds";
        let mut seen = 0;
        for ((_, le), bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            seen += bucket.load(Relaxed);
            let _ = writeln!(out, "{NAME}_bucket{{type=\"{kind}\",le=\"{le}\"}} {seen}");
        }
        let count = seen + self.overflow.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{NAME}_bucket{{type=\"{kind}\",le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{NAME}_sum{{type=\"{kind}\"}} {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{NAME}_count{{type=\"{kind}\"}} {count}");
    }
}

/// Media state sampled from the registry when `/metrics` is scraped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MediaGauges {
    pub sessions: usize,
    pub peers: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub worker_alive: bool,
}

/// Server-wide signaling metrics, cheap to clone
#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    requests: [[AtomicU64; OUTCOMES.len()]; REQUEST_TYPES.len()],
    latency: [Latency; REQUEST_TYPES.len()],
    rate_limited: AtomicU64,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    admission_failures: AtomicU64,
    sessions_created: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one dispatched request of wire type `kind` and records its handling time
    pub fn record_request(&self, kind: &str, outcome: Result<(), ErrorCategory>, elapsed: Duration) {
        let index = request_index(kind);
        self.inner.requests[index][outcome_index(outcome)].fetch_add(1, Relaxed);
        self.inner.latency[index].observe(elapsed);
    }

    /// Counts a frame rejected before it could be dispatched
    pub fn record_unparsed(&self) {
        self.inner.requests[UNPARSED][outcome_index(Err(ErrorCategory::MalformedRequest))].fetch_add(1, Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.inner.rate_limited.fetch_add(1, Relaxed);
    }

    pub fn inc_admission_failures(&self) {
        self.inner.admission_failures.fetch_add(1, Relaxed);
    }

    pub fn inc_sessions_created(&self) {
        self.inner.sessions_created.fetch_add(1, Relaxed);
    }

    /// Counts a new connection; the active gauge drops again with the guard
    pub fn track_connection(&self) -> ConnectionGuard {
        self.inner.connections_total.fetch_add(1, Relaxed);
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: Arc::clone(&self.inner) }
    }

    /// Prometheus text exposition of every series
    pub fn render_prometheus(&self, media: &MediaGauges) -> String {
        let i = &self.inner;
        let mut out = String::with_capacity(8192);

        let _ = writeln!(out, "# HELP sfu_requests_total Signaling requests by type and outcome");
        let _ = writeln!(out, "# TYPE sfu_requests_total counter");
        for (kind, by_outcome) in REQUEST_TYPES.iter().zip(&i.requests) {
            for (outcome, value) in OUTCOMES.iter().zip(by_outcome) {
                let value = value.load(Relaxed);
                let _ = writeln!(out, "sfu_requests_total{{type=\"{kind}\",outcome=\"{outcome}\"}} {value}");
            }
        }

        let _ = writeln!(out, "# HELP sfu_request_duration_seconds Signaling request handling latency");
        let _ = writeln!(out, "# TYPE sfu_request_duration_seconds histogram");
        for (kind, latency) in REQUEST_TYPES.iter().zip(&i.latency).take(UNPARSED) {
            latency.render(kind, &mut out);
        }

        counter(&mut out, "sfu_requests_rate_limited_total", "Requests dropped by the per-peer rate limit", i.rate_limited.load(Relaxed));
        counter(&mut out, "sfu_connections_total", "WebSocket connections accepted", i.connections_total.load(Relaxed));
        counter(&mut out, "sfu_admission_failures_total", "Connections that could not join a session", i.admission_failures.load(Relaxed));
        counter(&mut out, "sfu_sessions_created_total", "Sessions created", i.sessions_created.load(Relaxed));

        gauge(&mut out, "sfu_connections_active", "Open WebSocket connections", i.connections_active.load(Relaxed));
        gauge(&mut out, "sfu_sessions_active", "Sessions with at least one peer", media.sessions as u64);
        gauge(&mut out, "sfu_peers_active", "Admitted peers", media.peers as u64);
        gauge(&mut out, "sfu_routers_active", "Routers held by sessions", media.routers as u64);
        gauge(&mut out, "sfu_transports_open", "Open WebRTC transports", media.transports as u64);
        gauge(&mut out, "sfu_producers_open", "Open producers", media.producers as u64);
        gauge(&mut out, "sfu_consumers_open", "Open consumers", media.consumers as u64);
        gauge(&mut out, "sfu_worker_alive", "1 while the media worker is running", u64::from(media.worker_alive));

        out
    }
}

/// Keeps `sfu_connections_active` counted until dropped, including on panic
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}");
}
