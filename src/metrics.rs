//! Process metrics and the Prometheus scrape endpoint.
//!
//! Counters are lock-free atomics updated from the hot paths; the renderer
//! assembles the text exposition format on demand. A 1 s flush task owns
//! the derived values (events/sec, per-subscription queue depths).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::Bus;

pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Latency histogram bucket upper bounds in milliseconds; +Inf is implicit.
const LATENCY_BUCKETS_MS: [i64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    Drift,
    Dup,
    Ooo,
    Gaps,
    Spikes,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drift => "drift",
            Self::Dup => "dup",
            Self::Ooo => "ooo",
            Self::Gaps => "gaps",
            Self::Spikes => "spikes",
        }
    }

    const ALL: [AnomalyKind; 5] = [
        Self::Drift,
        Self::Dup,
        Self::Ooo,
        Self::Gaps,
        Self::Spikes,
    ];
}

#[derive(Debug, Default)]
struct AgePercentiles {
    p50: i64,
    p95: i64,
    p99: i64,
}

pub struct Metrics {
    events_total: AtomicU64,
    drops_total: AtomicU64,
    incidents_total: AtomicU64,
    capture_failures_total: AtomicU64,
    anomalies: [AtomicU64; 5],
    eps_bits: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    age_percentiles: RwLock<AgePercentiles>,
    queue_depths: RwLock<Vec<(String, usize)>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events_total: AtomicU64::new(0),
            drops_total: AtomicU64::new(0),
            incidents_total: AtomicU64::new(0),
            capture_failures_total: AtomicU64::new(0),
            anomalies: Default::default(),
            eps_bits: AtomicU64::new(0f64.to_bits()),
            latency_buckets: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            age_percentiles: RwLock::new(AgePercentiles::default()),
            queue_depths: RwLock::new(Vec::new()),
        })
    }

    #[inline]
    pub fn inc_events(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_drops(&self) {
        self.drops_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_anomaly(&self, kind: AnomalyKind) {
        self.inc_anomaly_by(kind, 1);
    }

    #[inline]
    pub fn inc_anomaly_by(&self, kind: AnomalyKind, n: u64) {
        let idx = AnomalyKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
        self.anomalies[idx].fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_incidents(&self) {
        self.incidents_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_capture_failures(&self) {
        self.capture_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one age-latency observation into the histogram.
    pub fn observe_latency_ms(&self, latency_ms: i64) {
        let latency_ms = latency_ms.max(0);
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms
            .fetch_add(latency_ms as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn incidents_total(&self) -> u64 {
        self.incidents_total.load(Ordering::Relaxed)
    }

    pub fn set_events_per_second(&self, eps: f64) {
        self.eps_bits.store(eps.to_bits(), Ordering::Relaxed);
    }

    pub fn set_age_percentiles(&self, p50: i64, p95: i64, p99: i64) {
        *self.age_percentiles.write() = AgePercentiles { p50, p95, p99 };
    }

    pub fn set_queue_depths(&self, depths: Vec<(String, usize)>) {
        *self.queue_depths.write() = depths;
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        };

        counter(
            &mut out,
            "mercurystream_events_total",
            "Total events processed",
            self.events_total.load(Ordering::Relaxed),
        );

        let eps = f64::from_bits(self.eps_bits.load(Ordering::Relaxed));
        out.push_str(&format!(
            "# HELP mercurystream_events_per_second Current events per second\n\
             # TYPE mercurystream_events_per_second gauge\n\
             mercurystream_events_per_second {:.2}\n\n",
            eps
        ));

        counter(
            &mut out,
            "mercurystream_drops_total",
            "Total events dropped by backpressure",
            self.drops_total.load(Ordering::Relaxed),
        );

        out.push_str(
            "# HELP mercurystream_anomalies_total Total anomalies detected by type\n\
             # TYPE mercurystream_anomalies_total counter\n",
        );
        for (idx, kind) in AnomalyKind::ALL.iter().enumerate() {
            out.push_str(&format!(
                "mercurystream_anomalies_total{{type=\"{}\"}} {}\n",
                kind.as_str(),
                self.anomalies[idx].load(Ordering::Relaxed)
            ));
        }
        out.push('\n');

        counter(
            &mut out,
            "mercurystream_incidents_total",
            "Total incident bundles captured",
            self.incidents_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "mercurystream_incident_capture_failures_total",
            "Incident bundles abandoned on filesystem errors",
            self.capture_failures_total.load(Ordering::Relaxed),
        );

        out.push_str(
            "# HELP mercurystream_latency_ms Event age latency histogram\n\
             # TYPE mercurystream_latency_ms histogram\n",
        );
        let mut cumulative = 0u64;
        for (idx, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.latency_buckets[idx].load(Ordering::Relaxed);
            out.push_str(&format!(
                "mercurystream_latency_ms_bucket{{le=\"{}\"}} {}\n",
                bound, cumulative
            ));
        }
        cumulative += self.latency_buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
        out.push_str(&format!(
            "mercurystream_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
            cumulative
        ));
        out.push_str(&format!(
            "mercurystream_latency_ms_sum {}\n",
            self.latency_sum_ms.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "mercurystream_latency_ms_count {}\n\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        {
            let age = self.age_percentiles.read();
            out.push_str(&format!(
                "# HELP mercurystream_age_ms Pipeline age latency percentiles\n\
                 # TYPE mercurystream_age_ms gauge\n\
                 mercurystream_age_ms{{quantile=\"0.5\"}} {}\n\
                 mercurystream_age_ms{{quantile=\"0.95\"}} {}\n\
                 mercurystream_age_ms{{quantile=\"0.99\"}} {}\n\n",
                age.p50, age.p95, age.p99
            ));
        }

        out.push_str(
            "# HELP mercurystream_queue_depth Current per-subscription queue depth\n\
             # TYPE mercurystream_queue_depth gauge\n",
        );
        for (name, depth) in self.queue_depths.read().iter() {
            out.push_str(&format!(
                "mercurystream_queue_depth{{sub=\"{}\"}} {}\n",
                name, depth
            ));
        }

        out
    }
}

/// Serve `/metrics` and `/health` until shutdown.
pub async fn serve(metrics: Arc<Metrics>, port: u16, mut shutdown: watch::Receiver<bool>) {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/metrics",
            get({
                let metrics = metrics.clone();
                move || {
                    let body = metrics.render();
                    async move { body }
                }
            }),
        );

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port, error = %e, "metrics_bind_failed");
            return;
        }
    };
    info!(port, "metrics_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .ok();
}

/// Periodic flush: events/sec from the counter delta, queue depth gauges
/// from the bus.
pub async fn run_flush(metrics: Arc<Metrics>, bus: Arc<Bus>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut last_total = metrics.events_total();
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed > 0.0 {
                    let total = metrics.events_total();
                    metrics.set_events_per_second((total - last_total) as f64 / elapsed);
                    last_total = total;
                    last_at = now;
                }
                metrics.set_queue_depths(bus.queue_depths());
            }
            _ = shutdown.changed() => break,
        }
    }
}
