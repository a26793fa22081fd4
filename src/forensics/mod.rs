//! Forensics consumer: data-quality detectors over the live stream.
//!
//! Subscribes to the bus and runs five detectors per event — schema
//! drift, duplicates, out-of-order timestamps, sequence gaps and latency
//! spikes — feeding the flight recorder that captures incident bundles.
//! All detector state is owned by this single task; nothing here locks.

pub mod drift;
pub mod flight;
pub mod integrity;
pub mod spike;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::bus::Subscription;
use crate::config::ForensicsConfig;
use crate::event::Event;
use crate::metrics::{AnomalyKind, Metrics};
use drift::{check_drift, DriftSampleWriter};
use flight::{FlightRecorder, IncidentKind};
use integrity::IntegrityTracker;
use spike::SpikeDetector;

/// Running totals, mirrored into process metrics and embedded into every
/// incident bundle's metadata.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Counters {
    pub processed: u64,
    pub drift: u64,
    pub dup: u64,
    pub ooo: u64,
    pub gaps: u64,
    pub spikes: u64,
    pub incidents: u64,
}

pub struct Forensics {
    counters: Counters,
    integrity: IntegrityTracker,
    spike: SpikeDetector,
    drift_writer: DriftSampleWriter,
    flight: FlightRecorder,
    metrics: Arc<Metrics>,
}

impl Forensics {
    pub fn new(config: ForensicsConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            counters: Counters::default(),
            integrity: IntegrityTracker::new(config.duplicate_lru_max),
            spike: SpikeDetector::new(
                config.latency_window,
                config.latency_spike_threshold_ms,
                config.spike_eval_every,
                config.spike_consecutive,
            ),
            drift_writer: DriftSampleWriter::new(config.drift_sample_file.clone()),
            flight: FlightRecorder::new(config.flight),
            metrics,
        }
    }

    /// Run the full detector pass over one event.
    pub fn process(&mut self, event: &Arc<Event>) {
        self.counters.processed += 1;

        // The flight recorder sees every event first, so the trigger
        // event itself always lands in the pre-window.
        let outcome = self.flight.record(event);
        self.note_outcome(outcome);

        let drift_report = check_drift(event.raw());
        if drift_report.is_drift() {
            self.counters.drift += 1;
            self.metrics.inc_anomaly(AnomalyKind::Drift);
            self.drift_writer.write_sample(event, &drift_report);
        }

        let integrity = self.integrity.check(event);
        if integrity.duplicate {
            self.counters.dup += 1;
            self.metrics.inc_anomaly(AnomalyKind::Dup);
            self.trigger(
                IncidentKind::Duplicate,
                event.tagged("dup", Value::Bool(true)),
                &event.product_id,
            );
        }
        if integrity.out_of_order {
            self.counters.ooo += 1;
            self.metrics.inc_anomaly(AnomalyKind::Ooo);
        }
        if let Some(missing) = integrity.gap {
            self.counters.gaps += missing;
            self.metrics.inc_anomaly_by(AnomalyKind::Gaps, missing);
            self.trigger(
                IncidentKind::SequenceGap,
                Value::Object(event.raw().clone()),
                &event.product_id,
            );
        }

        if let Some(age) = event.age_ms() {
            if self.spike.add_sample(age) {
                self.counters.spikes += 1;
                self.metrics.inc_anomaly(AnomalyKind::Spikes);
                self.trigger(
                    IncidentKind::LatencySpike,
                    event.tagged("p99_ms", Value::from(self.spike.last_p99())),
                    &event.product_id,
                );
            }
        }
    }

    fn trigger(&mut self, kind: IncidentKind, trigger_event: Value, symbol: &str) {
        self.flight.trigger(kind, trigger_event, symbol, self.counters);
    }

    fn note_outcome(&mut self, outcome: flight::RecordOutcome) {
        if outcome.finalized.is_some() {
            self.counters.incidents += 1;
            self.metrics.inc_incidents();
        }
        if outcome.capture_failed {
            self.metrics.inc_capture_failures();
        }
    }

    /// Finalize any in-flight capture; called on shutdown.
    pub fn finish(&mut self) {
        let outcome = self.flight.finalize_partial();
        self.note_outcome(outcome);
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    fn log_stats(&self) {
        let c = &self.counters;
        info!(
            processed = c.processed,
            drift = c.drift,
            dup = c.dup,
            ooo = c.ooo,
            gaps = c.gaps,
            spikes = c.spikes,
            incidents = c.incidents,
            "forensics_stats"
        );
    }
}

/// Consumer task: detector pass per event, periodic stats line, drain on
/// shutdown with a deadline, then best-effort finalize.
pub async fn run(
    mut forensics: Forensics,
    sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
    drain_deadline: Duration,
) {
    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = sub.recv() => forensics.process(&event),
            _ = stats_tick.tick() => forensics.log_stats(),
            _ = shutdown.changed() => break,
        }
    }

    let deadline = Instant::now() + drain_deadline;
    while Instant::now() < deadline {
        match sub.try_recv() {
            Some(event) => forensics.process(&event),
            None => break,
        }
    }
    forensics.finish();
    forensics.log_stats();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightConfig;

    fn test_config(dir: &std::path::Path) -> ForensicsConfig {
        ForensicsConfig {
            drift_sample_file: dir.join("drift_samples.jsonl"),
            duplicate_lru_max: 50_000,
            latency_spike_threshold_ms: 100,
            latency_window: 1000,
            spike_eval_every: 100,
            spike_consecutive: 2,
            flight: FlightConfig {
                incidents_dir: dir.join("incidents"),
                pre_events: 5000,
                post_events: 10,
                cooldown: Duration::from_millis(10),
            },
        }
    }

    fn ticker(trade_id: u64, sequence: u64) -> Arc<Event> {
        let payload = format!(
            r#"{{"type":"ticker","sequence":{seq},"product_id":"BTC-USD","price":"100","open_24h":"90","volume_24h":"10","low_24h":"80","high_24h":"110","volume_30d":"300","best_bid":"99","best_bid_size":"1","best_ask":"101","best_ask_size":"1","side":"buy","time":"2024-06-01T00:00:00Z","trade_id":{tid},"last_size":"0.1","ingest_ts_ms":1000}}"#,
            seq = sequence,
            tid = trade_id,
        );
        Arc::new(Event::parse(payload.as_bytes(), 1010).unwrap())
    }

    #[test]
    fn test_duplicate_counts_once_and_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(test_config(dir.path()), Metrics::new());

        for n in 1..=1000u64 {
            forensics.process(&ticker(n, n));
        }
        assert_eq!(forensics.counters().dup, 0);

        forensics.process(&ticker(500, 1001));
        assert_eq!(forensics.counters().dup, 1);
        assert!(forensics.flight.is_capturing());
    }

    #[test]
    fn test_gap_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(test_config(dir.path()), Metrics::new());

        for (tid, seq) in [(1u64, 100u64), (2, 101), (3, 102), (4, 106)] {
            forensics.process(&ticker(tid, seq));
        }
        assert_eq!(forensics.counters().gaps, 3);
        assert!(forensics.flight.is_capturing());
    }

    #[test]
    fn test_drift_counts_but_never_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(test_config(dir.path()), Metrics::new());

        for n in 0..50 {
            // Missing price (and most other required keys).
            let payload = format!(
                r#"{{"type":"ticker","product_id":"BTC-USD","trade_id":{},"sequence":{}}}"#,
                n + 1,
                n + 1
            );
            let event = Arc::new(Event::parse(payload.as_bytes(), 0).unwrap());
            forensics.process(&event);
        }

        let c = forensics.counters();
        assert_eq!(c.drift, 50);
        assert_eq!(c.incidents, 0);
        assert!(!forensics.flight.is_capturing());
        // Rate limit: far fewer samples on disk than drift events.
        assert!(forensics.drift_writer.written() >= 1);
        assert!(forensics.drift_writer.written() < 50);
    }

    #[test]
    fn test_incident_bundle_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(test_config(dir.path()), Metrics::new());

        for n in 1..=20u64 {
            forensics.process(&ticker(n, n));
        }
        forensics.process(&ticker(5, 21)); // duplicate trade_id
        for n in 22..=40u64 {
            forensics.process(&ticker(n + 100, n));
        }

        assert_eq!(forensics.counters().incidents, 1);
        let incidents: Vec<_> = std::fs::read_dir(dir.path().join("incidents"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(incidents.len(), 1);

        let meta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(incidents[0].path().join("meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["type"], "duplicate_detected");
        assert_eq!(meta["trigger_event"]["dup"], true);
        assert_eq!(meta["stats"]["dup"], 1);
        assert_eq!(meta["symbol"], "BTC-USD");
    }
}
