//! Processor configuration.
//!
//! Every knob is environment-driven (the binary mirrors each variable as a
//! CLI flag). Defaults here are the documented service defaults.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub record: bool,
    pub record_file: PathBuf,
    pub forensics_enabled: bool,
    pub bus_queue_capacity: usize,
    /// VWAP summary cadence, in events.
    pub log_interval: u64,
    pub forensics: ForensicsConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            metrics_port: 9090,
            record: false,
            record_file: PathBuf::from("data/btcusd.jsonl"),
            forensics_enabled: true,
            bus_queue_capacity: 1000,
            log_interval: 1000,
            forensics: ForensicsConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForensicsConfig {
    pub drift_sample_file: PathBuf,
    /// Seen trade-id capacity per symbol.
    pub duplicate_lru_max: usize,
    pub latency_spike_threshold_ms: i64,
    /// Rolling latency window feeding the p99 evaluation.
    pub latency_window: usize,
    /// Evaluate p99 every this many samples.
    pub spike_eval_every: usize,
    /// Consecutive over-threshold evaluations required to trigger.
    pub spike_consecutive: u32,
    pub flight: FlightConfig,
}

impl Default for ForensicsConfig {
    fn default() -> Self {
        Self {
            drift_sample_file: PathBuf::from("data/drift_samples.jsonl"),
            duplicate_lru_max: 50_000,
            latency_spike_threshold_ms: 100,
            latency_window: 1000,
            spike_eval_every: 100,
            spike_consecutive: 2,
            flight: FlightConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlightConfig {
    pub incidents_dir: PathBuf,
    /// Ring capacity: events retained before a trigger.
    pub pre_events: usize,
    /// Events captured after a trigger before the bundle is finalized.
    pub post_events: usize,
    /// Minimum quiet period between incidents.
    pub cooldown: Duration,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            incidents_dir: PathBuf::from("data/incidents"),
            pre_events: 5000,
            post_events: 3000,
            cooldown: Duration::from_secs(60),
        }
    }
}
