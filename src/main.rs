//! MercuryStream processor binary.
//!
//! Receives framed ticker events from the ingester over TCP, fans them
//! out to the analytic consumers and the forensics pipeline, and serves
//! process metrics.
//!
//! Every flag is environment-backed, so `HOST=0.0.0.0 PORT=9001
//! mercurystream` and `mercurystream --port 9001` are equivalent.
//!
//! Exit codes: 0 clean shutdown, 1 bind failure, 2 fatal misconfiguration.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mercurystream::bus::Bus;
use mercurystream::config::{FlightConfig, ForensicsConfig, ProcessorConfig};
use mercurystream::consumers;
use mercurystream::forensics::{self, Forensics};
use mercurystream::metrics::{self, Metrics};
use mercurystream::recorder::Recorder;
use mercurystream::server;

#[derive(Parser, Debug)]
#[command(name = "mercurystream")]
#[command(about = "MercuryStream processor - fan-out, forensics, flight recorder")]
struct Args {
    /// TCP bind address for the ingester link
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// TCP bind port for the ingester link
    #[arg(long, env = "PORT", default_value_t = 9001)]
    port: u16,

    /// Prometheus metrics port
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,

    /// Record every decoded event to RECORD_FILE
    #[arg(long, env = "RECORD", default_value_t = false, action = clap::ArgAction::Set)]
    record: bool,

    #[arg(long, env = "RECORD_FILE", default_value = "data/btcusd.jsonl")]
    record_file: PathBuf,

    /// Enable the forensics consumer
    #[arg(long, env = "FORENSICS", default_value_t = true, action = clap::ArgAction::Set)]
    forensics: bool,

    #[arg(long, env = "LATENCY_SPIKE_THRESHOLD_MS", default_value_t = 100)]
    latency_spike_threshold_ms: i64,

    #[arg(long, env = "DUPLICATE_LRU_MAX", default_value_t = 50_000)]
    duplicate_lru_max: usize,

    #[arg(long, env = "FLIGHT_PRE_EVENTS", default_value_t = 5000)]
    flight_pre_events: usize,

    #[arg(long, env = "FLIGHT_POST_EVENTS", default_value_t = 3000)]
    flight_post_events: usize,

    #[arg(long, env = "FLIGHT_COOLDOWN_S", default_value_t = 60)]
    flight_cooldown_s: u64,

    #[arg(long, env = "BUS_QUEUE_CAPACITY", default_value_t = 1000)]
    bus_queue_capacity: usize,

    #[arg(long, env = "INCIDENTS_DIR", default_value = "data/incidents")]
    incidents_dir: PathBuf,

    #[arg(long, env = "DRIFT_SAMPLE_FILE", default_value = "data/drift_samples.jsonl")]
    drift_sample_file: PathBuf,

    /// VWAP summary cadence, in events
    #[arg(long, env = "LOG_INTERVAL", default_value_t = 1000)]
    log_interval: u64,
}

impl Args {
    fn into_config(self) -> ProcessorConfig {
        ProcessorConfig {
            host: self.host,
            port: self.port,
            metrics_port: self.metrics_port,
            record: self.record,
            record_file: self.record_file,
            forensics_enabled: self.forensics,
            bus_queue_capacity: self.bus_queue_capacity,
            log_interval: self.log_interval,
            forensics: ForensicsConfig {
                drift_sample_file: self.drift_sample_file,
                duplicate_lru_max: self.duplicate_lru_max,
                latency_spike_threshold_ms: self.latency_spike_threshold_ms,
                flight: FlightConfig {
                    incidents_dir: self.incidents_dir,
                    pre_events: self.flight_pre_events,
                    post_events: self.flight_post_events,
                    cooldown: std::time::Duration::from_secs(self.flight_cooldown_s),
                },
                ..ForensicsConfig::default()
            },
        }
    }
}

const EXIT_BIND_FAILURE: i32 = 1;
const EXIT_MISCONFIGURATION: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // clap exits with code 2 on invalid values, matching misconfiguration.
    let config = Args::parse().into_config();

    let host: IpAddr = match config.host.parse() {
        Ok(host) => host,
        Err(_) => {
            error!(host = %config.host, "invalid bind host");
            std::process::exit(EXIT_MISCONFIGURATION);
        }
    };

    let listener = match TcpListener::bind((host, config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(host = %config.host, port = config.port, error = %e, "bind_failed");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Metrics::new();
    let bus = Bus::new(config.bus_queue_capacity, metrics.clone());

    let recorder = if config.record {
        match Recorder::spawn(&config.record_file, shutdown_rx.clone()) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                error!(error = %e, "recorder_setup_failed");
                std::process::exit(EXIT_MISCONFIGURATION);
            }
        }
    } else {
        None
    };

    tokio::spawn(metrics::serve(
        metrics.clone(),
        config.metrics_port,
        shutdown_rx.clone(),
    ));
    tokio::spawn(metrics::run_flush(
        metrics.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    ));

    let mut consumer_tasks = Vec::new();
    consumer_tasks.push(tokio::spawn(consumers::vwap::run(
        bus.subscribe("vwap"),
        metrics.clone(),
        config.log_interval,
        shutdown_rx.clone(),
    )));
    consumer_tasks.push(tokio::spawn(consumers::volatility::run(
        bus.subscribe("volatility"),
        shutdown_rx.clone(),
    )));
    consumer_tasks.push(tokio::spawn(consumers::volume::run(
        bus.subscribe("volume"),
        shutdown_rx.clone(),
    )));
    consumer_tasks.push(tokio::spawn(consumers::health::run(
        bus.subscribe("health"),
        bus.clone(),
        shutdown_rx.clone(),
    )));
    if config.forensics_enabled {
        info!("forensics_enabled");
        let forensics = Forensics::new(config.forensics.clone(), metrics.clone());
        // Forensics gets headroom: incident capture briefly blocks on disk.
        let sub = bus.subscribe_with_capacity("forensics", config.bus_queue_capacity * 5);
        consumer_tasks.push(tokio::spawn(forensics::run(
            forensics,
            sub,
            shutdown_rx.clone(),
            server::DEFAULT_DRAIN_DEADLINE,
        )));
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    server::run(
        listener,
        bus,
        recorder,
        metrics,
        shutdown_rx,
        server::DEFAULT_DRAIN_DEADLINE,
    )
    .await;

    for task in consumer_tasks {
        let _ = task.await;
    }
    info!("processor_stopped");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.map(|_| ()).unwrap_or(()),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
