//! TCP server glue: accept loop and per-connection receive tasks.
//!
//! Each connection runs the frame decoder; every payload is parsed,
//! stamped with `recv_ts_ms` and published to the bus. Errors are
//! connection-local: a bad frame closes that connection, a bad payload is
//! skipped, other connections are unaffected.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::event::{now_ms, Event};
use crate::frame::FrameReader;
use crate::metrics::Metrics;
use crate::recorder::Recorder;

pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Accept connections until shutdown. The listener is bound by the caller
/// so bind failures can map to the right exit code.
pub async fn run(
    listener: TcpListener,
    bus: Arc<Bus>,
    recorder: Option<Recorder>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
    drain_deadline: Duration,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let bus = bus.clone();
                    let recorder = recorder.clone();
                    let metrics = metrics.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, bus, recorder, metrics, shutdown, drain_deadline)
                            .await;
                        debug!(%peer, "client_disconnected");
                    });
                    info!(%peer, "client_connected");
                }
                Err(e) => warn!(error = %e, "accept_failed"),
            },
            _ = shutdown.changed() => {
                info!("accept_loop_stopped");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    bus: Arc<Bus>,
    recorder: Option<Recorder>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
    drain_deadline: Duration,
) {
    let mut frames = FrameReader::new(BufReader::new(stream));

    loop {
        tokio::select! {
            frame = frames.next() => {
                if !handle_frame(frame, &bus, &recorder, &metrics) {
                    return;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Shutdown: drain frames already in flight, bounded by the deadline.
    let drain = async {
        loop {
            let frame = frames.next().await;
            if !handle_frame(frame, &bus, &recorder, &metrics) {
                break;
            }
        }
    };
    if tokio::time::timeout(drain_deadline, drain).await.is_err() {
        debug!("drain_deadline_elapsed");
    }
}

/// Process one decoder result. Returns false when the connection should
/// close (clean EOF or frame error).
fn handle_frame(
    frame: Result<Option<Vec<u8>>, crate::frame::FrameError>,
    bus: &Arc<Bus>,
    recorder: &Option<Recorder>,
    metrics: &Arc<Metrics>,
) -> bool {
    let payload = match frame {
        Ok(Some(payload)) => payload,
        Ok(None) => return false,
        Err(e) => {
            warn!(error = %e, "frame_error");
            return false;
        }
    };

    let event = match Event::parse(&payload, now_ms()) {
        Ok(event) => Arc::new(event),
        Err(e) => {
            debug!(error = %e, "payload_parse_error");
            return true;
        }
    };

    if let Some(recorder) = recorder {
        recorder.record(&event);
    }
    bus.publish(&event);
    metrics.inc_events();
    true
}
