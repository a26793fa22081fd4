//! Flight recorder: ring buffer plus incident capture state machine.
//!
//! Every event is recorded into a fixed-capacity ring before detectors
//! run. When a detector triggers, the ring is snapshotted as the
//! pre-window and the next `post_events` events are collected as the
//! post-window; the bundle is then committed to disk atomically and the
//! recorder enters a cooldown that suppresses further triggers.
//!
//! Anomalies are only recognizable after the fact; the ring is what lets
//! an incident bundle answer "what led up to this" without continuous
//! recording.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::Counters;
use crate::config::FlightConfig;
use crate::event::Event;

/// Fixed-capacity FIFO over the most recent events; inserting into a full
/// ring evicts the oldest entry.
pub struct RingBuffer {
    buf: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: Arc<Event>) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(event);
    }

    /// Owned copy of the current contents, oldest first. A copy rather
    /// than a view: capture must not alias a buffer that keeps rolling.
    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        self.buf.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentKind {
    Duplicate,
    SequenceGap,
    LatencySpike,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate_detected",
            Self::SequenceGap => "sequence_gap",
            Self::LatencySpike => "latency_spike",
        }
    }
}

struct Capture {
    kind: IncidentKind,
    triggered_at: chrono::DateTime<chrono::Utc>,
    trigger_event: Value,
    symbol: String,
    stats: Counters,
    pre: Vec<Arc<Event>>,
    post: Vec<Arc<Event>>,
}

enum State {
    Idle,
    Capturing(Box<Capture>),
    Cooldown { since: Instant },
}

/// Outcome of feeding one event through the recorder.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Set when this event completed a capture and the bundle committed.
    pub finalized: Option<PathBuf>,
    /// Set when a capture was abandoned on a filesystem error.
    pub capture_failed: bool,
}

pub struct FlightRecorder {
    config: FlightConfig,
    ring: RingBuffer,
    state: State,
    incidents: u64,
}

impl FlightRecorder {
    pub fn new(config: FlightConfig) -> Self {
        let ring = RingBuffer::new(config.pre_events);
        Self {
            config,
            ring,
            state: State::Idle,
            incidents: 0,
        }
    }

    /// Feed one event. Must be called before detectors run on it, so the
    /// trigger event itself is part of the pre-window. Cooldown expiry is
    /// also checked here, ahead of any trigger the same event may cause.
    pub fn record(&mut self, event: &Arc<Event>) -> RecordOutcome {
        self.ring.push(event.clone());

        if let State::Cooldown { since } = &self.state {
            if since.elapsed() >= self.config.cooldown {
                self.state = State::Idle;
            }
        }

        let mut complete = false;
        if let State::Capturing(capture) = &mut self.state {
            capture.post.push(event.clone());
            complete = capture.post.len() >= self.config.post_events;
        }

        if complete {
            self.finalize()
        } else {
            RecordOutcome::default()
        }
    }

    /// Start a capture. Ignored while capturing or cooling down.
    pub fn trigger(
        &mut self,
        kind: IncidentKind,
        trigger_event: Value,
        symbol: &str,
        stats: Counters,
    ) -> bool {
        if !matches!(self.state, State::Idle) {
            return false;
        }
        warn!(kind = kind.as_str(), symbol, "incident_triggered");
        self.state = State::Capturing(Box::new(Capture {
            kind,
            triggered_at: chrono::Utc::now(),
            trigger_event,
            symbol: symbol.to_string(),
            stats,
            pre: self.ring.snapshot(),
            post: Vec::with_capacity(self.config.post_events),
        }));
        true
    }

    /// Best-effort finalization of an in-flight capture at shutdown; the
    /// recorded `post_count` reflects what was actually collected.
    pub fn finalize_partial(&mut self) -> RecordOutcome {
        if matches!(self.state, State::Capturing(_)) {
            self.finalize()
        } else {
            RecordOutcome::default()
        }
    }

    fn finalize(&mut self) -> RecordOutcome {
        let State::Capturing(capture) = std::mem::replace(
            &mut self.state,
            State::Cooldown {
                since: Instant::now(),
            },
        ) else {
            return RecordOutcome::default();
        };

        match self.write_bundle(&capture) {
            Ok(dir) => {
                self.incidents += 1;
                info!(
                    dir = %dir.display(),
                    pre = capture.pre.len(),
                    post = capture.post.len(),
                    "incident_saved"
                );
                RecordOutcome {
                    finalized: Some(dir),
                    capture_failed: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "incident_capture_failed");
                RecordOutcome {
                    finalized: None,
                    capture_failed: true,
                }
            }
        }
    }

    /// Write the bundle under a `.tmp` directory, then rename into place.
    /// The rename is the commit point: a readable incident directory
    /// always holds a complete `events.jsonl` and `meta.json`.
    fn write_bundle(&self, capture: &Capture) -> std::io::Result<PathBuf> {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}_{}",
            capture.triggered_at.format("%Y%m%d_%H%M%S"),
            &id[..8]
        );
        let final_dir = self.config.incidents_dir.join(&name);
        let tmp_dir = self.config.incidents_dir.join(format!("{}.tmp", name));

        let result: std::io::Result<PathBuf> = (|| {
            fs::create_dir_all(&tmp_dir)?;

            let events_file = fs::File::create(tmp_dir.join("events.jsonl"))?;
            let mut events = BufWriter::new(events_file);
            for event in capture.pre.iter().chain(capture.post.iter()) {
                events.write_all(event.to_json_line().as_bytes())?;
            }
            events.flush()?;

            let meta = serde_json::json!({
                "type": capture.kind.as_str(),
                "triggered_at": capture.triggered_at.to_rfc3339(),
                "trigger_event": capture.trigger_event,
                "pre_count": capture.pre.len(),
                "post_count": capture.post.len(),
                "symbol": capture.symbol,
                "stats": capture.stats,
            });
            fs::write(tmp_dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

            fs::rename(&tmp_dir, &final_dir)?;
            Ok(final_dir.clone())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }
        result
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, State::Capturing(_))
    }

    pub fn incidents(&self) -> u64 {
        self.incidents
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}
