//! Optional raw event recorder.
//!
//! When enabled, every decoded event is appended verbatim to a JSONL
//! file. Lines travel through a bounded queue to a writer task; a full
//! queue drops the line rather than slow the receive loop. Flushes are
//! batched (every 200 lines or 1 s).

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::event::Event;

const QUEUE_CAPACITY: usize = 10_000;
const FLUSH_EVERY_LINES: usize = 200;

#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<String>,
    path: PathBuf,
}

impl Recorder {
    /// Open the file and spawn the writer task. Failure to open is a
    /// configuration problem surfaced to the caller.
    pub fn spawn(
        path: impl Into<PathBuf>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| *p != Path::new("")) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening record file {}", path.display()))?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer_path = path.clone();
        tokio::spawn(run_writer(rx, BufWriter::new(file), writer_path, shutdown));
        info!(path = %path.display(), "recording_enabled");

        Ok(Self { tx, path })
    }

    /// Non-blocking; drops the line when the writer is behind.
    pub fn record(&self, event: &Event) {
        if self.tx.try_send(event.to_json_line()).is_err() {
            warn!(path = %self.path.display(), "recorder_queue_full");
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<String>,
    mut out: BufWriter<std::fs::File>,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending = 0usize;
    let mut flush_tick = tokio::time::interval(Duration::from_secs(1));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = out.write_all(line.as_bytes()) {
                        warn!(path = %path.display(), error = %e, "record_write_failed");
                        continue;
                    }
                    pending += 1;
                    if pending >= FLUSH_EVERY_LINES {
                        let _ = out.flush();
                        pending = 0;
                    }
                }
                None => break,
            },
            _ = flush_tick.tick() => {
                if pending > 0 {
                    let _ = out.flush();
                    pending = 0;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Drain whatever is already queued, then flush once.
    while let Ok(line) = rx.try_recv() {
        let _ = out.write_all(line.as_bytes());
    }
    let _ = out.flush();
    debug!(path = %path.display(), "recorder_stopped");
}
