//! Latency spike detection.
//!
//! Feeds pipeline-age samples into a rolling window and evaluates p99
//! every `eval_every` samples. A single hot evaluation is treated as an
//! outlier; only consecutive over-threshold evaluations trigger.

use crate::latency::LatencyWindow;

/// Samples required before evaluations start producing verdicts.
const MIN_BASELINE: usize = 100;

pub struct SpikeDetector {
    window: LatencyWindow,
    threshold_ms: i64,
    eval_every: usize,
    consecutive_required: u32,
    since_eval: usize,
    consecutive_over: u32,
    last_p99: i64,
}

impl SpikeDetector {
    pub fn new(
        window: usize,
        threshold_ms: i64,
        eval_every: usize,
        consecutive_required: u32,
    ) -> Self {
        Self {
            window: LatencyWindow::new(window),
            threshold_ms,
            eval_every: eval_every.max(1),
            consecutive_required: consecutive_required.max(1),
            since_eval: 0,
            consecutive_over: 0,
            last_p99: 0,
        }
    }

    /// Add one age sample. Returns true when a sustained spike fires; the
    /// consecutive counter resets after a trigger so the next incident
    /// requires a fresh run of hot evaluations.
    pub fn add_sample(&mut self, age_ms: i64) -> bool {
        self.window.push(age_ms.max(0));
        self.since_eval += 1;
        if self.since_eval < self.eval_every {
            return false;
        }
        self.since_eval = 0;

        if self.window.len() < MIN_BASELINE {
            return false;
        }

        let p99 = self.window.p99();
        self.last_p99 = p99;

        if p99 > self.threshold_ms {
            self.consecutive_over += 1;
            if self.consecutive_over >= self.consecutive_required {
                self.consecutive_over = 0;
                return true;
            }
        } else {
            self.consecutive_over = 0;
        }
        false
    }

    /// p99 from the most recent evaluation, for incident metadata.
    pub fn last_p99(&self) -> i64 {
        self.last_p99
    }
}
