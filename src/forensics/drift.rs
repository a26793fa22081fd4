//! Schema drift detection.
//!
//! Each payload is compared against the reference ticker schema: required
//! keys present, values of the expected JSON shape. Drift is an anomaly to
//! count and sample, never an error; the event still flows through the
//! rest of the pipeline.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::event::{numeric_f64, Event};

/// Expected JSON shape of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    /// A decimal quantity: JSON number, or a string that parses as one.
    Decimal,
}

impl FieldKind {
    fn matches(&self, v: &Value) -> bool {
        match self {
            Self::Str => v.is_string(),
            Self::Int => v.is_u64() || v.is_i64(),
            Self::Decimal => numeric_f64(v).is_some(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Decimal => "decimal",
        }
    }
}

/// The upstream ticker message carries 17 keys; the ingester adds
/// `ingest_ts_ms`. All are required.
pub const REFERENCE_SCHEMA: [(&str, FieldKind); 18] = [
    ("type", FieldKind::Str),
    ("sequence", FieldKind::Int),
    ("product_id", FieldKind::Str),
    ("price", FieldKind::Decimal),
    ("open_24h", FieldKind::Decimal),
    ("volume_24h", FieldKind::Decimal),
    ("low_24h", FieldKind::Decimal),
    ("high_24h", FieldKind::Decimal),
    ("volume_30d", FieldKind::Decimal),
    ("best_bid", FieldKind::Decimal),
    ("best_bid_size", FieldKind::Decimal),
    ("best_ask", FieldKind::Decimal),
    ("best_ask_size", FieldKind::Decimal),
    ("side", FieldKind::Str),
    ("time", FieldKind::Str),
    ("trade_id", FieldKind::Int),
    ("last_size", FieldKind::Decimal),
    ("ingest_ts_ms", FieldKind::Int),
];

#[derive(Debug, Default)]
pub struct DriftReport {
    pub missing: Vec<&'static str>,
    pub mismatched: Vec<(&'static str, &'static str)>,
    pub unexpected: Vec<String>,
}

impl DriftReport {
    /// Missing keys and wrong types are drift. Extra keys are reported in
    /// samples but tolerated on their own (forward compatibility).
    pub fn is_drift(&self) -> bool {
        !self.missing.is_empty() || !self.mismatched.is_empty()
    }

    pub fn reason(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing: {}", self.missing.join(",")));
        }
        for (key, expected) in &self.mismatched {
            parts.push(format!("{} not {}", key, expected));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected: {}", self.unexpected.join(",")));
        }
        parts.join("; ")
    }
}

/// Validate a payload object against the reference schema.
pub fn check_drift(raw: &Map<String, Value>) -> DriftReport {
    let mut report = DriftReport::default();

    for (key, kind) in REFERENCE_SCHEMA {
        match raw.get(key) {
            None => report.missing.push(key),
            Some(value) if !kind.matches(value) => report.mismatched.push((key, kind.name())),
            Some(_) => {}
        }
    }

    for key in raw.keys() {
        let known = key == "recv_ts_ms" || REFERENCE_SCHEMA.iter().any(|(k, _)| k == key);
        if !known {
            report.unexpected.push(key.clone());
        }
    }

    report
}

/// Appends drift samples to a JSONL file, at most one write per interval.
/// Writes are whole lines and blocking; they only happen on anomalies and
/// the rate limit keeps them off the hot path.
pub struct DriftSampleWriter {
    path: PathBuf,
    file: Option<File>,
    min_interval: Duration,
    last_write: Option<Instant>,
    written: u64,
    skipped: u64,
}

impl DriftSampleWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            min_interval: Duration::from_millis(100),
            last_write: None,
            written: 0,
            skipped: 0,
        }
    }

    #[cfg(test)]
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn write_sample(&mut self, event: &Event, report: &DriftReport) {
        if let Some(last) = self.last_write {
            if last.elapsed() < self.min_interval {
                self.skipped += 1;
                return;
            }
        }

        let sample = json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "reason": report.reason(),
            "raw": Value::Object(event.raw().clone()),
        });

        match self.append_line(&sample) {
            Ok(()) => {
                self.written += 1;
                self.last_write = Some(Instant::now());
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "drift_sample_write_failed");
                self.file = None;
            }
        }
    }

    fn append_line(&mut self, sample: &Value) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| *p != Path::new("")) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            debug!(path = %self.path.display(), "drift_sample_file_opened");
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(sample)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_ticker() -> Map<String, Value> {
        let json = r#"{"type":"ticker","sequence":1,"product_id":"BTC-USD","price":"100","open_24h":"90","volume_24h":"10","low_24h":"80","high_24h":"110","volume_30d":"300","best_bid":"99","best_bid_size":"1","best_ask":"101","best_ask_size":"1","side":"buy","time":"2024-06-01T00:00:00Z","trade_id":1,"last_size":"0.1","ingest_ts_ms":1000}"#;
        match serde_json::from_str(json).unwrap() {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_complete_ticker_is_clean() {
        let report = check_drift(&complete_ticker());
        assert!(!report.is_drift());
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_missing_key_is_drift() {
        let mut raw = complete_ticker();
        raw.remove("price");
        let report = check_drift(&raw);
        assert!(report.is_drift());
        assert_eq!(report.missing, vec!["price"]);
    }

    #[test]
    fn test_wrong_type_is_drift() {
        let mut raw = complete_ticker();
        raw.insert("trade_id".to_string(), Value::String("abc".to_string()));
        let report = check_drift(&raw);
        assert!(report.is_drift());
        assert_eq!(report.mismatched, vec![("trade_id", "integer")]);
    }

    #[test]
    fn test_numeric_string_price_accepted() {
        let mut raw = complete_ticker();
        raw.insert("price".to_string(), Value::from(100.5));
        assert!(!check_drift(&raw).is_drift());
        raw.insert("price".to_string(), Value::String("not-a-number".to_string()));
        assert!(check_drift(&raw).is_drift());
    }

    #[test]
    fn test_extra_key_alone_is_not_drift() {
        let mut raw = complete_ticker();
        raw.insert("vendor_flag".to_string(), Value::Bool(true));
        let report = check_drift(&raw);
        assert!(!report.is_drift());
        assert_eq!(report.unexpected, vec!["vendor_flag".to_string()]);
    }

    #[test]
    fn test_recv_ts_always_tolerated() {
        let mut raw = complete_ticker();
        raw.insert("recv_ts_ms".to_string(), Value::from(123));
        let report = check_drift(&raw);
        assert!(!report.is_drift());
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_sample_writer_rate_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift_samples.jsonl");
        let mut writer =
            DriftSampleWriter::new(&path).with_min_interval(Duration::from_secs(3600));

        let mut raw = complete_ticker();
        raw.remove("price");
        let event = Event::from_map(raw, 0);
        let report = check_drift(event.raw());

        for _ in 0..50 {
            writer.write_sample(&event, &report);
        }
        assert_eq!(writer.written(), 1);
        assert_eq!(writer.skipped(), 49);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let sample: Value = serde_json::from_str(lines[0]).unwrap();
        assert!(sample["reason"].as_str().unwrap().contains("missing: price"));
        assert!(sample["raw"].is_object());
    }
}
