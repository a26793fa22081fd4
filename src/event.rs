//! Decoded tick events.
//!
//! An event is parsed once at the receive loop into a fixed record of the
//! hot fields, while the complete payload object is retained so forensics
//! can inspect the raw shape and incident bundles can re-emit the event
//! byte-faithfully (unknown fields included, key order preserved).

use chrono::DateTime;
use serde_json::{Map, Value};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub enum EventParseError {
    Json(serde_json::Error),
    NotAnObject,
}

impl std::fmt::Display for EventParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid json: {}", e),
            Self::NotAnObject => write!(f, "payload is not a json object"),
        }
    }
}

impl std::error::Error for EventParseError {}

/// One market trade event, immutable after decode.
#[derive(Debug, Clone)]
pub struct Event {
    pub product_id: String,
    pub trade_id: Option<u64>,
    pub sequence: Option<u64>,
    /// Exchange event time parsed from the ISO-8601 `time` field.
    pub exchange_ts_ms: Option<i64>,
    /// Stamped by the ingester when the event left the exchange socket.
    pub ingest_ts_ms: Option<i64>,
    /// Stamped by the processor immediately after frame decode.
    pub recv_ts_ms: i64,
    raw: Map<String, Value>,
}

impl Event {
    /// Decode a frame payload. `recv_ts_ms` is stamped into the payload
    /// unless the upstream already set one.
    pub fn parse(payload: &[u8], recv_ts_ms: i64) -> Result<Self, EventParseError> {
        let value: Value = serde_json::from_slice(payload).map_err(EventParseError::Json)?;
        let Value::Object(raw) = value else {
            return Err(EventParseError::NotAnObject);
        };
        Ok(Self::from_map(raw, recv_ts_ms))
    }

    pub fn from_map(mut raw: Map<String, Value>, recv_ts_ms: i64) -> Self {
        let recv_ts_ms = match raw.get("recv_ts_ms").and_then(Value::as_i64) {
            Some(existing) => existing,
            None => {
                raw.insert("recv_ts_ms".to_string(), recv_ts_ms.into());
                recv_ts_ms
            }
        };

        let product_id = raw
            .get("product_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let exchange_ts_ms = raw
            .get("time")
            .and_then(Value::as_str)
            .and_then(parse_iso8601_ms);

        Self {
            product_id,
            trade_id: raw.get("trade_id").and_then(Value::as_u64),
            sequence: raw.get("sequence").and_then(Value::as_u64),
            exchange_ts_ms,
            ingest_ts_ms: raw.get("ingest_ts_ms").and_then(Value::as_i64),
            recv_ts_ms,
            raw,
        }
    }

    /// The full payload object, receive stamp included.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn price(&self) -> Option<f64> {
        self.raw.get("price").and_then(numeric_f64)
    }

    pub fn last_size(&self) -> Option<f64> {
        self.raw.get("last_size").and_then(numeric_f64)
    }

    pub fn side(&self) -> Option<&str> {
        self.raw.get("side").and_then(Value::as_str)
    }

    /// Pipeline latency: receive stamp minus ingest stamp. Negative values
    /// are possible under clock skew; callers clamp where needed.
    pub fn age_ms(&self) -> Option<i64> {
        self.ingest_ts_ms.map(|ingest| self.recv_ts_ms - ingest)
    }

    /// One JSONL line of the original payload.
    pub fn to_json_line(&self) -> String {
        let mut line = serde_json::to_string(&Value::Object(self.raw.clone()))
            .unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }

    /// Copy of the payload with one extra key, used to annotate the trigger
    /// event stored in incident metadata.
    pub fn tagged(&self, key: &str, value: Value) -> Value {
        let mut copy = self.raw.clone();
        copy.insert(key.to_string(), value);
        Value::Object(copy)
    }
}

/// Decimal quantities arrive either as JSON numbers or as decimal strings
/// (`"50000.12"`). Parse both; equality is never taken on the result.
pub fn numeric_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_iso8601_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker_json() -> &'static str {
        r#"{"type":"ticker","sequence":12345,"product_id":"BTC-USD","price":"50000.12","open_24h":"49000","volume_24h":"1200.5","low_24h":"48000","high_24h":"51000","volume_30d":"40000","best_bid":"50000.11","best_bid_size":"0.5","best_ask":"50000.13","best_ask_size":"0.7","side":"buy","time":"2024-06-01T12:00:00.123456Z","trade_id":777,"last_size":"0.25","ingest_ts_ms":1717243200200}"#
    }

    #[test]
    fn test_parse_ticker() {
        let ev = Event::parse(ticker_json().as_bytes(), 1717243200250).unwrap();
        assert_eq!(ev.product_id, "BTC-USD");
        assert_eq!(ev.trade_id, Some(777));
        assert_eq!(ev.sequence, Some(12345));
        assert_eq!(ev.ingest_ts_ms, Some(1717243200200));
        assert_eq!(ev.recv_ts_ms, 1717243200250);
        assert_eq!(ev.age_ms(), Some(50));
        assert!((ev.price().unwrap() - 50000.12).abs() < 1e-9);
        assert!((ev.last_size().unwrap() - 0.25).abs() < 1e-9);
        assert_eq!(ev.side(), Some("buy"));
        assert_eq!(ev.exchange_ts_ms, Some(1717243200123));
    }

    #[test]
    fn test_recv_stamp_added_once() {
        let ev = Event::parse(br#"{"product_id":"ETH-USD","recv_ts_ms":42}"#, 99).unwrap();
        assert_eq!(ev.recv_ts_ms, 42);

        let ev = Event::parse(br#"{"product_id":"ETH-USD"}"#, 99).unwrap();
        assert_eq!(ev.recv_ts_ms, 99);
        assert_eq!(ev.raw().get("recv_ts_ms").and_then(Value::as_i64), Some(99));
    }

    #[test]
    fn test_numeric_price_accepted() {
        let ev = Event::parse(br#"{"product_id":"BTC-USD","price":100.5}"#, 0).unwrap();
        assert!((ev.price().unwrap() - 100.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_fields_tolerated() {
        let ev = Event::parse(br#"{"something":"else"}"#, 5).unwrap();
        assert_eq!(ev.product_id, "unknown");
        assert!(ev.trade_id.is_none());
        assert!(ev.age_ms().is_none());
        assert!(ev.price().is_none());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            Event::parse(b"[1,2,3]", 0),
            Err(EventParseError::NotAnObject)
        ));
        assert!(matches!(
            Event::parse(b"not json", 0),
            Err(EventParseError::Json(_))
        ));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let ev = Event::parse(br#"{"product_id":"BTC-USD","vendor_flag":true}"#, 1).unwrap();
        let line = ev.to_json_line();
        assert!(line.contains("\"vendor_flag\":true"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_tagged_copy_leaves_original() {
        let ev = Event::parse(br#"{"product_id":"BTC-USD","trade_id":1}"#, 1).unwrap();
        let tagged = ev.tagged("dup", Value::Bool(true));
        assert_eq!(tagged.get("dup"), Some(&Value::Bool(true)));
        assert!(ev.raw().get("dup").is_none());
    }
}
