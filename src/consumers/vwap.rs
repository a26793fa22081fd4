//! Volume-weighted average price per symbol, plus pipeline latency
//! tracking. This is the reference consumer: the other analytics follow
//! the same subscribe/select/summarize shape.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::Subscription;
use crate::event::{now_ms, Event};
use crate::latency::LatencyWindow;
use crate::metrics::Metrics;

#[derive(Debug, Default)]
struct VwapBook {
    price_volume: f64,
    volume: f64,
}

impl VwapBook {
    fn vwap(&self) -> f64 {
        if self.volume > 0.0 {
            self.price_volume / self.volume
        } else {
            0.0
        }
    }
}

pub async fn run(
    sub: Subscription,
    metrics: Arc<Metrics>,
    log_interval: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut books: HashMap<String, VwapBook> = HashMap::new();
    // age: exchange socket -> processor decode; proc: decode -> now.
    let mut ages = LatencyWindow::default();
    let mut procs = LatencyWindow::default();
    let mut count: u64 = 0;
    let log_interval = log_interval.max(1);

    loop {
        tokio::select! {
            event = sub.recv() => {
                if !observe(&mut books, &mut ages, &mut procs, &metrics, &event) {
                    continue;
                }
                count += 1;
                if count % log_interval == 0 {
                    summarize(&books, &ages, &procs, &sub, &metrics);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Shutdown: consume what was already queued before unsubscribing.
    while let Some(event) = sub.try_recv() {
        if observe(&mut books, &mut ages, &mut procs, &metrics, &event) {
            count += 1;
        }
    }
    info!(events = count, "vwap_stopped");
}

fn observe(
    books: &mut HashMap<String, VwapBook>,
    ages: &mut LatencyWindow,
    procs: &mut LatencyWindow,
    metrics: &Metrics,
    event: &Event,
) -> bool {
    let (Some(price), Some(size)) = (event.price(), event.last_size()) else {
        return false;
    };
    if price <= 0.0 || size < 0.0 {
        warn!(symbol = %event.product_id, price, size, "vwap_bad_quantities");
        return false;
    }

    let book = books.entry(event.product_id.clone()).or_default();
    book.price_volume += price * size;
    book.volume += size;

    if let Some(age) = event.age_ms() {
        let age = age.max(0);
        ages.push(age);
        metrics.observe_latency_ms(age);
    }
    procs.push((now_ms() - event.recv_ts_ms).max(0));
    true
}

fn summarize(
    books: &HashMap<String, VwapBook>,
    ages: &LatencyWindow,
    procs: &LatencyWindow,
    sub: &Subscription,
    metrics: &Metrics,
) {
    let mut symbols: Vec<&String> = books.keys().collect();
    symbols.sort();
    let vwaps = symbols
        .iter()
        .map(|s| format!("{}={:.2}", s, books[*s].vwap()))
        .collect::<Vec<_>>()
        .join(" | ");

    info!(
        vwaps = %vwaps,
        age_p50_ms = ages.p50(),
        age_p99_ms = ages.p99(),
        proc_p99_ms = procs.p99(),
        dropped = sub.dropped(),
        "vwap_summary"
    );
    metrics.set_age_percentiles(ages.p50(), ages.p95(), ages.p99());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str, recv: i64) -> Event {
        Event::parse(json.as_bytes(), recv).unwrap()
    }

    #[test]
    fn test_running_vwap() {
        let mut books = HashMap::new();
        let mut ages = LatencyWindow::default();
        let mut procs = LatencyWindow::default();
        let metrics = Metrics::new();

        for (price, size) in [(100.0, 1.0), (200.0, 1.0), (300.0, 2.0)] {
            let json = format!(
                r#"{{"product_id":"BTC-USD","price":{},"last_size":{},"ingest_ts_ms":0}}"#,
                price, size
            );
            assert!(observe(&mut books, &mut ages, &mut procs, &metrics, &event(&json, 10)));
        }
        // (100 + 200 + 600) / 4
        assert!((books["BTC-USD"].vwap() - 225.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unusable_events() {
        let mut books = HashMap::new();
        let mut ages = LatencyWindow::default();
        let mut procs = LatencyWindow::default();
        let metrics = Metrics::new();

        for json in [
            r#"{"product_id":"BTC-USD"}"#,
            r#"{"product_id":"BTC-USD","price":0,"last_size":1}"#,
            r#"{"product_id":"BTC-USD","price":100,"last_size":-1}"#,
        ] {
            assert!(!observe(&mut books, &mut ages, &mut procs, &metrics, &event(json, 10)));
        }
        assert!(books.is_empty());
    }

    #[test]
    fn test_age_feeds_windows() {
        let mut books = HashMap::new();
        let mut ages = LatencyWindow::default();
        let mut procs = LatencyWindow::default();
        let metrics = Metrics::new();

        let json = r#"{"product_id":"BTC-USD","price":100,"last_size":1,"ingest_ts_ms":1000}"#;
        observe(&mut books, &mut ages, &mut procs, &metrics, &event(json, 1045));
        assert_eq!(ages.p50(), 45);
    }
}
