//! Rolling volatility of log returns per symbol.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::bus::Subscription;

const RETURN_WINDOW: usize = 100;
const MIN_RETURNS: usize = 10;
/// Annualization assumes roughly one tick per second.
const TICKS_PER_YEAR: f64 = 86_400.0 * 365.0;

pub async fn run(sub: Subscription, mut shutdown: watch::Receiver<bool>) {
    let mut last_prices: HashMap<String, f64> = HashMap::new();
    let mut returns: HashMap<String, VecDeque<f64>> = HashMap::new();
    let mut tick = tokio::time::interval(Duration::from_secs(10));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = sub.recv() => ingest(&mut last_prices, &mut returns, &event),
            _ = tick.tick() => summarize(&returns),
            _ = shutdown.changed() => break,
        }
    }

    while let Some(event) = sub.try_recv() {
        ingest(&mut last_prices, &mut returns, &event);
    }
}

fn ingest(
    last_prices: &mut HashMap<String, f64>,
    returns: &mut HashMap<String, VecDeque<f64>>,
    event: &crate::event::Event,
) {
    let Some(price) = event.price().filter(|p| *p > 0.0) else {
        return;
    };
    if let Some(&last) = last_prices.get(&event.product_id) {
        if last > 0.0 {
            let window = returns.entry(event.product_id.clone()).or_default();
            if window.len() == RETURN_WINDOW {
                window.pop_front();
            }
            window.push_back((price / last).ln());
        }
    }
    last_prices.insert(event.product_id.clone(), price);
}

fn summarize(returns: &HashMap<String, VecDeque<f64>>) {
    let mut symbols: Vec<&String> = returns.keys().collect();
    symbols.sort();

    let vols = symbols
        .iter()
        .filter_map(|sym| {
            annualized_vol_pct(&returns[*sym]).map(|vol| format!("{}={:.1}%", sym, vol))
        })
        .collect::<Vec<_>>();

    if !vols.is_empty() {
        info!(vols = %vols.join(" | "), "volatility_summary");
    }
}

fn annualized_vol_pct(window: &VecDeque<f64>) -> Option<f64> {
    if window.len() < MIN_RETURNS {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt() * TICKS_PER_YEAR.sqrt() * 100.0)
}
