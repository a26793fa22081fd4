//! Pipeline health: throughput, backpressure, queue depths.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::info;

use crate::bus::{Bus, Subscription};

pub async fn run(sub: Subscription, bus: Arc<Bus>, mut shutdown: watch::Receiver<bool>) {
    let mut count: u64 = 0;
    let mut last_price: Option<f64> = None;
    let mut window_start = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = sub.recv() => {
                count += 1;
                if let Some(price) = event.price() {
                    last_price = Some(price);
                }
            }
            _ = tick.tick() => {
                let elapsed = window_start.elapsed().as_secs_f64();
                let eps = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 };
                let depths = bus
                    .queue_depths()
                    .into_iter()
                    .map(|(name, depth)| format!("{}={}", name, depth))
                    .collect::<Vec<_>>()
                    .join(",");

                info!(
                    eps = %format!("{:.1}", eps),
                    price = ?last_price,
                    drops = bus.drops_total(),
                    subs = bus.subscriber_count(),
                    qdepths = %depths,
                    "health_summary"
                );
                count = 0;
                window_start = Instant::now();
            }
            _ = shutdown.changed() => break,
        }
    }
}
