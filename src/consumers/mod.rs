//! Analytic consumers.
//!
//! Each consumer owns a bus subscription and runs as an independent task:
//! a `select!` loop over the queue, a periodic summary timer and the
//! shutdown signal. A consumer that falls behind shows up as drops on its
//! subscription; it never stalls the producer or its peers.

pub mod health;
pub mod volatility;
pub mod volume;
pub mod vwap;
