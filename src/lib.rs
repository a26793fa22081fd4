//! MercuryStream processor library.
//!
//! Exposes the pipeline building blocks for the binary and for tests:
//! frame codec, fan-out bus, analytic consumers, forensics detectors and
//! the flight recorder.

pub mod bus;
pub mod config;
pub mod consumers;
pub mod event;
pub mod forensics;
pub mod frame;
pub mod latency;
pub mod metrics;
pub mod recorder;
pub mod server;
