//! Latency measurement primitives shared across the resilience layer.

pub mod histogram;

pub use histogram::*;
