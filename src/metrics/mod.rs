use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, HistogramOpts, IntCounterVec,
};

const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

pub const OUTCOME_OK: &str = "ok";

// Simulation requests by outcome
static SIMULATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "simulation_requests_total",
        "Simulation requests handled since simrelay started, by outcome",
        &["outcome"]
    )
    .unwrap()
});

// Wall-clock time of engine runs
static ENGINE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "simulation_engine_duration_seconds",
        "Time spent waiting for the simulation engine process",
    )
    .buckets(DURATION_BUCKETS.to_vec());
    register_histogram!(opts).unwrap()
});

pub fn record_outcome(outcome: &str) {
    SIMULATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_engine_duration(elapsed: Duration) {
    ENGINE_DURATION.observe(elapsed.as_secs_f64());
}

#[cfg(test)]
pub fn outcome_count(outcome: &str) -> u64 {
    SIMULATIONS.with_label_values(&[outcome]).get()
}
