//! simrelay: an HTTP front for an external simulation engine.
//!
//! A single `POST /simulate` endpoint hands the caller's JSON to the engine
//! executable and relays the engine's JSON result, classifying every failure.

pub mod config;
pub mod engine;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod service;
pub(crate) mod utils;
