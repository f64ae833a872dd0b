//! clientmeter HTTP library entry.
//!
//! This crate wires the meter and observation registries, the request
//! metrics listener, and an instrumented hyper client into one stack. It is
//! consumed by the probe binary (`main.rs`) and by integration tests.

pub mod client;
pub mod config;
pub mod instrumentation;
pub mod listener;
pub mod obs;
pub mod ops;

pub use client::{HttpResponse, InstrumentedClient};
pub use instrumentation::Instrumentation;
pub use listener::{RequestMetricsListener, TagExtractor, UriPath};
