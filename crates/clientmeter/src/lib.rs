//! Top-level facade crate for clientmeter.
//!
//! Re-exports core types and the HTTP instrumentation library so users can depend on a single crate.

pub mod core {
    pub use clientmeter_core::*;
}

pub mod http {
    pub use clientmeter_http::*;
}
