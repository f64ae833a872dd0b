//! clientmeter core: request lifecycle types, outcome classification, listener
//! contracts, and the shared error type.
//!
//! This crate defines what an HTTP client reports about its requests and how
//! listeners subscribe to it. It intentionally carries no transport or runtime
//! dependencies so any client implementation can host listeners.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Listener dispatch additionally isolates listener panics so a faulty
//! listener never aborts the request that triggered it.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod listener;
pub mod outcome;
pub mod request;

/// Shared result type.
pub use error::{ClientMeterError, ErrorKind, Result};
pub use listener::{attach, ListenerHost, RequestListener, RequestListeners};
pub use outcome::Outcome;
pub use request::{Failure, RequestId, RequestInfo, RequestResult};
