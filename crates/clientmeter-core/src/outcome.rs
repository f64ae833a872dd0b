//! Coarse classification of a completed request.

use serde::Serialize;

/// Outcome tag value derived from the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

impl Outcome {
    /// Classify an HTTP status code. Anything outside 100..=599 is `Unknown`.
    pub fn for_status(status: u16) -> Self {
        match status {
            100..=199 => Outcome::Informational,
            200..=299 => Outcome::Success,
            300..=399 => Outcome::Redirection,
            400..=499 => Outcome::ClientError,
            500..=599 => Outcome::ServerError,
            _ => Outcome::Unknown,
        }
    }

    /// Classify an optional status; no status (transport failure) is `Unknown`.
    pub fn for_optional_status(status: Option<u16>) -> Self {
        status.map(Self::for_status).unwrap_or(Outcome::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Informational => "INFORMATIONAL",
            Outcome::Success => "SUCCESS",
            Outcome::Redirection => "REDIRECTION",
            Outcome::ClientError => "CLIENT_ERROR",
            Outcome::ServerError => "SERVER_ERROR",
            Outcome::Unknown => "UNKNOWN",
        }
    }
}
