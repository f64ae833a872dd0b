//! Request identity and the facts a client reports about one request.

use std::fmt;

use crate::error::{ClientMeterError, ErrorKind};

/// Unique per-request identifier, assigned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Immutable view of an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: RequestId,
    /// Upper-case method name, e.g. `GET`.
    pub method: String,
    /// Full request URI as sent.
    pub uri: String,
    /// `host[:port]` portion of the URI; empty when relative.
    pub host: String,
    /// Path without query or fragment; `/` when empty.
    pub path: String,
    /// Request body length in bytes.
    pub content_length: u64,
}

impl RequestInfo {
    /// Build from a method and an absolute or relative URI string.
    pub fn new(id: RequestId, method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (host, path) = split_uri(&uri);
        Self {
            id,
            method: method.into().to_ascii_uppercase(),
            host,
            path,
            uri,
            content_length: 0,
        }
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = len;
        self
    }
}

fn split_uri(uri: &str) -> (String, String) {
    let rest = match uri.split_once("://") {
        Some((_scheme, rest)) => rest,
        None => return (String::new(), clean_path(uri)),
    };
    match rest.find('/') {
        Some(i) => (rest[..i].to_string(), clean_path(&rest[i..])),
        None => {
            let end = rest.find(['?', '#']).unwrap_or(rest.len());
            (rest[..end].to_string(), "/".to_string())
        }
    }
}

fn clean_path(p: &str) -> String {
    let end = p.find(['?', '#']).unwrap_or(p.len());
    let p = &p[..end];
    if p.is_empty() {
        "/".to_string()
    } else {
        p.to_string()
    }
}

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ClientMeterError> for Failure {
    fn from(e: &ClientMeterError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Terminal view of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestResult {
    /// Response status, when a response head arrived.
    pub status: Option<u16>,
    pub failure: Option<Failure>,
    /// Response body bytes received.
    pub response_length: u64,
}

impl RequestResult {
    pub fn succeeded(status: u16, response_length: u64) -> Self {
        Self {
            status: Some(status),
            failure: None,
            response_length,
        }
    }

    pub fn failed(status: Option<u16>, failure: Failure) -> Self {
        Self {
            status,
            failure: Some(failure),
            response_length: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}
