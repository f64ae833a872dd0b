//! Wire transport behind the instrumented client.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use clientmeter_core::error::{ClientMeterError, Result};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Response body as produced by a transport.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Sends one request and yields the response head with a streaming body.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>>;
}

/// Plain-HTTP transport on the hyper-util pooled client.
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>> {
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| ClientMeterError::Transport(error_chain(&e)))?;
        Ok(resp.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync()))
    }
}

/// Flatten an error and its sources into one line.
pub(crate) fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}
