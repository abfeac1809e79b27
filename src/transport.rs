//! A single HTTP exchange, abstracted so the dispatcher can be driven by any client.
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{Error, Result};

/// HTTP method of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`.
    Get,
    /// `POST`.
    Post,
}

/// An addressed outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute endpoint URL.
    pub url: Url,
    /// Header name/value pairs, sent in order.
    pub headers: Vec<(String, String)>,
    /// Serialized body. Handed back verbatim if the request fails.
    pub body: Vec<u8>,
}

impl Request {
    /// Create a `POST` request with a JSON body.
    pub fn post_json(url: Url, body: Vec<u8>) -> Request {
        Request {
            method: Method::Post,
            url,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body,
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Request {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Find the first header with `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs one HTTP exchange.
///
/// Non-2xx statuses are returned as `Ok(Response)`; `Err` is reserved for failures where no
/// response was received (connection errors, timeouts).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and wait for the response.
    async fn send(&self, request: &Request) -> Result<Response>;
}

/// [`Transport`] backed by `reqwest`.
pub struct ReqwestTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a transport with [`ReqwestTransport::DEFAULT_TIMEOUT`].
    pub fn new() -> Result<ReqwestTransport> {
        ReqwestTransport::with_timeout(ReqwestTransport::DEFAULT_TIMEOUT)
    }

    /// Create a transport whose requests fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<ReqwestTransport> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder.body(request.body.clone()).send().await?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(Error::from)?.to_vec();

        Ok(Response { status, body })
    }
}
