//! The underlying request transport.
//!
//! The pipeline never speaks HTTP itself; it hands a [`TransportRequest`] to a
//! [`Transport`] and classifies what comes back. [`HttpTransport`] is the
//! reqwest-backed implementation used outside tests.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Header carrying the per-call request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The bearer token attached to this request, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.header(header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Failures where no response was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("request could not be built: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// HTTP transport against a fixed base URL.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // Per-request timeouts are set on each call; this is only a connect bound.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn headers(request: &TransportRequest) -> Result<header::HeaderMap, TransportError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header name {}: {}", name, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = self.url(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(Self::headers(&request)?)
            .timeout(request.timeout);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(e, request.timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, request.timeout))?;
        debug!(url = %url, status, "Transport response received");

        Ok(TransportResponse { status, body })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new("https://api.example.com/").unwrap();
        assert_eq!(transport.url("/users"), "https://api.example.com/users");
        assert_eq!(transport.url("users"), "https://api.example.com/users");
        assert_eq!(transport.url("https://other.example.com/x"), "https://other.example.com/x");
    }

    #[test]
    fn test_bearer_lookup_is_case_insensitive() {
        let request = TransportRequest {
            method: Method::GET,
            path: "/x".to_string(),
            headers: vec![("authorization".to_string(), "Bearer abc".to_string())],
            body: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(request.bearer(), Some("abc"));
        assert_eq!(request.header("AUTHORIZATION"), Some("Bearer abc"));
        assert_eq!(request.header(REQUEST_ID_HEADER), None);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let request = TransportRequest {
            method: Method::GET,
            path: "/x".to_string(),
            headers: vec![("x-bad".to_string(), "line\nbreak".to_string())],
            body: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            HttpTransport::headers(&request),
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
