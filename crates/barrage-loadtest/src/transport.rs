//! Request/response transport
//!
//! The engine only needs `invoke(request) -> (status, body, elapsed)`.
//! [`HttpTransport`] implements it over a pooled `reqwest` client; tests
//! substitute scripted transports.

use crate::error::TransportError;
use async_trait::async_trait;
use barrage_core::Tags;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::{Duration, Instant};

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One request issued by a workload
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the target base URL
    pub path: String,
    /// JSON body
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Extra tags for the request's metrics (e.g. `operation`)
    pub tags: Tags,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            tags: Tags::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, path).with_json(body)
    }

    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Patch, path).with_json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Attach a JSON body and its content type
    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Completed exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>, elapsed: Duration) -> Self {
        Self {
            status,
            body: body.into(),
            elapsed,
        }
    }

    /// Decode the body as JSON, `None` when it is not valid
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport collaborator.
///
/// Must return `Ok` for every HTTP response including 4xx/5xx; `Err` is
/// reserved for requests that could not complete.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, request: &Request) -> Result<Response, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with a pooled client
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_idle_per_host: usize,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.into(), self.url(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.to_string());
        }

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(Response {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}
