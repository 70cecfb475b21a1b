//! HTTP transport shared by the REST-based provider adapters.
//!
//! Adapters describe calls as [`ApiRequest`] values and hand them to a
//! [`Transport`]. Production code uses [`HttpTransport`]; tests substitute a
//! scripted transport that records requests and replays canned responses.

mod auth;
mod http;

use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub use auth::{AzureCredentials, Auth, OvhCredentials};
pub use http::{DEFAULT_REQUEST_TIMEOUT, HttpTransport};
pub use reqwest::Method;

/// Payload attached to an [`ApiRequest`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// JSON document.
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// Plain text.
    Text(String),
}

/// Provider-neutral description of a single API call.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the provider base URL, or an absolute URL.
    pub path: String,
    /// Query parameters in insertion order.
    pub query: Vec<(String, String)>,
    /// Extra headers beyond authentication.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Body,
}

impl ApiRequest {
    /// Creates a request with no query, headers or body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Creates a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Creates a `POST` request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Creates a `PUT` request.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Creates a `PATCH` request.
    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Creates a `DELETE` request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    /// Attaches a form body.
    #[must_use]
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Body::Form(pairs);
        self
    }

    /// Attaches a plain-text body.
    #[must_use]
    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.body = Body::Text(value.into());
        self
    }

    /// Returns the value of a query parameter, if present.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the JSON body, if any.
    #[must_use]
    pub const fn json_body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Status and body returned by a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Reports whether the status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Reports whether the status is 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Errors raised before a provider produced a response.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the request could not be sent or the response not read.
    #[error("request to {url} failed: {message}")]
    Request {
        /// Target URL.
        url: String,
        /// Underlying client error.
        message: String,
    },
    /// Raised when credentials could not be turned into request headers.
    #[error("authentication failed: {message}")]
    Auth {
        /// Underlying error.
        message: String,
    },
}

/// Future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + 'a>>;

/// Sends provider API requests.
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the raw response for any HTTP status.
    fn send(&self, request: ApiRequest) -> TransportFuture<'_>;
}
