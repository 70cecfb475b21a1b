//! `reqwest` implementation of [`Transport`].

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use tracing::debug;

use super::auth::Auth;
use super::{ApiRequest, ApiResponse, Body, Transport, TransportError, TransportFuture};

/// Default timeout applied to every provider call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends requests to a provider base URL with provider-specific auth.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
}

impl HttpTransport {
    /// Builds a transport rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Request`] when the HTTP client cannot be
    /// constructed.
    pub fn new(
        base_url: impl Into<String>,
        auth: Auth,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base = base_url.into().trim_end_matches('/').to_owned();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Request {
                url: base.clone(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base,
            auth,
        })
    }

    /// Returns the configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_owned()
        } else {
            format!("{}{path}", self.base_url)
        }
    }

    fn build(&self, request: ApiRequest) -> Result<reqwest::Request, TransportError> {
        let url = self.url_for(&request.path);
        let mut builder = self.client.request(request.method, &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Form(pairs) => builder.form(&pairs),
            Body::Text(text) => builder.header(CONTENT_TYPE, "text/plain").body(text),
        };
        builder.build().map_err(|err| TransportError::Request {
            url,
            message: err.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let mut prepared = self.build(request)?;
            for (name, value) in self.auth.headers(&self.client, &prepared).await? {
                let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                    TransportError::Auth {
                        message: err.to_string(),
                    }
                })?;
                let header_value =
                    HeaderValue::from_str(&value).map_err(|err| TransportError::Auth {
                        message: err.to_string(),
                    })?;
                prepared.headers_mut().insert(header_name, header_value);
            }

            let url = prepared.url().to_string();
            debug!(method = %prepared.method(), url = %url, "sending provider request");
            let response =
                self.client
                    .execute(prepared)
                    .await
                    .map_err(|err| TransportError::Request {
                        url: url.clone(),
                        message: err.to_string(),
                    })?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|err| TransportError::Request {
                    url: url.clone(),
                    message: err.to_string(),
                })?;
            debug!(status, url = %url, "provider responded");
            Ok(ApiResponse::new(status, body))
        })
    }
}
