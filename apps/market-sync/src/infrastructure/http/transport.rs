//! reqwest HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::application::ports::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, TransportError};
use crate::infrastructure::config::ApiSettings;

/// Executes API requests against a fixed base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Create a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    /// Create a transport from loaded API settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &ApiSettings) -> Result<Self, TransportError> {
        Self::new(settings.base_url.clone(), settings.request_timeout)
    }

    /// Resolve a request path against the base URL.
    ///
    /// Absolute URLs pass through. Relative paths are appended to the base,
    /// keeping any path prefix the base already carries.
    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|e| TransportError::InvalidUrl(e.to_string()));
        }

        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|e| TransportError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(&request.path)?;

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token.expose());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(path = %request.path, error = %e, "Request failed");
            TransportError::Network(e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        tracing::trace!(path = %request.path, status, "Response received");
        Ok(ApiResponse::new(status, body))
    }
}
