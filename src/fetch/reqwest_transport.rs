//! reqwest-backed HTTP transport

use super::{FetchError, FetchRequest, HttpReply, HttpTransport};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// [`HttpTransport`] over a shared async reqwest client
///
/// The client keeps a connection pool, so one transport should be reused
/// across requests.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with a pooled client
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("stream_aggregator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &FetchRequest) -> Result<HttpReply, FetchError> {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(e, request))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(request.timeout)
            } else {
                FetchError::Body(e.to_string())
            }
        })?;

        debug!(url = %request.url, status, bytes = body.len(), "Provider responded");
        Ok(HttpReply { status, body })
    }
}

/// Maps reqwest failures onto the retry-relevant error kinds
fn classify_error(error: reqwest::Error, request: &FetchRequest) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(request.timeout)
    } else if error.is_connect() {
        FetchError::Connect(error.to_string())
    } else if error.is_builder() {
        FetchError::InvalidUrl {
            url: request.url.clone(),
            reason: error.to_string(),
        }
    } else {
        FetchError::Request(error.to_string())
    }
}
