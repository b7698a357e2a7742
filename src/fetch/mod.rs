/// Provider fetching: transport abstraction, retry policy and the
/// bounded-parallel scheduler.
///
/// The scheduler only needs a GET with timeout and custom headers, so the
/// HTTP stack is hidden behind [`HttpTransport`]. The reqwest-backed
/// implementation is used in production, tests script their own.
mod reqwest_transport;
mod retry;
mod scheduler;

pub use reqwest_transport::ReqwestTransport;
pub use retry::RetryPolicy;
pub use scheduler::FetchScheduler;

use crate::model::{ProviderDescriptor, RawProviderResponse};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching from a provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The call did not finish within its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The provider answered with a non-success status
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// The provider URL is malformed
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// The overall deadline cancelled the call
    #[error("Overall deadline exceeded")]
    DeadlineExceeded,

    /// Any other transport failure
    #[error("Request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// Whether another attempt may succeed
    ///
    /// Timeouts, connection failures and 5xx answers are transient.
    /// Malformed URLs, 4xx answers and everything else are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) => true,
            FetchError::Status { status } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// A single GET to issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Status and body of a completed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// GET capability supplied by the host
///
/// Implementations return `Ok` for any completed exchange, whatever its
/// status; the scheduler decides what counts as success.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &FetchRequest) -> Result<HttpReply, FetchError>;
}

/// Observes provider fetch lifecycle events
///
/// Called from worker tasks, possibly concurrently for different providers.
pub trait FetchObserver: Send + Sync {
    /// A worker slot was acquired and the first attempt is about to start
    fn on_start(&self, provider: &ProviderDescriptor);

    /// The provider reached its final outcome, including cancellation
    fn on_finish(&self, provider: &ProviderDescriptor, response: &RawProviderResponse);
}

/// Observer that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FetchObserver for NoopObserver {
    fn on_start(&self, _provider: &ProviderDescriptor) {}

    fn on_finish(&self, _provider: &ProviderDescriptor, _response: &RawProviderResponse) {}
}
