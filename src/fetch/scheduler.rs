//! Bounded-parallel provider fetch scheduler

use super::{FetchError, FetchObserver, FetchRequest, HttpReply, HttpTransport, RetryPolicy};
use crate::config::Configuration;
use crate::model::{ProviderDescriptor, RawProviderResponse};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fetches from many providers at once with bounded parallelism
///
/// Every provider gets its own task. A semaphore sized to `max_parallel`
/// limits how many are talking to the network at any time. Each attempt has
/// its own timeout; the overall deadline caps queueing, attempts and retry
/// delays together and turns whatever is still pending into an error.
pub struct FetchScheduler {
    transport: Arc<dyn HttpTransport>,
    max_parallel: usize,
    per_call_timeout: Duration,
    overall_deadline: Duration,
    retry: RetryPolicy,
    headers: BTreeMap<String, String>,
}

impl FetchScheduler {
    /// Creates a scheduler without retries
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        max_parallel: usize,
        per_call_timeout: Duration,
        overall_deadline: Duration,
    ) -> Self {
        Self {
            transport,
            max_parallel: max_parallel.max(1),
            per_call_timeout,
            overall_deadline,
            retry: RetryPolicy::disabled(),
            headers: BTreeMap::new(),
        }
    }

    /// Creates a scheduler from parallelism, timeout and retry settings
    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &Configuration) -> Self {
        Self::new(
            transport,
            config.max_parallel_requests,
            config.request_timeout(),
            config.overall_deadline(),
        )
        .with_retry(RetryPolicy::from_settings(&config.retry))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Headers sent with every provider call
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Fetches every provider and returns one response per provider, in input order
    ///
    /// A provider's failure never affects the others. Failed, timed out and
    /// cancelled providers are reported as unsuccessful responses, and the
    /// observer sees `on_finish` for each of them. Dropping the returned
    /// future aborts all provider tasks.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let scheduler = FetchScheduler::from_config(transport, &config);
    /// let responses = scheduler.fetch_all(&providers, Arc::new(NoopObserver)).await;
    /// assert_eq!(responses.len(), providers.len());
    /// ```
    pub async fn fetch_all(
        &self,
        providers: &[ProviderDescriptor],
        observer: Arc<dyn FetchObserver>,
    ) -> Vec<RawProviderResponse> {
        if providers.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let deadline = Instant::now() + self.overall_deadline;

        info!(
            providers = providers.len(),
            max_parallel = self.max_parallel,
            "Fetching providers"
        );

        let mut workers = AbortOnDrop(
            providers
                .iter()
                .cloned()
                .map(|provider| {
                    let worker = Worker {
                        transport: self.transport.clone(),
                        semaphore: semaphore.clone(),
                        observer: observer.clone(),
                        retry: self.retry,
                        per_call_timeout: self.per_call_timeout,
                        headers: self.headers.clone(),
                    };
                    tokio::spawn(worker.run(provider, deadline))
                })
                .collect(),
        );

        join_all(workers.0.iter_mut())
            .await
            .into_iter()
            .zip(providers)
            .map(|(joined, provider)| match joined {
                Ok(response) => response,
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "Fetch worker failed");
                    let response = RawProviderResponse::failed(
                        &provider.name,
                        format!("Fetch worker failed: {e}"),
                        0,
                        0,
                    );
                    observer.on_finish(provider, &response);
                    response
                }
            })
            .collect()
    }
}

/// Provider tasks that are aborted when the fetch is dropped
struct AbortOnDrop(Vec<JoinHandle<RawProviderResponse>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Everything one provider task needs
struct Worker {
    transport: Arc<dyn HttpTransport>,
    semaphore: Arc<Semaphore>,
    observer: Arc<dyn FetchObserver>,
    retry: RetryPolicy,
    per_call_timeout: Duration,
    headers: BTreeMap<String, String>,
}

impl Worker {
    async fn run(self, provider: ProviderDescriptor, deadline: Instant) -> RawProviderResponse {
        let attempts = AtomicU32::new(0);
        let started = OnceLock::new();

        let outcome =
            tokio::time::timeout_at(deadline, self.attempt_all(&provider, &attempts, &started))
                .await;

        let elapsed_ms = started
            .get()
            .map(|start: &Instant| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let attempts = attempts.load(Ordering::Relaxed);

        let response = match outcome {
            Ok(Ok(reply)) => RawProviderResponse {
                provider_name: provider.name.clone(),
                body: reply.body,
                http_status: Some(reply.status),
                elapsed_ms,
                success: true,
                error_message: None,
                attempts,
            },
            Ok(Err(error)) => {
                debug!(provider = %provider.name, %error, attempts, "Provider failed");
                let mut response = RawProviderResponse::failed(
                    &provider.name,
                    error.to_string(),
                    elapsed_ms,
                    attempts,
                );
                if let FetchError::Status { status } = error {
                    response.http_status = Some(status);
                }
                response
            }
            Err(_) => {
                debug!(
                    provider = %provider.name,
                    attempts,
                    "Provider cancelled by overall deadline"
                );
                RawProviderResponse::failed(
                    &provider.name,
                    FetchError::DeadlineExceeded.to_string(),
                    elapsed_ms,
                    attempts,
                )
            }
        };

        self.observer.on_finish(&provider, &response);
        response
    }

    async fn attempt_all(
        &self,
        provider: &ProviderDescriptor,
        attempts: &AtomicU32,
        started: &OnceLock<Instant>,
    ) -> Result<HttpReply, FetchError> {
        // The permit is held until this future completes or is cancelled
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let _ = started.set(Instant::now());
        self.observer.on_start(provider);

        url::Url::parse(&provider.base_url).map_err(|e| FetchError::InvalidUrl {
            url: provider.base_url.clone(),
            reason: e.to_string(),
        })?;

        let request = FetchRequest {
            url: provider.base_url.clone(),
            headers: self.headers.clone(),
            timeout: self.per_call_timeout,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            attempts.store(attempt, Ordering::Relaxed);

            let call = tokio::time::timeout(self.per_call_timeout, self.transport.get(&request));
            let result = match call.await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.per_call_timeout)),
            }
            .and_then(|reply| {
                if (200..300).contains(&reply.status) {
                    Ok(reply)
                } else {
                    Err(FetchError::Status {
                        status: reply.status,
                    })
                }
            });

            match result {
                Ok(reply) => return Ok(reply),
                Err(error) if self.retry.should_retry(attempt, &error) => {
                    let delay = self.retry.delay_after(attempt);
                    debug!(
                        provider = %provider.name,
                        attempt,
                        %error,
                        ?delay,
                        "Retrying provider"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NoopObserver;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Scripted transport: each URL maps to a queue of (delay, outcome)
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<HashMap<String, Vec<(Duration, Result<HttpReply, FetchError>)>>>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn push(&self, url: &str, delay_ms: u64, outcome: Result<HttpReply, FetchError>) {
            self.script
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push((Duration::from_millis(delay_ms), outcome));
        }

        fn ok(&self, url: &str, delay_ms: u64, body: &str) {
            self.push(
                url,
                delay_ms,
                Ok(HttpReply {
                    status: 200,
                    body: body.to_string(),
                }),
            );
        }

        fn call_count(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, request: &FetchRequest) -> Result<HttpReply, FetchError> {
            self.calls.lock().unwrap().push(request.url.clone());
            let (delay, outcome) = {
                let mut script = self.script.lock().unwrap();
                let queue = script.entry(request.url.clone()).or_default();
                if queue.is_empty() {
                    (Duration::ZERO, Err(FetchError::Connect("unscripted".to_string())))
                } else {
                    queue.remove(0)
                }
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl FetchObserver for RecordingObserver {
        fn on_start(&self, provider: &ProviderDescriptor) {
            self.events.lock().unwrap().push(format!("start:{}", provider.name));
        }

        fn on_finish(&self, provider: &ProviderDescriptor, response: &RawProviderResponse) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish:{}:{}", provider.name, response.success));
        }
    }

    fn provider(name: &str, index: usize) -> ProviderDescriptor {
        ProviderDescriptor::new(name, format!("https://{name}.example/list"), index)
    }

    fn url(name: &str) -> String {
        format!("https://{name}.example/list")
    }

    fn scheduler(
        transport: Arc<dyn HttpTransport>,
        max_parallel: usize,
        per_call_ms: u64,
        deadline_ms: u64,
    ) -> FetchScheduler {
        FetchScheduler::new(
            transport,
            max_parallel,
            Duration::from_millis(per_call_ms),
            Duration::from_millis(deadline_ms),
        )
    }

    fn status(code: u16) -> Result<HttpReply, FetchError> {
        Ok(HttpReply {
            status: code,
            body: String::new(),
        })
    }

    #[tokio::test]
    async fn test_one_response_per_provider_in_input_order() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.ok(&url("slow"), 80, "[]");
        transport.ok(&url("fast"), 5, "[1]");
        transport.push(&url("missing"), 0, status(404));

        let scheduler = scheduler(transport.clone(), 4, 1_000, 2_000);
        let observer = Arc::new(RecordingObserver::default());
        let providers = vec![provider("slow", 0), provider("fast", 1), provider("missing", 2)];

        let responses = scheduler.fetch_all(&providers, observer.clone()).await;

        let names: Vec<&str> = responses.iter().map(|r| r.provider_name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast", "missing"]);
        assert!(responses[0].success);
        assert_eq!(responses[1].body, "[1]");
        assert!(!responses[2].success);
        assert_eq!(responses[2].http_status, Some(404));

        let events = observer.events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| e.starts_with("start:")).count(), 3);
        assert!(events.contains(&"finish:missing:false".to_string()));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let transport = Arc::new(ScriptedTransport::default());
        let providers: Vec<_> = (0..6).map(|i| provider(&format!("p{i}"), i)).collect();
        for p in &providers {
            transport.ok(&p.base_url, 30, "[]");
        }

        let scheduler = scheduler(transport.clone(), 2, 1_000, 5_000);
        let responses = scheduler.fetch_all(&providers, Arc::new(NoopObserver)).await;

        assert!(responses.iter().all(|r| r.success));
        assert!(transport.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(&url("flaky"), 0, status(502));
        transport.ok(&url("flaky"), 0, "[]");

        let scheduler = scheduler(transport.clone(), 2, 1_000, 5_000)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));
        let responses = scheduler
            .fetch_all(&[provider("flaky", 0)], Arc::new(NoopObserver))
            .await;

        assert!(responses[0].success);
        assert_eq!(responses[0].attempts, 2);
        assert_eq!(transport.call_count(&url("flaky")), 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(&url("gone"), 0, status(410));
        transport.ok(&url("gone"), 0, "[]");

        let scheduler = scheduler(transport.clone(), 2, 1_000, 5_000)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));
        let responses = scheduler
            .fetch_all(&[provider("gone", 0)], Arc::new(NoopObserver))
            .await;

        assert!(!responses[0].success);
        assert_eq!(responses[0].attempts, 1);
        assert_eq!(transport.call_count(&url("gone")), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_without_calling_transport() {
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = scheduler(transport.clone(), 1, 1_000, 5_000)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));

        let broken = ProviderDescriptor::new("broken", "::not a url::", 0);
        let responses = scheduler.fetch_all(&[broken], Arc::new(NoopObserver)).await;

        assert!(!responses[0].success);
        assert!(responses[0].error_message.as_deref().unwrap().starts_with("Invalid URL"));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_per_call_timeout_does_not_block_others() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.ok(&url("hang"), 2_000, "[]");
        transport.ok(&url("quick"), 5, "[]");

        let scheduler = scheduler(transport.clone(), 2, 50, 5_000);
        let started = std::time::Instant::now();
        let responses = scheduler
            .fetch_all(&[provider("hang", 0), provider("quick", 1)], Arc::new(NoopObserver))
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!responses[0].success);
        assert!(responses[0].error_message.as_deref().unwrap().contains("timed out"));
        assert!(responses[1].success);
    }

    #[tokio::test]
    async fn test_overall_deadline_cancels_queued_and_running() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.ok(&url("first"), 2_000, "[]");
        transport.ok(&url("second"), 2_000, "[]");

        // One slot: "second" is still queued when the deadline fires
        let scheduler = scheduler(transport.clone(), 1, 5_000, 100);
        let observer = Arc::new(RecordingObserver::default());
        let started = std::time::Instant::now();
        let responses = scheduler
            .fetch_all(&[provider("first", 0), provider("second", 1)], observer.clone())
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        for response in &responses {
            assert!(!response.success);
            assert_eq!(response.error_message.as_deref(), Some("Overall deadline exceeded"));
        }

        let events = observer.events.lock().unwrap();
        assert!(events.contains(&"finish:first:false".to_string()));
        assert!(events.contains(&"finish:second:false".to_string()));
    }

    #[tokio::test]
    async fn test_empty_provider_list() {
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = scheduler(transport, 2, 1_000, 1_000);
        assert!(scheduler.fetch_all(&[], Arc::new(NoopObserver)).await.is_empty());
    }

    /// Transport that flags every call that ran to completion
    #[derive(Default)]
    struct CompletionFlag {
        completed: AtomicBool,
    }

    #[async_trait]
    impl HttpTransport for CompletionFlag {
        async fn get(&self, _request: &FetchRequest) -> Result<HttpReply, FetchError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.completed.store(true, Ordering::SeqCst);
            status(200)
        }
    }

    #[tokio::test]
    async fn test_dropping_fetch_aborts_provider_tasks() {
        let transport = Arc::new(CompletionFlag::default());
        let scheduler = scheduler(transport.clone(), 2, 5_000, 5_000);
        let providers = [provider("first", 0), provider("second", 1)];

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.fetch_all(&providers, Arc::new(NoopObserver)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!transport.completed.load(Ordering::SeqCst));
    }
}
