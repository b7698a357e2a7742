//! Aggregation orchestrator
//!
//! Drives one request end to end: provider selection, bounded-parallel
//! fetching, classification, merge, progress reporting and caching.

use crate::cache::{CacheStore, FingerprintCache, request_fingerprint};
use crate::classifier::Classifier;
use crate::config::ConfigProvider;
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::fetch::{FetchObserver, FetchScheduler, HttpTransport};
use crate::merge::{MergeEngine, MergeOptions};
use crate::model::{
    AggregationResult, ClassifiedPayload, ContentIdentity, LifecycleState, ProviderDescriptor,
    ProviderStatus, RawProviderResponse,
};
use crate::normalizer::Normalizer;
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::providers::{ProviderSource, select_providers};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Aggregates streaming sources for a title across all providers
///
/// All collaborators are injected: where providers come from, how HTTP is
/// done, which configuration applies and where results are cached. One
/// aggregator serves any number of concurrent requests.
pub struct Aggregator {
    source: Arc<dyn ProviderSource>,
    transport: Arc<dyn HttpTransport>,
    config: Arc<dyn ConfigProvider>,
    cache: FingerprintCache,
    tracker: Arc<ProgressTracker>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    headers: BTreeMap<String, String>,
}

impl Aggregator {
    /// Creates an aggregator with its own progress tracker
    ///
    /// # Arguments
    ///
    /// * `source` - Supplier of the provider list
    /// * `transport` - HTTP transport for provider calls
    /// * `config` - Versioned configuration
    /// * `cache` - Key/value store for finished results
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let aggregator = Aggregator::new(
    ///     Arc::new(StaticProviders::load(&path)?),
    ///     Arc::new(ReqwestTransport::new()?),
    ///     Arc::new(ConfigHandle::default()),
    ///     Arc::new(MemoryCache::new()),
    /// );
    /// let result = aggregator.aggregate(&identity, Some(1), None).await;
    /// ```
    pub fn new(
        source: Arc<dyn ProviderSource>,
        transport: Arc<dyn HttpTransport>,
        config: Arc<dyn ConfigProvider>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            source,
            transport,
            config,
            cache: FingerprintCache::new(cache),
            tracker: Arc::new(ProgressTracker::new()),
            diagnostics: Arc::new(TracingDiagnostics::new()),
            headers: BTreeMap::new(),
        }
    }

    /// Shares a progress tracker, e.g. with a polling endpoint
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Headers sent with every provider call
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Fingerprint under which a request is cached and tracked
    ///
    /// Depends on the current configuration version, so the key of the same
    /// request changes after every configuration reload.
    pub fn request_key(
        &self,
        identity: &ContentIdentity,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> String {
        request_fingerprint(identity, season, episode, self.config.current().version)
    }

    /// Live progress of a request, `None` if unknown or expired
    pub fn progress_snapshot(&self, request_key: &str) -> Option<ProgressSnapshot> {
        self.tracker.snapshot(request_key)
    }

    /// Aggregates all providers for a title
    ///
    /// # Arguments
    ///
    /// * `identity` - The title to aggregate
    /// * `season` - Optional season filter
    /// * `episode` - Optional episode filter
    ///
    /// # Returns
    ///
    /// Always a result. No providers, failing discovery and failing
    /// providers all produce an empty listing; the reasons are in the
    /// provider statuses and the log.
    pub async fn aggregate(
        &self,
        identity: &ContentIdentity,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> AggregationResult {
        let versioned = self.config.current();
        let config = versioned.config;
        let key = request_fingerprint(identity, season, episode, versioned.version);

        if let Some(cached) = self.cache.load(&key) {
            info!(title = %identity.title, key = %key, "Serving cached aggregation");
            self.tracker.seed_finished(&key, &cached);
            return cached;
        }

        let discovered = match self.source.providers(identity).await {
            Ok(providers) => providers,
            Err(e) => {
                warn!(title = %identity.title, error = %e, "Provider discovery failed");
                Vec::new()
            }
        };
        let query = identity.provider_query(season, episode);
        let providers: Vec<ProviderDescriptor> = select_providers(discovered, &config, identity)
            .iter()
            .map(|provider| provider.with_query(&query))
            .collect();

        info!(
            title = %identity.title,
            season,
            episode,
            providers = providers.len(),
            config_version = versioned.version,
            "Starting aggregation"
        );
        self.tracker.initialize(&key, &providers);

        let engine = MergeEngine::new(
            Normalizer::from_config(&config),
            MergeOptions::from_config(&config, season, episode),
        );
        let observer = Arc::new(ProgressObserver {
            request_key: key.clone(),
            tracker: self.tracker.clone(),
            classifier: Classifier::new(self.diagnostics.clone()),
            engine: engine.clone(),
            outcomes: Mutex::new(Vec::new()),
        });

        let started = Instant::now();
        let scheduler = FetchScheduler::from_config(self.transport.clone(), &config)
            .with_headers(self.headers.clone());
        scheduler.fetch_all(&providers, observer.clone()).await;

        let (payloads, statuses) = observer.take_outcomes();
        let mut result = engine.merge(&payloads);
        // The tracker is the record of truth; the observer's copy only
        // covers a record that expired mid-flight
        result.provider_statuses = self
            .tracker
            .snapshot(&key)
            .map(|snapshot| snapshot.provider_statuses)
            .unwrap_or(statuses);

        self.tracker.finalize(&key, &result);

        let any_succeeded = result
            .provider_statuses
            .iter()
            .any(|status| status.state != LifecycleState::Error);
        if any_succeeded {
            self.cache.store(&key, &result, config.cache_time());
        } else {
            debug!(key = %key, "No provider succeeded, result not cached");
        }

        info!(
            title = %identity.title,
            kind = %result.kind,
            items = result.metadata.total_items,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation finished"
        );

        result
    }
}

/// Classifies responses as they arrive and keeps the tracker current
struct ProgressObserver {
    request_key: String,
    tracker: Arc<ProgressTracker>,
    classifier: Classifier,
    engine: MergeEngine,
    outcomes: Mutex<Vec<(ClassifiedPayload, ProviderStatus)>>,
}

impl ProgressObserver {
    /// Payloads and statuses of all finished providers, in ordinal order
    fn take_outcomes(&self) -> (Vec<ClassifiedPayload>, Vec<ProviderStatus>) {
        let mut outcomes = std::mem::take(&mut *self.lock_outcomes());
        outcomes.sort_by_key(|(payload, _)| payload.ordinal_index);
        outcomes.into_iter().unzip()
    }

    fn lock_outcomes(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(ClassifiedPayload, ProviderStatus)>> {
        self.outcomes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FetchObserver for ProgressObserver {
    fn on_start(&self, provider: &ProviderDescriptor) {
        self.tracker.mark_running(&self.request_key, &provider.name);
    }

    fn on_finish(&self, provider: &ProviderDescriptor, response: &RawProviderResponse) {
        let payload = if response.success {
            self.classifier
                .classify(&provider.name, provider.ordinal_index, &response.body)
        } else {
            ClassifiedPayload::empty(&provider.name, provider.ordinal_index)
        };

        let error = match (&payload.defect, &response.error_message) {
            (Some(defect), _) => Some(defect.to_string()),
            (None, Some(message)) if !response.success => Some(message.clone()),
            (None, _) if !response.success => Some("Request failed".to_string()),
            _ => None,
        };
        let success = error.is_none();
        let item_count = payload.items.len();

        let mut status = ProviderStatus::pending(provider);
        status.finish(success, item_count, response.elapsed_ms, error.clone());

        debug!(
            provider = %provider.name,
            state = ?status.state,
            items = status.item_count,
            elapsed_ms = response.elapsed_ms,
            "Provider finished"
        );

        self.tracker.record_outcome(
            &self.request_key,
            &provider.name,
            success,
            item_count,
            response.elapsed_ms,
            error,
        );

        // Merge and publish under the lock so a newer partial is never
        // overwritten by an older one
        let mut outcomes = self.lock_outcomes();
        outcomes.push((payload, status));

        let mut payloads: Vec<ClassifiedPayload> =
            outcomes.iter().map(|(payload, _)| payload.clone()).collect();
        payloads.sort_by_key(|payload| payload.ordinal_index);
        let partial = self.engine.merge(&payloads);
        self.tracker
            .publish_partial(&self.request_key, partial.merged_items, partial.metadata, false);
    }
}
