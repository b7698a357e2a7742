//! Live per-provider progress for polling clients
//!
//! Every aggregation request gets one record, keyed by its request
//! fingerprint, holding a status per provider and the latest partial merge.
//! Writers for one request are serialized by that record's own lock, so
//! concurrent provider completions never contend with other requests.
//! Records expire after a fixed time-to-live whether or not the request
//! finished.

use crate::model::{
    AggregationMetadata, AggregationResult, ItemRecord, LifecycleState, ProviderDescriptor,
    ProviderStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long progress records live by default
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(5 * 60);

/// Point-in-time copy of a request's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Every provider is terminal, or the request was finalized
    pub ready: bool,
    /// Number of providers in the request
    pub total: usize,
    /// Number of providers in a terminal state
    pub completed_count: usize,
    pub items: Vec<ItemRecord>,
    pub provider_statuses: Vec<ProviderStatus>,
    pub metadata: AggregationMetadata,
    /// `items` is an interim merge rather than the final result
    pub partial: bool,
}

#[derive(Debug)]
struct ProgressRecord {
    created: Instant,
    statuses: Vec<ProviderStatus>,
    items: Vec<ItemRecord>,
    metadata: AggregationMetadata,
    finalized: bool,
}

impl ProgressRecord {
    fn new(statuses: Vec<ProviderStatus>) -> Self {
        Self {
            created: Instant::now(),
            statuses,
            items: Vec::new(),
            metadata: AggregationMetadata::default(),
            finalized: false,
        }
    }

    fn status_mut(&mut self, provider: &str) -> Option<&mut ProviderStatus> {
        self.statuses.iter_mut().find(|s| s.name == provider)
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let completed_count = self.statuses.iter().filter(|s| s.state.is_terminal()).count();
        let all_terminal = completed_count == self.statuses.len();
        ProgressSnapshot {
            ready: self.finalized || all_terminal,
            total: self.statuses.len(),
            completed_count,
            items: self.items.clone(),
            provider_statuses: self.statuses.clone(),
            metadata: self.metadata.clone(),
            partial: !self.finalized,
        }
    }
}

/// Tracks provider lifecycle for in-flight aggregation requests
pub struct ProgressTracker {
    records: RwLock<HashMap<String, Arc<Mutex<ProgressRecord>>>>,
    ttl: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Creates a tracker with the default five-minute TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PROGRESS_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Starts tracking a request with every provider `pending`
    ///
    /// Replaces any earlier record for the same key.
    pub fn initialize(&self, request_key: &str, providers: &[ProviderDescriptor]) {
        let statuses = providers.iter().map(ProviderStatus::pending).collect();
        self.insert(request_key, ProgressRecord::new(statuses));
        debug!(request_key, providers = providers.len(), "Progress initialized");
    }

    /// Installs a finished record, e.g. for a result served from cache
    pub fn seed_finished(&self, request_key: &str, result: &AggregationResult) {
        let mut record = ProgressRecord::new(result.provider_statuses.clone());
        record.items = result.merged_items.clone();
        record.metadata = result.metadata.clone();
        record.finalized = true;
        self.insert(request_key, record);
    }

    /// Moves a provider from `pending` to `running`
    ///
    /// Returns `false` (and changes nothing) if the provider already left
    /// `pending` or is unknown.
    pub fn mark_running(&self, request_key: &str, provider: &str) -> bool {
        self.update(request_key, |record| match record.status_mut(provider) {
            Some(status) if status.state == LifecycleState::Pending => {
                status.state = LifecycleState::Running;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Records a provider's terminal outcome
    ///
    /// The state becomes `completed` on success with items, `empty` on
    /// success without items and `error` otherwise. Terminal states are
    /// final: a second outcome for the same provider is ignored and `false`
    /// is returned.
    pub fn record_outcome(
        &self,
        request_key: &str,
        provider: &str,
        success: bool,
        item_count: usize,
        response_time_ms: u64,
        error: Option<String>,
    ) -> bool {
        self.update(request_key, |record| {
            let Some(status) = record.status_mut(provider) else {
                debug!(request_key, provider, "Outcome for unknown provider ignored");
                return false;
            };
            if status.state.is_terminal() {
                debug!(
                    request_key,
                    provider,
                    state = ?status.state,
                    "Outcome after terminal state ignored"
                );
                return false;
            }

            status.finish(success, item_count, response_time_ms, error);
            true
        })
        .unwrap_or(false)
    }

    /// Publishes an interim merge so pollers see results before all providers finish
    ///
    /// With `ready` set the record is finalized.
    pub fn publish_partial(
        &self,
        request_key: &str,
        items: Vec<ItemRecord>,
        metadata: AggregationMetadata,
        ready: bool,
    ) -> bool {
        self.update(request_key, |record| {
            record.items = items;
            record.metadata = metadata;
            record.finalized |= ready;
            true
        })
        .unwrap_or(false)
    }

    /// Publishes the terminal result and marks the request ready
    pub fn finalize(&self, request_key: &str, result: &AggregationResult) -> bool {
        self.publish_partial(
            request_key,
            result.merged_items.clone(),
            result.metadata.clone(),
            true,
        )
    }

    /// Race-free copy of a request's progress, `None` if unknown or expired
    pub fn snapshot(&self, request_key: &str) -> Option<ProgressSnapshot> {
        let record = self.live_record(request_key)?;
        let record = record.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(record.snapshot())
    }

    /// Drops expired records and returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut records = self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = records.len();
        records.retain(|_, record| !self.is_expired(record));
        before - records.len()
    }

    fn insert(&self, request_key: &str, record: ProgressRecord) {
        self.purge_expired();
        let mut records = self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.insert(request_key.to_string(), Arc::new(Mutex::new(record)));
    }

    /// Runs `apply` under the record's lock; `None` if the record is gone
    fn update<T>(
        &self,
        request_key: &str,
        apply: impl FnOnce(&mut ProgressRecord) -> T,
    ) -> Option<T> {
        let record = self.live_record(request_key)?;
        let mut record = record.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(apply(&mut record))
    }

    fn live_record(&self, request_key: &str) -> Option<Arc<Mutex<ProgressRecord>>> {
        let record = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(request_key)
            .cloned()?;
        (!self.is_expired(&record)).then_some(record)
    }

    fn is_expired(&self, record: &Mutex<ProgressRecord>) -> bool {
        record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .created
            .elapsed()
            > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn providers(names: &[&str]) -> Vec<ProviderDescriptor> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ProviderDescriptor::new(*name, format!("https://{name}.example"), i))
            .collect()
    }

    fn state_of(tracker: &ProgressTracker, key: &str, provider: &str) -> LifecycleState {
        tracker
            .snapshot(key)
            .unwrap()
            .provider_statuses
            .into_iter()
            .find(|s| s.name == provider)
            .unwrap()
            .state
    }

    #[test]
    fn test_initialize_seeds_pending() {
        let tracker = ProgressTracker::new();
        tracker.initialize("req", &providers(&["a", "b"]));

        let snapshot = tracker.snapshot("req").unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.completed_count, 0);
        assert!(!snapshot.ready);
        assert!(snapshot.partial);
        assert!(snapshot.provider_statuses.iter().all(|s| s.state == LifecycleState::Pending));
    }

    #[test]
    fn test_outcome_states() {
        let tracker = ProgressTracker::new();
        tracker.initialize("req", &providers(&["a", "b", "c"]));

        assert!(tracker.record_outcome("req", "a", true, 2, 120, None));
        assert!(tracker.record_outcome("req", "b", true, 0, 80, None));
        assert!(tracker.record_outcome("req", "c", false, 5, 900, Some("HTTP 500".to_string())));

        let snapshot = tracker.snapshot("req").unwrap();
        assert_eq!(state_of(&tracker, "req", "a"), LifecycleState::Completed);
        assert_eq!(state_of(&tracker, "req", "b"), LifecycleState::Empty);
        assert_eq!(state_of(&tracker, "req", "c"), LifecycleState::Error);
        assert_eq!(snapshot.provider_statuses[0].item_count, 2);
        assert_eq!(snapshot.provider_statuses[2].item_count, 0);
        assert_eq!(snapshot.provider_statuses[2].error.as_deref(), Some("HTTP 500"));
        assert_eq!(snapshot.completed_count, 3);
        assert!(snapshot.ready);
    }

    #[test]
    fn test_states_never_regress() {
        let tracker = ProgressTracker::new();
        tracker.initialize("req", &providers(&["a"]));

        let mut observed = vec![state_of(&tracker, "req", "a")];
        assert!(tracker.mark_running("req", "a"));
        observed.push(state_of(&tracker, "req", "a"));
        assert!(!tracker.mark_running("req", "a"));
        assert!(tracker.record_outcome("req", "a", false, 0, 10, Some("timeout".to_string())));
        observed.push(state_of(&tracker, "req", "a"));

        // Late signals after the terminal state are ignored
        assert!(!tracker.mark_running("req", "a"));
        assert!(!tracker.record_outcome("req", "a", true, 3, 10, None));
        observed.push(state_of(&tracker, "req", "a"));

        assert!(observed.windows(2).all(|w| w[0].stage() <= w[1].stage()));
        assert_eq!(observed.last(), Some(&LifecycleState::Error));
    }

    #[test]
    fn test_unknown_request_or_provider() {
        let tracker = ProgressTracker::new();
        assert!(!tracker.mark_running("nope", "a"));
        assert!(tracker.snapshot("nope").is_none());

        tracker.initialize("req", &providers(&["a"]));
        assert!(!tracker.record_outcome("req", "zzz", true, 1, 1, None));
    }

    #[test]
    fn test_concurrent_outcomes_are_counted_exactly() {
        let tracker = ProgressTracker::new();
        let names: Vec<String> = (0..64).map(|i| format!("p{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        tracker.initialize("req", &providers(&refs));

        thread::scope(|scope| {
            for name in &names {
                let tracker = &tracker;
                scope.spawn(move || {
                    tracker.mark_running("req", name);
                    tracker.record_outcome("req", name, true, 1, 5, None);
                    // Duplicate completions must not double count
                    tracker.record_outcome("req", name, false, 0, 5, Some("late".to_string()));
                });
            }
        });

        let snapshot = tracker.snapshot("req").unwrap();
        assert_eq!(snapshot.completed_count, 64);
        assert!(snapshot.provider_statuses.iter().all(|s| s.state == LifecycleState::Completed));
    }

    #[test]
    fn test_partial_then_finalize() {
        let tracker = ProgressTracker::new();
        tracker.initialize("req", &providers(&["a", "b"]));

        let item = ItemRecord::new("a", "https://a.example/1");
        tracker.publish_partial("req", vec![item.clone()], AggregationMetadata::default(), false);
        let snapshot = tracker.snapshot("req").unwrap();
        assert!(snapshot.partial);
        assert!(!snapshot.ready);
        assert_eq!(snapshot.items.len(), 1);

        let result = AggregationResult {
            merged_items: vec![item.clone(), ItemRecord::new("b", "https://b.example/1")],
            ..AggregationResult::empty()
        };
        tracker.finalize("req", &result);
        let snapshot = tracker.snapshot("req").unwrap();
        assert!(snapshot.ready);
        assert!(!snapshot.partial);
        assert_eq!(snapshot.items.len(), 2);
    }

    #[test]
    fn test_seed_finished() {
        let tracker = ProgressTracker::new();
        let result = AggregationResult {
            merged_items: vec![ItemRecord::new("a", "https://a.example/1")],
            ..AggregationResult::empty()
        };
        tracker.seed_finished("cached", &result);

        let snapshot = tracker.snapshot("cached").unwrap();
        assert!(snapshot.ready);
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.items.len(), 1);
    }

    #[test]
    fn test_records_expire() {
        let tracker = ProgressTracker::with_ttl(Duration::from_millis(20));
        tracker.initialize("req", &providers(&["a"]));
        assert!(tracker.snapshot("req").is_some());

        thread::sleep(Duration::from_millis(40));
        assert!(tracker.snapshot("req").is_none());
        assert!(!tracker.mark_running("req", "a"));
        assert_eq!(tracker.purge_expired(), 1);
    }
}
