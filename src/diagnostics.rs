//! Diagnostics sink for contained provider anomalies
//!
//! Components that drop data silently (items without links, malformed
//! entries) report through a [`DiagnosticsSink`] instead of logging inline.
//! Every occurrence is counted; only a sample is turned into a log event so
//! a noisy provider cannot flood the output.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Kind of anomaly reported by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiagnosticKind {
    /// An item had no usable link and was dropped
    MissingUrl,
    /// A container element was not an object
    MalformedItem,
    /// The provider answered with HTML
    HtmlBody,
    /// The provider body was not valid JSON
    InvalidJson,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::MissingUrl => "missing_url",
            DiagnosticKind::MalformedItem => "malformed_item",
            DiagnosticKind::HtmlBody => "html_body",
            DiagnosticKind::InvalidJson => "invalid_json",
        }
    }
}

/// Receives diagnostics from the core
pub trait DiagnosticsSink: Send + Sync {
    /// Records one occurrence of `kind` for `provider`
    fn record(&self, provider: &str, kind: DiagnosticKind, detail: &str);

    /// Occurrence counts keyed by (provider, kind)
    fn counters(&self) -> BTreeMap<(String, DiagnosticKind), u64>;
}

/// Counts every event and emits sampled `tracing` events
///
/// The 1st, 2nd, 4th, 8th, ... occurrence of each (provider, kind) pair is
/// logged at debug level together with the running count.
#[derive(Debug, Default)]
pub struct TracingDiagnostics {
    counts: Mutex<BTreeMap<(String, DiagnosticKind), u64>>,
}

impl TracingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, provider: &str, kind: DiagnosticKind, detail: &str) {
        let count = {
            let mut counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = counts.entry((provider.to_string(), kind)).or_insert(0);
            *count += 1;
            *count
        };

        if count.is_power_of_two() {
            debug!(provider, kind = kind.as_str(), count, detail, "Provider diagnostic");
        }
    }

    fn counters(&self) -> BTreeMap<(String, DiagnosticKind), u64> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Discards all diagnostics
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticsSink for NoopDiagnostics {
    fn record(&self, _provider: &str, _kind: DiagnosticKind, _detail: &str) {}

    fn counters(&self) -> BTreeMap<(String, DiagnosticKind), u64> {
        BTreeMap::new()
    }
}
