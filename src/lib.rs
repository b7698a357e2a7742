//! stream_aggregator - Aggregate streaming sources for a title across many providers
//!
//! This library fans a request out to every configured provider with bounded
//! parallelism, classifies their loosely-shaped answers, normalizes quality
//! and voice labels, and merges everything into one deduplicated listing.
//! Per-provider progress can be polled while a request is running, and
//! finished results are cached under a fingerprint that includes the
//! configuration version.
//!
//! The host supplies the collaborators: a [`ProviderSource`], an
//! [`HttpTransport`], a [`ConfigProvider`] and a [`CacheStore`].

mod aggregator;
mod cache;
mod classifier;
mod config;
mod diagnostics;
mod document;
mod fetch;
mod merge;
mod model;
mod normalizer;
mod progress;
mod providers;

pub use aggregator::Aggregator;

// Re-export error types
pub use cache::CacheError;
pub use config::ConfigError;
pub use fetch::FetchError;
pub use providers::DiscoveryError;

// Re-export host seams and their stock implementations
pub use cache::{CacheStore, FileCache, FingerprintCache, MemoryCache, request_fingerprint};
pub use config::{ConfigHandle, ConfigProvider, Configuration, RetrySettings, VersionedConfig};
pub use diagnostics::{DiagnosticKind, DiagnosticsSink, NoopDiagnostics, TracingDiagnostics};
pub use fetch::{
    FetchObserver, FetchRequest, FetchScheduler, HttpReply, HttpTransport, NoopObserver,
    ReqwestTransport, RetryPolicy,
};
pub use providers::{DiscoveryClient, ProviderSource, StaticProviders, select_providers};

// Re-export the core
pub use classifier::{Classifier, looks_like_html};
pub use merge::{MergeEngine, MergeOptions, stream_fingerprint};
pub use normalizer::{
    DEFAULT_QUALITY_ORDER, HIGH_RESOLUTION_CODES, Normalizer, QualityFilter, SynonymEntry,
    SynonymTable, compare_quality, is_hdr_label, rank, resolution_of,
};
pub use progress::{DEFAULT_PROGRESS_TTL, ProgressSnapshot, ProgressTracker};

// Re-export data model
pub use model::{
    AggregationMetadata, AggregationResult, ClassifiedPayload, ContentIdentity, Facet, ItemRecord,
    LifecycleState, NormalizedValue, PayloadDefect, PayloadKind, ProviderDescriptor,
    ProviderStatus, RawProviderResponse, Subtitle,
};
