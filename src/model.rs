//! Shared data model
//!
//! Plain data types passed between the fetch, classification, merge and
//! progress stages. Everything here is serializable so results can be
//! cached and handed to a presentation layer unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Describes one upstream provider able to list streams for a title.
///
/// Descriptors are supplied by a [`crate::ProviderSource`] and stay immutable
/// for the lifetime of a single aggregation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    /// Display name, also the key used by the progress tracker
    pub name: String,
    /// Identifier of the plugin that registered the provider
    #[serde(default)]
    pub plugin_id: String,
    /// Endpoint queried for this provider
    pub base_url: String,
    /// Position in the discovery listing
    #[serde(default)]
    pub ordinal_index: usize,
    /// Provider only serves anime catalogs
    #[serde(default)]
    pub anime_only: bool,
}

impl ProviderDescriptor {
    /// Creates a descriptor with an empty plugin id
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, ordinal_index: usize) -> Self {
        Self {
            name: name.into(),
            plugin_id: String::new(),
            base_url: base_url.into(),
            ordinal_index,
            anime_only: false,
        }
    }

    /// Returns a copy whose `base_url` carries the given query parameters
    ///
    /// Parameters already present on the base URL are kept. When the base
    /// URL cannot be parsed it is returned unchanged; the fetch scheduler
    /// reports it as an invalid URL later on.
    pub fn with_query(&self, params: &[(String, String)]) -> Self {
        let mut descriptor = self.clone();
        if params.is_empty() {
            return descriptor;
        }

        if let Ok(mut url) = url::Url::parse(&self.base_url) {
            {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in params {
                    pairs.append_pair(key, value);
                }
            }
            descriptor.base_url = url.to_string();
        }

        descriptor
    }
}

/// Identity of the title an aggregation request is about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentIdentity {
    /// Catalog id (TMDB style)
    pub id: Option<String>,
    pub imdb_id: Option<String>,
    pub kinopoisk_id: Option<String>,
    pub title: String,
    pub original_title: Option<String>,
    /// ISO 639-1 code of the original language, e.g. `ja`
    pub original_language: Option<String>,
    pub year: Option<u32>,
    /// Whether the title is a series rather than a movie
    pub is_serial: bool,
}

impl ContentIdentity {
    /// Creates an identity from a title only
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Query parameters describing this title to providers and discovery
    ///
    /// Absent optional fields are omitted rather than sent empty.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                pairs.push((key.to_string(), value));
            }
        };

        push("id", self.id.clone());
        push("imdb_id", self.imdb_id.clone());
        push("kinopoisk_id", self.kinopoisk_id.clone());
        push("title", Some(self.title.clone()));
        push("original_title", self.original_title.clone());
        push("original_language", self.original_language.clone());
        push("year", self.year.map(|y| y.to_string()));
        push("serial", Some(if self.is_serial { "1" } else { "0" }.to_string()));

        pairs
    }

    /// Query parameters sent to a provider, optionally narrowed to a season/episode
    pub fn provider_query(
        &self,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> Vec<(String, String)> {
        let mut pairs = self.query_pairs();
        if let Some(season) = season {
            pairs.push(("s".to_string(), season.to_string()));
        }
        if let Some(episode) = episode {
            pairs.push(("e".to_string(), episode.to_string()));
        }
        pairs
    }
}

/// What the fetch scheduler produced for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProviderResponse {
    pub provider_name: String,
    /// Response body, empty when the call failed
    pub body: String,
    /// HTTP status of the last attempt, if one completed
    pub http_status: Option<u16>,
    /// Wall time spent on this provider including retries
    pub elapsed_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    /// Number of attempts made
    pub attempts: u32,
}

impl RawProviderResponse {
    /// Builds a failed response
    pub fn failed(
        provider_name: impl Into<String>,
        message: impl Into<String>,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            body: String::new(),
            http_status: None,
            elapsed_ms,
            success: false,
            error_message: Some(message.into()),
            attempts,
        }
    }
}

/// Semantic type of a provider payload or aggregation result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Movie,
    Season,
    Episode,
    Similar,
    #[default]
    Unknown,
}

impl PayloadKind {
    /// Parses an explicit `type` field value
    pub fn from_type_field(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "movie" | "movies" | "film" => PayloadKind::Movie,
            "season" | "seasons" => PayloadKind::Season,
            "episode" | "episodes" => PayloadKind::Episode,
            "similar" => PayloadKind::Similar,
            _ => PayloadKind::Unknown,
        }
    }

    /// Whether items of this kind are addressed by season/episode
    pub fn is_episodic(self) -> bool {
        matches!(self, PayloadKind::Season | PayloadKind::Episode)
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Movie => "movie",
            PayloadKind::Season => "season",
            PayloadKind::Episode => "episode",
            PayloadKind::Similar => "similar",
            PayloadKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Reason a provider body could not be used at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadDefect {
    /// The provider answered with an HTML page
    Html,
    /// The body was not valid JSON
    InvalidJson(String),
}

impl fmt::Display for PayloadDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadDefect::Html => f.write_str("provider returned an HTML page"),
            PayloadDefect::InvalidJson(reason) => write!(f, "invalid JSON: {reason}"),
        }
    }
}

/// Classifier output for one provider response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedPayload {
    pub provider_name: String,
    pub ordinal_index: usize,
    pub kind: PayloadKind,
    pub items: Vec<ItemRecord>,
    /// Parsed document, `Null` when the body was empty or unparsable
    #[serde(default)]
    pub raw_document: serde_json::Value,
    pub defect: Option<PayloadDefect>,
}

impl ClassifiedPayload {
    /// An empty payload of unknown kind
    pub fn empty(provider_name: impl Into<String>, ordinal_index: usize) -> Self {
        Self {
            provider_name: provider_name.into(),
            ordinal_index,
            kind: PayloadKind::Unknown,
            items: Vec::new(),
            raw_document: serde_json::Value::Null,
            defect: None,
        }
    }
}

/// A subtitle track attached to an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtitle {
    pub label: String,
    pub url: String,
}

/// Canonical machine key plus display text for a free-text label
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedValue {
    pub code: String,
    pub label: String,
}

impl NormalizedValue {
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
        }
    }
}

/// One playable (or navigable) entry reported by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    /// Link the client opens; never empty once accepted
    pub url: String,
    /// Direct stream link, when the provider exposes one
    pub stream_url: Option<String>,
    /// How the client should treat `url` (`play`, `call`, `link`, ...)
    pub method: String,
    pub title: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub raw_quality_label: Option<String>,
    pub raw_voice_label: Option<String>,
    #[serde(default)]
    pub subtitles: Vec<Subtitle>,
    pub provider_name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Normalized quality, assigned during merge
    pub quality: Option<NormalizedValue>,
    /// Normalized voice track, assigned during merge
    pub voice: Option<NormalizedValue>,
}

impl ItemRecord {
    /// Creates a minimal `play` item
    pub fn new(provider_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_url: None,
            method: "play".to_string(),
            title: String::new(),
            season: None,
            episode: None,
            raw_quality_label: None,
            raw_voice_label: None,
            subtitles: Vec::new(),
            provider_name: provider_name.into(),
            headers: BTreeMap::new(),
            quality: None,
            voice: None,
        }
    }

    /// The link used for stream identity: the direct stream if known, else `url`
    pub fn effective_stream(&self) -> &str {
        self.stream_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.url)
    }

    /// Whether the item is addressed by season/episode
    pub fn is_episodic(&self) -> bool {
        self.season.is_some() || self.episode.is_some()
    }
}

/// Lifecycle of a provider within one request
///
/// Ordered so that `Pending < Running < {Completed, Empty, Error}`; the
/// three terminal states share a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Running,
    Completed,
    Empty,
    Error,
}

impl LifecycleState {
    /// Position in the pending → running → terminal progression
    pub fn stage(self) -> u8 {
        match self {
            LifecycleState::Pending => 0,
            LifecycleState::Running => 1,
            LifecycleState::Completed | LifecycleState::Empty | LifecycleState::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.stage() == 2
    }

    /// Terminal state for a finished provider
    pub fn from_outcome(success: bool, item_count: usize) -> Self {
        match (success, item_count) {
            (true, 0) => LifecycleState::Empty,
            (true, _) => LifecycleState::Completed,
            (false, _) => LifecycleState::Error,
        }
    }
}

/// Per-provider status reported to polling clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub name: String,
    pub plugin_id: String,
    pub ordinal_index: usize,
    pub state: LifecycleState,
    pub item_count: usize,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProviderStatus {
    /// A fresh `pending` status for the given provider
    pub fn pending(provider: &ProviderDescriptor) -> Self {
        Self {
            name: provider.name.clone(),
            plugin_id: provider.plugin_id.clone(),
            ordinal_index: provider.ordinal_index,
            state: LifecycleState::Pending,
            item_count: 0,
            response_time_ms: None,
            error: None,
        }
    }

    /// Moves the status into its terminal state
    ///
    /// A failed provider reports no items and keeps its error; a successful
    /// one drops any error.
    pub fn finish(
        &mut self,
        success: bool,
        item_count: usize,
        response_time_ms: u64,
        error: Option<String>,
    ) {
        self.state = LifecycleState::from_outcome(success, item_count);
        self.item_count = if success { item_count } else { 0 };
        self.response_time_ms = Some(response_time_ms);
        self.error = if success { None } else { error };
    }
}

/// Aggregated count of one normalized attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub code: String,
    pub label: String,
    pub count: usize,
}

/// Side-channel information about a merged result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationMetadata {
    pub quality_facets: Vec<Facet>,
    pub voice_facets: Vec<Facet>,
    pub total_items: usize,
}

/// Terminal output of one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub kind: PayloadKind,
    pub merged_items: Vec<ItemRecord>,
    pub provider_statuses: Vec<ProviderStatus>,
    pub metadata: AggregationMetadata,
}

impl AggregationResult {
    /// The valid "no sources found" result
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs_skip_missing_fields() {
        let identity = ContentIdentity {
            imdb_id: Some("tt0903747".to_string()),
            title: "Breaking Bad".to_string(),
            year: Some(2008),
            is_serial: true,
            ..ContentIdentity::default()
        };

        let pairs = identity.query_pairs();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["imdb_id", "title", "year", "serial"]);
        assert_eq!(pairs[3].1, "1");
    }

    #[test]
    fn test_with_query_appends_params() {
        let provider = ProviderDescriptor::new("alpha", "https://alpha.example/lite?x=1", 0);
        let with = provider.with_query(&[("title".to_string(), "Dark Matter".to_string())]);
        assert_eq!(with.base_url, "https://alpha.example/lite?x=1&title=Dark+Matter");
        assert_eq!(with.name, "alpha");
    }

    #[test]
    fn test_with_query_leaves_unparsable_url() {
        let provider = ProviderDescriptor::new("broken", "not a url", 0);
        let with = provider.with_query(&[("a".to_string(), "b".to_string())]);
        assert_eq!(with.base_url, "not a url");
    }

    #[test]
    fn test_lifecycle_stages() {
        assert!(LifecycleState::Pending.stage() < LifecycleState::Running.stage());
        assert!(LifecycleState::Running.stage() < LifecycleState::Error.stage());
        assert!(LifecycleState::Empty.is_terminal());
        assert!(!LifecycleState::Running.is_terminal());
    }

    #[test]
    fn test_payload_kind_from_type_field() {
        assert_eq!(PayloadKind::from_type_field("Episode"), PayloadKind::Episode);
        assert_eq!(PayloadKind::from_type_field("movie"), PayloadKind::Movie);
        assert_eq!(PayloadKind::from_type_field("whatever"), PayloadKind::Unknown);
    }

    #[test]
    fn test_effective_stream_prefers_stream_url() {
        let mut item = ItemRecord::new("alpha", "https://alpha.example/call?id=1");
        assert_eq!(item.effective_stream(), "https://alpha.example/call?id=1");
        item.stream_url = Some("https://cdn.example/a.m3u8".to_string());
        assert_eq!(item.effective_stream(), "https://cdn.example/a.m3u8");
    }
}
