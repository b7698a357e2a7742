//! Fingerprint cache module
//!
//! Aggregation results are memoized under a request fingerprint that folds
//! in the configuration version. The backing key/value store is pluggable
//! through [`CacheStore`]; an in-memory store and a file store under the
//! system's standard cache directory are provided.

use crate::model::{AggregationResult, ContentIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the cache stores
#[derive(Debug, Error)]
pub enum CacheError {
    /// The platform reports no per-user cache location
    #[error("No cache directory is available on this system")]
    NoCacheDirectory,

    #[error("Cache directory {path} is not usable: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Reading cache entry {path} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Writing cache entry {path} failed: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The entry file exists but holds no valid envelope
    #[error("Cache entry {path} is corrupt: {source}")]
    CorruptEntry {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key/value store with per-entry time-to-live
///
/// Expired entries behave exactly like missing ones.
pub trait CacheStore: Send + Sync {
    /// Returns the stored value, `None` if missing or expired
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores a value that expires after `ttl`
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Whether a live entry exists for `key`
    fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-process cache store
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until the next write
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, String)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((expires_at, value)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        // Keys are rarely read twice, so expired entries are dropped on write
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.insert(key.to_string(), (now + ttl, value));
        Ok(())
    }
}

/// On-disk representation of one cache entry
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Unix timestamp (seconds) of the write
    stored_at: u64,
    ttl_secs: u64,
    value: String,
}

impl Envelope {
    fn is_live(&self, now: u64) -> bool {
        now < self.stored_at.saturating_add(self.ttl_secs)
    }
}

/// Cache store keeping one JSON file per key
///
/// Files live in the system's standard cache directory unless a directory
/// is given explicitly. Expired files are left in place and overwritten on
/// the next write.
#[derive(Debug, Clone)]
pub struct FileCache {
    /// The directory where cached data is stored
    cache_dir: PathBuf,
}

impl FileCache {
    /// Opens the named store below the user's cache directory
    ///
    /// On Linux this is `~/.cache/stream_aggregator/<name>`. The directory
    /// is created when missing.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let cache = FileCache::open("aggregations")?;
    /// ```
    pub fn open(name: &str) -> Result<Self, CacheError> {
        let dirs =
            directories::ProjectDirs::from("org", "stream-aggregator", "stream_aggregator")
                .ok_or(CacheError::NoCacheDirectory)?;

        Self::open_in(dirs.cache_dir().join(path_segment(name)))
    }

    /// Opens or creates a cache rooted at `dir`
    pub fn open_in(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| CacheError::CreateDir {
            path: cache_dir.clone(),
            source: e,
        })?;
        Ok(Self { cache_dir })
    }

    /// Returns the path to the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", path_segment(key)))
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let file_path = self.entry_path(key);

        if !file_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&file_path).map_err(|e| CacheError::Read {
            path: file_path.clone(),
            source: e,
        })?;

        let envelope: Envelope =
            serde_json::from_str(&content).map_err(|e| CacheError::CorruptEntry {
                path: file_path,
                source: e,
            })?;

        Ok(envelope.is_live(unix_now()).then_some(envelope.value))
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let file_path = self.entry_path(key);
        let envelope = Envelope {
            stored_at: unix_now(),
            ttl_secs: ttl.as_secs(),
            value,
        };

        let content = serde_json::to_string(&envelope)?;

        fs::write(&file_path, content).map_err(|e| CacheError::Write {
            path: file_path,
            source: e,
        })?;

        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File system name for a cache key or store name
///
/// Request fingerprints are already lowercase hex and pass through
/// unchanged. Anything else is replaced by its blake3 digest, which keeps
/// distinct keys in distinct files on case-insensitive file systems too.
fn path_segment(raw: &str) -> String {
    let plain = !raw.is_empty()
        && raw.len() <= 128
        && raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');

    if plain {
        raw.to_string()
    } else {
        blake3::hash(raw.as_bytes()).to_hex().to_string()
    }
}

/// Canonical fields hashed into a request fingerprint
#[derive(Serialize)]
struct FingerprintInput<'a> {
    identity: &'a ContentIdentity,
    season: Option<u32>,
    episode: Option<u32>,
    config_version: u64,
}

/// Computes the cache key of one aggregation request
///
/// The key is a blake3 hex digest of the content identity, the filters and
/// the configuration version, so any configuration change produces new keys.
///
/// # Examples
///
/// ```ignore
/// let key = request_fingerprint(&identity, Some(1), None, config.version);
/// ```
pub fn request_fingerprint(
    identity: &ContentIdentity,
    season: Option<u32>,
    episode: Option<u32>,
    config_version: u64,
) -> String {
    let input = FingerprintInput {
        identity,
        season,
        episode,
        config_version,
    };
    // Serializing plain structs and options cannot fail
    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    blake3::hash(&canonical).to_hex().to_string()
}

/// Typed access to cached [`AggregationResult`]s
///
/// Cache failures are logged and treated as misses. We don't want a broken
/// cache to prevent an aggregation from being served.
#[derive(Clone)]
pub struct FingerprintCache {
    store: Arc<dyn CacheStore>,
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Loads the result cached under `key`
    pub fn load(&self, key: &str) -> Option<AggregationResult> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(result) => {
                debug!(key, "Cache hit");
                Some(result)
            }
            Err(e) => {
                warn!(key, error = %e, "Cached result is undecodable, treating as miss");
                None
            }
        }
    }

    /// Stores `result` under `key` for `ttl`
    pub fn store(&self, key: &str, result: &AggregationResult, ttl: Duration) {
        let encoded = match serde_json::to_string(result) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode result for caching");
                return;
            }
        };

        if let Err(e) = self.store.set(key, encoded, ttl) {
            warn!(key, error = %e, "Cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemRecord, PayloadKind};

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::NoCacheDirectory)
        }

        fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::NoCacheDirectory)
        }
    }

    fn identity() -> ContentIdentity {
        ContentIdentity {
            imdb_id: Some("tt0903747".to_string()),
            year: Some(2008),
            is_serial: true,
            ..ContentIdentity::titled("Breaking Bad")
        }
    }

    #[test]
    fn test_path_segment_keeps_plain_keys_and_hashes_the_rest() {
        let fingerprint = request_fingerprint(&identity(), None, None, 1);
        assert_eq!(path_segment(&fingerprint), fingerprint);
        assert_eq!(path_segment("aggregations"), "aggregations");

        let hashed = path_segment("Key/One");
        assert_eq!(hashed.len(), 64);
        assert_ne!(hashed, path_segment("key/one"));
        assert_ne!(hashed, path_segment("key_one"));
        assert_eq!(path_segment(""), blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn test_fingerprint_depends_on_every_input() {
        let base = request_fingerprint(&identity(), Some(1), None, 1);
        assert_eq!(base, request_fingerprint(&identity(), Some(1), None, 1));
        assert_eq!(base.len(), 64);
        assert_ne!(base, request_fingerprint(&identity(), Some(2), None, 1));
        assert_ne!(base, request_fingerprint(&identity(), Some(1), Some(1), 1));
        assert_ne!(base, request_fingerprint(&identity(), Some(1), None, 2));
        assert_ne!(
            base,
            request_fingerprint(&ContentIdentity::titled("Better Call Saul"), Some(1), None, 1)
        );
    }

    #[test]
    fn test_memory_cache_expiry() {
        let cache = MemoryCache::new();
        cache.set("live", "a".to_string(), Duration::from_secs(60)).unwrap();
        cache.set("dead", "b".to_string(), Duration::ZERO).unwrap();

        assert_eq!(cache.get("live").unwrap().as_deref(), Some("a"));
        assert!(cache.contains("live").unwrap());
        assert_eq!(cache.get("dead").unwrap(), None);
        assert!(!cache.contains("missing").unwrap());
    }

    #[test]
    fn test_memory_cache_drops_expired_entries_on_write() {
        let cache = MemoryCache::new();
        for n in 0..100 {
            cache.set(&format!("short-{n}"), "x".to_string(), Duration::ZERO).unwrap();
        }
        cache.set("fresh", "y".to_string(), Duration::from_secs(60)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh").unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_file_cache_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open_in(dir.path().join("results")).unwrap();

        cache.set("Key/One", "payload".to_string(), Duration::from_secs(600)).unwrap();
        assert_eq!(cache.get("Key/One").unwrap().as_deref(), Some("payload"));
        let file_name = format!("{}.json", path_segment("Key/One"));
        assert!(cache.cache_dir().join(file_name).exists());

        cache.set("stale", "old".to_string(), Duration::ZERO).unwrap();
        assert_eq!(cache.get("stale").unwrap(), None);
        assert_eq!(cache.get("absent").unwrap(), None);
    }

    #[test]
    fn test_file_cache_reports_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open_in(dir.path()).unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();

        assert!(matches!(
            cache.get("broken"),
            Err(CacheError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_fingerprint_cache_round_trip() {
        let cache = FingerprintCache::new(Arc::new(MemoryCache::new()));
        let result = AggregationResult {
            kind: PayloadKind::Movie,
            merged_items: vec![ItemRecord::new("alpha", "https://a.example/m.mp4")],
            ..AggregationResult::empty()
        };

        assert_eq!(cache.load("k"), None);
        cache.store("k", &result, Duration::from_secs(60));
        assert_eq!(cache.load("k"), Some(result));
    }

    #[test]
    fn test_fingerprint_cache_swallows_store_errors() {
        let cache = FingerprintCache::new(Arc::new(BrokenStore));
        cache.store("k", &AggregationResult::empty(), Duration::from_secs(60));
        assert_eq!(cache.load("k"), None);
    }

    #[test]
    fn test_fingerprint_cache_ignores_undecodable_values() {
        let store = Arc::new(MemoryCache::new());
        store.set("k", "{\"unexpected\": true".to_string(), Duration::from_secs(60)).unwrap();
        let cache = FingerprintCache::new(store);
        assert_eq!(cache.load("k"), None);
    }
}
