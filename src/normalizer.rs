//! Quality and voice-track normalization
//!
//! Providers describe the same stream quality in many ways ("4K", "UHD",
//! "2160p", "Ultra HD") and voice tracks even more loosely. This module maps
//! free-text labels onto canonical `(code, label)` pairs using a synonym
//! table, ranks quality codes against a priority order, and filters out
//! labels that the configuration forbids (4K, HDR).

use crate::config::Configuration;
use crate::model::NormalizedValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{LazyLock, Once};
use tracing::info;

/// Quality codes treated as "high resolution" for the 4K filter
pub const HIGH_RESOLUTION_CODES: &[&str] = &["2160p", "1440p"];

/// Priority order used when the configuration does not provide one
pub const DEFAULT_QUALITY_ORDER: &[&str] =
    &["2160p", "1440p", "1080p", "720p", "480p", "360p", "240p"];

/// Resolution followed by a scan suffix, e.g. `1080p`, `720i`
static SCAN_RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{3,4})\s*[pi](?:[^a-z]|$)").expect("valid regex"));

/// Frame size such as `1920x1080`; the height is captured
static FRAME_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{3,4}\s*[xX×]\s*(\d{3,4})").expect("valid regex"));

/// Any 3-4 digit run
static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{3,4}").expect("valid regex"));

static HDR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[^a-z0-9])(?:hdr(?:10)?\+?|dolby[\s_-]*vision|dovi|hlg|dv)(?:[^a-z0-9]|$)",
    )
    .expect("valid regex")
});

static QUALITY_FALLBACK_NOTICE: Once = Once::new();
static VOICE_FALLBACK_NOTICE: Once = Once::new();

/// One canonical value and the raw variants that map to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymEntry {
    /// Canonical machine key, e.g. `1080p`
    pub code: String,
    /// Display text; defaults to the code
    #[serde(default)]
    pub label: Option<String>,
    /// Accepted raw spellings, matched case-insensitively
    #[serde(default)]
    pub variants: Vec<String>,
}

impl SynonymEntry {
    fn new(code: &str, label: &str, variants: &[&str]) -> Self {
        Self {
            code: code.to_string(),
            label: Some(label.to_string()),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.code)
    }

    fn normalized(&self) -> NormalizedValue {
        NormalizedValue::new(self.code.clone(), self.display_label())
    }
}

/// Ordered synonym table
///
/// Order matters for substring matching: earlier entries win, so more
/// specific variants ("full hd", "ultra hd") must come before generic ones
/// ("hd").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynonymTable {
    entries: Vec<SynonymEntry>,
}

impl SynonymTable {
    pub fn new(entries: Vec<SynonymEntry>) -> Self {
        Self { entries }
    }

    /// Built-in quality table
    pub fn default_quality() -> Self {
        Self::new(vec![
            SynonymEntry::new("2160p", "4K", &["4k", "uhd", "ultra hd", "ultrahd", "2160"]),
            SynonymEntry::new("1440p", "2K", &["2k", "qhd", "quad hd", "1440"]),
            SynonymEntry::new("1080p", "1080p", &["full hd", "fullhd", "fhd", "1080"]),
            SynonymEntry::new("720p", "720p", &["hd", "hd ready", "720"]),
            SynonymEntry::new("480p", "480p", &["sd", "dvd", "480"]),
            SynonymEntry::new("360p", "360p", &["360"]),
            SynonymEntry::new("240p", "240p", &["240"]),
        ])
    }

    /// Built-in voice-track table
    pub fn default_voice() -> Self {
        Self::new(vec![
            SynonymEntry::new(
                "dub",
                "Dubbed",
                &[
                    "dub",
                    "dubbed",
                    "dubbing",
                    "full dub",
                    "дубляж",
                    "дублированный",
                    "дублированная",
                ],
            ),
            SynonymEntry::new(
                "mvo",
                "Multi-voice",
                &[
                    "mvo",
                    "multi voice",
                    "multivoice",
                    "многоголосый",
                    "многоголосая",
                    "проф. многоголосый",
                ],
            ),
            SynonymEntry::new(
                "dvo",
                "Two-voice",
                &["dvo", "two voice", "двухголосый", "двухголосая"],
            ),
            SynonymEntry::new(
                "avo",
                "Single-voice",
                &["avo", "vo", "single voice", "author", "авторский", "одноголосый", "одноголосая"],
            ),
            SynonymEntry::new(
                "sub",
                "Subtitles",
                &["sub", "subs", "subbed", "subtitles", "субтитры"],
            ),
            SynonymEntry::new(
                "original",
                "Original",
                &["original", "orig", "оригинал", "оригинальная дорожка"],
            ),
        ])
    }

    pub fn entries(&self) -> &[SynonymEntry] {
        &self.entries
    }

    /// Resolves a raw label against this table
    ///
    /// Matching order: exact code, case-insensitive code or variant,
    /// token-bounded variant membership. Returns `None` when nothing matched.
    pub fn lookup(&self, raw: &str) -> Option<NormalizedValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(entry) = self.entries.iter().find(|e| e.code == trimmed) {
            return Some(entry.normalized());
        }

        let lower = trimmed.to_lowercase();
        if let Some(entry) = self.entries.iter().find(|e| {
            e.code.to_lowercase() == lower || e.variants.iter().any(|v| v.to_lowercase() == lower)
        }) {
            return Some(entry.normalized());
        }

        self.entries
            .iter()
            .find(|e| {
                contains_token(&lower, &e.code.to_lowercase())
                    || e.variants.iter().any(|v| contains_token(&lower, &v.to_lowercase()))
            })
            .map(SynonymEntry::normalized)
    }

    fn find_code(&self, code: &str) -> Option<&SynonymEntry> {
        self.entries.iter().find(|e| e.code == code)
    }
}

/// Maps raw labels onto canonical quality and voice values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    quality: SynonymTable,
    voice: SynonymTable,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(SynonymTable::default_quality(), SynonymTable::default_voice())
    }
}

impl Normalizer {
    pub fn new(quality: SynonymTable, voice: SynonymTable) -> Self {
        Self { quality, voice }
    }

    /// Builds a normalizer from configured tables, falling back to built-ins
    pub fn from_config(config: &Configuration) -> Self {
        let quality = match &config.quality_synonyms {
            Some(entries) if !entries.is_empty() => SynonymTable::new(entries.clone()),
            _ => {
                QUALITY_FALLBACK_NOTICE.call_once(|| {
                    info!("No quality synonym table configured, using built-in defaults");
                });
                SynonymTable::default_quality()
            }
        };
        let voice = match &config.voice_synonyms {
            Some(entries) if !entries.is_empty() => SynonymTable::new(entries.clone()),
            _ => {
                VOICE_FALLBACK_NOTICE.call_once(|| {
                    info!("No voice synonym table configured, using built-in defaults");
                });
                SynonymTable::default_voice()
            }
        };
        Self::new(quality, voice)
    }

    /// Normalizes a quality label such as `"4K HDR"` or `"FHD 1080"`
    ///
    /// After the synonym table, a resolution embedded in the label
    /// (`1920x1080`, `1080i`) is tried before synthesizing a code.
    pub fn normalize_quality(&self, raw: &str) -> NormalizedValue {
        if let Some(value) = self.quality.lookup(raw) {
            return value;
        }

        let by_resolution = resolution_of(raw)
            .and_then(|height| self.quality.find_code(&format!("{height}p")));
        if let Some(entry) = by_resolution {
            return entry.normalized();
        }

        synthesize(raw)
    }

    /// Normalizes a voice-track label such as `"Дубляж"` or `"MVO | LostFilm"`
    pub fn normalize_voice(&self, raw: &str) -> NormalizedValue {
        self.voice.lookup(raw).unwrap_or_else(|| synthesize(raw))
    }
}

/// Position of `code` in `priority_order`; unknown codes rank last
pub fn rank(code: &str, priority_order: &[String]) -> usize {
    priority_order
        .iter()
        .position(|candidate| candidate == code)
        .unwrap_or(usize::MAX)
}

/// Extracts a vertical resolution from a label
///
/// Prefers a run followed by a scan suffix (`1080p`), then the height of a
/// frame size (`1920x1080`), then any 3-4 digit run.
pub fn resolution_of(label: &str) -> Option<u32> {
    let captured = SCAN_RESOLUTION
        .captures(label)
        .or_else(|| FRAME_SIZE.captures(label))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| DIGIT_RUN.find(label).map(|m| m.as_str()));

    captured.and_then(|digits| digits.parse().ok())
}

/// Orders two quality values best-first
///
/// Lower rank wins; on equal rank the higher parsed resolution wins.
pub fn compare_quality(
    a: &NormalizedValue,
    b: &NormalizedValue,
    priority_order: &[String],
) -> Ordering {
    rank(&a.code, priority_order)
        .cmp(&rank(&b.code, priority_order))
        .then_with(|| quality_resolution(b).cmp(&quality_resolution(a)))
}

fn quality_resolution(value: &NormalizedValue) -> u32 {
    resolution_of(&value.label)
        .or_else(|| resolution_of(&value.code))
        .unwrap_or(0)
}

/// Whether a raw label advertises HDR, HDR10(+), Dolby Vision or HLG
pub fn is_hdr_label(raw: &str) -> bool {
    HDR_MARKER.is_match(raw)
}

/// Excludes qualities the configuration does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityFilter {
    pub allow_4k: bool,
    pub allow_hdr: bool,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self {
            allow_4k: true,
            allow_hdr: true,
        }
    }
}

impl QualityFilter {
    /// Returns `false` when an item with this quality must be dropped
    pub fn permits(&self, raw: &str, normalized: &NormalizedValue) -> bool {
        if !self.allow_4k && HIGH_RESOLUTION_CODES.contains(&normalized.code.as_str()) {
            return false;
        }
        if !self.allow_hdr && is_hdr_label(raw) {
            return false;
        }
        true
    }
}

/// Synthesizes a code from unmatched text
///
/// Lowercases and collapses each run of non-alphanumeric characters into
/// `_`; the trimmed original text becomes the label.
fn synthesize(raw: &str) -> NormalizedValue {
    let trimmed = raw.trim();
    let mut code = String::with_capacity(trimmed.len());
    let mut pending_separator = false;

    for c in trimmed.chars() {
        if c.is_alphanumeric() {
            if pending_separator && !code.is_empty() {
                code.push('_');
            }
            pending_separator = false;
            code.extend(c.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    if code.is_empty() {
        return NormalizedValue::new("unknown", "unknown");
    }

    NormalizedValue::new(code, trimmed)
}

/// Finds `needle` in `haystack` as a whole token
///
/// Neighbouring characters must not be alphanumeric, except that a needle
/// ending in a digit may be followed by a `p`/`i` scan suffix.
fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }

    let ends_with_digit = needle.chars().last().is_some_and(|c| c.is_ascii_digit());

    for (start, _) in haystack.match_indices(needle) {
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        if !before_ok {
            continue;
        }

        let mut rest = haystack[start + needle.len()..].chars();
        let after_ok = match rest.next() {
            None => true,
            Some(c) if !c.is_alphanumeric() => true,
            Some('p' | 'i') if ends_with_digit => rest.next().is_none_or(|c| !c.is_alphanumeric()),
            Some(_) => false,
        };
        if after_ok {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Vec<String> {
        DEFAULT_QUALITY_ORDER.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_recognized_4k_synonyms() {
        let normalizer = Normalizer::default();
        for raw in ["4K", "4K HDR", "Ultra HD", "UHD", "2160p", "uhd 2160p HDR10+"] {
            assert_eq!(normalizer.normalize_quality(raw).code, "2160p", "label {raw}");
        }
    }

    #[test]
    fn test_quality_matching_order() {
        let normalizer = Normalizer::default();
        assert_eq!(normalizer.normalize_quality("1080p").label, "1080p");
        assert_eq!(normalizer.normalize_quality("FULL HD").code, "1080p");
        assert_eq!(normalizer.normalize_quality("HD").code, "720p");
        assert_eq!(normalizer.normalize_quality("WEB-DL 720p").code, "720p");
        assert_eq!(normalizer.normalize_quality("1920x1080").code, "1080p");
    }

    #[test]
    fn test_hd_does_not_match_inside_hdr() {
        let normalizer = Normalizer::default();
        let value = normalizer.normalize_quality("HDR");
        assert_eq!(value.code, "hdr");
        assert_eq!(value.label, "HDR");
    }

    #[test]
    fn test_unmatched_label_is_synthesized() {
        let normalizer = Normalizer::default();
        let value = normalizer.normalize_quality("  Cam Rip!! (bad) ");
        assert_eq!(value.code, "cam_rip_bad");
        assert_eq!(value.label, "Cam Rip!! (bad)");
    }

    #[test]
    fn test_normalization_is_stable() {
        let normalizer = Normalizer::default();
        let first = normalizer.normalize_voice("Многоголосый закадровый");
        let second = normalizer.normalize_voice("Многоголосый закадровый");
        assert_eq!(first, second);
        assert_eq!(first.code, "mvo");
    }

    #[test]
    fn test_voice_aliases() {
        let normalizer = Normalizer::default();
        assert_eq!(normalizer.normalize_voice("Дубляж").code, "dub");
        assert_eq!(normalizer.normalize_voice("dubbed").label, "Dubbed");
        assert_eq!(normalizer.normalize_voice("English subs").code, "sub");
        assert_eq!(normalizer.normalize_voice("LostFilm").code, "lostfilm");
    }

    #[test]
    fn test_rank_positions_and_sentinel() {
        let order = order();
        assert_eq!(rank("2160p", &order), 0);
        assert_eq!(rank("720p", &order), 3);
        assert_eq!(rank("cam_rip", &order), usize::MAX);
        assert_eq!(rank("720p", &order), rank("720p", &order));
        assert!(rank("cam_rip", &order) > rank("240p", &order));
    }

    #[test]
    fn test_compare_quality_tie_breaks_on_resolution() {
        let order = vec!["1080p".to_string()];
        let a = NormalizedValue::new("bdrip_720", "BDRip 720");
        let b = NormalizedValue::new("webrip_900", "WEBRip 900");
        assert_eq!(compare_quality(&b, &a, &order), Ordering::Less);

        let best = NormalizedValue::new("1080p", "1080p");
        assert_eq!(compare_quality(&best, &b, &order), Ordering::Less);
    }

    #[test]
    fn test_resolution_of() {
        assert_eq!(resolution_of("1080p"), Some(1080));
        assert_eq!(resolution_of("1920x1080"), Some(1080));
        assert_eq!(resolution_of("Ultra 2160"), Some(2160));
        assert_eq!(resolution_of("4K"), None);
    }

    #[test]
    fn test_quality_filter() {
        let normalizer = Normalizer::default();
        let no_4k = QualityFilter {
            allow_4k: false,
            allow_hdr: true,
        };
        assert!(!no_4k.permits("2160p", &normalizer.normalize_quality("2160p")));
        assert!(!no_4k.permits("2K", &normalizer.normalize_quality("2K")));
        assert!(no_4k.permits("1080p HDR", &normalizer.normalize_quality("1080p HDR")));

        let no_hdr = QualityFilter {
            allow_4k: true,
            allow_hdr: false,
        };
        assert!(!no_hdr.permits("1080p HDR", &normalizer.normalize_quality("1080p HDR")));
        let dolby = normalizer.normalize_quality("4K Dolby Vision");
        assert!(!no_hdr.permits("4K Dolby Vision", &dolby));
        assert!(!no_hdr.permits("2160p HLG", &normalizer.normalize_quality("2160p HLG")));
        assert!(no_hdr.permits("HD 720", &normalizer.normalize_quality("HD 720")));
    }

    #[test]
    fn test_contains_token() {
        assert!(contains_token("4k hdr", "4k"));
        assert!(contains_token("web-dl 1080p", "1080"));
        assert!(!contains_token("hdrip", "hd"));
        assert!(!contains_token("21080", "1080"));
        assert!(contains_token("full hd", "hd"));
    }

    #[test]
    fn test_configured_table_overrides_defaults() {
        let config = Configuration {
            quality_synonyms: Some(vec![SynonymEntry {
                code: "hi".to_string(),
                label: None,
                variants: vec!["best".to_string()],
            }]),
            ..Configuration::default()
        };
        let normalizer = Normalizer::from_config(&config);
        assert_eq!(normalizer.normalize_quality("Best"), NormalizedValue::new("hi", "hi"));
        assert_eq!(normalizer.normalize_voice("Дубляж").code, "dub");
    }
}
