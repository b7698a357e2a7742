//! Cross-provider merge and deduplication
//!
//! Combines the classified payloads of every provider into one canonical
//! listing. Episodic items collapse to a single entry per (season, episode),
//! keeping the best-ranked quality; non-episodic items collapse per
//! normalized link. All quality and voice variants that were accepted still
//! show up in the facet counts, independent of which link survived.

use crate::config::Configuration;
use crate::model::{
    AggregationMetadata, AggregationResult, ClassifiedPayload, Facet, ItemRecord, PayloadKind,
};
use crate::normalizer::{Normalizer, QualityFilter, compare_quality, rank};
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// Query parameters that vary between otherwise identical stream links
const VOLATILE_PARAMS: &[&str] = &[
    "sig",
    "signature",
    "token",
    "access_token",
    "auth",
    "auth_key",
    "hash",
    "md5",
    "hmac",
    "expires",
    "expire",
    "expiry",
    "exp",
    "ts",
    "timestamp",
    "valid_until",
    "validto",
    "st",
    "policy",
    "key-pair-id",
];

/// Normalizes a stream link for identity comparison
///
/// Removes signatures, tokens and expiry timestamps from the query, sorts
/// the remaining parameters and drops the fragment. Scheme and host are
/// lowercased by URL parsing. Unparsable links are compared as trimmed text.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(
///     stream_fingerprint("https://CDN.example/a.m3u8?token=abc&q=1"),
///     stream_fingerprint("https://cdn.example/a.m3u8?q=1&token=xyz"),
/// );
/// ```
pub fn stream_fingerprint(link: &str) -> String {
    let trimmed = link.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let mut kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_volatile(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    kept.sort();

    url.set_fragment(None);
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }

    url.to_string()
}

fn is_volatile(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("x-amz-") || VOLATILE_PARAMS.contains(&key.as_str())
}

/// Settings that shape a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Quality codes from most to least preferred
    pub priority_order: Vec<String>,
    pub filter: QualityFilter,
    /// Only keep items of this season (items without a season pass)
    pub season_filter: Option<u32>,
    /// Only keep items of this episode (items without an episode pass)
    pub episode_filter: Option<u32>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from_config(&Configuration::default(), None, None)
    }
}

impl MergeOptions {
    pub fn from_config(
        config: &Configuration,
        season_filter: Option<u32>,
        episode_filter: Option<u32>,
    ) -> Self {
        Self {
            priority_order: config.quality_priority_order.clone(),
            filter: QualityFilter {
                allow_4k: config.allow_4k,
                allow_hdr: config.allow_hdr,
            },
            season_filter,
            episode_filter,
        }
    }
}

/// Merges classified payloads into one [`AggregationResult`]
///
/// Merging is a pure function of the payloads (in the order given) and the
/// options: the same input always yields the same output.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    normalizer: Normalizer,
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(normalizer: Normalizer, options: MergeOptions) -> Self {
        Self { normalizer, options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merges payloads; `provider_statuses` is left empty for the caller
    ///
    /// Payloads carrying a defect are skipped entirely.
    pub fn merge(&self, payloads: &[ClassifiedPayload]) -> AggregationResult {
        let mut facets = FacetCounter::default();
        let mut episodes: BTreeMap<(u32, u32), ItemRecord> = BTreeMap::new();
        let mut others: Vec<ItemRecord> = Vec::new();
        let mut other_slots: HashMap<String, usize> = HashMap::new();
        let mut kind = PayloadKind::Unknown;

        for payload in payloads.iter().filter(|p| p.defect.is_none()) {
            if !payload.items.is_empty() {
                kind = stronger_kind(kind, payload.kind);
            }

            for raw in &payload.items {
                let Some(item) = self.accept(raw) else {
                    continue;
                };
                facets.count(&item);

                if item.is_episodic() {
                    let key = (item.season.unwrap_or(0), item.episode.unwrap_or(0));
                    match episodes.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(item);
                        }
                        Entry::Occupied(mut slot) => {
                            if self.outranks(&item, slot.get()) {
                                slot.insert(item);
                            }
                        }
                    }
                } else {
                    let fingerprint = stream_fingerprint(&item.url);
                    match other_slots.get(&fingerprint) {
                        Some(&index) => {
                            if self.outranks(&item, &others[index]) {
                                others[index] = item;
                            }
                        }
                        None => {
                            other_slots.insert(fingerprint, others.len());
                            others.push(item);
                        }
                    }
                }
            }
        }

        let merged_items: Vec<ItemRecord> = episodes.into_values().chain(others).collect();

        if kind == PayloadKind::Unknown && !merged_items.is_empty() {
            kind = infer_kind(&merged_items);
        }

        AggregationResult {
            kind,
            metadata: AggregationMetadata {
                quality_facets: facets.quality_facets(&self.options.priority_order),
                voice_facets: facets.voice_facets(),
                total_items: merged_items.len(),
            },
            merged_items,
            provider_statuses: Vec::new(),
        }
    }

    /// Applies filters and attaches normalized values; `None` drops the item
    fn accept(&self, raw: &ItemRecord) -> Option<ItemRecord> {
        if raw.url.trim().is_empty() {
            return None;
        }
        if let (Some(wanted), Some(season)) = (self.options.season_filter, raw.season) {
            if wanted != season {
                return None;
            }
        }
        if let (Some(wanted), Some(episode)) = (self.options.episode_filter, raw.episode) {
            if wanted != episode {
                return None;
            }
        }

        let mut item = raw.clone();

        if let Some(label) = raw.raw_quality_label.as_deref().filter(|l| !l.trim().is_empty()) {
            let quality = self.normalizer.normalize_quality(label);
            if !self.options.filter.permits(label, &quality) {
                return None;
            }
            item.quality = Some(quality);
        }

        if let Some(label) = raw.raw_voice_label.as_deref().filter(|l| !l.trim().is_empty()) {
            item.voice = Some(self.normalizer.normalize_voice(label));
        }

        Some(item)
    }

    /// Whether `challenger` should replace `incumbent`
    ///
    /// Only a strictly better quality wins, so ties keep the first seen.
    /// Any known quality beats a missing one.
    fn outranks(&self, challenger: &ItemRecord, incumbent: &ItemRecord) -> bool {
        match (&challenger.quality, &incumbent.quality) {
            (Some(a), Some(b)) => {
                compare_quality(a, b, &self.options.priority_order) == Ordering::Less
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Picks the more specific of two payload kinds
fn stronger_kind(current: PayloadKind, candidate: PayloadKind) -> PayloadKind {
    fn strength(kind: PayloadKind) -> u8 {
        match kind {
            PayloadKind::Episode => 4,
            PayloadKind::Season => 3,
            PayloadKind::Movie => 2,
            PayloadKind::Similar => 1,
            PayloadKind::Unknown => 0,
        }
    }

    if strength(candidate) > strength(current) {
        candidate
    } else {
        current
    }
}

/// Kind implied by the items when no provider declared one
fn infer_kind(items: &[ItemRecord]) -> PayloadKind {
    if items.iter().any(|i| i.episode.is_some()) {
        PayloadKind::Episode
    } else if items.iter().any(|i| i.season.is_some()) {
        PayloadKind::Season
    } else {
        PayloadKind::Movie
    }
}

#[derive(Default)]
struct FacetCounter {
    quality: BTreeMap<String, (String, usize)>,
    voice: BTreeMap<String, (String, usize)>,
}

impl FacetCounter {
    fn count(&mut self, item: &ItemRecord) {
        if let Some(quality) = &item.quality {
            bump(&mut self.quality, &quality.code, &quality.label);
        }
        if let Some(voice) = &item.voice {
            bump(&mut self.voice, &voice.code, &voice.label);
        }
    }

    /// Quality facets, best first
    fn quality_facets(&self, priority_order: &[String]) -> Vec<Facet> {
        let mut facets = to_facets(&self.quality);
        facets.sort_by(|a, b| {
            rank(&a.code, priority_order)
                .cmp(&rank(&b.code, priority_order))
                .then_with(|| a.code.cmp(&b.code))
        });
        facets
    }

    fn voice_facets(&self) -> Vec<Facet> {
        to_facets(&self.voice)
    }
}

fn bump(counter: &mut BTreeMap<String, (String, usize)>, code: &str, label: &str) {
    counter
        .entry(code.to_string())
        .or_insert_with(|| (label.to_string(), 0))
        .1 += 1;
}

fn to_facets(counter: &BTreeMap<String, (String, usize)>) -> Vec<Facet> {
    counter
        .iter()
        .map(|(code, (label, count))| Facet {
            code: code.clone(),
            label: label.clone(),
            count: *count,
        })
        .collect()
}
