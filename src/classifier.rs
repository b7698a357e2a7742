//! Response classification and item extraction
//!
//! Turns a raw provider body into a [`ClassifiedPayload`]: decides whether
//! the document lists a movie, seasons, episodes or similar titles, and
//! extracts a flat list of [`ItemRecord`]s from whichever container shape
//! the provider uses. Classification never fails; bodies that cannot be used
//! come back as `unknown` with a [`PayloadDefect`] attached.

use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::document::DocumentExt;
use crate::model::{ClassifiedPayload, ItemRecord, PayloadDefect, PayloadKind, Subtitle};
use crate::normalizer::resolution_of;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Object keys that hold the item list directly
const CONTAINER_KEYS: &[&str] = &["data", "results", "episodes", "seasons"];

const URL_FIELDS: &[&str] = &["url", "link", "file"];
const STREAM_FIELDS: &[&str] = &["stream", "stream_url", "streamUrl", "play"];
const TITLE_FIELDS: &[&str] = &["title", "name"];
const QUALITY_FIELDS: &[&str] = &["quality", "maxquality", "max_quality", "resolution"];
const VOICE_FIELDS: &[&str] = &["voice", "translate", "translation", "voice_name", "voiceName"];
const SEASON_FIELDS: &[&str] = &["season", "s", "season_number", "seasonNumber"];
const EPISODE_FIELDS: &[&str] = &["episode", "e", "episode_number", "episodeNumber"];
const SUBTITLE_FIELDS: &[&str] = &["subtitles", "subs"];

/// Classifies provider bodies and reports dropped items to a diagnostics sink
#[derive(Clone)]
pub struct Classifier {
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl Classifier {
    pub fn new(diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self { diagnostics }
    }

    /// Classifies one provider body
    ///
    /// # Arguments
    ///
    /// * `provider` - Name of the provider the body came from
    /// * `ordinal_index` - The provider's position, carried for ordering
    /// * `body` - Raw response text
    ///
    /// # Returns
    ///
    /// A payload that is `unknown` and empty when the body is empty, HTML
    /// or invalid JSON. The latter two also carry a defect.
    pub fn classify(&self, provider: &str, ordinal_index: usize, body: &str) -> ClassifiedPayload {
        let mut payload = ClassifiedPayload::empty(provider, ordinal_index);
        let trimmed = body.trim_start_matches('\u{feff}').trim();

        if trimmed.is_empty() {
            return payload;
        }

        // HTML error pages must not reach the JSON parser
        if looks_like_html(trimmed) {
            self.diagnostics
                .record(provider, DiagnosticKind::HtmlBody, &preview(trimmed));
            payload.defect = Some(PayloadDefect::Html);
            return payload;
        }

        let document: Value = match serde_json::from_str(trimmed) {
            Ok(document) => document,
            Err(e) => {
                self.diagnostics
                    .record(provider, DiagnosticKind::InvalidJson, &e.to_string());
                payload.defect = Some(PayloadDefect::InvalidJson(e.to_string()));
                return payload;
            }
        };

        let elements = container_items(&document);
        payload.kind = detect_kind(&document, &elements);

        for element in elements {
            match extract_item(provider, element) {
                Ok(item) => payload.items.push(item),
                Err(kind) => {
                    self.diagnostics
                        .record(provider, kind, &preview(&element.to_string()))
                }
            }
        }

        debug!(
            provider,
            kind = %payload.kind,
            items = payload.items.len(),
            "Classified provider response"
        );

        payload.raw_document = document;
        payload
    }
}

/// Whether a (trimmed) body is an HTML document rather than JSON
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(16).collect::<String>().to_ascii_lowercase();
    head.starts_with('<')
        || head.starts_with("<!doctype")
        || head.starts_with("<html")
        || head.starts_with("<body")
}

/// Locates the item list inside a document
///
/// Accepts a top-level array, an object with one of the known container
/// keys, or an object whose nested objects hold arrays (all of which are
/// flattened). As a last resort, array-valued top-level properties are
/// flattened.
fn container_items(document: &Value) -> Vec<&Value> {
    match document {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => {
            if let Some(items) = CONTAINER_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array))
            {
                return items.iter().collect();
            }

            let nested: Vec<&Value> = map
                .values()
                .filter_map(Value::as_object)
                .flat_map(|inner| inner.values().filter_map(Value::as_array))
                .flatten()
                .collect();
            if !nested.is_empty() {
                return nested;
            }

            map.values().filter_map(Value::as_array).flatten().collect()
        }
        _ => Vec::new(),
    }
}

/// Determines the payload kind
///
/// An explicit `type` (or `kind`) field wins; otherwise the first item decides:
/// an episode-number field means episodes, a season-number field seasons.
fn detect_kind(document: &Value, elements: &[&Value]) -> PayloadKind {
    if let Some(explicit) = document.str_field(&["type", "kind"]) {
        return PayloadKind::from_type_field(&explicit);
    }

    match elements.first() {
        Some(first) if first.field(EPISODE_FIELDS).is_some() => PayloadKind::Episode,
        Some(first) if first.field(SEASON_FIELDS).is_some() => PayloadKind::Season,
        _ => PayloadKind::Unknown,
    }
}

/// Builds an item from one container element
///
/// Returns the diagnostic to record when the element has to be dropped.
fn extract_item(provider: &str, element: &Value) -> Result<ItemRecord, DiagnosticKind> {
    if !element.is_object() {
        return Err(DiagnosticKind::MalformedItem);
    }

    // `quality` may map labels to links: {"1080p": "...", "720p": "..."}
    let best_quality_link = element
        .string_map_field(QUALITY_FIELDS)
        .and_then(|links| {
            links
                .into_iter()
                .max_by_key(|(label, _)| resolution_of(label).unwrap_or(0))
        });

    let stream_url = element
        .str_field(STREAM_FIELDS)
        .or_else(|| best_quality_link.as_ref().map(|(_, link)| link.clone()));

    let url = element
        .str_field(URL_FIELDS)
        .or_else(|| stream_url.clone())
        .ok_or(DiagnosticKind::MissingUrl)?;

    let mut item = ItemRecord::new(provider, url);
    item.stream_url = stream_url;
    if let Some(method) = element.str_field(&["method"]) {
        item.method = method;
    }
    item.title = element.str_field(TITLE_FIELDS).unwrap_or_default();
    item.season = element.number_field(SEASON_FIELDS);
    item.episode = element.number_field(EPISODE_FIELDS);
    item.raw_quality_label = element
        .str_field(QUALITY_FIELDS)
        .or_else(|| best_quality_link.map(|(label, _)| label));
    item.raw_voice_label = element.str_field(VOICE_FIELDS);
    item.subtitles = extract_subtitles(element);
    item.headers = element.string_map_field(&["headers"]).unwrap_or_default();

    Ok(item)
}

/// Reads subtitle tracks given either as link strings or `{label, url}` objects
fn extract_subtitles(element: &Value) -> Vec<Subtitle> {
    let Some(tracks) = element.field(SUBTITLE_FIELDS).and_then(Value::as_array) else {
        return Vec::new();
    };

    tracks
        .iter()
        .enumerate()
        .filter_map(|(index, track)| match track {
            Value::String(link) if !link.trim().is_empty() => Some(Subtitle {
                label: format!("Subtitle {}", index + 1),
                url: link.trim().to_string(),
            }),
            Value::Object(_) => {
                let url = track.str_field(&["url", "file", "link"])?;
                let label = track
                    .str_field(&["label", "lang", "language", "name"])
                    .unwrap_or_else(|| format!("Subtitle {}", index + 1));
                Some(Subtitle { label, url })
            }
            _ => None,
        })
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
