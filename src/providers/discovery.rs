//! Provider discovery over HTTP.
use super::{DiscoveryError, ProviderSource};
use crate::document::DocumentExt;
use crate::fetch::{FetchRequest, HttpTransport};
use crate::model::{ContentIdentity, ProviderDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const NAME_FIELDS: &[&str] = &["name", "balanser", "title"];
const URL_FIELDS: &[&str] = &["url", "link"];
const PLUGIN_FIELDS: &[&str] = &["plugin", "pluginId", "plugin_id"];
const INDEX_FIELDS: &[&str] = &["index", "ordinalIndex", "ordinal_index"];
const LIST_KEYS: &[&str] = &["providers", "data", "results"];

/// Provider source backed by a discovery endpoint
///
/// Sends the content identity as query parameters and reads back a list of
/// `{name, url, plugin, index}` entries, either as a top-level array or
/// wrapped in a `providers`/`data`/`results` property.
pub struct DiscoveryClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    timeout: Duration,
    headers: BTreeMap<String, String>,
}

impl DiscoveryClient {
    /// Creates a discovery client.
    ///
    /// # Arguments
    ///
    /// * `transport` - HTTP transport used for the discovery call
    /// * `endpoint` - Discovery URL, without the identity parameters
    /// * `timeout` - Timeout of the discovery call
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            timeout,
            headers: BTreeMap::new(),
        }
    }

    /// Headers sent with the discovery call, e.g. for authenticated endpoints
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Converts a discovery document into provider descriptors.
    ///
    /// Entries without a name or URL are skipped. The ordinal index defaults
    /// to the entry's position in the list.
    fn parse_providers(document: &Value) -> Result<Vec<ProviderDescriptor>, DiscoveryError> {
        let entries = match document {
            Value::Array(entries) => entries,
            Value::Object(_) => document
                .field(LIST_KEYS)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    DiscoveryError::ParseError("No provider list in response".to_string())
                })?,
            _ => {
                return Err(DiscoveryError::ParseError(
                    "Expected a provider array or object".to_string(),
                ));
            }
        };

        let providers = entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let name = entry.str_field(NAME_FIELDS)?;
                let url = entry.str_field(URL_FIELDS)?;
                let index = entry
                    .number_field(INDEX_FIELDS)
                    .map(|i| i as usize)
                    .unwrap_or(position);

                let mut descriptor = ProviderDescriptor::new(name, url, index);
                descriptor.plugin_id = entry
                    .str_field(PLUGIN_FIELDS)
                    .unwrap_or_else(|| descriptor.name.to_lowercase());
                descriptor.anime_only = entry
                    .field(&["anime", "animeOnly", "anime_only"])
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(descriptor)
            })
            .collect();

        Ok(providers)
    }
}

#[async_trait]
impl ProviderSource for DiscoveryClient {
    async fn providers(
        &self,
        identity: &ContentIdentity,
    ) -> Result<Vec<ProviderDescriptor>, DiscoveryError> {
        // Reuse the descriptor helper to append query parameters
        let url = ProviderDescriptor::new("discovery", self.endpoint.clone(), 0)
            .with_query(&identity.query_pairs())
            .base_url;

        debug!(url = %url, "Requesting provider list");

        let reply = self
            .transport
            .get(&FetchRequest {
                url,
                headers: self.headers.clone(),
                timeout: self.timeout,
            })
            .await?;

        if !(200..300).contains(&reply.status) {
            return Err(DiscoveryError::UnexpectedStatus(reply.status));
        }

        let document: Value = serde_json::from_str(reply.body.trim_start_matches('\u{feff}'))
            .map_err(|e| DiscoveryError::ParseError(e.to_string()))?;

        let providers = Self::parse_providers(&document)?;
        info!(title = %identity.title, count = providers.len(), "Discovered providers");
        Ok(providers)
    }
}
