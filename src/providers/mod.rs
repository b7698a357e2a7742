//! Provider lists: where they come from and which ones a request uses
//!
//! The provider list is supplied by the host through [`ProviderSource`],
//! either as a fixed list or by asking a discovery endpoint.
//! [`select_providers`] then narrows it down for one request.
mod discovery;
mod static_list;

pub use discovery::DiscoveryClient;
pub use static_list::StaticProviders;

use crate::config::Configuration;
use crate::fetch::FetchError;
use crate::model::{ContentIdentity, ProviderDescriptor};
use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Original languages for which anime-only providers stay relevant
const ANIME_LANGUAGES: &[&str] = &["ja", "zh", "ko"];

/// Errors that can occur while obtaining the provider list
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery endpoint could not be reached
    #[error("Discovery request failed: {0}")]
    RequestFailed(#[from] FetchError),

    /// The discovery endpoint answered with a non-success status
    #[error("Discovery endpoint returned HTTP {0}")]
    UnexpectedStatus(u16),

    /// Failed to parse the discovery response
    #[error("Failed to parse discovery response: {0}")]
    ParseError(String),

    /// Failed to read a provider list file
    #[error("Failed to read provider list {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// Supplier of the providers available for a title
///
/// Implementors can return a fixed list or query a remote discovery
/// service. The returned order is only advisory; providers carry their own
/// ordinal index.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    /// Lists the providers that may serve `identity`
    ///
    /// # Arguments
    ///
    /// * `identity` - The title being aggregated
    ///
    /// # Returns
    ///
    /// A Result containing the provider descriptors, or a DiscoveryError
    async fn providers(
        &self,
        identity: &ContentIdentity,
    ) -> Result<Vec<ProviderDescriptor>, DiscoveryError>;
}

/// Narrows a provider list to the ones one request should query
///
/// Applies, in order: the include list (when non-empty), the exclude list,
/// and suppression of anime-only providers for content they cannot serve.
/// Name comparisons ignore case. The result is sorted by ordinal index, and
/// repeated names are made unique so every provider is tracked on its own.
///
/// # Examples
///
/// ```ignore
/// let selected = select_providers(all, &config, &identity);
/// ```
pub fn select_providers(
    providers: Vec<ProviderDescriptor>,
    config: &Configuration,
    identity: &ContentIdentity,
) -> Vec<ProviderDescriptor> {
    let mut selected: Vec<ProviderDescriptor> = providers
        .into_iter()
        .filter(|provider| {
            let included = config.provider_include_list.is_empty()
                || contains_name(&config.provider_include_list, &provider.name);
            let excluded = contains_name(&config.provider_exclude_list, &provider.name);
            if !included || excluded {
                debug!(provider = %provider.name, "Provider filtered by configuration");
                return false;
            }

            let anime_only = provider.anime_only
                || contains_name(&config.anime_providers, &provider.name);
            if anime_only && !could_be_anime(identity) {
                debug!(provider = %provider.name, "Anime-only provider suppressed");
                return false;
            }

            true
        })
        .collect();

    selected.sort_by_key(|provider| provider.ordinal_index);
    disambiguate_names(&mut selected);
    selected
}

/// Renames later providers whose name is already taken
///
/// The plugin id is appended when that yields a free name, a running number
/// otherwise. The first provider under a name keeps it.
fn disambiguate_names(providers: &mut [ProviderDescriptor]) {
    let mut taken: HashSet<String> = HashSet::with_capacity(providers.len());

    for provider in providers.iter_mut() {
        if taken.insert(provider.name.clone()) {
            continue;
        }

        let by_plugin = format!("{} ({})", provider.name, provider.plugin_id);
        let unique = if !provider.plugin_id.is_empty() && !taken.contains(&by_plugin) {
            by_plugin
        } else {
            (2..)
                .map(|n| format!("{} #{}", provider.name, n))
                .find(|candidate| !taken.contains(candidate))
                .unwrap_or_default()
        };

        debug!(provider = %provider.name, renamed = %unique, "Duplicate provider name");
        provider.name = unique.clone();
        taken.insert(unique);
    }
}

fn contains_name(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry.trim().eq_ignore_ascii_case(name.trim()))
}

/// Whether anime-only providers are worth asking about this title
///
/// Only serials qualify, and only if their original language (when known)
/// is one anime is commonly produced in.
fn could_be_anime(identity: &ContentIdentity) -> bool {
    if !identity.is_serial {
        return false;
    }
    match identity.original_language.as_deref().map(str::trim) {
        Some(language) if !language.is_empty() => ANIME_LANGUAGES
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(language)),
        _ => true,
    }
}
