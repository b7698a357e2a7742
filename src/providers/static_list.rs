//! Fixed provider list
use super::{DiscoveryError, ProviderSource};
use crate::model::{ContentIdentity, ProviderDescriptor};
use async_trait::async_trait;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// One `[[provider]]` table of a provider list file
#[derive(Debug, Deserialize)]
struct ProviderEntry {
    name: String,
    url: String,
    #[serde(default)]
    plugin_id: Option<String>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    anime: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderFile {
    #[serde(default, rename = "provider")]
    providers: Vec<ProviderEntry>,
}

/// Provider source returning the same list for every title
#[derive(Debug, Clone, Default)]
pub struct StaticProviders {
    providers: Vec<ProviderDescriptor>,
}

impl StaticProviders {
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        Self { providers }
    }

    /// Parses a TOML provider list
    ///
    /// ```toml
    /// [[provider]]
    /// name = "Alloha"
    /// url = "https://alloha.example/lite/alloha"
    /// plugin_id = "alloha"   # optional, defaults to the lowercased name
    /// index = 0              # optional, defaults to the position
    /// anime = false          # optional
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, DiscoveryError> {
        let file: ProviderFile =
            toml::from_str(content).map_err(|e| DiscoveryError::ParseError(e.to_string()))?;

        let providers = file
            .providers
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                let mut descriptor =
                    ProviderDescriptor::new(entry.name, entry.url, entry.index.unwrap_or(position));
                descriptor.plugin_id = entry
                    .plugin_id
                    .unwrap_or_else(|| descriptor.name.to_lowercase());
                descriptor.anime_only = entry.anime;
                descriptor
            })
            .collect();

        Ok(Self { providers })
    }

    /// Reads a TOML provider list from disk
    pub fn load(path: &Path) -> Result<Self, DiscoveryError> {
        let content = fs::read_to_string(path).map_err(|e| DiscoveryError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }
}

#[async_trait]
impl ProviderSource for StaticProviders {
    async fn providers(
        &self,
        _identity: &ContentIdentity,
    ) -> Result<Vec<ProviderDescriptor>, DiscoveryError> {
        Ok(self.providers.clone())
    }
}
