use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::fetcher::{fetch_bytes, FetchError, FetchOptions};
use super::manifest::parse_manifest;
use super::parser::{parse_rss, ParseError};
use crate::release::{normalize, NormalizeError, Release, SourceContext};

/// Grammar of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Rss,
    Manifest,
}

/// One configured release source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Short unique name, used in logs and release identity.
    pub name: String,
    /// HTTP(S) URL or local file path.
    pub location: String,
    #[serde(default = "default_format")]
    pub format: SourceFormat,
    /// Product label for manifest assets (e.g. "AirPods Firmware").
    #[serde(default)]
    pub label: Option<String>,
    /// Fixed icon for every release of this source; skips page lookups.
    #[serde(default)]
    pub icon: Option<String>,
}

fn default_format() -> SourceFormat {
    SourceFormat::Rss
}

impl SourceConfig {
    /// Apple's developer release feed.
    pub fn apple_developer() -> Self {
        Self {
            name: "developer".to_string(),
            location: "https://developer.apple.com/news/releases/rss/releases.rss".to_string(),
            format: SourceFormat::Rss,
            label: None,
            icon: None,
        }
    }
}

/// Why a source produced no releases this cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("entry {index}: {source}")]
    Normalize {
        index: usize,
        #[source]
        source: NormalizeError,
    },
}

/// Something the poll loop can ask for the current release list.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the source's complete current release set, in source order.
    ///
    /// A single malformed entry fails the whole fetch: partial sets would
    /// make the missing entries look new on the next cycle.
    async fn fetch(&self) -> Result<Vec<Release>, SourceError>;
}

/// A [`ReleaseSource`] backed by an RSS feed or a property-list manifest.
pub struct FeedSource {
    config: SourceConfig,
    client: reqwest::Client,
    options: FetchOptions,
}

impl FeedSource {
    pub fn new(config: SourceConfig, client: reqwest::Client, options: FetchOptions) -> Self {
        Self {
            config,
            client,
            options,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }
}

#[async_trait]
impl ReleaseSource for FeedSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn fetch(&self) -> Result<Vec<Release>, SourceError> {
        let bytes = fetch_bytes(&self.client, &self.config.location, self.options).await?;

        let raw = match self.config.format {
            SourceFormat::Rss => parse_rss(&bytes)?,
            SourceFormat::Manifest => parse_manifest(&bytes)?,
        };

        let ctx = SourceContext {
            name: &self.config.name,
            location: &self.config.location,
            label: self.config.label.as_deref(),
        };

        raw.into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let release =
                    normalize(ctx, entry).map_err(|source| SourceError::Normalize { index, source })?;
                Ok(match &self.config.icon {
                    Some(icon) => release.with_icon(icon.clone()),
                    None => release,
                })
            })
            .collect()
    }
}
