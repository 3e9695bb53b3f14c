//! Release model: categories, raw feed entries and the normalized [`Release`].
//!
//! A [`RawEntry`] is exactly what a source handed us. [`normalize`] turns it
//! into a [`Release`] whose identity ([`ReleaseKey`]) is derived only from the
//! raw entry's immutable fields, so two fetches of the same upstream item
//! compare equal regardless of what has been lazily resolved on either copy.

mod diff;

pub use diff::{diff, ComparisonResult};

use chrono::{DateTime, NaiveDateTime, TimeZone};
use chrono_tz::America::Los_Angeles;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::feed::resolve_icon;
use crate::util::strip_control_chars;

/// Date layout used by Apple's release feed once the trailing zone token is removed.
const PUBDATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S";

/// Icon used when a release page has no usable `og:image`.
pub const DEFAULT_ICON: &str = "https://www.apple.com/ac/structured-data/images/open_graph_logo.png";

// ============================================================================
// Category
// ============================================================================

/// The kind of software a release belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "iOS")]
    Ios,
    #[serde(rename = "iPadOS")]
    IpadOs,
    #[serde(rename = "macOS")]
    MacOs,
    #[serde(rename = "tvOS")]
    TvOs,
    #[serde(rename = "watchOS")]
    WatchOs,
    Other,
}

impl Category {
    /// Categories with a dedicated announcement configuration, in display order.
    pub const ENUMERATED: [Category; 5] = [
        Category::Ios,
        Category::IpadOs,
        Category::MacOs,
        Category::TvOs,
        Category::WatchOs,
    ];

    /// Every category, including the catch-all.
    pub const ALL: [Category; 6] = [
        Category::Ios,
        Category::IpadOs,
        Category::MacOs,
        Category::TvOs,
        Category::WatchOs,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ios => "iOS",
            Category::IpadOs => "iPadOS",
            Category::MacOs => "macOS",
            Category::TvOs => "tvOS",
            Category::WatchOs => "watchOS",
            Category::Other => "Other",
        }
    }

    /// Maps the first word of a release title to its category.
    ///
    /// Matching is exact: `"iOS"` is a category, `"ios"` or `"iOS,"` is not.
    pub fn from_title_token(token: &str) -> Category {
        Self::ENUMERATED
            .into_iter()
            .find(|c| c.as_str() == token)
            .unwrap_or(Category::Other)
    }

    pub fn is_enumerated(self) -> bool {
        self != Category::Other
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown release category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Case-insensitive, for operator input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ============================================================================
// Raw entries
// ============================================================================

/// An entry as produced by a feed grammar, before any derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntry {
    /// An RSS `<item>`.
    Rss {
        title: String,
        link: String,
        description: Option<String>,
        pubdate: String,
    },
    /// One asset of a property-list manifest.
    Manifest {
        build: String,
        base_url: Option<String>,
        relative_path: Option<String>,
    },
}

/// Identity of a release for diffing: a digest of the raw immutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseKey(String);

impl ReleaseKey {
    fn from_parts(parts: &[&str]) -> Self {
        let hash = Sha256::digest(parts.join("|").as_bytes());
        ReleaseKey(format!("{:x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for log correlation
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

// ============================================================================
// Release
// ============================================================================

/// A normalized release.
///
/// Equality and hashing are by [`ReleaseKey`] only.
#[derive(Debug, Clone)]
pub struct Release {
    key: ReleaseKey,
    /// Name of the configured source this release came from.
    pub source: Arc<str>,
    pub category: Category,
    pub version: String,
    /// Present only for enumerated categories.
    pub build: Option<String>,
    pub link: String,
    pub description: Option<String>,
    /// Publish time in US Pacific time. Manifest assets carry no date.
    pub published: Option<DateTime<Tz>>,
    icon: OnceCell<String>,
}

impl Release {
    pub fn key(&self) -> &ReleaseKey {
        &self.key
    }

    /// Pre-populates the icon so it is never fetched.
    pub fn with_icon(self, icon: impl Into<String>) -> Self {
        Self {
            icon: OnceCell::new_with(Some(icon.into())),
            ..self
        }
    }

    /// The icon if it has already been resolved.
    pub fn cached_icon(&self) -> Option<&str> {
        self.icon.get().map(String::as_str)
    }

    /// Returns the release icon, resolving it from the release page on first use.
    ///
    /// Resolution failures fall back to [`DEFAULT_ICON`]; the outcome is cached
    /// on this instance either way.
    pub async fn icon(&self, client: &reqwest::Client) -> &str {
        self.icon
            .get_or_init(|| async {
                match resolve_icon(client, &self.link).await {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::warn!(
                            release = %self.key,
                            link = %self.link,
                            error = %e,
                            "Icon resolution failed, using default icon"
                        );
                        DEFAULT_ICON.to_string()
                    }
                }
            })
            .await
    }
}

impl PartialEq for Release {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Release {}

impl Hash for Release {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

// ============================================================================
// Normalization
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("entry has an empty title")]
    EmptyTitle,
    #[error("entry has an empty link")]
    EmptyLink,
    #[error("unparsable publish date {0:?}")]
    InvalidDate(String),
    #[error("publish date {0:?} does not exist in US Pacific time")]
    NonexistentLocalTime(String),
    #[error("manifest asset has an empty build")]
    EmptyBuild,
}

/// Source-level context needed to normalize manifest assets.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub name: &'a str,
    /// Location of the source document, used as the fallback link.
    pub location: &'a str,
    /// Product label used as the version prefix for manifest assets.
    pub label: Option<&'a str>,
}

/// Normalizes one raw entry into a [`Release`].
///
/// Pure apart from the lazily resolved icon, which is left unresolved.
pub fn normalize(ctx: SourceContext<'_>, raw: RawEntry) -> Result<Release, NormalizeError> {
    match raw {
        RawEntry::Rss {
            title,
            link,
            description,
            pubdate,
        } => normalize_rss(ctx, title, link, description, pubdate),
        RawEntry::Manifest {
            build,
            base_url,
            relative_path,
        } => normalize_manifest(ctx, build, base_url, relative_path),
    }
}

fn normalize_rss(
    ctx: SourceContext<'_>,
    title: String,
    link: String,
    description: Option<String>,
    pubdate: String,
) -> Result<Release, NormalizeError> {
    let key = ReleaseKey::from_parts(&[&title, &link, &pubdate]);

    let clean_title = strip_control_chars(title.trim()).into_owned();
    let first_token = clean_title
        .split_whitespace()
        .next()
        .ok_or(NormalizeError::EmptyTitle)?;
    let link = link.trim();
    if link.is_empty() {
        return Err(NormalizeError::EmptyLink);
    }

    let category = Category::from_title_token(first_token);
    let version = extract_version(&clean_title).to_string();
    let build = if category.is_enumerated() {
        extract_build(&clean_title)
    } else {
        None
    };
    let published = parse_pubdate(&pubdate)?;

    Ok(Release {
        key,
        source: Arc::from(ctx.name),
        category,
        version,
        build,
        link: link.to_string(),
        description: description.map(|d| strip_control_chars(d.trim()).into_owned()),
        published: Some(published),
        icon: OnceCell::new(),
    })
}

fn normalize_manifest(
    ctx: SourceContext<'_>,
    build: String,
    base_url: Option<String>,
    relative_path: Option<String>,
) -> Result<Release, NormalizeError> {
    let build = build.trim().to_string();
    if build.is_empty() {
        return Err(NormalizeError::EmptyBuild);
    }

    let key = ReleaseKey::from_parts(&[
        ctx.name,
        &build,
        base_url.as_deref().unwrap_or(""),
        relative_path.as_deref().unwrap_or(""),
    ]);

    let link = match (base_url.as_deref(), relative_path.as_deref()) {
        (Some(base), Some(path)) => join_asset_url(base, path),
        (Some(base), None) => base.to_string(),
        _ => ctx.location.to_string(),
    };
    let label = ctx.label.unwrap_or(ctx.name);

    Ok(Release {
        key,
        source: Arc::from(ctx.name),
        category: Category::Other,
        version: format!("{} {}", label, build),
        build: None,
        link,
        description: None,
        published: None,
        icon: OnceCell::new(),
    })
}

/// Text before the first `" ("`, or the whole title.
fn extract_version(title: &str) -> &str {
    title.split(" (").next().unwrap_or(title).trim()
}

/// Text between the first `(` and the following `)` with `" | "` separators removed.
fn extract_build(title: &str) -> Option<String> {
    let (_, rest) = title.split_once('(')?;
    let inner = rest.split(')').next()?;
    let build = inner.replace(" | ", "");
    let build = build.trim();
    if build.is_empty() {
        None
    } else {
        Some(build.to_string())
    }
}

/// Parses Apple's `"%a, %d %b %Y %H:%M:%S <ZONE>"` and localizes it to US Pacific.
///
/// The trailing zone token is discarded: the feed's wall-clock times are Pacific.
fn parse_pubdate(raw: &str) -> Result<DateTime<Tz>, NormalizeError> {
    let trimmed = raw.trim();
    let without_zone = match trimmed.rsplit_once(' ') {
        Some((head, tail)) if !tail.contains(':') => head.trim_end(),
        _ => trimmed,
    };

    let naive = NaiveDateTime::parse_from_str(without_zone, PUBDATE_FORMAT)
        .map_err(|_| NormalizeError::InvalidDate(raw.to_string()))?;

    Los_Angeles
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| NormalizeError::NonexistentLocalTime(raw.to_string()))
}

fn join_asset_url(base: &str, path: &str) -> String {
    let base_dir = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    match url::Url::parse(&base_dir).and_then(|b| b.join(path.trim_start_matches('/'))) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}{}", base_dir, path.trim_start_matches('/')),
    }
}
