//! Release sources: retrieval and parsing of upstream documents.
//!
//! - [`fetcher`] - HTTP/file retrieval with timeout, retry and size limits
//! - [`parser`] - RSS 2.0 item extraction
//! - [`manifest`] - Apple asset manifests (XML property lists)
//! - [`icon`] - `og:image` lookup on release pages
//! - [`source`] - the [`ReleaseSource`] seam the poll loop consumes

mod fetcher;
mod icon;
mod manifest;
mod parser;
mod source;

pub use fetcher::{fetch_bytes, FetchError, FetchOptions};
pub use icon::{resolve_icon, IconError};
pub use manifest::parse_manifest;
pub use parser::{parse_rss, ParseError};
pub use source::{FeedSource, ReleaseSource, SourceConfig, SourceError, SourceFormat};
