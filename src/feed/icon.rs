use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

const ICON_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB

#[derive(Debug, Error)]
pub enum IconError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("page too large")]
    TooLarge,
    #[error("page has no og:image")]
    NotFound,
}

/// Fetches a release page and returns its `og:image` URL.
///
/// Relative image URLs are resolved against the page URL. The whole lookup,
/// body included, is bounded by a fixed timeout.
pub async fn resolve_icon(client: &reqwest::Client, page_url: &str) -> Result<String, IconError> {
    resolve_icon_within(client, page_url, ICON_TIMEOUT).await
}

async fn resolve_icon_within(
    client: &reqwest::Client,
    page_url: &str,
    timeout: Duration,
) -> Result<String, IconError> {
    let bytes = tokio::time::timeout(timeout, fetch_page(client, page_url))
        .await
        .map_err(|_| IconError::Timeout)??;

    let html = String::from_utf8_lossy(&bytes);
    find_og_image(&html, page_url).ok_or(IconError::NotFound)
}

async fn fetch_page(client: &reqwest::Client, page_url: &str) -> Result<Vec<u8>, IconError> {
    let response = client.get(page_url).send().await?;

    if !response.status().is_success() {
        return Err(IconError::HttpStatus(response.status().as_u16()));
    }

    if let Some(len) = response.content_length() {
        if len as usize > MAX_PAGE_SIZE {
            return Err(IconError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(IconError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > MAX_PAGE_SIZE {
            return Err(IconError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Scans HTML for `<meta property="og:image" content="...">`.
///
/// Uses simple string scanning (no HTML parser dependency) and tolerates
/// either attribute order and either quote style.
fn find_og_image(html: &str, page_url: &str) -> Option<String> {
    let html_lower = html.to_lowercase();
    let mut search_from = 0;

    while let Some(meta_start) = html_lower[search_from..].find("<meta") {
        let abs_start = search_from + meta_start;
        let tag_end = html_lower[abs_start..].find('>')?;
        let tag = &html_lower[abs_start..=abs_start + tag_end];

        if contains_attr(tag, "property", "og:image") {
            // Read content from the original HTML to keep the URL's case
            let original_tag = html.get(abs_start..=abs_start + tag_end).unwrap_or(tag);
            if let Some(content) = extract_attr_value(original_tag, "content") {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(resolve_url(content, page_url));
                }
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

/// Checks if a lowercased tag contains an attribute with the given value.
fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

/// Extracts a quoted attribute value from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_lowercase();
    let attr_prefix = format!(" {attr_name}=");

    let value_start = tag_lower.find(&attr_prefix)? + attr_prefix.len();
    let rest = tag.get(value_start..)?;
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }

    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(&inner[..end])
}

fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }

    if href.starts_with("//") {
        if let Ok(parsed) = url::Url::parse(&format!("https:{}", href)) {
            return parsed.to_string();
        }
    }

    url::Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_owned())
}
