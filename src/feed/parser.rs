use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::release::RawEntry;

/// Maximum element nesting accepted in a source document.
pub(crate) const MAX_XML_DEPTH: usize = 64;

/// Errors raised when a fetched payload does not match its grammar.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    Xml(String),
    #[error("document is not an RSS feed")]
    NotAFeed,
    #[error("feed item {index} is missing <{field}>")]
    MissingField { index: usize, field: &'static str },
    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),
    #[error("document nesting exceeds {0} levels")]
    MaxDepthExceeded(usize),
}

impl From<quick_xml::Error> for ParseError {
    fn from(e: quick_xml::Error) -> Self {
        ParseError::Xml(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Link,
    Description,
    PubDate,
}

#[derive(Default)]
struct ItemBuilder {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    pubdate: Option<String>,
}

impl ItemBuilder {
    fn slot(&mut self, field: ItemField) -> &mut Option<String> {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::Description => &mut self.description,
            ItemField::PubDate => &mut self.pubdate,
        }
    }

    fn finish(self, index: usize) -> Result<RawEntry, ParseError> {
        let missing = |field| ParseError::MissingField { index, field };
        Ok(RawEntry::Rss {
            title: self.title.ok_or_else(|| missing("title"))?,
            link: self.link.ok_or_else(|| missing("link"))?,
            description: self.description,
            pubdate: self.pubdate.ok_or_else(|| missing("pubDate"))?,
        })
    }
}

fn item_field(name: &[u8]) -> Option<ItemField> {
    // Element names are matched case-insensitively: the feed has shipped
    // both `pubDate` and `pubdate` over the years.
    if name.eq_ignore_ascii_case(b"title") {
        Some(ItemField::Title)
    } else if name.eq_ignore_ascii_case(b"link") {
        Some(ItemField::Link)
    } else if name.eq_ignore_ascii_case(b"description") {
        Some(ItemField::Description)
    } else if name.eq_ignore_ascii_case(b"pubdate") {
        Some(ItemField::PubDate)
    } else {
        None
    }
}

/// Parses an RSS 2.0 document into raw entries, in document order.
///
/// Each `<item>` must carry `<title>`, `<link>` and `<pubDate>`; `<description>`
/// is optional. Text and CDATA content are concatenated verbatim (entities
/// unescaped) so the identity of an entry is exactly what upstream published.
///
/// # Errors
///
/// - [`ParseError::NotAFeed`] if there is no `<rss>`/`<channel>` element
/// - [`ParseError::MissingField`] if an item lacks a required element
/// - [`ParseError::Xml`] for malformed XML
pub fn parse_rss(bytes: &[u8]) -> Result<Vec<RawEntry>, ParseError> {
    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations; only the
    // five predefined entities are unescaped.
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut saw_channel = false;
    let mut item: Option<ItemBuilder> = None;
    let mut field: Option<ItemField> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                depth += 1;
                if depth > MAX_XML_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_XML_DEPTH));
                }

                let name = e.local_name();
                let name = name.as_ref();
                if name == b"rss" || name == b"channel" {
                    saw_channel = true;
                } else if name == b"item" {
                    item = Some(ItemBuilder::default());
                } else if let Some(builder) = item.as_mut() {
                    field = item_field(name);
                    if let Some(f) = field {
                        // Repeated elements: the last one wins, like a DOM lookup would
                        *builder.slot(f) = Some(String::new());
                    }
                }
            }
            Event::Empty(e) => {
                if let (Some(builder), Some(f)) = (item.as_mut(), item_field(e.local_name().as_ref())) {
                    *builder.slot(f) = Some(String::new());
                }
            }
            Event::Text(t) => {
                if let (Some(builder), Some(f)) = (item.as_mut(), field) {
                    let text = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                    builder.slot(f).get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::CData(c) => {
                if let (Some(builder), Some(f)) = (item.as_mut(), field) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    builder.slot(f).get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"item" {
                    if let Some(builder) = item.take() {
                        entries.push(builder.finish(entries.len())?);
                    }
                    field = None;
                } else if field.is_some() && item_field(e.local_name().as_ref()) == field {
                    field = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_channel {
        return Err(ParseError::NotAFeed);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Releases - Apple Developer</title>
    <link>https://developer.apple.com/news/releases/</link>
    <item>
      <title>iOS 17.4 (21E219)</title>
      <link>https://developer.apple.com/news/releases/?id=03052024a</link>
      <guid>https://developer.apple.com/news/releases/?id=03052024a</guid>
      <description><![CDATA[<p>View downloads &amp; notes</p>]]></description>
      <pubDate>Tue, 05 Mar 2024 10:00:00 PST</pubDate>
    </item>
    <item>
      <title>Xcode 15.3 &amp; Instruments</title>
      <link>
        https://developer.apple.com/news/releases/?id=03052024b
      </link>
      <pubdate>Tue, 05 Mar 2024 10:00:00 PST</pubdate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_items_in_document_order() {
        let entries = parse_rss(FEED.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(
            entries[0],
            RawEntry::Rss {
                title: "iOS 17.4 (21E219)".to_string(),
                link: "https://developer.apple.com/news/releases/?id=03052024a".to_string(),
                description: Some("<p>View downloads &amp; notes</p>".to_string()),
                pubdate: "Tue, 05 Mar 2024 10:00:00 PST".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_unescapes_and_keeps_raw_whitespace() {
        let entries = parse_rss(FEED.as_bytes()).unwrap();
        match &entries[1] {
            RawEntry::Rss {
                title,
                link,
                description,
                pubdate,
            } => {
                assert_eq!(title, "Xcode 15.3 & Instruments");
                assert_eq!(link.trim(), "https://developer.apple.com/news/releases/?id=03052024b");
                assert_eq!(description, &None);
                assert_eq!(pubdate, "Tue, 05 Mar 2024 10:00:00 PST");
            }
            other => panic!("expected RSS entry, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_title_is_not_an_item() {
        let feed = r#"<rss><channel><title>Only a channel</title></channel></rss>"#;
        assert!(parse_rss(feed.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_pubdate_is_an_error() {
        let feed = r#"<rss><channel><item><title>iOS 17.4 (21E219)</title><link>https://x</link></item></channel></rss>"#;
        let err = parse_rss(feed.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField {
                index: 0,
                field: "pubDate"
            }
        ));
    }

    #[test]
    fn test_non_feed_document() {
        let err = parse_rss(b"<html><body>nope</body></html>").unwrap_err();
        assert!(matches!(err, ParseError::NotAFeed));
    }

    #[test]
    fn test_malformed_xml() {
        let feed = r#"<rss><channel><item><title>x</wrong></item></channel></rss>"#;
        let err = parse_rss(feed.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::Xml(_)));
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let open = "<a>".repeat(MAX_XML_DEPTH + 1);
        let close = "</a>".repeat(MAX_XML_DEPTH + 1);
        let doc = format!("<rss>{}{}</rss>", open, close);
        let err = parse_rss(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::MaxDepthExceeded(_)));
    }
}
