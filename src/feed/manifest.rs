//! Apple asset manifests (XML property lists).
//!
//! Only the parts the bot consumes are interpreted: the top-level `Assets`
//! array and, per asset, `Build`, `__BaseURL` and `__RelativePath`. Everything
//! else is parsed for structure and then ignored.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::parser::{ParseError, MAX_XML_DEPTH};
use crate::release::RawEntry;

/// A property-list value, reduced to what manifest assets need.
#[derive(Debug, Clone, PartialEq)]
enum Plist {
    String(String),
    Array(Vec<Plist>),
    Dict(Vec<(String, Plist)>),
    /// Numbers, booleans, dates and data blobs: kept as their text form.
    Scalar(String),
}

impl Plist {
    fn get(&self, key: &str) -> Option<&Plist> {
        match self {
            Plist::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Plist::String(s) | Plist::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// Container under construction while walking the event stream.
enum Frame {
    Array(Vec<Plist>),
    Dict {
        entries: Vec<(String, Plist)>,
        pending_key: Option<String>,
    },
}

/// Parses an XML property-list manifest into raw entries, one per asset.
///
/// Assets without a `Build` are skipped. Binary property lists are rejected
/// with [`ParseError::UnsupportedManifest`].
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<RawEntry>, ParseError> {
    if bytes.starts_with(b"bplist") {
        return Err(ParseError::UnsupportedManifest(
            "binary property lists are not supported".to_string(),
        ));
    }

    let root = parse_plist(bytes)?;
    let assets = match root.get("Assets") {
        Some(Plist::Array(items)) => items,
        Some(_) => {
            return Err(ParseError::UnsupportedManifest(
                "`Assets` is not an array".to_string(),
            ))
        }
        None => {
            return Err(ParseError::UnsupportedManifest(
                "missing `Assets` key".to_string(),
            ))
        }
    };

    let mut entries = Vec::with_capacity(assets.len());
    for (index, asset) in assets.iter().enumerate() {
        let Some(build) = asset.get("Build").and_then(Plist::as_text) else {
            tracing::debug!(index = index, "Skipping manifest asset without a build");
            continue;
        };
        entries.push(RawEntry::Manifest {
            build: build.to_string(),
            base_url: asset
                .get("__BaseURL")
                .and_then(Plist::as_text)
                .map(str::to_string),
            relative_path: asset
                .get("__RelativePath")
                .and_then(Plist::as_text)
                .map(str::to_string),
        });
    }

    Ok(entries)
}

/// Builds the value tree of the document's root element.
fn parse_plist(bytes: &[u8]) -> Result<Plist, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Plist> = None;
    // Text accumulator for the leaf element currently open
    let mut leaf: Option<(Vec<u8>, String)> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"plist" => {}
                    b"dict" | b"array" => {
                        if stack.len() >= MAX_XML_DEPTH {
                            return Err(ParseError::MaxDepthExceeded(MAX_XML_DEPTH));
                        }
                        stack.push(if name == b"dict" {
                            Frame::Dict {
                                entries: Vec::new(),
                                pending_key: None,
                            }
                        } else {
                            Frame::Array(Vec::new())
                        });
                    }
                    _ => leaf = Some((name, String::new())),
                }
            }
            Event::Empty(e) => {
                let value = match e.local_name().as_ref() {
                    b"dict" => Plist::Dict(Vec::new()),
                    b"array" => Plist::Array(Vec::new()),
                    b"true" => Plist::Scalar("true".to_string()),
                    b"false" => Plist::Scalar("false".to_string()),
                    b"string" => Plist::String(String::new()),
                    _ => Plist::Scalar(String::new()),
                };
                attach(&mut stack, &mut root, value)?;
            }
            Event::Text(t) => {
                if let Some((_, text)) = leaf.as_mut() {
                    let unescaped = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Event::CData(c) => {
                if let Some((_, text)) = leaf.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"plist" => {}
                b"dict" | b"array" => {
                    let value = match stack.pop() {
                        Some(Frame::Array(items)) => Plist::Array(items),
                        Some(Frame::Dict { entries, .. }) => Plist::Dict(entries),
                        None => return Err(ParseError::Xml("unbalanced container".to_string())),
                    };
                    attach(&mut stack, &mut root, value)?;
                }
                _ => {
                    if let Some((name, text)) = leaf.take() {
                        if name == b"key" {
                            match stack.last_mut() {
                                Some(Frame::Dict { pending_key, .. }) => *pending_key = Some(text),
                                _ => {
                                    return Err(ParseError::UnsupportedManifest(
                                        "<key> outside of a dict".to_string(),
                                    ))
                                }
                            }
                        } else {
                            let value = if name == b"string" {
                                Plist::String(text)
                            } else {
                                Plist::Scalar(text)
                            };
                            attach(&mut stack, &mut root, value)?;
                        }
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| ParseError::UnsupportedManifest("empty property list".to_string()))
}

/// Places a finished value into the enclosing container, or makes it the root.
fn attach(stack: &mut [Frame], root: &mut Option<Plist>, value: Plist) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(Frame::Array(items)) => items.push(value),
        Some(Frame::Dict {
            entries,
            pending_key,
        }) => {
            let key = pending_key.take().ok_or_else(|| {
                ParseError::UnsupportedManifest("dict value without a <key>".to_string())
            })?;
            entries.push((key, value));
        }
        None => {
            if root.is_none() {
                *root = Some(value);
            }
        }
    }
    Ok(())
}
