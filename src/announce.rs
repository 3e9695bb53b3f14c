//! Rendering of a [`Release`] into a chat message.

use serde::Serialize;

use crate::release::Release;
use crate::transport::RoleId;
use crate::util::truncate_chars;

/// Discord "blurple".
pub const EMBED_COLOR: u32 = 0x5865F2;
pub const FOOTER_TEXT: &str = "Apple Releases";

const MAX_TITLE: usize = 256;
const MAX_DESCRIPTION: usize = 4096;
const MAX_FIELD_VALUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

/// A platform-neutral announcement: mention prefix, embed and one link button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Announcement {
    /// `<@&role>` when the destination has a role for the category.
    pub mention: Option<String>,
    pub title: String,
    pub description: String,
    pub fields: Vec<EmbedField>,
    pub thumbnail: String,
    pub color: u32,
    pub footer: String,
    pub link_label: String,
    pub link: String,
}

impl Announcement {
    /// Builds the message for `release` as seen by one destination.
    ///
    /// `icon` is passed in so rendering stays free of I/O.
    pub fn render(release: &Release, role: Option<RoleId>, icon: &str) -> Self {
        let mut fields = Vec::with_capacity(2);

        if let Some(published) = release.published {
            fields.push(EmbedField {
                name: "Release Date".to_string(),
                value: format!("<t:{}:f>", published.timestamp()),
            });
        }

        if release.category.is_enumerated() {
            if let Some(build) = &release.build {
                fields.push(EmbedField {
                    name: "Build Number".to_string(),
                    value: truncate_chars(build, MAX_FIELD_VALUE).into_owned(),
                });
            }
        }

        Self {
            mention: role.map(|r| format!("<@&{}>", r)),
            title: truncate_chars("New Release", MAX_TITLE).into_owned(),
            description: truncate_chars(&release.version, MAX_DESCRIPTION).into_owned(),
            fields,
            thumbnail: icon.to_string(),
            color: EMBED_COLOR,
            footer: FOOTER_TEXT.to_string(),
            link_label: "Link".to_string(),
            link: release.link.clone(),
        }
    }
}
