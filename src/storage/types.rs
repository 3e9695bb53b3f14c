use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::release::Category;
use crate::transport::{ChannelId, GuildId, RoleId};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the bot has locked the database
    #[error("Another instance of applereleases appears to be running. Please stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The row kept changing underneath a read-modify-write
    #[error("Subscription for guild {0} was modified concurrently, giving up")]
    Conflict(GuildId),

    /// Mutation of a guild that has no subscription row
    #[error("Guild {0} is not registered")]
    NotRegistered(GuildId),

    /// Stored subscription JSON could not be (de)serialized
    #[error("Malformed subscription data for guild {guild}: {source}")]
    Serialization {
        guild: GuildId,
        #[source]
        source: serde_json::Error,
    },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Announcement settings for one category within one guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySubscription {
    #[serde(default)]
    pub role: Option<RoleId>,
    #[serde(default)]
    pub channel: Option<ChannelId>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for CategorySubscription {
    fn default() -> Self {
        Self {
            role: None,
            channel: None,
            enabled: true,
        }
    }
}

/// A guild's full subscription: one entry for every [`Category`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSubscription {
    pub guild: GuildId,
    categories: BTreeMap<Category, CategorySubscription>,
}

impl GuildSubscription {
    /// Every category enabled, with no channel or role set.
    pub fn new(guild: GuildId) -> Self {
        Self {
            guild,
            categories: Category::ALL
                .into_iter()
                .map(|c| (c, CategorySubscription::default()))
                .collect(),
        }
    }

    pub fn category(&self, category: Category) -> &CategorySubscription {
        // Every category is present by construction
        &self.categories[&category]
    }

    pub fn category_mut(&mut self, category: Category) -> &mut CategorySubscription {
        self.categories.entry(category).or_default()
    }

    /// Categories in display order.
    pub fn iter(&self) -> impl Iterator<Item = (Category, &CategorySubscription)> {
        self.categories.iter().map(|(c, s)| (*c, s))
    }

    pub(crate) fn to_json(&self) -> Result<String, DatabaseError> {
        let named: BTreeMap<&str, &CategorySubscription> = self
            .categories
            .iter()
            .map(|(c, s)| (c.as_str(), s))
            .collect();
        serde_json::to_string(&named).map_err(|source| DatabaseError::Serialization {
            guild: self.guild,
            source,
        })
    }

    /// Decodes a stored row, bringing it up to the current category set.
    ///
    /// Unknown categories are dropped; missing ones are added with defaults.
    /// The flag is true when the stored form differs from the migrated one.
    pub(crate) fn from_json(guild: GuildId, data: &str) -> Result<(Self, bool), DatabaseError> {
        let stored: BTreeMap<String, CategorySubscription> = serde_json::from_str(data)
            .map_err(|source| DatabaseError::Serialization { guild, source })?;

        let mut changed = false;
        let mut subscription = Self::new(guild);
        let mut seen = 0;

        for (name, entry) in stored {
            match Category::ALL.into_iter().find(|c| c.as_str() == name) {
                Some(category) => {
                    subscription.categories.insert(category, entry);
                    seen += 1;
                }
                None => {
                    tracing::warn!(
                        guild = %guild,
                        category = %name,
                        "Dropping unknown category from stored subscription"
                    );
                    changed = true;
                }
            }
        }

        if seen < Category::ALL.len() {
            changed = true;
        }

        Ok((subscription, changed))
    }
}
