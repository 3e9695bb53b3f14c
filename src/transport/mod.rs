//! Delivery of announcements to chat destinations.

mod discord;

pub use discord::{DiscordConfigError, DiscordTransport, DEFAULT_API_BASE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::announce::Announcement;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            // SQLite integers are signed; snowflakes stay below 2^63
            pub(crate) fn as_i64(self) -> i64 {
                self.0 as i64
            }

            pub(crate) fn from_i64(id: i64) -> Self {
                Self(id as u64)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

snowflake!(
    /// A chat server.
    GuildId
);
snowflake!(
    /// A text channel within a guild.
    ChannelId
);
snowflake!(
    /// A mentionable role within a guild.
    RoleId
);

/// Why a single delivery failed.
///
/// The dispatcher decides per variant whether the destination's
/// configuration needs repairing; see [`DeliveryError::is_permanent`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The bot may no longer post in the channel
    #[error("missing permission to post in channel")]
    Forbidden,
    #[error("channel no longer exists")]
    ChannelNotFound,
    /// The bot is no longer a member of the guild
    #[error("guild is no longer reachable")]
    GuildNotFound,
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("HTTP error: status {status}")]
    HttpStatus { status: u16 },
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// True when retrying next cycle would fail the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryError::Forbidden | DeliveryError::ChannelNotFound | DeliveryError::GuildNotFound
        )
    }
}

/// A chat platform the bot can post announcements to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        guild: GuildId,
        channel: ChannelId,
        announcement: &Announcement,
    ) -> Result<(), DeliveryError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_serde_is_transparent() {
        let json = serde_json::to_string(&ChannelId::new(1_106_000_000_000_000_001)).unwrap();
        assert_eq!(json, "1106000000000000001");
        let back: RoleId = serde_json::from_str("42").unwrap();
        assert_eq!(back, RoleId::new(42));
    }

    #[test]
    fn test_snowflake_i64_roundtrip_for_large_ids() {
        let id = GuildId::new(1_106_000_000_000_000_001);
        assert_eq!(GuildId::from_i64(id.as_i64()), id);
    }

    #[test]
    fn test_snowflake_from_str() {
        assert_eq!(" 17 ".parse::<GuildId>().unwrap(), GuildId::new(17));
        assert!("abc".parse::<GuildId>().is_err());
    }

    #[test]
    fn test_permanent_failures() {
        assert!(DeliveryError::Forbidden.is_permanent());
        assert!(DeliveryError::GuildNotFound.is_permanent());
        assert!(!DeliveryError::HttpStatus { status: 502 }.is_permanent());
        assert!(!DeliveryError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_permanent());
    }
}
