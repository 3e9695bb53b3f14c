use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use super::{ChannelId, DeliveryError, GuildId, Transport};
use crate::announce::Announcement;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// JSON error code for "Unknown Guild".
const UNKNOWN_GUILD: u64 = 10004;

/// Longest rate-limit wait we report, whatever the server asks for.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

const COMPONENT_ACTION_ROW: u8 = 1;
const COMPONENT_BUTTON: u8 = 2;
const BUTTON_STYLE_LINK: u8 = 5;

#[derive(Debug, Error)]
pub enum DiscordConfigError {
    #[error("Insecure API base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    retry_after: Option<f64>,
}

/// Posts announcements through the Discord REST API using a bot token.
pub struct DiscordTransport {
    client: reqwest::Client,
    api_base: String,
    token: SecretString,
    timeout: Duration,
}

impl std::fmt::Debug for DiscordTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordTransport")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl DiscordTransport {
    /// # Errors
    ///
    /// SEC-002: rejects a non-HTTPS `api_base` so the token never travels in
    /// clear text; plain HTTP is allowed for localhost only.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        token: SecretString,
        timeout: Duration,
    ) -> Result<Self, DiscordConfigError> {
        let api_base = api_base.trim_end_matches('/');
        if !api_base.starts_with("https://") {
            let is_localhost = api_base.starts_with("http://127.0.0.1")
                || api_base.starts_with("http://localhost");
            if !is_localhost {
                tracing::error!(api_base = %api_base, "Rejecting non-HTTPS Discord API base");
                return Err(DiscordConfigError::InsecureBaseUrl);
            }
            tracing::warn!(api_base = %api_base, "Using non-HTTPS Discord API base (localhost only)");
        }

        Ok(Self {
            client,
            api_base: api_base.to_string(),
            token,
            timeout,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(
            "Authorization",
            format!("Bot {}", self.token.expose_secret()),
        )
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, DeliveryError> {
        // reqwest's per-request timeout also covers reading the body
        self.authorized(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Network(e)
                }
            })
    }

    /// Tells a lost channel permission apart from a lost guild membership.
    ///
    /// Only a 403 or 404 on the guild itself means the bot is gone; rate
    /// limits and server errors leave the guild in place.
    async fn guild_reachable(&self, guild: GuildId) -> bool {
        let url = format!("{}/guilds/{}", self.api_base, guild);
        match self.execute(self.client.get(&url)).await {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    tracing::debug!(guild = %guild, status = %status, "Guild probe rejected");
                }
                !matches!(
                    status,
                    reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::NOT_FOUND
                )
            }
            Err(e) => {
                // Unknown state: keep the guild, only the category gets disabled
                tracing::debug!(guild = %guild, error = %e, "Guild probe failed");
                true
            }
        }
    }

    async fn classify(
        &self,
        guild: GuildId,
        response: reqwest::Response,
    ) -> DeliveryError {
        let status = response.status();
        let header_retry = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body: Option<ApiError> = response.json().await.ok();

        match status.as_u16() {
            403 => {
                if self.guild_reachable(guild).await {
                    DeliveryError::Forbidden
                } else {
                    DeliveryError::GuildNotFound
                }
            }
            404 => match body.and_then(|b| b.code) {
                Some(UNKNOWN_GUILD) => DeliveryError::GuildNotFound,
                // Unknown Channel (10003), or a 404 without a code
                _ => DeliveryError::ChannelNotFound,
            },
            429 => {
                let secs = body.and_then(|b| b.retry_after).or(header_retry);
                DeliveryError::RateLimited {
                    retry_after: retry_after(secs),
                }
            }
            code => DeliveryError::HttpStatus { status: code },
        }
    }
}

/// Converts a server-supplied `retry_after` into a bounded wait.
///
/// Missing or non-finite values fall back to one second; anything above
/// [`MAX_RETRY_AFTER`] is clamped.
fn retry_after(secs: Option<f64>) -> Duration {
    let fallback = Duration::from_secs(1);
    match secs {
        Some(s) if s.is_nan() => fallback,
        Some(s) => Duration::try_from_secs_f64(s.max(0.0))
            .map(|d| d.min(MAX_RETRY_AFTER))
            .unwrap_or(MAX_RETRY_AFTER),
        None => fallback,
    }
}

/// The message body for `POST /channels/{id}/messages`.
pub(crate) fn message_payload(announcement: &Announcement) -> Value {
    let fields: Vec<Value> = announcement
        .fields
        .iter()
        .map(|f| json!({ "name": f.name, "value": f.value, "inline": false }))
        .collect();

    let mut payload = json!({
        "embeds": [{
            "title": announcement.title,
            "description": announcement.description,
            "color": announcement.color,
            "thumbnail": { "url": announcement.thumbnail },
            "fields": fields,
            "footer": { "text": announcement.footer },
        }],
        "components": [{
            "type": COMPONENT_ACTION_ROW,
            "components": [{
                "type": COMPONENT_BUTTON,
                "style": BUTTON_STYLE_LINK,
                "label": announcement.link_label,
                "url": announcement.link,
            }],
        }],
        // Only role pings; never @everyone from upstream text
        "allowed_mentions": { "parse": ["roles"] },
    });

    if let (Some(mention), Some(obj)) = (&announcement.mention, payload.as_object_mut()) {
        obj.insert("content".to_string(), Value::String(mention.clone()));
    }
    payload
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn send(
        &self,
        guild: GuildId,
        channel: ChannelId,
        announcement: &Announcement,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel);
        let request = self.client.post(&url).json(&message_payload(announcement));
        let response = self.execute(request).await?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(self.classify(guild, response).await)
    }
}
