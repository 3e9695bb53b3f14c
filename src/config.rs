//! Configuration file parser for ~/.config/applereleases/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetchOptions, SourceConfig};
use crate::transport::DEFAULT_API_BASE;

/// Environment variable holding the bot token; overrides `discord_token`.
pub const TOKEN_ENV: &str = "AR_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level bot configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
///
/// SEC-015: Custom Debug impl masks `discord_token` to prevent secret leakage
/// in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between poll cycles, for warm-up and steady state alike.
    pub poll_interval_secs: u64,

    /// Pause between two consecutive chat deliveries.
    pub send_delay_ms: u64,

    /// Per-request timeout for feed fetches and chat API calls.
    pub request_timeout_secs: u64,

    /// SQLite file for guild subscriptions. Defaults to the config directory.
    pub database_path: Option<PathBuf>,

    pub discord_api_base: String,

    /// Bot token (alternative to the AR_TOKEN env var).
    /// Env var takes precedence over config file.
    pub discord_token: Option<String>,

    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            send_delay_ms: 500,
            request_timeout_secs: 30,
            database_path: None,
            discord_api_base: DEFAULT_API_BASE.to_string(),
            discord_token: None,
            sources: vec![SourceConfig::apple_developer()],
        }
    }
}

/// SEC-015: Mask discord_token in Debug output to prevent secret leakage.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("send_delay_ms", &self.send_delay_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("database_path", &self.database_path)
            .field("discord_api_base", &self.discord_api_base)
            .field(
                "discord_token",
                &self.discord_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("sources", &self.sources)
            .finish()
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "poll_interval_secs",
        "send_delay_ms",
        "request_timeout_secs",
        "database_path",
        "discord_api_base",
        "discord_token",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            interval_secs = config.poll_interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[sources]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() || source.location.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "every source needs a name and a location".to_string(),
                ));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name `{}`",
                    source.name
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: self.request_timeout(),
            ..FetchOptions::default()
        }
    }

    /// The bot token: `AR_TOKEN` if set and non-empty, else `discord_token`.
    pub fn token(&self) -> Option<SecretString> {
        self.token_from(std::env::var(TOKEN_ENV).ok())
    }

    fn token_from(&self, env: Option<String>) -> Option<SecretString> {
        env.filter(|t| !t.trim().is_empty())
            .or_else(|| self.discord_token.clone())
            .map(SecretString::from)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::SourceFormat;
    use secrecy::ExposeSecret;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("applereleases_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_secs, 120);
        assert_eq!(config.send_delay(), Duration::from_millis(500));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.discord_api_base, "https://discord.com/api/v10");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(
            config.sources[0].location,
            "https://developer.apple.com/news/releases/rss/releases.rss"
        );
        assert!(config.discord_token.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/applereleases_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.poll_interval_secs, 120);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sources.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("partial", "poll_interval_secs = 60\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.send_delay_ms, 500);
        assert_eq!(config.sources[0].name, "developer");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
poll_interval_secs = 300
send_delay_ms = 250
request_timeout_secs = 10
database_path = "/var/lib/applereleases/bot.db"
discord_api_base = "https://discord.example.com/api/v10"
discord_token = "config-token"

[[sources]]
name = "developer"
location = "https://developer.apple.com/news/releases/rss/releases.rss"

[[sources]]
name = "airpods"
location = "https://mesu.apple.com/assets/com_apple_MobileAsset_MobileAccessoryUpdate_A2564_EA/com_apple_MobileAsset_MobileAccessoryUpdate_A2564_EA.xml"
format = "manifest"
label = "AirPods Firmware"
icon = "https://example.com/airpods.png"
"#;
        let (dir, path) = write_config("full", content);
        let config = Config::load(&path).unwrap();

        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.fetch_options().timeout, Duration::from_secs(10));
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/applereleases/bot.db"))
        );
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].format, SourceFormat::Rss);
        assert_eq!(config.sources[1].format, SourceFormat::Manifest);
        assert_eq!(config.sources[1].label.as_deref(), Some("AirPods Firmware"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "poll_interval_secs = 5\ntotally_fake_key = 1\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_source_format_rejected() {
        let content = "[[sources]]\nname = \"x\"\nlocation = \"https://x\"\nformat = \"atom\"\n";
        assert!(matches!(
            Config::from_toml(content).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_zero_interval_invalid() {
        let err = Config::from_toml("poll_interval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_source_names_invalid() {
        let content = r#"
[[sources]]
name = "dev"
location = "https://a"

[[sources]]
name = "dev"
location = "https://b"
"#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn test_empty_sources_invalid() {
        let err = Config::from_toml("sources = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_env_token_takes_precedence() {
        let config = Config {
            discord_token: Some("from-file".to_string()),
            ..Config::default()
        };

        let token = config.token_from(Some("from-env".to_string())).unwrap();
        assert_eq!(token.expose_secret(), "from-env");

        let token = config.token_from(Some("  ".to_string())).unwrap();
        assert_eq!(token.expose_secret(), "from-file");

        assert!(Config::default().token_from(None).is_none());
    }

    // SEC-015: Debug output masks the token
    #[test]
    fn test_debug_masks_token() {
        let config = Config {
            discord_token: Some("super-secret-token-12345".to_string()),
            ..Config::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-token-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
