use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use applereleases::config::Config;
use applereleases::dispatch::Dispatcher;
use applereleases::feed::{FeedSource, ReleaseSource};
use applereleases::poller::Poller;
use applereleases::release::Category;
use applereleases::storage::{Database, DatabaseError};
use applereleases::transport::{ChannelId, DiscordTransport, GuildId, RoleId};

/// Get the config directory path (~/.config/applereleases/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("applereleases");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(
    name = "applereleases",
    about = "Announce new Apple software releases to Discord servers"
)]
struct Args {
    /// Config file (default: ~/.config/applereleases/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subscription database (overrides `database_path`)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll sources and post announcements until Ctrl-C
    Run,
    /// Fetch every source once and print what it returns
    Check,
    /// Create the default subscription for a guild
    Register { guild: GuildId },
    /// Set the announcement channel for one category, or all of them
    SetChannel {
        guild: GuildId,
        channel: ChannelId,
        #[arg(long)]
        category: Option<Category>,
    },
    /// Set the role mentioned for a category
    SetRole {
        guild: GuildId,
        category: Category,
        role: RoleId,
    },
    /// Enable or disable announcements for a category
    Toggle { guild: GuildId, category: Category },
    /// Show a guild's subscription
    List { guild: GuildId },
    /// Delete a guild's subscription
    Remove { guild: GuildId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(?config, "Effective configuration");

    let client = reqwest::Client::builder()
        .user_agent(concat!("applereleases/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let db_path = args
        .database
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("subscriptions.db"));

    match args.command.unwrap_or(Command::Run) {
        Command::Check => check(&config, client).await,
        Command::Run => {
            let db = open_database(&db_path).await?;
            run(&config, client, db).await
        }
        command => {
            let db = open_database(&db_path).await?;
            manage(command, &db).await
        }
    }
}

/// Handles the subscription management subcommands.
async fn manage(command: Command, db: &Database) -> Result<()> {
    match command {
        Command::Register { guild } => {
            if db.register_guild(guild).await? {
                println!("Registered guild {guild}");
            } else {
                println!("Guild {guild} is already registered");
            }
        }
        Command::SetChannel {
            guild,
            channel,
            category,
        } => {
            db.set_channel(guild, category, channel)
                .await
                .context("Failed to set channel")?;
            match category {
                Some(c) => println!("{c} announcements now go to channel {channel}"),
                None => println!("All announcements now go to channel {channel}"),
            }
        }
        Command::SetRole {
            guild,
            category,
            role,
        } => {
            db.set_role(guild, category, role)
                .await
                .context("Failed to set role")?;
            println!("{category} announcements now mention role {role}");
        }
        Command::Toggle { guild, category } => {
            let enabled = db
                .toggle_category(guild, category)
                .await
                .context("Failed to toggle category")?;
            let state = if enabled { "enabled" } else { "disabled" };
            println!("{category} announcements {state}");
        }
        Command::List { guild } => {
            let Some(sub) = db.get_subscription(guild).await? else {
                anyhow::bail!("Guild {guild} is not registered");
            };
            for (category, entry) in sub.iter() {
                let channel = entry
                    .channel
                    .map_or_else(|| "-".to_string(), |c| c.to_string());
                let role = entry.role.map_or_else(|| "-".to_string(), |r| r.to_string());
                let state = if entry.enabled { "on" } else { "off" };
                let name = category.as_str();
                println!("{name:<8} {state:<4} channel={channel} role={role}");
            }
        }
        Command::Remove { guild } => {
            if db.remove_guild(guild).await? {
                println!("Removed guild {guild}");
            } else {
                println!("Guild {guild} was not registered");
            }
        }
        Command::Run | Command::Check => {}
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of applereleases appears to be running. Please stop it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    db.migrate_subscriptions()
        .await
        .context("Failed to migrate stored subscriptions")?;
    Ok(db)
}

fn build_sources(config: &Config, client: &reqwest::Client) -> Vec<Box<dyn ReleaseSource>> {
    config
        .sources
        .iter()
        .map(|source| {
            Box::new(FeedSource::new(
                source.clone(),
                client.clone(),
                config.fetch_options(),
            )) as Box<dyn ReleaseSource>
        })
        .collect()
}

async fn check(config: &Config, client: reqwest::Client) -> Result<()> {
    for source in build_sources(config, &client) {
        match source.fetch().await {
            Ok(releases) => {
                println!("{}: {} releases", source.name(), releases.len());
                for release in releases {
                    let date = release
                        .published
                        .map_or_else(|| "undated".to_string(), |d| d.to_rfc2822());
                    println!(
                        "  [{}] {} ({}) {}",
                        release.category,
                        release.version,
                        release.build.as_deref().unwrap_or("-"),
                        date
                    );
                }
            }
            Err(e) => println!("{}: failed: {}", source.name(), e),
        }
    }
    Ok(())
}

async fn run(config: &Config, client: reqwest::Client, db: Database) -> Result<()> {
    let token = config.token().ok_or_else(|| {
        anyhow::anyhow!("No bot token: set AR_TOKEN or `discord_token` in the config file")
    })?;
    let transport = DiscordTransport::new(
        client.clone(),
        &config.discord_api_base,
        token,
        config.request_timeout(),
    )
    .context("Invalid Discord API configuration")?;

    let dispatcher = Dispatcher::new(
        Arc::new(transport),
        db.clone(),
        client.clone(),
        config.send_delay(),
    );
    let poller = Poller::new(
        build_sources(config, &client),
        dispatcher,
        db,
        config.poll_interval(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the poller
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    poller.run(shutdown_rx).await;
    println!("Goodbye!");
    Ok(())
}
