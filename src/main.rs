use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use loanwatch::config::Config;
use loanwatch::feed::FeedFetcher;
use loanwatch::refresh::{RefreshOutcome, RefreshSettings, Refresher};
use loanwatch::storage::{Database, DatabaseError};

/// Get the config directory path (~/.config/loanwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("loanwatch");
    Ok(config_dir)
}

/// Create the config directory with user-only permissions.
fn ensure_config_dir(config_dir: &std::path::Path) -> Result<()> {
    if config_dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "loanwatch",
    version,
    about = "Due-date summary of borrowed library items from the library's RSS feed"
)]
struct Args {
    /// RSS feed URL of the library account (overrides the config file)
    #[arg(short = 'u', long = "url", value_name = "RSS-URL")]
    url: Option<String>,

    /// Database file (overrides the config file)
    #[arg(short = 'd', long = "db", value_name = "DB-FILE")]
    db: Option<PathBuf>,

    /// Config file [default: ~/.config/loanwatch/config.toml]
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Refresh even if the last refresh is recent
    #[arg(long)]
    force: bool,

    /// Print the stored records after the counts
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_dir = get_config_dir()?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config file '{}'", config_path.display()))?;

    // CLI flags override file values
    if let Some(url) = args.url {
        config.feed_url = Some(url);
    }
    if let Some(db) = args.db {
        config.database = Some(db);
    }

    let settings = RefreshSettings::from_config(&config).context("Invalid configuration")?;

    if config.database.is_none() {
        ensure_config_dir(&config_dir)?;
    }
    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: The database at {} is locked by another process. Please try again later.",
                db_path.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let fetcher =
        FeedFetcher::new(config.max_feed_bytes).context("Failed to create HTTP client")?;
    let refresher = Refresher::new(db.clone(), fetcher, settings);

    let report = refresher
        .poll(args.force)
        .await
        .context("Failed to read loan counts")?;

    match &report.refresh {
        Ok(RefreshOutcome::Refreshed { records }) => {
            tracing::debug!(records = records, "Refresh complete");
        }
        Ok(RefreshOutcome::Skipped) => {}
        Err(e) => eprintln!("Warning: refresh failed, showing stored loans: {}", e),
    }

    println!("{}", report.counts);

    if args.list {
        let records = db.records().await.context("Failed to list records")?;
        for record in records {
            println!(
                "{}  {}  {}",
                record.due_date,
                record.title,
                record.url.as_deref().unwrap_or("-")
            );
        }
    }

    db.close().await;
    Ok(())
}
