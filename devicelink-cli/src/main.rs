use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devicelink_core::database::shared;
use devicelink_core::jobs::CancelOutcome;
use devicelink_core::platform::get_default_config_path;
use devicelink_core::service::{HttpAccountManager, NoPushToken};
use devicelink_core::{
    AccountHandle, Database, JobQueue, LinkConfig, LinkingCoordinator, LinkingEvent,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Device Link CLI - link this machine as a secondary device
#[derive(Parser)]
#[command(name = "devicelink")]
#[command(about = "Link a secondary device and inspect its sync queue", long_about = None)]
struct Cli {
    /// Config file (TOML). Defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Account-management service URL
    #[arg(long, global = true)]
    service_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link to an existing account by scanning a provisioning URI on the primary device
    ///
    /// Linking queues the initial sync jobs but does not run them. They are
    /// dispatched by a host that starts a `JobRunner` with a messaging
    /// transport and reports network availability to the queue.
    Link,

    /// Show the local account state
    Status,

    /// Inspect the job queue
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List queued jobs
    List,

    /// Cancel a queued job
    Cancel {
        /// Job ID
        id: Uuid,
    },
}

fn load_config(cli: &Cli) -> Result<LinkConfig> {
    let mut config = match &cli.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let path = get_default_config_path();
            if path.exists() {
                LinkConfig::load(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?
            } else {
                LinkConfig::default()
            }
        }
    };

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(url) = &cli.service_url {
        config.service_url = url.clone();
    }
    Ok(config)
}

fn open_database(config: &LinkConfig) -> Result<Database> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::create_dir_all(&config.cache_dir)
        .with_context(|| format!("creating {}", config.cache_dir.display()))?;
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Link => link(config).await,
        Commands::Status => status(&config),
        Commands::Jobs { command } => jobs(&config, command),
    }
}

async fn link(config: LinkConfig) -> Result<()> {
    let db = shared(open_database(&config)?);
    let account = AccountHandle::load(&db)?;
    if account.is_linked() {
        warn!("This device is already linked; linking again replaces its identity");
    }

    let queue = JobQueue::new(db.clone(), &config)?;
    let manager = Arc::new(HttpAccountManager::new(&config)?);
    let coordinator = LinkingCoordinator::new(
        db,
        account,
        queue.clone(),
        Arc::new(config),
        manager,
        Arc::new(NoPushToken),
    );

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LinkingEvent::ProvisioningUri(uri) => {
                    println!("Scan this on the primary device:");
                    println!("  {}", uri);
                }
                LinkingEvent::Linked { .. } | LinkingEvent::Failed(_) => break,
            }
        }
    });

    let result = tokio::select! {
        result = coordinator.link() => result,
        _ = tokio::signal::ctrl_c() => {
            coordinator.cancel()?;
            println!("Linking cancelled");
            printer.abort();
            return Ok(());
        }
    };
    printer.abort();

    let identity = result.context("linking failed")?;
    info!("Linking complete");
    println!(
        "Linked as device {} of {}",
        identity.device_id, identity.account_id
    );
    println!("{}", pending_jobs_notice(queue.len()?));
    Ok(())
}

fn status(config: &LinkConfig) -> Result<()> {
    let db = shared(open_database(config)?);
    let state = AccountHandle::load(&db)?.snapshot();
    let queue = JobQueue::new(db, config)?;

    match &state.identity {
        Some(identity) if state.is_linked() => {
            println!("Linked: yes");
            println!("Account: {}", identity.account_id);
            println!("Device ID: {}", identity.device_id);
            println!("Registration ID: {}", identity.registration_id);
            println!(
                "Identity key: {}",
                identity.identity_key_pair.public_key().to_hex()
            );
        }
        _ => println!("Linked: no"),
    }
    println!("Push disabled: {}", state.push_disabled);
    if let Some(linked_at) = state.linked_at {
        println!("Linked at: {}", format_millis(linked_at));
    }
    println!("Queued jobs: {}", queue.len()?);
    Ok(())
}

fn jobs(config: &LinkConfig, command: JobsCommand) -> Result<()> {
    let db = shared(open_database(config)?);
    let queue = JobQueue::new(db, config)?;

    match command {
        JobsCommand::List => {
            let records = queue.list()?;
            if records.is_empty() {
                println!("No queued jobs");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:<28} attempts {}/{}  next run {}",
                    record.id,
                    record.factory_key,
                    record.attempt_count,
                    record.max_attempts,
                    format_millis(record.next_run_at)
                );
            }
        }
        JobsCommand::Cancel { id } => match queue.cancel(&id.to_string())? {
            CancelOutcome::Canceled => println!("Cancelled {}", id),
            CancelOutcome::Deferred => {
                println!("{} is running; it will be cancelled when it finishes", id)
            }
        },
    }
    Ok(())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn pending_jobs_notice(queued: usize) -> String {
    format!(
        "{} jobs queued; they run once a host with a messaging transport drives the job queue",
        queued
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_link_help_says_jobs_need_a_host() {
        let mut command = Cli::command();
        let link = command.find_subcommand_mut("link").unwrap();
        let help = link.render_long_help().to_string();
        assert!(help.contains("JobRunner"));
        assert!(pending_jobs_notice(5).starts_with("5 jobs queued"));
    }

    #[test]
    fn test_global_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "devicelink",
            "--database",
            "/tmp/devicelink-test.db",
            "--service-url",
            "https://staging.example.org",
            "status",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/devicelink-test.db"));
        assert_eq!(config.service_url, "https://staging.example.org");
    }
}
