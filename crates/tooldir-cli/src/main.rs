use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tooldir_core::ToolStatus;
use tooldir_storage::PgRecordStore;
use tooldir_sync::{maybe_build_scheduler, SyncConfig, SyncRuntime};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tooldir-cli")]
#[command(about = "Tool directory sync and link-health command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the catalog from the content store into the record store.
    Sync,
    /// Probe every tool website and apply the resulting statuses.
    Probe,
    /// List (or with --execute, delete) tools that stayed inactive long enough.
    Cleanup {
        #[arg(long)]
        execute: bool,
    },
    SetStatus {
        id: String,
        status: ToolStatus,
    },
    Migrate,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tooldir=info"));
    let json = std::env::var("TOOLDIR_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Commands that act on persisted lifecycle state need the database; the in-memory
/// fallback starts empty for every process.
fn require_database<'a>(config: &'a SyncConfig, command: &str) -> Result<&'a str> {
    match config.database_url.as_deref() {
        Some(url) => Ok(url),
        None => bail!("DATABASE_URL is required for {command}"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let runtime = SyncRuntime::from_config(config).await?;
            let report = runtime.sync_once().await?;
            println!(
                "sync complete: fetched={} invalid={} inserted={} updated={} unchanged={} skipped_purged={}",
                report.fetched, report.invalid, report.inserted, report.updated, report.unchanged, report.skipped_purged
            );
        }
        Commands::Probe => {
            let runtime = SyncRuntime::from_config(config).await?;
            if runtime.pg.is_none() {
                runtime.sync_once().await?;
            }
            let summary = runtime.probe_once().await?;
            println!(
                "probe complete: run_id={} probed={} skipped={} transitions={} reports={}",
                summary.run_id,
                summary.probed,
                summary.skipped_without_website,
                summary.apply.transitions,
                summary.reports_dir
            );
        }
        Commands::Cleanup { execute } => {
            require_database(&config, "cleanup")?;
            let runtime = SyncRuntime::from_config(config).await?;
            let report = runtime.cleanup(!execute).await?;
            print_json(&report)?;
            if !execute && !report.selected.is_empty() {
                eprintln!("dry run: re-run with --execute to delete {} tool(s)", report.selected.len());
            }
        }
        Commands::SetStatus { id, status } => {
            require_database(&config, "set-status")?;
            let runtime = SyncRuntime::from_config(config).await?;
            let tool = runtime.set_status(&id, status).await?;
            println!("{} is now {}", tool.id, tool.status);
        }
        Commands::Migrate => {
            let url = require_database(&config, "migrate")?;
            let store = PgRecordStore::connect(url).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let runtime = SyncRuntime::from_config(config).await?;
            let scheduler = maybe_build_scheduler(&runtime.config, runtime.health_job.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %runtime.config.probe_cron, "health check scheduler started");
            }
            tooldir_web::serve(runtime).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_commands_refuse_to_run_without_a_database() {
        let config = SyncConfig::default();
        let err = require_database(&config, "cleanup").unwrap_err();
        assert_eq!(err.to_string(), "DATABASE_URL is required for cleanup");

        let config = SyncConfig {
            database_url: Some("postgres://localhost/tooldir".into()),
            ..SyncConfig::default()
        };
        assert_eq!(require_database(&config, "set-status").unwrap(), "postgres://localhost/tooldir");
    }

    #[test]
    fn set_status_parses_the_status_argument() {
        let cli = Cli::try_parse_from(["tooldir-cli", "set-status", "rec1", "inactive"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::SetStatus { ref id, status: ToolStatus::Inactive }) if id == "rec1"
        ));
    }
}
