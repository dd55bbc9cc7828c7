//! roster-import - command-line front end for the roster import engine
//!
//! Imports a student or class-list spreadsheet into the roster database and
//! prints the result as JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use roster_common::db::init::init_database;
use roster_common::{ActorId, EventBus};
use roster_import::audit::{EventBusAuditSink, SqliteAuditLog};
use roster_import::{ImportService, RosterStore, StudentInput};
use tracing::{error, info};

/// Command-line arguments for roster-import
#[derive(Parser, Debug)]
#[command(name = "roster-import")]
#[command(about = "Bulk import and reconciliation of school rosters")]
#[command(version)]
struct Args {
    /// Root folder holding the roster database
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides root folder and config)
    #[arg(long, global = true, env = "ROSTER_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a student spreadsheet
    Students {
        file: PathBuf,
        /// Id of the user performing the import
        #[arg(long)]
        actor: ActorId,
    },
    /// Import a class-list spreadsheet
    Classes {
        file: PathBuf,
        #[arg(long)]
        actor: ActorId,
    },
    /// Create or update one student by national id
    Student {
        #[arg(long)]
        name: String,
        #[arg(long)]
        national_id: String,
        #[arg(long)]
        local_id: String,
        /// Existing class the student belongs to
        #[arg(long = "class")]
        class: String,
        #[arg(long)]
        actor: ActorId,
    },
    /// Soft-delete a student by national id
    Remove {
        national_id: String,
        #[arg(long)]
        actor: ActorId,
    },
    /// Show the most recent audit log entries
    Audit {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load_or_default(args.config.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting roster-import v{}", env!("CARGO_PKG_VERSION"));

    let db_path = match &args.database {
        Some(path) => path.clone(),
        None => {
            let root_folder = RootFolderResolver::new()
                .with_cli_arg(args.root_folder.clone())
                .with_toml(&config)
                .resolve();
            let initializer = RootFolderInitializer::new(root_folder);
            initializer.ensure_directory_exists()?;
            config.resolve_database_path(initializer.root_folder())
        }
    };
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let audit_log = SqliteAuditLog::new(pool.clone());

    if let Command::Audit { limit } = args.command {
        let entries = audit_log.recent(limit).await?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    // Every audit event goes through the bus; the writer drains it into audit_log
    let bus = EventBus::new(config.import.event_capacity);
    let writer = audit_log.spawn_writer(bus.subscribe());

    let service = ImportService::new(
        RosterStore::new(pool.clone(), config.import.max_rows_per_statement),
        Arc::new(EventBusAuditSink::new(bus.clone())),
        config.import.clone(),
    );

    let outcome = run(&service, args.command).await;

    drop(service);
    drop(bus);
    if let Err(e) = writer.await {
        error!("Audit writer stopped abnormally: {}", e);
    }
    pool.close().await;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run(service: &ImportService, command: Command) -> Result<serde_json::Value> {
    let value = match command {
        Command::Students { file, actor } => {
            let bytes = read_input(&file).await?;
            let result = service
                .import_batch(&bytes, actor)
                .await
                .with_context(|| format!("Student import from {} failed", file.display()))?;
            serde_json::to_value(result)?
        }
        Command::Classes { file, actor } => {
            let bytes = read_input(&file).await?;
            let result = service
                .import_groups(&bytes, actor)
                .await
                .with_context(|| format!("Class import from {} failed", file.display()))?;
            serde_json::to_value(result)?
        }
        Command::Student {
            name,
            national_id,
            local_id,
            class,
            actor,
        } => {
            let input = StudentInput {
                name,
                national_id: national_id.clone(),
                local_id,
                group_name: class,
            };
            let saved = service
                .upsert_student(input, actor)
                .await
                .with_context(|| format!("Saving student {} failed", national_id))?;
            serde_json::to_value(saved)?
        }
        Command::Remove { national_id, actor } => {
            let student = service
                .remove_student(&national_id, actor)
                .await
                .with_context(|| format!("Removing student {} failed", national_id))?;
            serde_json::to_value(student)?
        }
        Command::Audit { .. } => serde_json::Value::Null,
    };
    Ok(value)
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_command_parses() {
        let args = Args::try_parse_from([
            "roster-import",
            "student",
            "--name",
            "Ana",
            "--national-id",
            "111",
            "--local-id",
            "S1",
            "--class",
            "10A",
            "--actor",
            "7",
        ])
        .unwrap();

        match args.command {
            Command::Student {
                name,
                national_id,
                local_id,
                class,
                actor,
            } => {
                assert_eq!(name, "Ana");
                assert_eq!(national_id, "111");
                assert_eq!(local_id, "S1");
                assert_eq!(class, "10A");
                assert_eq!(actor, 7);
            }
            other => panic!("Expected Student, got {:?}", other),
        }
    }

    #[test]
    fn test_student_command_requires_class() {
        let result = Args::try_parse_from([
            "roster-import",
            "student",
            "--name",
            "Ana",
            "--national-id",
            "111",
            "--local-id",
            "S1",
            "--actor",
            "7",
        ]);
        assert!(result.is_err());
    }
}
