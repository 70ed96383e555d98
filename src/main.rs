use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use homedash_lib::config::{self, ConfigOverrides, ToolkitConfig};
use homedash_lib::db::backup::{BackupStore, PruneSummary};
use homedash_lib::db::checkpoint::{
    CheckpointCoordinator, CheckpointEvent, CheckpointObserver, CheckpointOutcome, CheckpointStep,
    StepState,
};
use homedash_lib::db::integrity::{
    foreign_key_offenders, ForeignKeyOffender, IntegrityCheck, IntegrityReport, IntegrityVerifier,
};
use homedash_lib::db::restore::{RecoveryEngine, RestoreOutcome, RestoreReport, TableStatus};
use homedash_lib::db::DatabaseHandle;
use homedash_lib::logging::{self, LogFormat, LogOptions};
use homedash_lib::tokens::TokenInvalidator;

const EXIT_OPEN_FAILED: i32 = 2;
const EXIT_INTEGRITY_FAILED: i32 = 5;

#[derive(Debug, Parser)]
#[command(
    name = "homedash",
    about = "Backup, checkpoint and recovery tooling for the homedash database",
    version
)]
struct Cli {
    /// Database file to operate on.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Directory holding rotated backups.
    #[arg(long, global = true, value_name = "DIR")]
    backup_dir: Option<PathBuf>,
    /// Number of backups kept after pruning (1-100).
    #[arg(long, global = true, value_name = "N")]
    retention: Option<usize>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Also write JSON logs to a daily-rolling file in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance and recovery commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Stored third-party credential commands.
    #[command(subcommand)]
    Tokens(TokensCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Back up, checkpoint and verify the database, then prune old backups.
    Checkpoint {
        /// Emit the summary as JSON instead of step lines.
        #[arg(long)]
        json: bool,
    },
    /// Copy every recoverable table from a backup into an existing database.
    Restore {
        /// Backup file to read from. Opened read-only.
        #[arg(long, value_name = "BACKUP")]
        from: PathBuf,
        /// Database to restore into; defaults to the configured database.
        #[arg(long, value_name = "DB")]
        target: Option<PathBuf>,
        /// Write the report as restore-<timestamp>.json into this directory.
        #[arg(long, value_name = "DIR")]
        report_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the integrity check against a database or backup file.
    Verify {
        /// File to verify; defaults to the configured database.
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List backups, newest first.
    Backups {
        #[arg(long)]
        json: bool,
    },
    /// Delete backups beyond the retention count.
    Prune,
}

#[derive(Debug, Subcommand)]
enum TokensCommand {
    /// Clear every stored Google token so all accounts must reconnect.
    Clear {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_guard = match logging::init(&LogOptions {
        format: cli.log_format,
        dir: cli.log_dir.clone(),
        filter: std::env::var(config::ENV_LOG).ok(),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    drop(log_guard);
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let overrides = ConfigOverrides {
        db_path: cli.db,
        backup_dir: cli.backup_dir,
        retention: cli.retention,
    };
    let config = ToolkitConfig::from_env(&overrides).context("resolve configuration")?;
    tracing::debug!(
        target: "homedash",
        event = "config_resolved",
        db = %config.db_path.display(),
        backup_dir = %config.backup_dir.display(),
        retention = config.retention
    );

    match cli.command {
        Commands::Db(command) => handle_db_command(&config, command),
        Commands::Tokens(TokensCommand::Clear { json }) => handle_tokens_clear(&config, json),
    }
}

fn handle_db_command(config: &ToolkitConfig, command: DbCommand) -> Result<i32> {
    match command {
        DbCommand::Checkpoint { json } => handle_checkpoint(config, json),
        DbCommand::Restore {
            from,
            target,
            report_dir,
            json,
        } => handle_restore(config, from, target, report_dir, json),
        DbCommand::Verify { path, json } => handle_verify(config, path, json),
        DbCommand::Backups { json } => handle_backups(config, json),
        DbCommand::Prune => handle_prune(config),
    }
}

fn handle_checkpoint(config: &ToolkitConfig, emit_json: bool) -> Result<i32> {
    let store = BackupStore::new(&config.backup_dir);
    let mut coordinator = CheckpointCoordinator::new(store, config.retention);
    if !emit_json {
        let printer: CheckpointObserver = Arc::new(|event: CheckpointEvent| {
            if event.status == StepState::Pending {
                return;
            }
            let label = cli_step_label(event.step);
            let status_label = cli_status_label(event.status);
            match event.message {
                Some(msg) => println!("{label:<12} {status_label:<9} {msg}"),
                None => println!("{label:<12} {status_label:<9}"),
            }
        });
        coordinator = coordinator.with_observer(printer);
    }

    match coordinator.run(&config.db_path) {
        Ok(outcome) => {
            if emit_json {
                print_json(&outcome)?;
                return Ok(0);
            }
            match outcome {
                CheckpointOutcome::NoDatabase { db_path } => {
                    println!(
                        "No database at {}; nothing to checkpoint.",
                        db_path.display()
                    );
                }
                CheckpointOutcome::Completed(summary) => {
                    println!();
                    println!("Checkpoint complete.");
                    println!("Backup     : {}", summary.backup.path.display());
                    if let Some(count) = summary.sanity_row_count {
                        println!("Users      : {count}");
                    }
                    print_prune_summary(&summary.prune);
                    println!(
                        "Elapsed    : {:.2} seconds",
                        summary.duration_ms as f64 / 1000.0
                    );
                }
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("Error: {err}");
            Ok(err.exit_code())
        }
    }
}

fn handle_restore(
    config: &ToolkitConfig,
    from: PathBuf,
    target: Option<PathBuf>,
    report_dir: Option<PathBuf>,
    emit_json: bool,
) -> Result<i32> {
    let target = target.unwrap_or_else(|| config.db_path.clone());
    let report = match RecoveryEngine::new().restore(&from, &target) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(err.exit_code());
        }
    };

    let written = match &report_dir {
        Some(dir) => Some(
            report
                .write_to_dir(dir)
                .with_context(|| format!("write restore report into {}", dir.display()))?,
        ),
        None => None,
    };

    if emit_json {
        print_json(&report)?;
    } else {
        print_restore_table(&report);
        if let Some(path) = written {
            println!("Report written to {}", path.display());
        }
    }
    Ok(0)
}

fn handle_verify(config: &ToolkitConfig, path: Option<PathBuf>, emit_json: bool) -> Result<i32> {
    let path = path.unwrap_or_else(|| config.db_path.clone());
    let handle = match DatabaseHandle::open_read_only(&path) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(EXIT_OPEN_FAILED);
        }
    };
    let report = IntegrityVerifier::new().check(&handle);
    let offenders = if report.passed {
        foreign_key_offenders(&handle).context("run foreign key check")?
    } else {
        Vec::new()
    };
    handle.close().context("close database")?;

    if emit_json {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct VerifyPayload<'a> {
            path: &'a Path,
            integrity: &'a IntegrityReport,
            foreign_key_offenders: &'a [ForeignKeyOffender],
        }
        print_json(&VerifyPayload {
            path: &path,
            integrity: &report,
            foreign_key_offenders: &offenders,
        })?;
    } else {
        println!("Integrity check for {}", path.display());
        println!(
            "Result       : {}",
            if report.passed { "ok" } else { "FAILED" }
        );
        println!("Duration (ms): {}", report.duration_ms);
        for anomaly in &report.anomalies {
            println!("  - {}", anomaly.replace('\n', " "));
        }
        if offenders.is_empty() {
            println!("Foreign key offenders: none");
        } else {
            println!("Foreign key offenders:");
            println!("{:<20} {:>10}  Parent", "Table", "RowID");
            for offender in &offenders {
                let rowid = offender
                    .rowid
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:>10}  {}", offender.table, rowid, offender.parent);
            }
        }
    }

    Ok(if report.passed { 0 } else { EXIT_INTEGRITY_FAILED })
}

fn handle_backups(config: &ToolkitConfig, emit_json: bool) -> Result<i32> {
    let store = BackupStore::new(&config.backup_dir);
    let records = store.list().context("list backups")?;

    if emit_json {
        print_json(&records)?;
        return Ok(0);
    }
    if records.is_empty() {
        println!("No backups in {}", store.dir().display());
        return Ok(0);
    }
    println!("{:<20} {:>12}  Path", "Key", "Size (bytes)");
    for record in &records {
        println!(
            "{:<20} {:>12}  {}",
            record.key.to_string(),
            record.size_bytes,
            record.path.display()
        );
    }
    Ok(0)
}

fn handle_prune(config: &ToolkitConfig) -> Result<i32> {
    let store = BackupStore::new(&config.backup_dir);
    let summary = store.prune(config.retention);
    print_prune_summary(&summary);
    Ok(0)
}

fn handle_tokens_clear(config: &ToolkitConfig, emit_json: bool) -> Result<i32> {
    let handle = match DatabaseHandle::open_read_write(&config.db_path) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(EXIT_OPEN_FAILED);
        }
    };
    let cleared = TokenInvalidator::new()
        .clear_all(&handle)
        .context("clear stored tokens")?;
    handle.close().context("close database")?;

    if emit_json {
        print_json(&cleared)?;
    } else if cleared.count == 0 {
        println!("No stored tokens to clear.");
    } else {
        let ids: Vec<String> = cleared.affected_ids.iter().map(i64::to_string).collect();
        println!(
            "Cleared tokens for {} account(s): {}",
            cleared.count,
            ids.join(", ")
        );
    }
    Ok(0)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn print_prune_summary(summary: &PruneSummary) {
    println!(
        "Pruned     : kept {}, removed {}",
        summary.kept.len(),
        summary.removed.len()
    );
    for failure in &summary.failed {
        println!(
            "  could not remove {}: {}",
            failure.path.display(),
            failure.error
        );
    }
}

fn print_restore_table(report: &RestoreReport) {
    println!(
        "Restore from {} into {}",
        report.source.display(),
        report.target.display()
    );
    println!(
        "{:<16} {:<22} {:>8} {:>10}  Warnings",
        "Table", "Status", "Read", "Recovered"
    );
    for table in &report.tables {
        let status = table_status_label(table.status);
        let warnings = if table.warnings.is_empty() {
            "-".to_string()
        } else {
            table.warnings.join("; ")
        };
        println!(
            "{:<16} {:<22} {:>8} {:>10}  {}",
            table.table, status, table.rows_read, table.rows_recovered, warnings
        );
    }
    println!();
    println!(
        "Outcome      : {}",
        match report.outcome {
            RestoreOutcome::Complete => "complete",
            RestoreOutcome::Partial => "partial",
        }
    );
    println!("Integrity    : {}", report.integrity.summary());
    println!("FK offenders : {}", report.foreign_key_offenders.len());
}

fn table_status_label(status: TableStatus) -> &'static str {
    match status {
        TableStatus::Restored => "restored",
        TableStatus::Unreadable => "unreadable",
        TableStatus::WriteFailed => "write_failed",
        TableStatus::SkippedParentFailed => "skipped_parent_failed",
    }
}

fn cli_step_label(step: CheckpointStep) -> &'static str {
    match step {
        CheckpointStep::Backup => "Backup",
        CheckpointStep::Checkpoint => "Checkpoint",
        CheckpointStep::Verify => "Verify",
        CheckpointStep::Sanity => "Sanity",
        CheckpointStep::Prune => "Prune",
    }
}

fn cli_status_label(state: StepState) -> &'static str {
    match state {
        StepState::Pending => "pending",
        StepState::Running => "running",
        StepState::Success => "success",
        StepState::Warning => "warning",
        StepState::Skipped => "skipped",
        StepState::Failed => "failed",
    }
}
