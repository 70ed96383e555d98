use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AppError, AppResult};

use super::integrity::{
    foreign_key_offenders, ForeignKeyOffender, IntegrityCheck, IntegrityReport, IntegrityVerifier,
};
use super::manifest::{self, RecoverableTable, RESTORE_MANIFEST};
use super::{quote_ident, write_atomic, DatabaseHandle};

const REPORT_PREFIX: &str = "restore-";
const REPORT_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup {} cannot be read: {source}", .path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: AppError,
    },
    #[error("target {} cannot be written: {source}", .path.display())]
    TargetUnwritable {
        path: PathBuf,
        #[source]
        source: AppError,
    },
    #[error("restore manifest does not match the target schema: {}", .issues.join("; "))]
    ManifestDrift { issues: Vec<String> },
}

impl RestoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RestoreError::SourceUnreadable { .. } => 6,
            RestoreError::TargetUnwritable { .. } => 7,
            RestoreError::ManifestDrift { .. } => 8,
        }
    }

    fn source_unreadable(path: &Path, source: AppError) -> Self {
        RestoreError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        }
    }

    fn target_unwritable(path: &Path, source: AppError) -> Self {
        RestoreError::TargetUnwritable {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Restored,
    Unreadable,
    WriteFailed,
    SkippedParentFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRestoreReport {
    pub table: String,
    pub status: TableStatus,
    pub rows_read: u64,
    pub rows_recovered: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl TableRestoreReport {
    fn new(table: &str, status: TableStatus) -> Self {
        Self {
            table: table.to_string(),
            status,
            rows_read: 0,
            rows_recovered: 0,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub source: PathBuf,
    pub target: PathBuf,
    pub outcome: RestoreOutcome,
    pub tables: Vec<TableRestoreReport>,
    pub integrity: IntegrityReport,
    #[serde(default)]
    pub foreign_key_offenders: Vec<ForeignKeyOffender>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RestoreReport {
    pub fn table(&self, name: &str) -> Option<&TableRestoreReport> {
        self.tables.iter().find(|table| table.table == name)
    }

    /// Writes the report as `restore-YYYYMMDD-HHMMSS.json` inside `dir`,
    /// creating the directory when needed.
    pub fn write_to_dir(&self, dir: &Path) -> AppResult<PathBuf> {
        fs::create_dir_all(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_report_dir")
                .with_context("path", dir.display().to_string())
        })?;
        let name = format!(
            "{REPORT_PREFIX}{}.json",
            self.completed_at.format(REPORT_STAMP_FORMAT)
        );
        let path = dir.join(name);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_restore_report")
                .with_context("path", path.display().to_string())
        })?;
        Ok(path)
    }
}

/// Rows pulled out of one source table, ready to be written.
struct TableRead {
    columns: Vec<&'static str>,
    rows: Vec<Vec<Value>>,
    warnings: Vec<String>,
}

enum WriteFailure {
    Target(AppError),
    Conflict(AppError),
}

/// Copies manifest tables from a backup into an existing database.
pub struct RecoveryEngine<V = IntegrityVerifier> {
    manifest: &'static [RecoverableTable],
    verifier: V,
}

impl RecoveryEngine<IntegrityVerifier> {
    pub fn new() -> Self {
        Self::with_verifier(RESTORE_MANIFEST, IntegrityVerifier::new())
    }
}

impl Default for RecoveryEngine<IntegrityVerifier> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: IntegrityCheck> RecoveryEngine<V> {
    pub fn with_verifier(manifest: &'static [RecoverableTable], verifier: V) -> Self {
        Self { manifest, verifier }
    }

    /// Restore every manifest table from `source` into `target`.
    ///
    /// The backup is opened read-only and never modified. The target must
    /// already exist with a schema matching the manifest. Each table is
    /// written in its own transaction with primary-key upserts, so running
    /// the same restore twice leaves the target unchanged.
    pub fn restore(&self, source: &Path, target: &Path) -> Result<RestoreReport, RestoreError> {
        let start = Instant::now();
        tracing::info!(
            target: "homedash",
            event = "restore_started",
            source = %source.display(),
            target_db = %target.display()
        );

        ensure_distinct(source, target)?;

        let src = open_source(source)?;
        let mut dest = DatabaseHandle::open_read_write(target)
            .map_err(|err| RestoreError::target_unwritable(target, err))?;

        let issues = manifest::validate_against(dest.conn(), self.manifest)
            .map_err(|err| RestoreError::target_unwritable(target, err))?;
        if !issues.is_empty() {
            tracing::error!(
                target: "homedash",
                event = "restore_manifest_drift",
                target_db = %target.display(),
                issues = issues.len()
            );
            return Err(RestoreError::ManifestDrift { issues });
        }

        let mut tables = Vec::with_capacity(self.manifest.len());
        let mut not_clean: HashSet<&'static str> = HashSet::new();
        let mut unreadable: Vec<(&'static str, AppError)> = Vec::new();

        for table in self.manifest {
            let read = read_table(src.conn(), table);

            if let Some(parent) = table.parent.filter(|parent| not_clean.contains(parent)) {
                // Still read so the report tells an intact dependent from a
                // damaged one; nothing is written.
                let mut report = TableRestoreReport::new(table.name, TableStatus::SkippedParentFailed);
                report
                    .warnings
                    .push(format!("parent table {parent} was not restored"));
                match read {
                    Ok(read) => report.rows_read = read.rows.len() as u64,
                    Err(err) => {
                        report.warnings.push(format!("table could not be read: {err}"));
                        unreadable.push((table.name, err));
                    }
                }
                log_table(&report);
                not_clean.insert(table.name);
                tables.push(report);
                continue;
            }

            let mut read = match read {
                Ok(read) => read,
                Err(err) => {
                    let mut report = TableRestoreReport::new(table.name, TableStatus::Unreadable);
                    report.warnings.push(format!("table could not be read: {err}"));
                    log_table(&report);
                    not_clean.insert(table.name);
                    unreadable.push((table.name, err));
                    tables.push(report);
                    continue;
                }
            };

            let mut report = TableRestoreReport::new(table.name, TableStatus::Restored);
            report.rows_read = read.rows.len() as u64;
            report.warnings = std::mem::take(&mut read.warnings);

            match write_table(dest.conn_mut(), table, &read) {
                Ok(written) => report.rows_recovered = written,
                Err(WriteFailure::Conflict(err)) => {
                    report.status = TableStatus::WriteFailed;
                    report.warnings.push(format!("write rolled back: {err}"));
                    not_clean.insert(table.name);
                }
                Err(WriteFailure::Target(err)) => {
                    log_table(&report);
                    return Err(RestoreError::target_unwritable(
                        target,
                        err.with_context("table", table.name),
                    ));
                }
            }
            log_table(&report);
            tables.push(report);
        }

        if !self.manifest.is_empty() && unreadable.len() == self.manifest.len() {
            return Err(RestoreError::source_unreadable(
                source,
                nothing_readable(unreadable),
            ));
        }

        let integrity = self.verifier.check(&dest);
        let offenders = match foreign_key_offenders(&dest) {
            Ok(offenders) => offenders,
            Err(err) => {
                tracing::warn!(
                    target: "homedash",
                    event = "restore_fk_check_failed",
                    target_db = %target.display(),
                    error = %err
                );
                Vec::new()
            }
        };

        if let Err(err) = src.close() {
            tracing::warn!(target: "homedash", event = "restore_source_close_failed", error = %err);
        }
        dest.close()
            .map_err(|err| RestoreError::target_unwritable(target, err))?;

        let outcome = if tables.iter().all(|table| table.status == TableStatus::Restored) {
            RestoreOutcome::Complete
        } else {
            RestoreOutcome::Partial
        };
        let report = RestoreReport {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            outcome,
            tables,
            integrity,
            foreign_key_offenders: offenders,
            completed_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        tracing::info!(
            target: "homedash",
            event = "restore_finished",
            outcome = ?report.outcome,
            integrity_passed = report.integrity.passed,
            fk_offenders = report.foreign_key_offenders.len(),
            duration_ms = report.duration_ms
        );
        Ok(report)
    }
}

fn nothing_readable(unreadable: Vec<(&'static str, AppError)>) -> AppError {
    let names: Vec<&str> = unreadable.iter().map(|(name, _)| *name).collect();
    let mut err = AppError::new(
        "DB_RESTORE/NOTHING_READABLE",
        format!("None of the {} manifest tables could be read from the backup", names.len()),
    )
    .with_context("tables", names.join(","));
    if let Some((_, first)) = unreadable.into_iter().next() {
        err = err.with_cause(first);
    }
    err
}

fn ensure_distinct(source: &Path, target: &Path) -> Result<(), RestoreError> {
    if let (Ok(a), Ok(b)) = (fs::canonicalize(source), fs::canonicalize(target)) {
        if a == b {
            return Err(RestoreError::target_unwritable(
                target,
                AppError::new(
                    "DB_RESTORE/SAME_FILE",
                    "Backup and target refer to the same database file",
                ),
            ));
        }
    }
    Ok(())
}

fn open_source(source: &Path) -> Result<DatabaseHandle, RestoreError> {
    let handle = DatabaseHandle::open_read_only(source)
        .map_err(|err| RestoreError::source_unreadable(source, err))?;
    handle
        .conn()
        .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|err| {
            RestoreError::source_unreadable(
                source,
                AppError::from(err).with_context("operation", "probe_schema"),
            )
        })?;
    Ok(handle)
}

fn read_table(src: &Connection, table: &RecoverableTable) -> AppResult<TableRead> {
    let schema = manifest::table_schema(src, table.name)
        .map_err(|err| AppError::from(err).with_context("operation", "read_source_schema"))?
        .ok_or_else(|| AppError::new("DB_RESTORE/TABLE_MISSING", "Table is missing from the backup"))?;

    let mut columns = Vec::with_capacity(table.columns.len());
    let mut warnings = Vec::new();
    for column in table.columns {
        if schema.has_column(column) {
            columns.push(*column);
        } else if table.is_key_column(column) {
            return Err(AppError::new(
                "DB_RESTORE/KEY_COLUMN_MISSING",
                format!("Primary key column {column} is missing from the backup"),
            ));
        } else {
            warnings.push(format!(
                "column {column} is absent from the backup; target default used"
            ));
        }
    }

    let sql = format!(
        "SELECT {} FROM {}",
        columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(table.name)
    );
    let mut stmt = src
        .prepare(&sql)
        .map_err(|err| AppError::from(err).with_context("operation", "prepare_select"))?;
    let mut rows = stmt
        .query([])
        .map_err(|err| AppError::from(err).with_context("operation", "query_select"))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| AppError::from(err).with_context("operation", "select_iter"))?
    {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value: Value = row.get(idx).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_value")
                    .with_context("column", columns[idx])
            })?;
            values.push(value);
        }
        out.push(values);
    }

    Ok(TableRead {
        columns,
        rows: out,
        warnings,
    })
}

fn build_upsert_sql(table: &RecoverableTable, columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
    let keys = table
        .primary_key
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|column| !table.is_key_column(column))
        .map(|column| {
            let quoted = quote_ident(column);
            format!("{quoted} = excluded.{quoted}")
        })
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({keys}) {action}",
        quote_ident(table.name),
        columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders.join(", "),
    )
}

/// Errors that mean the target itself cannot take writes, as opposed to a
/// row being rejected by a constraint.
fn is_target_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::ReadOnly
                | ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::PermissionDenied
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
        )
    )
}

fn classify(err: rusqlite::Error, operation: &str) -> WriteFailure {
    let target = is_target_failure(&err);
    let app = AppError::from(err).with_context("operation", operation);
    if target {
        WriteFailure::Target(app)
    } else {
        WriteFailure::Conflict(app)
    }
}

fn write_table(
    conn: &mut Connection,
    table: &RecoverableTable,
    read: &TableRead,
) -> Result<u64, WriteFailure> {
    let tx = conn.transaction().map_err(|err| {
        WriteFailure::Target(AppError::from(err).with_context("operation", "begin_table_tx"))
    })?;
    let mut written = 0u64;
    {
        let sql = build_upsert_sql(table, &read.columns);
        let mut insert = tx
            .prepare(&sql)
            .map_err(|err| classify(err, "prepare_upsert"))?;
        for row in &read.rows {
            insert
                .execute(params_from_iter(row.iter()))
                .map_err(|err| classify(err, "upsert_row"))?;
            written += 1;
        }
    }
    tx.commit().map_err(|err| {
        WriteFailure::Target(AppError::from(err).with_context("operation", "commit_table_tx"))
    })?;
    Ok(written)
}

fn log_table(report: &TableRestoreReport) {
    if report.status == TableStatus::Restored {
        tracing::info!(
            target: "homedash",
            event = "restore_table",
            table = %report.table,
            status = ?report.status,
            rows_read = report.rows_read,
            rows_recovered = report.rows_recovered,
            warnings = report.warnings.len()
        );
    } else {
        tracing::warn!(
            target: "homedash",
            event = "restore_table",
            table = %report.table,
            status = ?report.status,
            rows_read = report.rows_read,
            rows_recovered = report.rows_recovered,
            reason = report.warnings.last().map(String::as_str).unwrap_or("")
        );
    }
}
