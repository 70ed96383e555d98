use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AppError;

use super::backup::{BackupRecord, BackupStore, PruneSummary};
use super::integrity::{IntegrityCheck, IntegrityReport, IntegrityVerifier};
use super::DatabaseHandle;

pub const DEFAULT_RETENTION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStep {
    Backup,
    Checkpoint,
    Verify,
    Sanity,
    Prune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Success,
    Warning,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStepReport {
    pub step: CheckpointStep,
    pub status: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEvent {
    pub step: CheckpointStep,
    pub status: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub type CheckpointObserver = Arc<dyn Fn(CheckpointEvent) + Send + Sync + 'static>;

const CHECKPOINT_STEPS: [CheckpointStep; 5] = [
    CheckpointStep::Backup,
    CheckpointStep::Checkpoint,
    CheckpointStep::Verify,
    CheckpointStep::Sanity,
    CheckpointStep::Prune,
];

/// Result row of `PRAGMA wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalCheckpoint {
    pub busy: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub db_path: PathBuf,
    pub backup: BackupRecord,
    pub wal_checkpoint: WalCheckpoint,
    pub integrity: IntegrityReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanity_row_count: Option<i64>,
    pub prune: PruneSummary,
    pub steps: Vec<CheckpointStepReport>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointOutcome {
    /// Nothing to protect yet; the database file has never been created.
    NoDatabase { db_path: PathBuf },
    Completed(CheckpointSummary),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("could not open database: {0}")]
    Open(#[source] AppError),
    #[error("backup failed: {0}")]
    BackupFailed(#[source] AppError),
    #[error("WAL checkpoint failed: {0}")]
    CheckpointFailed(#[source] AppError),
    #[error(
        "integrity check failed after checkpoint ({}); snapshot kept at {}",
        .report.summary(),
        .backup.path.display()
    )]
    IntegrityFailed {
        report: IntegrityReport,
        backup: BackupRecord,
    },
}

impl CheckpointError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckpointError::Open(_) => 2,
            CheckpointError::BackupFailed(_) => 3,
            CheckpointError::CheckpointFailed(_) => 4,
            CheckpointError::IntegrityFailed { .. } => 5,
        }
    }
}

struct StepTracker<'a> {
    steps: Vec<CheckpointStepReport>,
    observer: Option<&'a CheckpointObserver>,
}

impl<'a> StepTracker<'a> {
    fn new(observer: Option<&'a CheckpointObserver>) -> Self {
        let steps = CHECKPOINT_STEPS
            .iter()
            .copied()
            .map(|step| CheckpointStepReport {
                step,
                status: StepState::Pending,
                message: None,
            })
            .collect();
        Self { steps, observer }
    }

    fn emit(&mut self, step: CheckpointStep, status: StepState, message: Option<String>) {
        if let Some(report) = self.steps.iter_mut().find(|report| report.step == step) {
            report.status = status;
            report.message = message.clone();
        }
        if let Some(callback) = self.observer {
            callback(CheckpointEvent {
                step,
                status,
                message,
            });
        }
    }

    fn skip_remaining(&mut self) {
        let pending: Vec<_> = self
            .steps
            .iter()
            .filter(|report| report.status == StepState::Pending)
            .map(|report| report.step)
            .collect();
        for step in pending {
            self.emit(step, StepState::Skipped, None);
        }
    }
}

/// Backup, WAL checkpoint, integrity gate and retention in one pass.
///
/// Assumes it is the only writer to the database while it runs.
pub struct CheckpointCoordinator<V = IntegrityVerifier> {
    store: BackupStore,
    retention: usize,
    verifier: V,
    observer: Option<CheckpointObserver>,
}

impl CheckpointCoordinator<IntegrityVerifier> {
    pub fn new(store: BackupStore, retention: usize) -> Self {
        Self::with_verifier(store, retention, IntegrityVerifier::new())
    }
}

impl<V: IntegrityCheck> CheckpointCoordinator<V> {
    pub fn with_verifier(store: BackupStore, retention: usize, verifier: V) -> Self {
        Self {
            store,
            retention: retention.max(1),
            verifier,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: CheckpointObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(&self, db_path: &Path) -> Result<CheckpointOutcome, CheckpointError> {
        if !db_path.exists() {
            tracing::info!(
                target: "homedash",
                event = "checkpoint_skipped",
                reason = "no_database",
                path = %db_path.display()
            );
            return Ok(CheckpointOutcome::NoDatabase {
                db_path: db_path.to_path_buf(),
            });
        }

        let start = Instant::now();
        let mut tracker = StepTracker::new(self.observer.as_ref());
        let handle = DatabaseHandle::open_read_write(db_path).map_err(|err| {
            tracker.skip_remaining();
            CheckpointError::Open(err)
        })?;

        tracker.emit(
            CheckpointStep::Backup,
            StepState::Running,
            Some("Copying database with the online backup API".into()),
        );
        let backup = match self.store.create_backup(&handle) {
            Ok(record) => {
                tracker.emit(
                    CheckpointStep::Backup,
                    StepState::Success,
                    Some(format!("Snapshot stored at {}", record.path.display())),
                );
                record
            }
            Err(err) => {
                tracker.emit(
                    CheckpointStep::Backup,
                    StepState::Failed,
                    Some(err.message().to_string()),
                );
                tracker.skip_remaining();
                return Err(CheckpointError::BackupFailed(err));
            }
        };

        tracker.emit(CheckpointStep::Checkpoint, StepState::Running, None);
        let wal = match wal_checkpoint_truncate(&handle) {
            Ok(wal) => {
                tracker.emit(
                    CheckpointStep::Checkpoint,
                    StepState::Success,
                    Some(format!(
                        "{} of {} WAL frames checkpointed",
                        wal.checkpointed_frames, wal.log_frames
                    )),
                );
                wal
            }
            Err(err) => {
                tracker.emit(
                    CheckpointStep::Checkpoint,
                    StepState::Failed,
                    Some(err.message().to_string()),
                );
                tracker.skip_remaining();
                return Err(CheckpointError::CheckpointFailed(err));
            }
        };

        tracker.emit(CheckpointStep::Verify, StepState::Running, None);
        let integrity = self.verifier.check(&handle);
        if !integrity.passed {
            tracker.emit(
                CheckpointStep::Verify,
                StepState::Failed,
                Some(integrity.summary()),
            );
            tracker.skip_remaining();
            return Err(CheckpointError::IntegrityFailed {
                report: integrity,
                backup,
            });
        }
        tracker.emit(
            CheckpointStep::Verify,
            StepState::Success,
            Some(format!("integrity_check ok in {} ms", integrity.duration_ms)),
        );

        tracker.emit(CheckpointStep::Sanity, StepState::Running, None);
        let sanity_row_count = match count_users(&handle) {
            Ok(count) => {
                tracker.emit(
                    CheckpointStep::Sanity,
                    StepState::Success,
                    Some(format!("{count} user rows")),
                );
                Some(count)
            }
            Err(err) => {
                tracing::warn!(
                    target: "homedash",
                    event = "sanity_count_unavailable",
                    path = %db_path.display(),
                    error = %err
                );
                tracker.emit(
                    CheckpointStep::Sanity,
                    StepState::Warning,
                    Some(err.to_string()),
                );
                None
            }
        };

        if let Err(err) = handle.close() {
            tracing::warn!(
                target: "homedash",
                event = "checkpoint_close_failed",
                path = %db_path.display(),
                error = %err
            );
        }

        tracker.emit(CheckpointStep::Prune, StepState::Running, None);
        let prune = self.store.prune(self.retention);
        if prune.failed.is_empty() {
            tracker.emit(
                CheckpointStep::Prune,
                StepState::Success,
                Some(format!(
                    "kept {}, removed {}",
                    prune.kept.len(),
                    prune.removed.len()
                )),
            );
        } else {
            tracker.emit(
                CheckpointStep::Prune,
                StepState::Warning,
                Some(format!("{} snapshot(s) could not be removed", prune.failed.len())),
            );
        }

        let summary = CheckpointSummary {
            db_path: db_path.to_path_buf(),
            backup,
            wal_checkpoint: wal,
            integrity,
            sanity_row_count,
            prune,
            steps: tracker.steps,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            target: "homedash",
            event = "checkpoint_complete",
            path = %db_path.display(),
            backup = %summary.backup.path.display(),
            duration_ms = summary.duration_ms
        );
        Ok(CheckpointOutcome::Completed(summary))
    }
}

/// Merge the WAL into the main file and truncate it. A busy result means
/// readers kept the WAL pinned and the base file alone is not complete.
fn wal_checkpoint_truncate(handle: &DatabaseHandle) -> Result<WalCheckpoint, AppError> {
    let wal = handle
        .conn()
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok(WalCheckpoint {
                busy: row.get(0)?,
                log_frames: row.get(1)?,
                checkpointed_frames: row.get(2)?,
            })
        })
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "wal_checkpoint")
                .with_context("path", handle.path().display().to_string())
        })?;

    tracing::info!(
        target: "homedash",
        event = "wal_checkpoint",
        path = %handle.path().display(),
        busy = wal.busy,
        log_frames = wal.log_frames,
        checkpointed_frames = wal.checkpointed_frames
    );

    if wal.busy != 0 {
        return Err(
            AppError::new("DB_CHECKPOINT/BUSY", "WAL checkpoint could not complete")
                .with_context("log_frames", wal.log_frames.to_string())
                .with_context("checkpointed_frames", wal.checkpointed_frames.to_string()),
        );
    }
    Ok(wal)
}

fn count_users(handle: &DatabaseHandle) -> Result<i64, AppError> {
    handle
        .conn()
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .map_err(|err| AppError::from(err).with_context("operation", "sanity_count"))
}
