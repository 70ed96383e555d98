use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use fs2::available_space;
use rusqlite::{backup::Backup, Connection};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

use super::{sidecar_path, sync_dir, DatabaseHandle};

pub const BACKUP_PREFIX: &str = "homedash-";
pub const BACKUP_EXTENSION: &str = ".sqlite3";
const PARTIAL_SUFFIX: &str = ".partial";
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const STAMP_LEN: usize = 15;
const MAX_SAME_SECOND: u8 = 99;
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const PAGES_PER_STEP: i32 = 256;
const STEP_PAUSE: Duration = Duration::from_millis(25);

/// Second-resolution UTC timestamp plus a same-second sequence number.
///
/// Renders as `YYYYMMDD-HHMMSS` or `YYYYMMDD-HHMMSS-NN`; the string form
/// sorts the same way as the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BackupKey {
    stamp: String,
    seq: u8,
}

impl BackupKey {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            stamp: timestamp.format(STAMP_FORMAT).to_string(),
            seq: 0,
        }
    }

    fn with_seq(&self, seq: u8) -> Self {
        Self {
            stamp: self.stamp.clone(),
            seq,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if !value.is_ascii() {
            return None;
        }
        let (stamp, seq) = match value.len() {
            STAMP_LEN => (value, 0),
            len if len == STAMP_LEN + 3 => {
                let (stamp, rest) = value.split_at(STAMP_LEN);
                let digits = rest.strip_prefix('-')?;
                if !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let seq: u8 = digits.parse().ok()?;
                if seq == 0 {
                    return None;
                }
                (stamp, seq)
            }
            _ => return None,
        };
        if !valid_stamp(stamp) {
            return None;
        }
        Some(Self {
            stamp: stamp.to_string(),
            seq,
        })
    }
}

fn valid_stamp(stamp: &str) -> bool {
    let bytes = stamp.as_bytes();
    if bytes.len() != STAMP_LEN || bytes[8] != b'-' {
        return false;
    }
    if !bytes
        .iter()
        .enumerate()
        .all(|(idx, b)| idx == 8 || b.is_ascii_digit())
    {
        return false;
    }
    let field = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().unwrap_or(u32::MAX);
    NaiveDate::from_ymd_opt(field(0..4) as i32, field(4..6), field(6..8))
        .and_then(|date| date.and_hms_opt(field(9..11), field(11..13), field(13..15)))
        .is_some()
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            f.write_str(&self.stamp)
        } else {
            write!(f, "{}-{:02}", self.stamp, self.seq)
        }
    }
}

impl From<BackupKey> for String {
    fn from(key: BackupKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for BackupKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BackupKey::parse(&value).ok_or_else(|| format!("invalid backup key: {value}"))
    }
}

pub fn backup_file_name(key: &BackupKey) -> String {
    format!("{BACKUP_PREFIX}{key}{BACKUP_EXTENSION}")
}

fn parse_backup_file_name(name: &str) -> Option<BackupKey> {
    let key = name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(BACKUP_EXTENSION)?;
    BackupKey::parse(key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub path: PathBuf,
    #[serde(rename = "timestampKey")]
    pub key: BackupKey,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneSummary {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<PruneFailure>,
}

pub type FreeSpaceProbe = fn(&Path) -> io::Result<u64>;

/// Directory of hot-backup snapshots named `homedash-<key>.sqlite3`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    free_space: FreeSpaceProbe,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            free_space: disk_free_space,
        }
    }

    pub fn with_free_space_probe(mut self, probe: FreeSpaceProbe) -> Self {
        self.free_space = probe;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the database behind `handle` into a new snapshot with the
    /// SQLite online-backup API.
    ///
    /// The copy runs in bounded page steps and sleeps between them, so
    /// concurrent writers on the source keep making progress. The snapshot
    /// is written to a `.partial` file and only renamed into place once it
    /// is complete, so an interrupted copy never matches the naming
    /// convention.
    pub fn create_backup(&self, handle: &DatabaseHandle) -> AppResult<BackupRecord> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::new(
                "DB_BACKUP/DIR_UNWRITABLE",
                "Unable to create the backup directory",
            )
            .with_context("path", self.dir.display().to_string())
            .with_cause(err)
        })?;

        self.ensure_free_space(handle.path())?;

        let (key, final_path) = self.allocate(Utc::now())?;
        let partial = partial_path(&final_path);

        if let Err(err) = run_hot_backup(handle.conn(), &partial) {
            remove_with_sidecars(&partial);
            return Err(AppError::new("DB_BACKUP/COPY_FAILED", "Hot backup copy failed")
                .with_context("path", partial.display().to_string())
                .with_cause(err));
        }

        if let Err(err) = fs::rename(&partial, &final_path) {
            remove_with_sidecars(&partial);
            return Err(
                AppError::new("DB_BACKUP/FINALIZE_FAILED", "Unable to finalize backup file")
                    .with_context("from", partial.display().to_string())
                    .with_context("to", final_path.display().to_string())
                    .with_cause(err),
            );
        }
        sync_dir(&self.dir).ok();

        let size_bytes = fs::metadata(&final_path).map(|meta| meta.len()).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "backup_metadata")
                .with_context("path", final_path.display().to_string())
        })?;

        tracing::info!(
            target: "homedash",
            event = "backup_created",
            path = %final_path.display(),
            key = %key,
            size_bytes
        );

        Ok(BackupRecord {
            path: final_path,
            key,
            size_bytes,
        })
    }

    /// Snapshots in this directory, newest first.
    pub fn list(&self) -> AppResult<Vec<BackupRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_backups_dir")
                .with_context("path", self.dir.display().to_string())
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(target: "homedash", event = "skip_invalid_backup_entry", error = %err);
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(parse_backup_file_name) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            records.push(BackupRecord {
                path: entry.path(),
                key,
                size_bytes,
            });
        }

        records.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(records)
    }

    /// Keep the `retention` newest snapshots and delete the rest.
    ///
    /// Failures are logged and reported in the summary; snapshots that
    /// survive a failed deletion stay valid.
    pub fn prune(&self, retention: usize) -> PruneSummary {
        let mut summary = PruneSummary::default();
        let mut records = match self.list() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    target: "homedash",
                    event = "prune_list_failed",
                    path = %self.dir.display(),
                    error = %err
                );
                summary.failed.push(PruneFailure {
                    path: self.dir.clone(),
                    error: err.to_string(),
                });
                return summary;
            }
        };

        let expired = if records.len() > retention {
            records.split_off(retention)
        } else {
            Vec::new()
        };
        summary.kept = records.into_iter().map(|record| record.path).collect();

        for record in expired {
            match fs::remove_file(&record.path) {
                Ok(()) => {
                    remove_with_sidecars(&record.path);
                    tracing::info!(
                        target: "homedash",
                        event = "backup_pruned",
                        path = %record.path.display(),
                        key = %record.key
                    );
                    summary.removed.push(record.path);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "homedash",
                        event = "prune_remove_failed",
                        path = %record.path.display(),
                        error = %err
                    );
                    summary.failed.push(PruneFailure {
                        path: record.path,
                        error: err.to_string(),
                    });
                }
            }
        }

        summary
    }

    fn ensure_free_space(&self, db_path: &Path) -> AppResult<()> {
        let db_size = fs::metadata(db_path).map(|meta| meta.len()).unwrap_or(0);
        let wal_size = fs::metadata(sidecar_path(db_path, "-wal"))
            .map(|meta| meta.len())
            .unwrap_or(0);
        let required = required_free_bytes(db_size.saturating_add(wal_size));
        let available = (self.free_space)(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "available_space")
                .with_context("path", self.dir.display().to_string())
        })?;
        if available < required {
            return Err(AppError::new(
                "DB_BACKUP/LOW_DISK",
                "Not enough free disk space for a backup",
            )
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
        }
        Ok(())
    }

    /// Next free key for `now`. Same-second snapshots continue after the
    /// highest sequence already on disk, partial copies included, so a
    /// pruned `-00` is never reused behind a surviving `-01`.
    fn allocate(&self, now: DateTime<Utc>) -> AppResult<(BackupKey, PathBuf)> {
        let base = BackupKey::at(now);
        let seq = match self.highest_seq_for(&base)? {
            None => 0,
            Some(seq) if seq < MAX_SAME_SECOND => seq + 1,
            Some(_) => {
                return Err(AppError::new(
                    "DB_BACKUP/NAME_COLLISION",
                    "Unable to allocate a backup file name",
                )
                .with_context("key", base.to_string()))
            }
        };
        let key = base.with_seq(seq);
        let path = self.dir.join(backup_file_name(&key));
        Ok((key, path))
    }

    fn highest_seq_for(&self, base: &BackupKey) -> AppResult<Option<u8>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_backups_dir")
                .with_context("path", self.dir.display().to_string())
        })?;
        let highest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let name = name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(name);
                parse_backup_file_name(name)
            })
            .filter(|key| key.stamp == base.stamp)
            .map(|key| key.seq)
            .max();
        Ok(highest)
    }
}

fn disk_free_space(path: &Path) -> io::Result<u64> {
    available_space(path)
}

fn required_free_bytes(db_size: u64) -> u64 {
    (db_size as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn partial_path(final_path: &Path) -> PathBuf {
    sidecar_path(final_path, PARTIAL_SUFFIX)
}

fn remove_with_sidecars(path: &Path) {
    let _ = fs::remove_file(path);
    for suffix in ["-journal", "-wal", "-shm"] {
        let _ = fs::remove_file(sidecar_path(path, suffix));
    }
}

fn run_hot_backup(src: &Connection, dest: &Path) -> AppResult<()> {
    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_db")
            .with_context("path", dest.display().to_string())
    })?;

    {
        let backup = Backup::new(src, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_init"))?;
        backup
            .run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;
    }

    // The copy inherits the source's WAL header; a snapshot must be a single
    // self-contained file.
    dest_conn
        .pragma_update_and_check(None, "journal_mode", "DELETE", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|err| AppError::from(err).with_context("operation", "backup_journal_mode"))?;

    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_backup_db"))?;

    fs::File::open(dest)
        .and_then(|file| file.sync_all())
        .map_err(|err| AppError::from(err).with_context("operation", "sync_backup_file"))?;
    Ok(())
}
