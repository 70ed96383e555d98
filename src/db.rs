use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::{AppError, AppResult};

pub mod backup;
pub mod checkpoint;
pub mod integrity;
pub mod manifest;
pub mod restore;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Exclusively owned connection to a single database file.
///
/// The handle never creates the file it points at. Callers release it with
/// [`DatabaseHandle::close`] on the success path so close errors surface;
/// error paths release it through `Drop`.
#[derive(Debug)]
pub struct DatabaseHandle {
    conn: Connection,
    path: PathBuf,
}

impl DatabaseHandle {
    pub fn open_read_write(path: &Path) -> AppResult<Self> {
        Self::open(path, AccessMode::ReadWrite)
    }

    /// Open with `SQLITE_OPEN_READ_ONLY`; nothing done through this handle
    /// can modify the file.
    pub fn open_read_only(path: &Path) -> AppResult<Self> {
        Self::open(path, AccessMode::ReadOnly)
    }

    fn open(path: &Path, mode: AccessMode) -> AppResult<Self> {
        if !path.exists() {
            return Err(
                AppError::new("DB_OPEN/NOT_FOUND", "Database file does not exist")
                    .with_context("path", path.display().to_string()),
            );
        }

        let access = match mode {
            AccessMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            AccessMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
        };
        let flags = access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_db")
                .with_context("path", path.display().to_string())
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;
        if mode == AccessMode::ReadWrite {
            conn.pragma_update(None, "foreign_keys", 1).map_err(|err| {
                AppError::from(err).with_context("operation", "enable_foreign_keys")
            })?;
        }

        tracing::debug!(
            target: "homedash",
            event = "db_open",
            path = %path.display(),
            mode = ?mode
        );

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> AppResult<()> {
        let DatabaseHandle { conn, path } = self;
        conn.close().map_err(|(_, err)| {
            AppError::from(err)
                .with_context("operation", "close_db")
                .with_context("path", path.display().to_string())
        })?;
        tracing::debug!(target: "homedash", event = "db_close", path = %path.display());
        Ok(())
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Path of a SQLite sidecar file such as `-wal` or `-shm`.
pub(crate) fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(db_path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Write `bytes` to `path` through a temporary sibling file so readers never
/// observe a half-written file. The parent directory must already exist.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let mut tmp_name = OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        sync_dir(parent).ok();
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_refuses_missing_file_without_creating_it() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("absent.sqlite3");
        let err = DatabaseHandle::open_read_write(&path).unwrap_err();
        assert_eq!(err.code(), "DB_OPEN/NOT_FOUND");
        assert!(!path.exists());
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ro.sqlite3");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY);")
            .unwrap();

        let handle = DatabaseHandle::open_read_only(&path).unwrap();
        let err = handle
            .conn()
            .execute("INSERT INTO t(id) VALUES (1)", [])
            .unwrap_err();
        assert!(err.to_string().contains("readonly"), "{err}");
        handle.close().unwrap();
    }

    #[test]
    fn read_write_handle_enables_foreign_keys() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("rw.sqlite3");
        Connection::open(&path).unwrap();

        let handle = DatabaseHandle::open_read_write(&path).unwrap();
        let fks: i64 = handle
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fks, 1);
        handle.close().unwrap();
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("notes"), "\"notes\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("report.json");
        fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn write_atomic_fails_without_parent_dir() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("missing").join("report.json");
        assert!(write_atomic(&path, b"data").is_err());
        assert!(!path.exists());
    }
}
