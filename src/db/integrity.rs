use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

use super::DatabaseHandle;

const OK_TOKEN: &str = "ok";
const MAX_ANOMALIES: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl IntegrityReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            anomalies: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn fail(anomalies: Vec<String>) -> Self {
        Self {
            passed: false,
            anomalies,
            duration_ms: 0,
        }
    }

    /// One-line description for logs and CLI output.
    pub fn summary(&self) -> String {
        if self.passed {
            return OK_TOKEN.to_string();
        }
        match self.anomalies.as_slice() {
            [] => "integrity check failed".to_string(),
            [only] => only.clone(),
            [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
        }
    }
}

/// Structural consistency check run against an open handle.
pub trait IntegrityCheck {
    fn check(&self, handle: &DatabaseHandle) -> IntegrityReport;
}

/// Runs `PRAGMA integrity_check`; a single `ok` row is a pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }
}

impl IntegrityCheck for IntegrityVerifier {
    fn check(&self, handle: &DatabaseHandle) -> IntegrityReport {
        let start = Instant::now();
        let sql = format!("PRAGMA integrity_check({MAX_ANOMALIES})");
        let rows = (|| -> rusqlite::Result<Vec<String>> {
            let mut stmt = handle.conn().prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })();

        let mut report = match rows {
            Ok(rows) if rows.len() == 1 && rows[0].eq_ignore_ascii_case(OK_TOKEN) => {
                IntegrityReport::pass()
            }
            Ok(rows) if rows.is_empty() => {
                IntegrityReport::fail(vec!["integrity_check returned no rows".to_string()])
            }
            Ok(rows) => IntegrityReport::fail(rows),
            Err(err) => IntegrityReport::fail(vec![format!("integrity_check failed: {err}")]),
        };
        report.duration_ms = start.elapsed().as_millis() as u64;

        if report.passed {
            tracing::info!(
                target: "homedash",
                event = "integrity_check",
                path = %handle.path().display(),
                passed = true,
                duration_ms = report.duration_ms
            );
        } else {
            tracing::error!(
                target: "homedash",
                event = "integrity_check",
                path = %handle.path().display(),
                passed = false,
                anomalies = report.anomalies.len(),
                first = %report.summary()
            );
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyOffender {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
}

pub fn foreign_key_offenders(handle: &DatabaseHandle) -> AppResult<Vec<ForeignKeyOffender>> {
    let mut stmt = handle
        .conn()
        .prepare("PRAGMA foreign_key_check")
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ForeignKeyOffender {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
            })
        })
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check_query"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check_iter"))
}
