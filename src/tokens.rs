use serde::{Deserialize, Serialize};

use crate::db::DatabaseHandle;
use crate::{AppError, AppResult};

const CLEAR_TOKENS_SQL: &str = "UPDATE users \
     SET google_access_token = NULL, google_refresh_token = NULL, google_token_expiry = NULL \
     WHERE google_access_token IS NOT NULL \
        OR google_refresh_token IS NOT NULL \
        OR google_token_expiry IS NOT NULL \
     RETURNING id";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedTokens {
    pub count: usize,
    /// Ascending.
    pub affected_ids: Vec<i64>,
}

/// Revokes every stored third-party credential in one statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenInvalidator;

impl TokenInvalidator {
    pub fn new() -> Self {
        Self
    }

    /// Null the Google token columns on every account that still holds one.
    /// Rows without credentials are untouched, so a repeat call reports zero.
    pub fn clear_all(&self, handle: &DatabaseHandle) -> AppResult<ClearedTokens> {
        let mut stmt = handle
            .conn()
            .prepare(CLEAR_TOKENS_SQL)
            .map_err(|err| AppError::from(err).with_context("operation", "prepare_clear_tokens"))?;
        let mut affected_ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(|err| AppError::from(err).with_context("operation", "clear_tokens"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| AppError::from(err).with_context("operation", "clear_tokens_rows"))?;
        affected_ids.sort_unstable();

        tracing::info!(
            target: "homedash",
            event = "tokens_cleared",
            path = %handle.path().display(),
            count = affected_ids.len()
        );

        Ok(ClearedTokens {
            count: affected_ids.len(),
            affected_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    #[test]
    fn clears_each_credential_column_and_is_idempotent() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("homedash.sqlite3");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE users(
                     id INTEGER PRIMARY KEY,
                     google_access_token TEXT,
                     google_refresh_token TEXT,
                     google_token_expiry INTEGER
                 );
                 INSERT INTO users VALUES (9, 'a', NULL, NULL);
                 INSERT INTO users VALUES (2, NULL, 'r', NULL);
                 INSERT INTO users VALUES (5, NULL, NULL, 1700000000);
                 INSERT INTO users VALUES (7, NULL, NULL, NULL);",
            )
            .unwrap();

        let handle = DatabaseHandle::open_read_write(&path).unwrap();
        let invalidator = TokenInvalidator::new();
        let first = invalidator.clear_all(&handle).unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(first.affected_ids, vec![2, 5, 9]);

        let remaining: i64 = handle
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM users WHERE google_access_token IS NOT NULL
                    OR google_refresh_token IS NOT NULL OR google_token_expiry IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);

        let second = invalidator.clear_all(&handle).unwrap();
        assert_eq!(second, ClearedTokens::default());
        handle.close().unwrap();
    }

    #[test]
    fn read_only_handle_cannot_clear() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("homedash.sqlite3");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE users(id INTEGER PRIMARY KEY, google_access_token TEXT,
                     google_refresh_token TEXT, google_token_expiry INTEGER);
                 INSERT INTO users VALUES (1, 'a', 'r', 1);",
            )
            .unwrap();

        let handle = DatabaseHandle::open_read_only(&path).unwrap();
        let err = TokenInvalidator::new().clear_all(&handle).unwrap_err();
        assert_eq!(err.code(), "Sqlite/ReadOnly");
    }
}
