use std::collections::{BTreeSet, HashSet};

use rusqlite::{Connection, OptionalExtension};

use crate::{AppError, AppResult};

use super::quote_ident;

/// A table the recovery engine knows how to copy out of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableTable {
    pub name: &'static str,
    /// Columns in the order they are read and written.
    pub columns: &'static [&'static str],
    pub primary_key: &'static [&'static str],
    /// Table whose rows this table's rows reference. Always listed earlier
    /// in the manifest.
    pub parent: Option<&'static str>,
}

impl RecoverableTable {
    pub fn is_key_column(&self, column: &str) -> bool {
        self.primary_key.contains(&column)
    }
}

/// Restore order: every parent precedes its children.
pub const RESTORE_MANIFEST: &[RecoverableTable] = &[
    RecoverableTable {
        name: "users",
        columns: &[
            "id",
            "username",
            "password_hash",
            "is_admin",
            "google_access_token",
            "google_refresh_token",
            "google_token_expiry",
            "created_at",
        ],
        primary_key: &["id"],
        parent: None,
    },
    RecoverableTable {
        name: "sections",
        columns: &["id", "user_id", "name", "position"],
        primary_key: &["id"],
        parent: Some("users"),
    },
    RecoverableTable {
        name: "services",
        columns: &["id", "section_id", "name", "url", "icon", "position"],
        primary_key: &["id"],
        parent: Some("sections"),
    },
    RecoverableTable {
        name: "service_config",
        columns: &["service_id", "key", "value"],
        primary_key: &["service_id", "key"],
        parent: Some("services"),
    },
    RecoverableTable {
        name: "notes",
        columns: &["id", "section_id", "title", "body", "updated_at"],
        primary_key: &["id"],
        parent: Some("sections"),
    },
];

/// Bookkeeping tables owned by the migration tooling; never restored.
const INTERNAL_TABLES: &[&str] = &["schema_migrations", "_sqlx_migrations"];

/// Columns, primary key and foreign-key targets of one live table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub parents: BTreeSet<String>,
}

impl TableSchema {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Reads a table's shape; `Ok(None)` when the table does not exist.
pub fn table_schema(conn: &Connection, table: &str) -> rusqlite::Result<Option<TableSchema>> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut schema = TableSchema::default();
    let mut keyed: Vec<(i64, String)> = Vec::new();
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let pk: i64 = row.get(5)?;
        if pk > 0 {
            keyed.push((pk, name.clone()));
        }
        schema.columns.push(name);
    }
    keyed.sort();
    schema.primary_key = keyed.into_iter().map(|(_, name)| name).collect();

    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let target: String = row.get(2)?;
        schema.parents.insert(target);
    }

    Ok(Some(schema))
}

/// Problems with the manifest itself: parents out of order, keys that are
/// not columns, duplicate tables.
pub fn manifest_order_issues(manifest: &[RecoverableTable]) -> Vec<String> {
    let mut issues = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for table in manifest {
        if !seen.insert(table.name) {
            issues.push(format!("table {} is listed twice", table.name));
        }
        if let Some(parent) = table.parent {
            if !seen.contains(parent) || parent == table.name {
                issues.push(format!(
                    "table {} is listed before its parent {parent}",
                    table.name
                ));
            }
        }
        for key in table.primary_key {
            if !table.columns.contains(key) {
                issues.push(format!(
                    "table {} declares key column {key} that is not in its column list",
                    table.name
                ));
            }
        }
    }
    issues
}

/// Compare the manifest with the live schema behind `conn`.
///
/// Returns every mismatch found; an empty list means the manifest covers
/// the schema exactly. Errors only when the schema itself cannot be read.
pub fn validate_against(conn: &Connection, manifest: &[RecoverableTable]) -> AppResult<Vec<String>> {
    let mut issues = manifest_order_issues(manifest);

    for table in manifest {
        let schema = table_schema(conn, table.name).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_table_schema")
                .with_context("table", table.name)
        })?;
        let Some(schema) = schema else {
            issues.push(format!("table {} is missing from the target schema", table.name));
            continue;
        };

        for column in table.columns {
            if !schema.has_column(column) {
                issues.push(format!("table {} is missing column {column}", table.name));
            }
        }
        for column in &schema.columns {
            if !table.columns.contains(&column.as_str()) {
                issues.push(format!(
                    "table {} has column {column} that the manifest does not list",
                    table.name
                ));
            }
        }
        if schema.primary_key != table.primary_key {
            issues.push(format!(
                "table {} primary key is ({}), manifest declares ({})",
                table.name,
                schema.primary_key.join(", "),
                table.primary_key.join(", ")
            ));
        }
        if let Some(parent) = table.parent {
            if !schema.parents.contains(parent) {
                issues.push(format!(
                    "table {} has no foreign key to its declared parent {parent}",
                    table.name
                ));
            }
        }
    }

    let declared: HashSet<&str> = manifest.iter().map(|table| table.name).collect();
    for name in live_tables(conn)? {
        if !declared.contains(name.as_str()) && !INTERNAL_TABLES.contains(&name.as_str()) {
            issues.push(format!(
                "table {name} exists in the target schema but not in the restore manifest"
            ));
        }
    }

    Ok(issues)
}

fn live_tables(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(|err| AppError::from(err).with_context("operation", "list_tables"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| AppError::from(err).with_context("operation", "list_tables_query"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "collect_tables"))?;
    Ok(names)
}
