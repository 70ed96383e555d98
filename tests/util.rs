#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::Connection;

pub const SCHEMA: &str = include_str!("fixtures/schema.sql");

/// Two accounts, two sections, three services with config, two notes.
pub const HOUSEHOLD_SEED: &str = "
    INSERT INTO users(id, username, password_hash, is_admin, google_access_token,
                      google_refresh_token, google_token_expiry, created_at)
        VALUES (1, 'alice', 'hash-a', 1, 'ya29.a', '1//ra', 1700000000, '2024-01-01 08:00:00'),
               (2, 'bob', 'hash-b', 0, NULL, NULL, NULL, '2024-01-02 09:30:00');
    INSERT INTO sections(id, user_id, name, position)
        VALUES (1, 1, 'Home', 0),
               (2, 2, 'Media', 1);
    INSERT INTO services(id, section_id, name, url, icon, position)
        VALUES (1, 1, 'Router', 'http://192.168.1.1', 'router.svg', 0),
               (2, 2, 'Jellyfin', 'http://media.lan:8096', NULL, 0),
               (3, 2, 'Sonarr', 'http://media.lan:8989', 'sonarr.png', 1);
    INSERT INTO service_config(service_id, key, value)
        VALUES (1, 'poll_seconds', '30'),
               (2, 'api_key', 'abc123'),
               (3, 'api_key', 'def456');
    INSERT INTO notes(id, section_id, title, body, updated_at)
        VALUES (1, 1, 'Wifi', 'guest password is on the fridge', '2024-02-01T10:00:00Z'),
               (2, NULL, NULL, 'loose note', NULL);
";

pub const TABLES: [&str; 5] = ["users", "sections", "services", "service_config", "notes"];

/// Create a database file with the dashboard schema and run `seed` on it.
pub fn create_db(path: &Path, seed: &str) {
    let conn = Connection::open(path).expect("create database");
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    conn.execute_batch(SCHEMA).expect("apply schema");
    conn.execute_batch(seed).expect("seed database");
    conn.close().expect("close database");
}

pub fn row_count(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
        .unwrap()
}

/// Every row of `table` ordered by rowid, rendered for comparison.
pub fn dump_table(path: &Path, table: &str) -> Vec<Vec<Value>> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM \"{table}\" ORDER BY rowid"))
        .unwrap();
    let width = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|idx| row.get::<_, Value>(idx))
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap();
    rows.collect::<Result<Vec<_>, _>>().unwrap()
}

/// Overwrite the b-tree page type byte of `table`'s root page so any scan
/// of the table fails with SQLITE_CORRUPT while the schema stays readable.
pub fn make_table_unreadable(path: &Path, table: &str) {
    let conn = Connection::open(path).unwrap();
    let journal: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal.to_lowercase(), "delete", "fixture must not use WAL");
    let page_size: i64 = conn
        .query_row("PRAGMA page_size", [], |row| row.get(0))
        .unwrap();
    let root_page: i64 = conn
        .query_row(
            "SELECT rootpage FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .unwrap();
    conn.close().unwrap();

    let mut offset = ((root_page - 1) * page_size) as u64;
    if root_page == 1 {
        offset += 100;
    }
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[0x00]).unwrap();
    file.sync_all().unwrap();
}

/// Point an index definition at a different column than the one its
/// entries were built from, so `integrity_check` reports missing entries.
pub fn corrupt_index(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE probe(a TEXT, b TEXT);
         CREATE INDEX probe_idx ON probe(a);
         INSERT INTO probe(a, b) VALUES ('x', 'y'), ('p', 'q');
         PRAGMA writable_schema = ON;
         UPDATE sqlite_master SET sql = 'CREATE INDEX probe_idx ON probe(b)'
             WHERE name = 'probe_idx';
         PRAGMA writable_schema = OFF;",
    )
    .unwrap();
    conn.close().unwrap();
}
