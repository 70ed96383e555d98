#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use homedash_lib::db::backup::BackupRecord;
use homedash_lib::db::checkpoint::CheckpointOutcome;
use homedash_lib::db::restore::{RestoreOutcome, RestoreReport};
use homedash_lib::tokens::ClearedTokens;
use tempfile::tempdir;

mod util;

use util::{corrupt_index, create_db, HOUSEHOLD_SEED};

fn homedash(db: &Path, backups: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("homedash")?;
    cmd.env_remove("HOMEDASH_DB_PATH")
        .env_remove("HOMEDASH_DATA_DIR")
        .env_remove("HOMEDASH_BACKUP_DIR")
        .env_remove("HOMEDASH_BACKUP_RETENTION")
        .env("HOMEDASH_LOG", "homedash=warn")
        .arg("--db")
        .arg(db)
        .arg("--backup-dir")
        .arg(backups);
    Ok(cmd)
}

fn seed_old_backups(dir: &Path, count: usize) {
    fs::create_dir_all(dir).unwrap();
    for idx in 0..count {
        let name = format!("homedash-20200101-0000{idx:02}.sqlite3");
        fs::write(dir.join(name), b"old").unwrap();
    }
}

fn describe(output: &std::process::Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn checkpoint_without_database_is_a_no_op() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");

    let output = homedash(&db, &backups)?
        .args(["db", "checkpoint"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("nothing to checkpoint"));
    assert!(!db.exists());
    assert!(!backups.exists());
    Ok(())
}

#[test]
fn checkpoint_reports_each_step_and_keeps_a_backup() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    create_db(&db, HOUSEHOLD_SEED);

    let output = homedash(&db, &backups)?
        .args(["db", "checkpoint"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    for label in ["Backup", "Checkpoint", "Verify", "Sanity", "Prune"] {
        assert!(stdout.contains(label), "missing {label} in {stdout}");
    }
    assert!(stdout.contains("Checkpoint complete."));
    assert!(stdout.contains("Users      : 2"));

    let json = homedash(&db, &backups)?
        .args(["db", "checkpoint", "--json"])
        .output()?;
    assert!(json.status.success(), "{}", describe(&json));
    let outcome: CheckpointOutcome = serde_json::from_slice(&json.stdout)?;
    let CheckpointOutcome::Completed(summary) = outcome else {
        panic!("expected a completed checkpoint");
    };
    assert!(summary.backup.path.exists());
    assert_eq!(summary.prune.kept.len(), 2);
    Ok(())
}

#[test]
fn checkpoint_integrity_failure_exits_five_and_skips_pruning() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    corrupt_index(&db);
    seed_old_backups(&backups, 12);

    let output = homedash(&db, &backups)?
        .args(["db", "checkpoint"])
        .output()?;
    assert_eq!(output.status.code(), Some(5), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("integrity check failed"));
    assert_eq!(fs::read_dir(&backups)?.count(), 13);
    Ok(())
}

#[test]
fn retention_flag_limits_kept_backups() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    create_db(&db, HOUSEHOLD_SEED);
    seed_old_backups(&backups, 5);

    let output = homedash(&db, &backups)?
        .args(["db", "checkpoint", "--retention", "3"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    assert_eq!(fs::read_dir(&backups)?.count(), 3);

    let output = homedash(&db, &backups)?
        .args(["db", "prune", "--retention", "1"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("kept 1, removed 2"));

    let listed = homedash(&db, &backups)?
        .args(["db", "backups", "--json"])
        .output()?;
    let records: Vec<BackupRecord> = serde_json::from_slice(&listed.stdout)?;
    assert_eq!(records.len(), 1);
    assert!(!records[0].key.to_string().starts_with("2020"));
    Ok(())
}

#[test]
fn tokens_clear_reports_affected_accounts_then_nothing() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    create_db(
        &db,
        "INSERT INTO users(id, username, password_hash, google_access_token,
                           google_refresh_token, google_token_expiry)
             VALUES (1, 'alice', 'h', 'at-1', 'rt-1', 1700000000),
                    (2, 'bob', 'h', 'at-2', NULL, NULL),
                    (3, 'carol', 'h', NULL, 'rt-3', NULL),
                    (4, 'dave', 'h', NULL, NULL, NULL);",
    );

    let first = homedash(&db, &backups)?
        .args(["tokens", "clear", "--json"])
        .output()?;
    assert!(first.status.success(), "{}", describe(&first));
    let cleared: ClearedTokens = serde_json::from_slice(&first.stdout)?;
    assert_eq!(cleared.count, 3);
    assert_eq!(cleared.affected_ids, vec![1, 2, 3]);

    let second = homedash(&db, &backups)?
        .args(["tokens", "clear"])
        .output()?;
    assert!(second.status.success(), "{}", describe(&second));
    assert!(String::from_utf8_lossy(&second.stdout).contains("No stored tokens to clear."));
    Ok(())
}

#[test]
fn tokens_clear_without_database_fails_to_open() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");

    let output = homedash(&db, &tmp.path().join("backups"))?
        .args(["tokens", "clear"])
        .output()?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(!db.exists());
    Ok(())
}

#[test]
fn restore_writes_report_into_report_dir() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    let backup = tmp.path().join("homedash-20240301-020000.sqlite3");
    let reports = tmp.path().join("reports");
    create_db(&backup, HOUSEHOLD_SEED);
    create_db(&db, "");

    let output = homedash(&db, &backups)?
        .args(["db", "restore", "--from"])
        .arg(&backup)
        .arg("--report-dir")
        .arg(&reports)
        .arg("--json")
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let report: RestoreReport = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report.outcome, RestoreOutcome::Complete);
    assert_eq!(report.target, db);

    let written: Vec<_> = fs::read_dir(&reports)?
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(written.len(), 1);
    assert!(written[0].starts_with("restore-") && written[0].ends_with(".json"));
    Ok(())
}

#[test]
fn restore_with_schema_drift_exits_with_drift_code() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backup = tmp.path().join("backup.sqlite3");
    create_db(&backup, HOUSEHOLD_SEED);
    create_db(&db, "CREATE TABLE widgets(id INTEGER PRIMARY KEY);");

    let output = homedash(&db, &tmp.path().join("backups"))?
        .args(["db", "restore", "--from"])
        .arg(&backup)
        .output()?;
    assert_eq!(output.status.code(), Some(8), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("widgets"));
    Ok(())
}

#[test]
fn verify_distinguishes_healthy_and_damaged_files() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let damaged = tmp.path().join("damaged.sqlite3");
    let backups = tmp.path().join("backups");
    create_db(&db, HOUSEHOLD_SEED);
    corrupt_index(&damaged);

    let ok = homedash(&db, &backups)?.args(["db", "verify"]).output()?;
    assert!(ok.status.success(), "{}", describe(&ok));
    assert!(String::from_utf8_lossy(&ok.stdout).contains("Result       : ok"));

    let bad = homedash(&db, &backups)?
        .args(["db", "verify", "--path"])
        .arg(&damaged)
        .output()?;
    assert_eq!(bad.status.code(), Some(5), "{}", describe(&bad));
    assert!(String::from_utf8_lossy(&bad.stdout).contains("probe_idx"));
    Ok(())
}

#[test]
fn log_dir_receives_json_lines() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("homedash.sqlite3");
    let backups = tmp.path().join("backups");
    let logs = tmp.path().join("logs");
    create_db(&db, HOUSEHOLD_SEED);

    let output = homedash(&db, &backups)?
        .env("HOMEDASH_LOG", "homedash=info")
        .arg("--log-dir")
        .arg(&logs)
        .args(["db", "checkpoint"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));

    let files: Vec<_> = fs::read_dir(&logs)?
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1, "{files:?}");
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("homedash.log"), "{name}");

    let contents = fs::read_to_string(&files[0])?;
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json log line"))
        .collect();
    let created = lines
        .iter()
        .find(|value| value["event"] == "backup_created")
        .expect("backup_created logged");
    assert_eq!(created["level"], "INFO");
    assert_eq!(created["target"], "homedash");
    assert!(created["timestamp"].as_str().is_some());
    assert!(created["path"].as_str().unwrap().ends_with(".sqlite3"));
    Ok(())
}
