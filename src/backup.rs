use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::store::{IMPORT_TABLES, clear_tables, row_counts};

/// Snapshot of the import tables taken before an import mutates anything.
#[derive(Debug, Clone, Serialize)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub checksum: String,
    pub created_at: String,
    pub row_counts: BTreeMap<String, i64>,
}

pub fn capture(conn: &Connection, dir: &Path, label: &str) -> Result<BackupHandle> {
    fs::create_dir_all(dir).with_context(|| format!("create backup dir {}", dir.display()))?;
    let created_at = Utc::now();
    let path = dir.join(format!(
        "{label}_{}.sqlite",
        created_at.format("%Y%m%dT%H%M%S%.3fZ")
    ));
    if path.exists() {
        return Err(anyhow!("backup target already exists: {}", path.display()));
    }

    let target = path
        .to_str()
        .ok_or_else(|| anyhow!("backup path is not valid utf-8: {}", path.display()))?;
    conn.execute("VACUUM INTO ?1", [target])
        .with_context(|| format!("snapshot store into {}", path.display()))?;

    let handle = BackupHandle {
        checksum: file_checksum(&path)?,
        created_at: created_at.to_rfc3339(),
        row_counts: row_counts(conn)?,
        path,
    };
    info!(path = %handle.path.display(), "captured pre-import backup");
    Ok(handle)
}

/// Replaces the import tables with the snapshot's contents in one transaction.
pub fn restore(conn: &mut Connection, handle: &BackupHandle) -> Result<()> {
    let actual = file_checksum(&handle.path)?;
    if actual != handle.checksum {
        return Err(anyhow!(
            "backup {} checksum mismatch (expected {}, got {actual})",
            handle.path.display(),
            handle.checksum
        ));
    }

    let source = handle
        .path
        .to_str()
        .ok_or_else(|| anyhow!("backup path is not valid utf-8"))?;
    conn.execute("ATTACH DATABASE ?1 AS snapshot", [source])
        .context("attach backup snapshot")?;
    let copied = copy_from_snapshot(conn);
    if let Err(err) = conn.execute("DETACH DATABASE snapshot", []) {
        warn!(error = %err, "detach backup snapshot failed");
    }
    copied?;

    let restored = row_counts(conn)?;
    if restored != handle.row_counts {
        return Err(anyhow!(
            "restored row counts {restored:?} differ from snapshot {:?}",
            handle.row_counts
        ));
    }
    info!(path = %handle.path.display(), "restored store from backup");
    Ok(())
}

fn copy_from_snapshot(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("begin restore transaction")?;
    clear_tables(&tx)?;
    for table in IMPORT_TABLES {
        tx.execute(
            &format!("INSERT INTO main.{table} SELECT * FROM snapshot.{table}"),
            [],
        )
        .with_context(|| format!("restore {table}"))?;
    }
    tx.commit().context("commit restore transaction")?;
    Ok(())
}

pub fn discard(handle: &BackupHandle) -> Result<()> {
    fs::remove_file(&handle.path)
        .with_context(|| format!("remove backup {}", handle.path.display()))
}

pub fn file_checksum(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_db;

    #[test]
    fn restore_round_trips_import_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_db(&dir.path().join("store.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO leagues (league_code, name) VALUES ('NSTF', 'NSTF')",
            [],
        )
        .unwrap();

        let handle = capture(&conn, &dir.path().join("backups"), "local").unwrap();
        assert_eq!(handle.row_counts["leagues"], 1);

        conn.execute("DELETE FROM leagues", []).unwrap();
        conn.execute(
            "INSERT INTO leagues (league_code, name) VALUES ('CITA', 'CITA'), ('X', 'X')",
            [],
        )
        .unwrap();
        restore(&mut conn, &handle).unwrap();

        let code: String = conn
            .query_row("SELECT league_code FROM leagues", [], |row| row.get(0))
            .unwrap();
        assert_eq!(code, "NSTF");
        assert_eq!(row_counts(&conn).unwrap(), handle.row_counts);
    }

    #[test]
    fn tampered_backup_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_db(&dir.path().join("store.sqlite")).unwrap();
        let mut handle = capture(&conn, &dir.path().join("backups"), "local").unwrap();
        handle.checksum = "not-the-checksum".to_string();
        let err = restore(&mut conn, &handle).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
