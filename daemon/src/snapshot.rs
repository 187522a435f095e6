use log::{debug, info, warn};
use parking_lot::Mutex;
use policy_core::{rule_blob, Preferences, ProfileSnapshot};
use rusqlite::{params, Connection};
use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::error::DaemonResult;
use crate::now_ms;

// ================================================================================================
// SQLITE SCHEMA
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    name             TEXT PRIMARY KEY,
    preferences_json TEXT NOT NULL,
    rules_blob       BLOB NOT NULL,
    active           INTEGER NOT NULL DEFAULT 0,
    updated_at       INTEGER NOT NULL
);
";

// ================================================================================================
// SNAPSHOT STORE
// ================================================================================================

/// Eventually consistent copy of every profile on disk.
///
/// Each save replaces the whole table inside one transaction, so a crash
/// leaves either the previous snapshot or the new one. Rules are stored as
/// the same versioned blob the admin surface exports.
///
/// `purge` seals the store: later saves are refused under the same lock, so
/// no writer that raced the purge can bring rows back.
#[derive(Debug)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
    db: Mutex<Db>,
}

#[derive(Debug)]
struct Db {
    conn: Connection,
    sealed: bool,
}

impl Db {
    fn new(conn: Connection) -> Self {
        Self { conn, sealed: false }
    }
}

impl SnapshotStore {
    /// Opens (creating if needed) the database named in `config`
    pub fn open(config: &StorageConfig) -> DaemonResult<Self> {
        if let Some(parent) = config.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.snapshot_path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Snapshot store at {}", config.snapshot_path.display());
        Ok(Self {
            path: Some(config.snapshot_path.clone()),
            db: Mutex::new(Db::new(conn)),
        })
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> DaemonResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            db: Mutex::new(Db::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Replaces the stored profiles with `snapshots`. A sealed store saves
    /// nothing and returns 0.
    pub fn save(&self, snapshots: &[ProfileSnapshot]) -> DaemonResult<usize> {
        // Encode before taking the connection lock
        let mut rows = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let preferences = serde_json::to_string(&snapshot.preferences)?;
            let blob = rule_blob::encode(&snapshot.rules)?;
            rows.push((snapshot.name.as_str(), preferences, blob, snapshot.active));
        }

        let updated_at = now_ms() as i64;
        let mut db = self.db.lock();
        if db.sealed {
            debug!("Snapshot store is sealed, skipping save");
            return Ok(0);
        }
        let tx = db.conn.transaction()?;
        tx.execute("DELETE FROM profiles", [])?;
        for (name, preferences, blob, active) in &rows {
            tx.execute(
                "INSERT OR REPLACE INTO profiles (name, preferences_json, rules_blob, active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, preferences, blob, *active as i64, updated_at],
            )?;
        }
        tx.commit()?;

        debug!("Saved {} profile snapshots", rows.len());
        Ok(rows.len())
    }

    /// Reads every stored profile. Rows that cannot be decoded are skipped.
    pub fn load(&self) -> DaemonResult<Vec<ProfileSnapshot>> {
        // Collect rows first so decoding happens without the connection lock
        let rows: Vec<(String, String, Vec<u8>, i64)> = {
            let db = self.db.lock();
            let mut stmt = db.conn.prepare(
                "SELECT name, preferences_json, rules_blob, active FROM profiles ORDER BY name",
            )?;
            let collected = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut snapshots = Vec::with_capacity(rows.len());
        for (name, preferences_json, blob, active) in rows {
            let preferences: Preferences = match serde_json::from_str(&preferences_json) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping profile '{}' with invalid preferences: {}", name, e);
                    continue;
                }
            };
            let decoded = match rule_blob::decode(&blob) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Skipping profile '{}' with unreadable rules: {}", name, e);
                    continue;
                }
            };
            if decoded.skipped > 0 {
                warn!(
                    "Profile '{}': {} stored rules could not be decoded",
                    name, decoded.skipped
                );
            }
            snapshots.push(ProfileSnapshot {
                name,
                preferences,
                rules: decoded.rules,
                active: active != 0,
            });
        }
        Ok(snapshots)
    }

    /// Deletes every stored profile and seals the store against later saves
    pub fn purge(&self) -> DaemonResult<usize> {
        let mut db = self.db.lock();
        db.sealed = true;
        let removed = db.conn.execute("DELETE FROM profiles", [])?;
        info!("Purged {} profile snapshots", removed);
        Ok(removed)
    }

    pub fn is_sealed(&self) -> bool {
        self.db.lock().sealed
    }

    pub fn count(&self) -> DaemonResult<usize> {
        let n: i64 = self
            .db
            .lock()
            .conn
            .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
