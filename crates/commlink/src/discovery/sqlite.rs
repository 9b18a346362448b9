//! SQLite-backed discovery store shared between processes on one host.

use super::Discovery;
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::platform::is_process_alive;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A published service key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub key: String,
    pub address: String,
    pub registered_at: String,
    pub pid: u32,
}

/// Discovery store in a WAL-mode SQLite file.
///
/// `Arc<Mutex<Connection>>` serializes access within a process; WAL mode
/// makes concurrent access from several processes safe.
///
/// Every row records the publishing process. A key whose publisher has
/// exited is free to claim again, so a crashed server does not lock its
/// name out.
#[derive(Clone)]
pub struct SqliteDiscovery {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDiscovery {
    /// Open the store at `db_path`, creating it and its parent directory.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| CommError::Config {
                    message: format!(
                        "Failed to create discovery directory {}: {}",
                        parent.display(),
                        e
                    ),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        let discovery = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let reaped = discovery.remove_stale()?;
        if reaped > 0 {
            info!("Removed {} discovery entries left by exited processes", reaped);
        }
        Ok(discovery)
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;",
            CommConfig::DISCOVERY_BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                key TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                pid INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CommError::Database {
            message: "Failed to acquire discovery connection lock".to_string(),
            source: None,
        })
    }

    /// Claim `key`. Returns `Ok(false)` if a live publisher holds it.
    ///
    /// A row left by a process that no longer exists is replaced.
    pub fn try_insert(&self, key: &str, address: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let holder: Option<u32> = tx
            .query_row(
                "SELECT pid FROM services WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(pid) = holder {
            if pid == std::process::id() || is_process_alive(pid) {
                return Ok(false);
            }
            warn!("Reclaiming {} from exited process {}", key, pid);
            tx.execute("DELETE FROM services WHERE key = ?1", params![key])?;
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO services (key, address, registered_at, pid)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, address, now, std::process::id()],
        )?;
        tx.commit()?;
        debug!("Published {} -> {}", key, address);
        Ok(true)
    }

    pub fn try_erase(&self, key: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute("DELETE FROM services WHERE key = ?1", params![key])?;
        if rows > 0 {
            debug!("Retracted {}", key);
        }
        Ok(rows > 0)
    }

    pub fn lookup(&self, key: &str) -> Result<Option<ServiceEntry>> {
        let conn = self.lock_conn()?;
        let entry = conn
            .query_row(
                "SELECT key, address, registered_at, pid FROM services WHERE key = ?1",
                params![key],
                |row| {
                    Ok(ServiceEntry {
                        key: row.get(0)?,
                        address: row.get(1)?,
                        registered_at: row.get(2)?,
                        pid: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// All published entries, ordered by key.
    pub fn list(&self) -> Result<Vec<ServiceEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT key, address, registered_at, pid FROM services ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(ServiceEntry {
                key: row.get(0)?,
                address: row.get(1)?,
                registered_at: row.get(2)?,
                pid: row.get(3)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Remove every entry published by process `pid`.
    ///
    /// Used to clear keys left behind by a server that exited without
    /// retracting them.
    pub fn remove_by_pid(&self, pid: u32) -> Result<usize> {
        let conn = self.lock_conn()?;
        let rows = conn.execute("DELETE FROM services WHERE pid = ?1", params![pid])?;
        if rows > 0 {
            debug!("Removed {} entries published by PID {}", rows, pid);
        }
        Ok(rows)
    }

    /// Remove every entry whose publishing process has exited.
    pub fn remove_stale(&self) -> Result<usize> {
        let mut dead: Vec<u32> = self
            .list()?
            .into_iter()
            .map(|entry| entry.pid)
            .filter(|pid| !is_process_alive(*pid))
            .collect();
        dead.sort_unstable();
        dead.dedup();

        let mut removed = 0;
        for pid in dead {
            removed += self.remove_by_pid(pid)?;
        }
        Ok(removed)
    }
}

impl Discovery for SqliteDiscovery {
    fn insert(&self, key: &str, value: &str) -> bool {
        self.try_insert(key, value).unwrap_or_else(|e| {
            warn!("Discovery insert of {} failed: {}", key, e);
            false
        })
    }

    fn erase(&self, key: &str) -> bool {
        self.try_erase(key).unwrap_or_else(|e| {
            warn!("Discovery erase of {} failed: {}", key, e);
            false
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key) {
            Ok(entry) => entry.map(|e| e.address),
            Err(e) => {
                warn!("Discovery lookup of {} failed: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_discovery() -> (SqliteDiscovery, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("discovery.db");
        let discovery = SqliteDiscovery::open_at(&db_path).unwrap();
        (discovery, temp_dir)
    }

    /// A pid above every platform's limit, so never a running process.
    const EXITED_PID: u32 = i32::MAX as u32;

    fn publish_as(discovery: &SqliteDiscovery, key: &str, address: &str, pid: u32) {
        let conn = discovery.lock_conn().unwrap();
        conn.execute(
            "INSERT INTO services (key, address, registered_at, pid) VALUES (?1, ?2, ?3, ?4)",
            params![key, address, Utc::now().to_rfc3339(), pid],
        )
        .unwrap();
    }

    #[test]
    fn test_insert_and_lookup() {
        let (discovery, _temp) = create_test_discovery();
        assert!(discovery.insert("engine", "tcp://127.0.0.1:9000"));

        let entry = discovery.lookup("engine").unwrap().unwrap();
        assert_eq!(entry.address, "tcp://127.0.0.1:9000");
        assert_eq!(entry.pid, std::process::id());
        assert!(!entry.registered_at.is_empty());
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let (discovery, _temp) = create_test_discovery();
        assert!(discovery.insert("engine", "tcp://127.0.0.1:9000"));
        assert!(!discovery.insert("engine", "tcp://127.0.0.1:9001"));
        assert_eq!(discovery.get("engine").as_deref(), Some("tcp://127.0.0.1:9000"));
    }

    #[test]
    fn test_erase_returns_whether_removed() {
        let (discovery, _temp) = create_test_discovery();
        assert!(!discovery.erase("engine"));
        discovery.insert("engine", "tcp://127.0.0.1:9000");
        assert!(discovery.erase("engine"));
        assert!(discovery.get("engine").is_none());
    }

    #[test]
    fn test_store_is_shared_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("discovery.db");
        let first = SqliteDiscovery::open_at(&db_path).unwrap();
        let second = SqliteDiscovery::open_at(&db_path).unwrap();

        first.insert("engine_control", "tcp://127.0.0.1:9100");
        assert_eq!(
            second.get("engine_control").as_deref(),
            Some("tcp://127.0.0.1:9100")
        );
    }

    #[test]
    fn test_list_and_remove_by_pid() {
        let (discovery, _temp) = create_test_discovery();
        discovery.insert("b", "tcp://127.0.0.1:2");
        discovery.insert("a", "tcp://127.0.0.1:1");

        let keys: Vec<String> = discovery.list().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(discovery.remove_by_pid(std::process::id()).unwrap(), 2);
        assert!(discovery.list().unwrap().is_empty());
    }

    #[test]
    fn test_key_of_exited_publisher_is_reclaimed() {
        let (discovery, _temp) = create_test_discovery();
        publish_as(&discovery, "engine", "tcp://127.0.0.1:9000", EXITED_PID);

        assert!(discovery.insert("engine", "tcp://127.0.0.1:9001"));
        let entry = discovery.lookup("engine").unwrap().unwrap();
        assert_eq!(entry.address, "tcp://127.0.0.1:9001");
        assert_eq!(entry.pid, std::process::id());
    }

    #[test]
    fn test_open_removes_entries_of_exited_publishers() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("discovery.db");
        let first = SqliteDiscovery::open_at(&db_path).unwrap();
        publish_as(&first, "engine", "tcp://127.0.0.1:9000", EXITED_PID);
        publish_as(&first, "engine_control", "tcp://127.0.0.1:9001", EXITED_PID);
        first.insert("other", "tcp://127.0.0.1:9002");

        let second = SqliteDiscovery::open_at(&db_path).unwrap();
        let keys: Vec<String> = second.list().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["other".to_string()]);
    }

    #[test]
    fn test_server_restarts_after_unretracted_exit() {
        use crate::config::ServerConfig;
        use crate::server::CommServer;

        let (discovery, _temp) = create_test_discovery();
        for key in ["engine", "engine_control", "engine_status"] {
            publish_as(&discovery, key, "tcp://127.0.0.1:9000", EXITED_PID);
        }

        let server =
            CommServer::new(ServerConfig::new("engine"), Some(Arc::new(discovery.clone()))).unwrap();
        let address = server.start().unwrap();
        assert_eq!(discovery.get("engine"), Some(address));
        server.stop();
        assert!(discovery.list().unwrap().is_empty());
    }
}
