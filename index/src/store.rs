//! The three index relations plus the transient connected-set, behind a
//! trait so the session layer never sees a `rusqlite::Connection` or a
//! cursor — the "decorator-based SQL session" re-architecture named in
//! spec.md §9. Grounded on
//! `original_source/p2p_fileshare/server/db_manager.py` for the relation
//! shape (`files`, `origins`/`shares`) and generalized to the trait the
//! spec names: `search`, `add_share`, `remove_share`, `get_file`,
//! `find_sharing_clients`, `add_client`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::IndexError;
use crate::types::SharedFile;

pub trait IndexStore: Send + Sync {
    /// Inserts the client id if absent. Idempotent.
    fn add_client(&self, client_id: &str) -> Result<(), IndexError>;

    /// Inserts `file` into `files` if its id is new (existing rows are
    /// kept — `file_id` is stable, spec §4.4), then inserts
    /// `(file_id, client_id)` into `shares`.
    /// Returns `Err(Duplicate)` if that share already existed.
    fn add_share(&self, file: &SharedFile, client_id: &str) -> Result<(), IndexError>;

    /// Removes `(file_id, client_id)` from `shares`.
    /// Returns `Err(NotFound)` if no row was removed.
    fn remove_share(&self, file_id: &str, client_id: &str) -> Result<(), IndexError>;

    fn get_file(&self, file_id: &str) -> Result<Option<SharedFile>, IndexError>;

    /// Every file whose name contains `substr`, regardless of whether it
    /// is currently reachable — the session layer applies the
    /// currently-connected-with-port filter (spec §4.4).
    fn search_by_name(&self, substr: &str) -> Result<Vec<SharedFile>, IndexError>;

    /// Every client id that has ever shared `file_id` (a `shares` row),
    /// connected or not.
    fn find_sharing_clients(&self, file_id: &str) -> Result<Vec<String>, IndexError>;

    /// Records that `client_id` is connected from `ip`, with `port`
    /// unknown until `SharePort` arrives.
    fn mark_connected(&self, client_id: &str, ip: Ipv4Addr);

    /// Records the serving port a connected client has advertised.
    fn set_port(&self, client_id: &str, port: u16);

    /// Removes `client_id` from the connected set (spec §4.4: "when a
    /// client channel retires, its row is removed from `connected`").
    fn disconnect(&self, client_id: &str);

    /// `(ip, port)` for a currently connected client, if any.
    fn connected_info(&self, client_id: &str) -> Option<(Ipv4Addr, Option<u16>)>;
}

struct ConnectedEntry {
    ip: Ipv4Addr,
    port: Option<u16>,
}

/// Single-writer sqlite-backed store. The connection and the transient
/// connected-set each sit behind their own short-held `Mutex` — callers
/// never hold one across an `.await`.
pub struct SqliteIndexStore {
    conn: Mutex<Connection>,
    connected: Mutex<HashMap<String, ConnectedEntry>>,
}

impl SqliteIndexStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                file_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                modification_time INTEGER NOT NULL,
                size INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS clients (
                client_id TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS shares (
                file_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                PRIMARY KEY (file_id, client_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            connected: Mutex::new(HashMap::new()),
        })
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::open(":memory:")
    }
}

impl IndexStore for SqliteIndexStore {
    fn add_client(&self, client_id: &str) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO clients (client_id) VALUES (?1)",
            params![client_id],
        )?;
        Ok(())
    }

    fn add_share(&self, file: &SharedFile, client_id: &str) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO files (file_id, name, modification_time, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![file.file_id, file.name, file.modification_time, file.size],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO shares (file_id, client_id) VALUES (?1, ?2)",
            params![file.file_id, client_id],
        )?;
        if inserted == 0 {
            return Err(IndexError::Duplicate);
        }
        Ok(())
    }

    fn remove_share(&self, file_id: &str, client_id: &str) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM shares WHERE file_id = ?1 AND client_id = ?2",
            params![file_id, client_id],
        )?;
        if removed == 0 {
            return Err(IndexError::NotFound);
        }
        Ok(())
    }

    fn get_file(&self, file_id: &str) -> Result<Option<SharedFile>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT file_id, name, modification_time, size FROM files WHERE file_id = ?1",
                params![file_id],
                |row| {
                    Ok(SharedFile {
                        file_id: row.get(0)?,
                        name: row.get(1)?,
                        modification_time: row.get(2)?,
                        size: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn search_by_name(&self, substr: &str) -> Result<Vec<SharedFile>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%{}%", substr.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT file_id, name, modification_time, size FROM files
             WHERE name LIKE ?1 ESCAPE '\\'",
        )?;
        let rows = stmt.query_map(params![pattern], |row| {
            Ok(SharedFile {
                file_id: row.get(0)?,
                name: row.get(1)?,
                modification_time: row.get(2)?,
                size: row.get(3)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn find_sharing_clients(&self, file_id: &str) -> Result<Vec<String>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT client_id FROM shares WHERE file_id = ?1")?;
        let rows = stmt.query_map(params![file_id], |row| row.get::<_, String>(0))?;
        let mut clients = Vec::new();
        for row in rows {
            clients.push(row?);
        }
        Ok(clients)
    }

    fn mark_connected(&self, client_id: &str, ip: Ipv4Addr) {
        let mut connected = self.connected.lock().unwrap();
        connected
            .entry(client_id.to_string())
            .or_insert(ConnectedEntry { ip, port: None })
            .ip = ip;
    }

    fn set_port(&self, client_id: &str, port: u16) {
        let mut connected = self.connected.lock().unwrap();
        connected
            .entry(client_id.to_string())
            .or_insert(ConnectedEntry {
                ip: Ipv4Addr::UNSPECIFIED,
                port: None,
            })
            .port = Some(port);
    }

    fn disconnect(&self, client_id: &str) {
        self.connected.lock().unwrap().remove(client_id);
    }

    fn connected_info(&self, client_id: &str) -> Option<(Ipv4Addr, Option<u16>)> {
        self.connected
            .lock()
            .unwrap()
            .get(client_id)
            .map(|e| (e.ip, e.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(id: &str, name: &str) -> SharedFile {
        SharedFile {
            file_id: id.repeat(32 / id.len().max(1)).chars().take(32).collect(),
            name: name.to_string(),
            modification_time: 1000,
            size: 2000,
        }
    }

    #[test]
    fn add_share_is_idempotent_but_flags_duplicates() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        let file = sample_file("a", "movie.mkv");
        store.add_client("client-1").unwrap();
        store.add_share(&file, "client-1").unwrap();
        let err = store.add_share(&file, "client-1").unwrap_err();
        assert!(matches!(err, IndexError::Duplicate));
    }

    #[test]
    fn remove_share_reports_not_found() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        let file = sample_file("b", "movie.mkv");
        let err = store.remove_share(&file.file_id, "ghost").unwrap_err();
        assert!(matches!(err, IndexError::NotFound));
    }

    #[test]
    fn search_matches_substrings() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        let file = sample_file("c", "great_movie.mkv");
        store.add_share(&file, "client-1").unwrap();
        let found = store.search_by_name("movie").unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.search_by_name("nope").unwrap().is_empty());
    }

    #[test]
    fn shares_persist_across_disconnect_but_connected_does_not() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        let file = sample_file("d", "movie.mkv");
        store.add_share(&file, "client-1").unwrap();
        store.mark_connected("client-1", Ipv4Addr::LOCALHOST);
        store.set_port("client-1", 5000);
        store.disconnect("client-1");

        assert_eq!(store.connected_info("client-1"), None);
        assert_eq!(
            store.find_sharing_clients(&file.file_id).unwrap(),
            vec!["client-1".to_string()]
        );
    }
}
