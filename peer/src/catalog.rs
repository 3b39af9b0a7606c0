//! Local persistent state: the opaque client id file and the catalog of
//! locally-advertised shares, kept outside the download engine's view per
//! spec.md §6 ("specified only by the interfaces the core consumes").
//!
//! Grounded on `original_source/p2p_fileshare/client/files_manager.py`
//! (`generate_db_path`, the per-user `<username>.db`) and on
//! `patrickett-dryas/src/config.rs` for resolving a per-user state
//! directory with `dirs` instead of hardcoding the current directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::PeerError;

pub trait ShareCatalog: Send + Sync {
    fn add(&self, file_id: &str, path: &Path) -> Result<(), PeerError>;
    fn remove(&self, file_id: &str) -> Result<(), PeerError>;
    fn path_for(&self, file_id: &str) -> Result<Option<PathBuf>, PeerError>;
    fn list(&self) -> Result<Vec<(String, PathBuf)>, PeerError>;
    fn any_shared(&self) -> Result<bool, PeerError>;
}

/// Backs spec.md §6's `files(file_path, unique_id PK)` table.
pub struct SqliteShareCatalog {
    conn: Mutex<Connection>,
}

impl SqliteShareCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PeerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                file_path TEXT NOT NULL,
                file_id TEXT PRIMARY KEY
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PeerError> {
        Self::open(":memory:")
    }
}

impl ShareCatalog for SqliteShareCatalog {
    fn add(&self, file_id: &str, path: &Path) -> Result<(), PeerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO files (file_path, file_id) VALUES (?1, ?2)",
            params![path.to_string_lossy(), file_id],
        )?;
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<(), PeerError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM files WHERE file_id = ?1", params![file_id])?;
        if removed == 0 {
            return Err(PeerError::NotFound);
        }
        Ok(())
    }

    fn path_for(&self, file_id: &str) -> Result<Option<PathBuf>, PeerError> {
        let conn = self.conn.lock().unwrap();
        let path: Option<String> = conn
            .query_row(
                "SELECT file_path FROM files WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    fn list(&self) -> Result<Vec<(String, PathBuf)>, PeerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT file_id, file_path FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn any_shared(&self) -> Result<bool, PeerError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count > 0)
    }
}

/// Reads `<username>_client_id.dat` under the per-user data directory,
/// minting and persisting a fresh one on first run.
pub fn load_or_create_client_id(username: &str) -> std::io::Result<String> {
    let path = client_id_path(username);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if trimmed.len() == net::message::UNIQUE_ID_LEN {
            return Ok(trimmed.to_string());
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, net::message::NO_CLIENT_ID)?;
    Ok(net::message::NO_CLIENT_ID.to_string())
}

/// Called once the index has assigned a real id, so subsequent starts bind
/// the same identity (spec.md §6).
pub fn persist_client_id(username: &str, client_id: &str) -> std::io::Result<()> {
    let path = client_id_path(username);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, client_id)
}

fn client_id_path(username: &str) -> PathBuf {
    let base = dirs::data_dir()
        .map(|d| d.join("flud-peer"))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(format!("{username}_client_id.dat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_path_for_round_trips() {
        let catalog = SqliteShareCatalog::open_in_memory().unwrap();
        let id = "a".repeat(32);
        catalog.add(&id, Path::new("/tmp/movie.mkv")).unwrap();
        assert_eq!(catalog.path_for(&id).unwrap(), Some(PathBuf::from("/tmp/movie.mkv")));
        assert!(catalog.any_shared().unwrap());
    }

    #[test]
    fn remove_missing_reports_not_found() {
        let catalog = SqliteShareCatalog::open_in_memory().unwrap();
        let err = catalog.remove(&"b".repeat(32)).unwrap_err();
        assert!(matches!(err, PeerError::NotFound));
    }

    #[test]
    fn list_reflects_every_share() {
        let catalog = SqliteShareCatalog::open_in_memory().unwrap();
        catalog.add(&"c".repeat(32), Path::new("/a")).unwrap();
        catalog.add(&"d".repeat(32), Path::new("/b")).unwrap();
        let mut shares = catalog.list().unwrap();
        shares.sort();
        assert_eq!(
            shares,
            vec![
                ("c".repeat(32), PathBuf::from("/a")),
                ("d".repeat(32), PathBuf::from("/b")),
            ]
        );
    }
}
