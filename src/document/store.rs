//! SQLite persistence for collaborative documents
//!
//! Documents are stored as full Automerge save blobs keyed by document id
//! and restored on the next page load.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

pub struct DocumentStore {
    db: Connection,
}

impl DocumentStore {
    /// Open or create `documents.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("documents.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        // WAL so a second tab can read while this one writes
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&db)?;

        info!(path = %db_path.display(), "Document store opened");
        Ok(Self { db })
    }

    /// Store that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory database")?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );",
        )?;
        Ok(())
    }

    pub fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT data FROM documents WHERE doc_id = ?1")?;

        let result = stmt.query_row([doc_id], |row| row.get::<_, Vec<u8>>(0));

        match result {
            Ok(data) => Ok(Some(data)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("loading doc {doc_id}")),
        }
    }

    pub fn save(&self, doc_id: &str, data: &[u8]) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO documents (doc_id, data, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(doc_id) DO UPDATE SET data = ?2, updated_at = strftime('%s', 'now')",
                rusqlite::params![doc_id, data],
            )
            .with_context(|| format!("saving doc {doc_id}"))?;
        debug!(doc_id, bytes = data.len(), "Saved document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_reload_across_connections() {
        let dir = TempDir::new().unwrap();
        {
            let store = DocumentStore::open(dir.path()).unwrap();
            store.save("shell", b"first").unwrap();
            store.save("shell", b"second").unwrap();
        }

        let store = DocumentStore::open(dir.path()).unwrap();
        assert_eq!(store.load("shell").unwrap().as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let store = DocumentStore::in_memory().unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mode: String = store
            .db
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
