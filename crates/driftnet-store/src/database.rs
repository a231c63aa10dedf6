//! Database connection and transaction management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation.  All reads and
//! writes go through a [`Txn`]: a wrapper around a `rusqlite::Transaction`
//! that rolls back on drop unless [`Txn::commit`] is called, so no failed
//! operation can leave partial state behind.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::Result;
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    capacity: u64,
}

impl Database {
    /// Open (or create) a database at an explicit path.
    ///
    /// `capacity` is the configured maximum size of the message store in
    /// bytes; free space is reported relative to it.
    pub fn open_at(path: &Path, capacity: u64) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        tracing::info!(path = %path.display(), capacity, "opening database");

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn, capacity })
    }

    /// Open an in-memory database.  Used by tests.
    pub fn open_in_memory(capacity: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn, capacity })
    }

    /// Start a transaction.  The transaction rolls back when dropped
    /// unless [`Txn::commit`] is called.
    pub fn transaction(&mut self) -> Result<Txn<'_>> {
        let inner = self.conn.transaction()?;
        Ok(Txn {
            inner,
            capacity: self.capacity,
        })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// An open transaction.  Dropping it without calling [`Txn::commit`]
/// rolls back every change made through it.
pub struct Txn<'a> {
    inner: rusqlite::Transaction<'a>,
    capacity: u64,
}

impl<'a> Txn<'a> {
    /// Commit all changes made through this transaction.
    pub fn commit(self) -> Result<()> {
        self.inner.commit()?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &rusqlite::Connection {
        &self.inner
    }

    /// Free storage space in bytes: the configured capacity minus the
    /// total size of stored messages.
    pub fn free_space(&self) -> Result<u64> {
        let used: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(length), 0) FROM messages",
            [],
            |row| row.get(0),
        )?;
        Ok(self.capacity.saturating_sub(used as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path, 1024).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut db = Database::open_in_memory(1024).unwrap();
        {
            let txn = db.transaction().unwrap();
            txn.conn()
                .execute("INSERT INTO ratings (authorId, rating) VALUES ('ab', 1)", [])
                .unwrap();
            // dropped without commit
        }
        let txn = db.transaction().unwrap();
        let count: i64 = txn
            .conn()
            .query_row("SELECT COUNT(*) FROM ratings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn free_space_reflects_stored_bytes() {
        let mut db = Database::open_in_memory(1000).unwrap();
        let txn = db.transaction().unwrap();
        assert_eq!(txn.free_space().unwrap(), 1000);
    }
}
