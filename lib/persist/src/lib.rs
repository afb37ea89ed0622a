//! A small bucketed key/value store over an embedded SQLite database.
//!
//! Buckets nest one level at a time and hold byte keys and values ordered
//! lexicographically. All mutation happens inside `update` transactions:
//! the closure either returns `Ok` and its writes commit atomically, or
//! returns `Err` (or unwinds) and nothing is persisted. `view` runs
//! read-only. Opening with no path yields a stub whose operations succeed
//! without doing anything, for running without durability.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

/// Separator for nested bucket paths. Not a printable character, so it
/// cannot collide with operator ids.
const SEP: char = '\u{1f}';

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store is closed")]
    Closed,

    #[error("cannot {op} in a read-only transaction")]
    ReadOnly { op: &'static str },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to the store. Cloning shares the underlying database.
#[derive(Clone)]
pub enum Store {
    Sqlite(Arc<Mutex<Option<Connection>>>),

    /// The no-op store used when durability is disabled.
    Stub,
}

impl Store {
    /// Opens (or creates) the database at `path`, creating parent
    /// directories as needed. Readable by the group, writable only by the
    /// owner.
    pub fn open(path: &Path) -> Result<Store, Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                DirBuilder::new().recursive(true).mode(0o755).create(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                 parent TEXT NOT NULL,
                 name   TEXT NOT NULL,
                 PRIMARY KEY (parent, name)
             );
             CREATE TABLE IF NOT EXISTS kv (
                 bucket TEXT NOT NULL,
                 key    BLOB NOT NULL,
                 value  BLOB NOT NULL,
                 PRIMARY KEY (bucket, key)
             );",
        )?;

        Ok(Store::Sqlite(Arc::new(Mutex::new(Some(conn)))))
    }

    /// A store whose operations all succeed without doing anything.
    pub fn stub() -> Store {
        Store::Stub
    }

    /// Runs `f` in a read/write transaction with exclusive access. The
    /// transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err` or unwinds.
    pub fn update<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&Txn<'_>) -> Result<(), Error>,
    {
        match self {
            Store::Stub => Ok(()),
            Store::Sqlite(inner) => {
                let mut guard = lock(inner);
                let conn = guard.as_mut().ok_or(Error::Closed)?;

                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                f(&Txn {
                    tx: &tx,
                    writable: true,
                })?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    /// Runs `f` in a read-only transaction.
    pub fn view<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&Txn<'_>) -> Result<(), Error>,
    {
        match self {
            Store::Stub => Ok(()),
            Store::Sqlite(inner) => {
                let mut guard = lock(inner);
                let conn = guard.as_mut().ok_or(Error::Closed)?;

                let tx = conn.transaction()?;
                f(&Txn {
                    tx: &tx,
                    writable: false,
                })?;
                // Nothing to commit; dropping releases the read snapshot.
                Ok(())
            }
        }
    }

    /// Flushes committed state through to the database file.
    pub fn sync(&self) -> Result<(), Error> {
        match self {
            Store::Stub => Ok(()),
            Store::Sqlite(inner) => {
                let guard = lock(inner);
                let conn = guard.as_ref().ok_or(Error::Closed)?;
                conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
                Ok(())
            }
        }
    }

    /// Closes the store; later operations fail with `Closed`. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        match self {
            Store::Stub => Ok(()),
            Store::Sqlite(inner) => {
                lock(inner).take();
                Ok(())
            }
        }
    }
}

fn lock(inner: &Mutex<Option<Connection>>) -> std::sync::MutexGuard<'_, Option<Connection>> {
    // A panic inside an update closure poisons the mutex after the
    // transaction already rolled back; the store itself is still sound.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A transaction handle passed to `update`/`view` closures.
pub struct Txn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    writable: bool,
}

impl Txn<'_> {
    /// Opens a top-level bucket, creating it in an update transaction.
    pub fn bucket(&self, name: &str) -> Result<Bucket<'_>, Error> {
        self.open_at("", name)
    }

    /// Opens a top-level bucket only if it exists.
    pub fn existing_bucket(&self, name: &str) -> Result<Option<Bucket<'_>>, Error> {
        self.existing_at("", name)
    }

    /// Deletes a top-level bucket, its keys, and its children.
    pub fn delete_bucket(&self, name: &str) -> Result<(), Error> {
        self.delete_at("", name)
    }

    fn open_at(&self, parent: &str, name: &str) -> Result<Bucket<'_>, Error> {
        if !self.writable {
            return match self.existing_at(parent, name)? {
                Some(bucket) => Ok(bucket),
                None => Err(Error::ReadOnly {
                    op: "create a bucket",
                }),
            };
        }

        self.tx.execute(
            "INSERT OR IGNORE INTO buckets (parent, name) VALUES (?1, ?2)",
            params![parent, name],
        )?;

        Ok(Bucket {
            txn: self,
            path: join(parent, name),
        })
    }

    fn existing_at(&self, parent: &str, name: &str) -> Result<Option<Bucket<'_>>, Error> {
        let exists = self
            .tx
            .query_row(
                "SELECT 1 FROM buckets WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        Ok(exists.then(|| Bucket {
            txn: self,
            path: join(parent, name),
        }))
    }

    fn delete_at(&self, parent: &str, name: &str) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly {
                op: "delete a bucket",
            });
        }

        let path = join(parent, name);
        for child in self.children_of(&path)? {
            self.delete_at(&path, &child)?;
        }

        self.tx
            .execute("DELETE FROM kv WHERE bucket = ?1", params![path])?;
        self.tx.execute(
            "DELETE FROM buckets WHERE parent = ?1 AND name = ?2",
            params![parent, name],
        )?;
        Ok(())
    }

    fn children_of(&self, path: &str) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .tx
            .prepare("SELECT name FROM buckets WHERE parent = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![path], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}{SEP}{name}")
    }
}

/// A bucket within a transaction: byte keys and values, plus child
/// buckets one level down.
pub struct Bucket<'a> {
    txn: &'a Txn<'a>,
    path: String,
}

impl<'a> Bucket<'a> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let value = self
            .txn
            .tx
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![self.path, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if !self.txn.writable {
            return Err(Error::ReadOnly { op: "put a key" });
        }

        self.txn.tx.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![self.path, key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        if !self.txn.writable {
            return Err(Error::ReadOnly { op: "delete a key" });
        }

        self.txn.tx.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![self.path, key],
        )?;
        Ok(())
    }

    /// Key/value pairs in lexicographic key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut stmt = self.txn.tx.prepare(
            "SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![self.path], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Opens a child bucket, creating it in an update transaction. The
    /// child borrows the transaction, not the parent bucket, so it can
    /// outlive the parent handle.
    pub fn child(&self, name: &str) -> Result<Bucket<'a>, Error> {
        self.txn.open_at(&self.path, name)
    }

    pub fn existing_child(&self, name: &str) -> Result<Option<Bucket<'a>>, Error> {
        self.txn.existing_at(&self.path, name)
    }

    pub fn delete_child(&self, name: &str) -> Result<(), Error> {
        self.txn.delete_at(&self.path, name)
    }

    /// Names of child buckets in lexicographic order.
    pub fn children(&self) -> Result<Vec<String>, Error> {
        self.txn.children_of(&self.path)
    }
}
