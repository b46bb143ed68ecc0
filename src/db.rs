//! Dictionary-style facade over [`Storage`] and [`Tree`]: the thin wrapper
//! the CLI and applications actually talk to.

use std::path::Path;

use crate::error::DbError;
use crate::storage::Storage;
use crate::tree::Tree;

pub struct Db {
    storage: Storage,
    tree: Tree,
}

impl Db {
    /// Open or create the database file at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut storage = Storage::open(path)?;
        let root = storage.root()?;
        Ok(Db {
            storage,
            tree: Tree::new(root),
        })
    }

    pub fn get(&mut self, key: &str) -> Result<String, DbError> {
        self.tree.get(&mut self.storage, key)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        self.tree.set(&mut self.storage, key, value)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), DbError> {
        self.tree.delete(&mut self.storage, key)
    }

    /// Implemented by attempting `get`: `NotFound` becomes `false`, any
    /// other error propagates.
    pub fn contains(&mut self, key: &str) -> Result<bool, DbError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Persist all in-memory mutations: commit is the only thing that
    /// makes `set`/`delete` durable or visible to other handles.
    pub fn commit(&mut self) -> Result<(), DbError> {
        self.tree.commit(&mut self.storage)
    }

    /// Release the lock and close the file. Consumes `self`, so there is
    /// no "closed" flag to check or get out of sync with the file — a
    /// closed `Db` simply no longer exists.
    pub fn close(self) -> Result<(), DbError> {
        self.storage.close()
    }
}
