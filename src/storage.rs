//! Append-only block storage with a fixed superblock.
//!
//! Offsets `0..SUPERBLOCK_SIZE` hold the superblock: the first 8 bytes are
//! the current root address (big-endian u64), the rest is reserved and
//! stays zero. Every offset at or beyond `SUPERBLOCK_SIZE` belongs to a
//! length-prefixed block (an 8-byte big-endian length followed by that many
//! data bytes) and, once written, is never overwritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::error::DbError;

/// A file offset. `0` is reserved to mean "no such block."
pub type Address = u64;

pub const SUPERBLOCK_SIZE: u64 = 4096;
const LENGTH_PREFIX_SIZE: u64 = 8;

/// The persistence layer: one regular file, one exclusive advisory lock,
/// one root pointer.
pub struct Storage {
    file: File,
    locked: bool,
}

impl Storage {
    /// Open (creating if necessary) the database file at `path` and make
    /// sure its superblock is in place.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut storage = Storage {
            file,
            locked: false,
        };
        storage.ensure_superblock()?;
        Ok(storage)
    }

    /// Extend a too-short (or brand new) file out to `SUPERBLOCK_SIZE` with
    /// zero bytes. A freshly created superblock encodes root address 0,
    /// i.e. an empty tree. Always run on open, resolving the source's
    /// `ensure_superblock`/`_ensure_superblock` naming ambiguity as "always."
    fn ensure_superblock(&mut self) -> Result<(), DbError> {
        let end = self.file.seek(SeekFrom::End(0))?;
        if end >= SUPERBLOCK_SIZE {
            return Ok(());
        }
        // Only a fresh (or truncated) file needs the lock: extending the
        // superblock is the one case `open` writes anything, and readers
        // opening an already-initialized file must never block on it.
        self.lock()?;
        let end = self.file.seek(SeekFrom::End(0))?;
        if end < SUPERBLOCK_SIZE {
            self.file.seek(SeekFrom::Start(end))?;
            let padding = vec![0u8; (SUPERBLOCK_SIZE - end) as usize];
            self.file.write_all(&padding)?;
        }
        self.unlock()?;
        Ok(())
    }

    /// Acquire the exclusive lock if we don't already hold it.
    ///
    /// Returns `true` if this call newly acquired the lock, `false` if we
    /// already held it. The tree uses this to know when to refresh its
    /// in-memory view of the root from the superblock.
    pub fn lock(&mut self) -> Result<bool, DbError> {
        if self.locked {
            return Ok(false);
        }
        self.file
            .lock_exclusive()
            .map_err(|e| DbError::Lock(e.to_string()))?;
        self.locked = true;
        log::debug!("storage: acquired exclusive lock");
        Ok(true)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Flush and release the lock. A no-op if we don't hold it.
    pub fn unlock(&mut self) -> Result<(), DbError> {
        if self.locked {
            self.file.flush()?;
            FileExt::unlock(&self.file).map_err(|e| DbError::Lock(e.to_string()))?;
            self.locked = false;
            log::debug!("storage: released exclusive lock");
        }
        Ok(())
    }

    /// Read the root address out of the superblock.
    pub fn root(&mut self) -> Result<Address, DbError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Append `data` as a new length-prefixed block and return its address
    /// (the offset of the length prefix).
    pub fn write(&mut self, data: &[u8]) -> Result<Address, DbError> {
        self.lock()?;
        let addr = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&(data.len() as u64).to_be_bytes())?;
        self.file.write_all(data)?;
        Ok(addr)
    }

    /// Read the block at `address`, or `None` if `address` is 0.
    pub fn read(&mut self, address: Address) -> Result<Option<Vec<u8>>, DbError> {
        if address == 0 {
            return Ok(None);
        }
        let file_len = self.file.metadata()?.len();
        if address + LENGTH_PREFIX_SIZE > file_len {
            return Err(DbError::Corrupt(format!(
                "address {address} has no room for a length prefix"
            )));
        }
        self.file.seek(SeekFrom::Start(address))?;
        let mut len_buf = [0u8; 8];
        self.file.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);
        if address + LENGTH_PREFIX_SIZE + len > file_len {
            return Err(DbError::Corrupt(format!(
                "block at {address} claims length {len}, past end of file"
            )));
        }
        let mut data = vec![0u8; len as usize];
        self.file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    /// Durably make `address` the new root: fsync the data region, write
    /// the superblock pointer, fsync again, then release the lock.
    ///
    /// The two fsyncs are not interchangeable: data must be durable before
    /// the pointer that names it, or a crash between them leaves a root
    /// pointing at bytes that may not survive.
    pub fn commit_root(&mut self, address: Address) -> Result<(), DbError> {
        self.lock()?;
        self.file.sync_data()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&address.to_be_bytes())?;
        self.file.sync_all()?;
        log::debug!("storage: committed root address {address}");
        self.unlock()?;
        Ok(())
    }

    /// Release the lock and drop the file handle.
    pub fn close(mut self) -> Result<(), DbError> {
        self.unlock()
    }
}
