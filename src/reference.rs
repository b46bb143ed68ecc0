//! Lazy references: a handle to something that may live on disk, in
//! memory, both, or neither.
//!
//! A `Ref<T>` is conceptually the tagged variant from the design notes —
//! `Empty | Unloaded(Address) | Loaded(T) | Persisted(Address, T)` — but is
//! represented as an address plus an interior-mutable cache rather than a
//! literal enum. The reason is structural sharing: the same loaded node can
//! be reachable through more than one in-memory tree version before it is
//! ever persisted, so caching a load has to happen behind a shared
//! reference, not an owned `&mut self`. `state()` below exposes the four
//! logical states for callers (and tests) that want to match on them
//! directly.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::DbError;
use crate::storage::{Address, Storage};

/// The four logical states a [`Ref`] can be in, matching spec section 4.2.
pub enum RefState<T> {
    Empty,
    Unloaded(Address),
    Loaded(Rc<T>),
    Persisted(Address, Rc<T>),
}

/// Something a `Ref` can point at: knows how to turn itself into bytes and
/// back, and (for node referents) how to persist its children first.
pub trait Referent: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, DbError>;

    /// Store any child references before this referent is serialized.
    /// The default is a no-op; `Node` overrides it.
    fn prepare_children(&self, _storage: &mut Storage) -> Result<(), DbError> {
        Ok(())
    }
}

pub struct Ref<T> {
    address: RefCell<Address>,
    cached: RefCell<Option<Rc<T>>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            address: RefCell::new(*self.address.borrow()),
            cached: RefCell::new(self.cached.borrow().clone()),
        }
    }
}

impl<T: Referent> Ref<T> {
    pub fn empty() -> Self {
        Ref {
            address: RefCell::new(0),
            cached: RefCell::new(None),
        }
    }

    pub fn from_address(address: Address) -> Self {
        Ref {
            address: RefCell::new(address),
            cached: RefCell::new(None),
        }
    }

    pub fn from_referent(referent: T) -> Self {
        Ref {
            address: RefCell::new(0),
            cached: RefCell::new(Some(Rc::new(referent))),
        }
    }

    /// The stored address, or 0 if empty or not yet written.
    pub fn address(&self) -> Address {
        *self.address.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.address() == 0 && self.cached.borrow().is_none()
    }

    pub fn state(&self) -> RefState<T> {
        let addr = self.address();
        match (&*self.cached.borrow(), addr) {
            (None, 0) => RefState::Empty,
            (None, a) => RefState::Unloaded(a),
            (Some(r), 0) => RefState::Loaded(Rc::clone(r)),
            (Some(r), a) => RefState::Persisted(a, Rc::clone(r)),
        }
    }

    /// Load-on-demand: empty stays `None` with no I/O, an already-cached
    /// referent is cloned (cheap — it's an `Rc`), and an unloaded address
    /// is read and cached before being returned.
    pub fn get(&self, storage: &mut Storage) -> Result<Option<Rc<T>>, DbError> {
        if let Some(cached) = self.cached.borrow().as_ref() {
            return Ok(Some(Rc::clone(cached)));
        }
        let addr = self.address();
        if addr == 0 {
            return Ok(None);
        }
        let bytes = storage
            .read(addr)?
            .ok_or_else(|| DbError::Corrupt(format!("dangling reference at {addr}")))?;
        let referent = Rc::new(T::from_bytes(&bytes)?);
        *self.cached.borrow_mut() = Some(Rc::clone(&referent));
        Ok(Some(referent))
    }

    /// Write-once: a referent with no address is serialized (after its
    /// children, if any, are themselves stored) and the returned address is
    /// cached. An already-addressed or empty reference does nothing.
    pub fn store(&self, storage: &mut Storage) -> Result<(), DbError> {
        if self.address() != 0 {
            return Ok(());
        }
        let referent = match self.cached.borrow().clone() {
            Some(r) => r,
            None => return Ok(()),
        };
        referent.prepare_children(storage)?;
        let bytes = referent.to_bytes();
        let addr = storage.write(&bytes)?;
        *self.address.borrow_mut() = addr;
        Ok(())
    }
}

/// Self-describing length-prefixed UTF-8 encoding for string referents.
impl Referent for String {
    fn to_bytes(&self) -> Vec<u8> {
        let bytes = self.as_bytes();
        let mut out = Vec::with_capacity(8 + bytes.len());
        out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DbError> {
        if bytes.len() < 8 {
            return Err(DbError::Corrupt("truncated string value".into()));
        }
        let (len_bytes, rest) = bytes.split_at(8);
        let len = u64::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        if rest.len() != len {
            return Err(DbError::Corrupt("string length mismatch".into()));
        }
        String::from_utf8(rest.to_vec()).map_err(|e| DbError::Corrupt(e.to_string()))
    }
}
