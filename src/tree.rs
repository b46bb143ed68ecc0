//! The persistent, immutable binary search tree.
//!
//! Every mutation produces a new root reference whose path shares whatever
//! subtrees it didn't touch with the old root. Nothing here is visible to
//! other handles until [`Tree::commit`] runs; until then it lives only in
//! the in-memory side of the references making up the dirty path.

use std::rc::Rc;

use crate::error::DbError;
use crate::reference::{Ref, Referent};
use crate::storage::{Address, Storage};

pub type ValueRef = Ref<String>;
pub type NodeRef = Ref<Node>;

/// A tree node. `length` is a derived invariant: `1 + left.length() +
/// right.length()`, recomputed on every structural change from the
/// children's reference lengths rather than by re-counting the subtree.
#[derive(Clone)]
pub struct Node {
    pub left: NodeRef,
    pub key: String,
    pub value: ValueRef,
    pub right: NodeRef,
    pub length: u64,
}

impl Node {
    fn leaf(key: String, value: ValueRef) -> Self {
        Node {
            left: NodeRef::empty(),
            key,
            value,
            right: NodeRef::empty(),
            length: 1,
        }
    }

    fn with_left(base: &Node, new_left: NodeRef) -> Self {
        let length = base.length - base.left.length() + new_left.length();
        Node {
            left: new_left,
            key: base.key.clone(),
            value: base.value.clone(),
            right: base.right.clone(),
            length,
        }
    }

    fn with_right(base: &Node, new_right: NodeRef) -> Self {
        let length = base.length - base.right.length() + new_right.length();
        Node {
            left: base.left.clone(),
            key: base.key.clone(),
            value: base.value.clone(),
            right: new_right,
            length,
        }
    }

    fn with_value(base: &Node, new_value: ValueRef) -> Self {
        Node {
            left: base.left.clone(),
            key: base.key.clone(),
            value: new_value,
            right: base.right.clone(),
            length: base.length,
        }
    }

    /// Rebuild a node around a (possibly new) key/value taken from
    /// elsewhere, with fresh left/right subtrees — used by two-child
    /// deletion to graft the in-order successor into `node`'s place.
    fn rebuilt(left: NodeRef, key: String, value: ValueRef, right: NodeRef) -> Self {
        let length = 1 + left.length() + right.length();
        Node {
            left,
            key,
            value,
            right,
            length,
        }
    }
}

/// On-disk shape of a node: the tuple (left-address, key, value-address,
/// right-address, length), each integer a fixed-width big-endian `u64` —
/// the same encoding `storage.rs` uses for the superblock and block length
/// prefixes — with only the key's bytes varying in length. Only child
/// *addresses* are stored, never embedded children, so that a node's
/// children are always durable before the node that references them is
/// written.
impl Referent for Node {
    fn to_bytes(&self) -> Vec<u8> {
        let key_bytes = self.key.as_bytes();
        let mut out = Vec::with_capacity(8 * 4 + 8 + key_bytes.len());
        out.extend_from_slice(&self.left.address().to_be_bytes());
        out.extend_from_slice(&(key_bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.extend_from_slice(&self.value.address().to_be_bytes());
        out.extend_from_slice(&self.right.address().to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DbError> {
        let read_u64 = |b: &[u8]| -> Result<(u64, &[u8]), DbError> {
            if b.len() < 8 {
                return Err(DbError::Corrupt("truncated node record".into()));
            }
            let (head, rest) = b.split_at(8);
            Ok((u64::from_be_bytes(head.try_into().unwrap()), rest))
        };

        let (left, rest) = read_u64(bytes)?;
        let (key_len, rest) = read_u64(rest)?;
        let key_len = key_len as usize;
        if rest.len() < key_len {
            return Err(DbError::Corrupt("truncated node key".into()));
        }
        let (key_bytes, rest) = rest.split_at(key_len);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|e| DbError::Corrupt(e.to_string()))?;
        let (value, rest) = read_u64(rest)?;
        let (right, rest) = read_u64(rest)?;
        let (length, rest) = read_u64(rest)?;
        if !rest.is_empty() {
            return Err(DbError::Corrupt("trailing bytes after node record".into()));
        }

        Ok(Node {
            left: NodeRef::from_address(left),
            key,
            value: ValueRef::from_address(value),
            right: NodeRef::from_address(right),
            length,
        })
    }

    fn prepare_children(&self, storage: &mut Storage) -> Result<(), DbError> {
        // Depth-first: grandchildren (and the value) land on disk before
        // this node is serialized, so every address this node records is
        // already durable.
        self.value.store(storage)?;
        self.left.store(storage)?;
        self.right.store(storage)?;
        Ok(())
    }
}

impl NodeRef {
    /// Number of key-value pairs in this subtree. An empty reference
    /// answers 0 without touching storage. An unloaded reference that has
    /// never been followed cannot answer this without a read; the tree
    /// never asks in that state (it always follows a reference before
    /// computing a new length from it), so this is a programming-error
    /// panic rather than a silent wrong answer.
    pub fn length(&self) -> u64 {
        use crate::reference::RefState;
        match self.state() {
            RefState::Empty => 0,
            RefState::Loaded(n) | RefState::Persisted(_, n) => n.length,
            RefState::Unloaded(addr) => {
                panic!("length requested for unloaded node at address {addr}")
            }
        }
    }
}

/// The persistent BST plus the bookkeeping `get`/`set`/`delete`/`commit`
/// need: when to refresh the root from the superblock, and what post-order
/// write means for `commit`.
pub struct Tree {
    root: NodeRef,
}

impl Tree {
    pub fn new(root_address: Address) -> Self {
        Tree {
            root: NodeRef::from_address(root_address),
        }
    }

    fn refresh(&mut self, storage: &mut Storage) -> Result<(), DbError> {
        let addr = storage.root()?;
        self.root = NodeRef::from_address(addr);
        Ok(())
    }

    pub fn get(&mut self, storage: &mut Storage, key: &str) -> Result<String, DbError> {
        if !storage.is_locked() {
            self.refresh(storage)?;
        }
        Self::get_node(&self.root, storage, key)
    }

    /// The current root reference, for callers that want to walk the tree
    /// directly (tests, diagnostics) rather than through `get`/`set`.
    pub fn root_ref(&self) -> &NodeRef {
        &self.root
    }

    fn get_node(node_ref: &NodeRef, storage: &mut Storage, key: &str) -> Result<String, DbError> {
        match node_ref.get(storage)? {
            None => Err(DbError::NotFound {
                key: key.to_string(),
            }),
            Some(node) => {
                if key < node.key.as_str() {
                    Self::get_node(&node.left, storage, key)
                } else if key > node.key.as_str() {
                    Self::get_node(&node.right, storage, key)
                } else {
                    let value = node
                        .value
                        .get(storage)?
                        .ok_or_else(|| DbError::Corrupt(format!("node {key:?} has no value")))?;
                    Ok((*value).clone())
                }
            }
        }
    }

    pub fn set(&mut self, storage: &mut Storage, key: &str, value: &str) -> Result<(), DbError> {
        if storage.lock()? {
            self.refresh(storage)?;
        }
        let value_ref = ValueRef::from_referent(value.to_string());
        self.root = Self::insert(&self.root, storage, key, value_ref)?;
        Ok(())
    }

    fn insert(
        node_ref: &NodeRef,
        storage: &mut Storage,
        key: &str,
        value_ref: ValueRef,
    ) -> Result<NodeRef, DbError> {
        let new_node = match node_ref.get(storage)? {
            None => Node::leaf(key.to_string(), value_ref),
            Some(node) => {
                if key < node.key.as_str() {
                    let new_left = Self::insert(&node.left, storage, key, value_ref)?;
                    Node::with_left(&node, new_left)
                } else if key > node.key.as_str() {
                    let new_right = Self::insert(&node.right, storage, key, value_ref)?;
                    Node::with_right(&node, new_right)
                } else {
                    Node::with_value(&node, value_ref)
                }
            }
        };
        Ok(NodeRef::from_referent(new_node))
    }

    pub fn delete(&mut self, storage: &mut Storage, key: &str) -> Result<(), DbError> {
        if storage.lock()? {
            self.refresh(storage)?;
        }
        self.root = Self::delete_node(&self.root, storage, key)?;
        Ok(())
    }

    fn delete_node(node_ref: &NodeRef, storage: &mut Storage, key: &str) -> Result<NodeRef, DbError> {
        let node = node_ref.get(storage)?.ok_or_else(|| DbError::NotFound {
            key: key.to_string(),
        })?;

        if key < node.key.as_str() {
            let new_left = Self::delete_node(&node.left, storage, key)?;
            return Ok(NodeRef::from_referent(Node::with_left(&node, new_left)));
        }
        if key > node.key.as_str() {
            let new_right = Self::delete_node(&node.right, storage, key)?;
            return Ok(NodeRef::from_referent(Node::with_right(&node, new_right)));
        }

        // key == node.key: the four deletion cases.
        let left_present = node.left.get(storage)?.is_some();
        let right_present = node.right.get(storage)?.is_some();

        Ok(match (left_present, right_present) {
            (false, false) => NodeRef::empty(),
            (true, false) => node.left.clone(),
            (false, true) => node.right.clone(),
            (true, true) => {
                let successor = Self::find_min(&node.right, storage)?;
                let new_right = Self::delete_node(&node.right, storage, &successor.key)?;
                NodeRef::from_referent(Node::rebuilt(
                    node.left.clone(),
                    successor.key.clone(),
                    successor.value.clone(),
                    new_right,
                ))
            }
        })
    }

    /// Walk left from `node_ref` until there is no further left child;
    /// return the minimum-key node — the in-order successor used when
    /// deleting a two-child node.
    fn find_min(node_ref: &NodeRef, storage: &mut Storage) -> Result<Rc<Node>, DbError> {
        let mut current = node_ref
            .get(storage)?
            .expect("find_min called on an empty subtree");
        loop {
            match current.left.get(storage)? {
                Some(left) => current = left,
                None => return Ok(current),
            }
        }
    }

    /// Persist every unwritten descendant of the dirty root in post-order
    /// (children before parents — `Ref::store` already guarantees this),
    /// then atomically swap the superblock's root pointer.
    pub fn commit(&mut self, storage: &mut Storage) -> Result<(), DbError> {
        self.root.store(storage)?;
        storage.commit_root(self.root.address())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn storage() -> Storage {
        let path = NamedTempFile::new().unwrap().into_temp_path();
        Storage::open(&path).unwrap()
    }

    fn in_order(tree: &mut Tree, storage: &mut Storage) -> Vec<String> {
        fn walk(node_ref: &NodeRef, storage: &mut Storage, out: &mut Vec<String>) {
            if let Some(node) = node_ref.get(storage).unwrap() {
                walk(&node.left, storage, out);
                out.push(node.key.clone());
                walk(&node.right, storage, out);
            }
        }
        let mut out = Vec::new();
        walk(&tree.root, storage, &mut out);
        out
    }

    #[test]
    fn get_on_empty_tree_is_not_found() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        assert!(tree.get(&mut storage, "missing").is_err());
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        tree.set(&mut storage, "k", "v").unwrap();
        assert_eq!(tree.get(&mut storage, "k").unwrap(), "v");
    }

    #[test]
    fn overwrite_replaces_value_without_changing_length() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        tree.set(&mut storage, "k", "v1").unwrap();
        tree.set(&mut storage, "k", "v2").unwrap();
        assert_eq!(tree.get(&mut storage, "k").unwrap(), "v2");
        assert_eq!(tree.root.length(), 1);
    }

    #[test]
    fn lengths_are_consistent_after_several_inserts() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        for key in ["m", "g", "t", "f", "h", "s", "z"] {
            tree.set(&mut storage, key, "v").unwrap();
        }
        assert_eq!(tree.root.length(), 7);
    }

    #[test]
    fn in_order_traversal_is_sorted() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        for key in ["m", "g", "t", "f", "h", "s", "z"] {
            tree.set(&mut storage, key, "v").unwrap();
        }
        let order = in_order(&mut tree, &mut storage);
        assert_eq!(order, vec!["f", "g", "h", "m", "s", "t", "z"]);
    }

    #[test]
    fn delete_two_child_node_uses_in_order_successor() {
        // Scenario S4 from the spec.
        let mut storage = storage();
        let mut tree = Tree::new(0);
        for key in ["m", "g", "t", "f", "h", "s", "z"] {
            tree.set(&mut storage, key, "v").unwrap();
        }
        tree.delete(&mut storage, "m").unwrap();
        let order = in_order(&mut tree, &mut storage);
        assert_eq!(order, vec!["f", "g", "h", "s", "t", "z"]);
        assert_eq!(tree.root.length(), 6);
    }

    #[test]
    fn delete_missing_key_fails() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        tree.set(&mut storage, "k", "v").unwrap();
        assert!(tree.delete(&mut storage, "nope").is_err());
    }

    #[test]
    fn delete_leaf_removes_it_entirely() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        tree.set(&mut storage, "b", "v").unwrap();
        tree.set(&mut storage, "a", "v").unwrap();
        tree.set(&mut storage, "c", "v").unwrap();
        tree.delete(&mut storage, "a").unwrap();
        assert!(tree.get(&mut storage, "a").is_err());
        assert_eq!(tree.root.length(), 2);
    }

    #[test]
    fn delete_single_child_splices_it_up() {
        let mut storage = storage();
        let mut tree = Tree::new(0);
        tree.set(&mut storage, "b", "v").unwrap();
        tree.set(&mut storage, "a", "v").unwrap();
        tree.delete(&mut storage, "b").unwrap();
        assert_eq!(tree.get(&mut storage, "a").unwrap(), "v");
        assert_eq!(tree.root.length(), 1);
    }

    #[test]
    fn commit_then_reopen_preserves_contents() {
        let path = NamedTempFile::new().unwrap().into_temp_path();
        let root_addr;
        {
            let mut storage = Storage::open(&path).unwrap();
            let mut tree = Tree::new(0);
            tree.set(&mut storage, "name", "DBDB").unwrap();
            tree.set(&mut storage, "type", "kv").unwrap();
            tree.commit(&mut storage).unwrap();
            root_addr = storage.root().unwrap();
        }
        let mut storage = Storage::open(&path).unwrap();
        assert_eq!(storage.root().unwrap(), root_addr);
        let mut tree = Tree::new(root_addr);
        assert_eq!(tree.get(&mut storage, "name").unwrap(), "DBDB");
        assert_eq!(tree.get(&mut storage, "type").unwrap(), "kv");
    }
}
