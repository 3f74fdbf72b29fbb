//! On-disk B-tree index: timestamp keys, block-id (leaf) or child-node-id
//! (interior) values.
//!
//! Each series gets one B-tree, backed by its own growable file of 8 KiB
//! pages. Insertion is the "eager split" variant: a node that reaches degree
//! `D` keys is split immediately after the write, biasing the left sibling
//! to `floor(D * 0.9)` keys (left-heavy, which favors write-mostly
//! monotonic-timestamp workloads). `find(k)` returns the value of the
//! greatest key `<= k`.
//!
//! Grounded on the embedded `_btree` implementation in bolo's `db2.c` (the
//! "newer path", authoritative per `SPEC_FULL.md` §9): `_BT_DEGREE`,
//! `_BT_SPLIT_FACTOR = 0.9`, `track()`/`track1()` split propagation, and the
//! two-pass on-disk open (map every node, then resolve child ids to
//! in-memory indices).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Result, RondoError};
use crate::page::{Page, PageRef};

/// Page size for every B-tree node.
pub const PAGE_SIZE: usize = 8192;

/// Magic bytes identifying a node page.
pub const MAGIC: &[u8; 5] = b"BTREE";

/// Flag bit marking a node as a leaf.
const LEAF_FLAG: u8 = 0x80;

/// Node degree: how many keys fit in one 8 KiB page alongside its values.
pub const DEGREE: usize = (PAGE_SIZE - 1 - 2 - 8) / 16;

/// Fraction of a full node's keys kept on the left sibling after a split.
const SPLIT_FACTOR: f64 = 0.9;

const OFF_FLAGS: usize = 5;
const OFF_COUNT: usize = 6;
const OFF_KEYS: usize = 8;
const OFF_VALUES: usize = OFF_KEYS + 8 * DEGREE;

/// One in-memory node, mirroring its on-disk page.
struct Node {
    id: u64,
    leaf: bool,
    keys: Vec<u64>,
    /// Leaf: block ids. Interior: child node ids.
    values: Vec<u64>,
}

impl Node {
    fn new_leaf(id: u64) -> Self {
        Node { id, leaf: true, keys: Vec::new(), values: Vec::new() }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = Page::new(&mut buf);
        page.write_n(0, MAGIC).unwrap();
        page.write_u8(OFF_FLAGS, if self.leaf { LEAF_FLAG } else { 0 }).unwrap();
        page.write_u16(OFF_COUNT, self.keys.len() as u16).unwrap();
        for (i, k) in self.keys.iter().enumerate() {
            page.write_u64(OFF_KEYS + i * 8, *k).unwrap();
        }
        for (i, v) in self.values.iter().enumerate() {
            page.write_u64(OFF_VALUES + i * 8, *v).unwrap();
        }
        buf
    }

    fn from_bytes(id: u64, buf: &[u8]) -> Result<Self> {
        let page = PageRef::new(buf);
        if page.read_n(0, 5)? != MAGIC {
            return Err(RondoError::BadTree(format!("node {id:#x}: bad magic")));
        }
        let leaf = page.read_u8(OFF_FLAGS)? & LEAF_FLAG != 0;
        let count = page.read_u16(OFF_COUNT)? as usize;
        if count > DEGREE {
            return Err(RondoError::BadTree(format!("node {id:#x}: key count {count} > degree")));
        }
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            keys.push(page.read_u64(OFF_KEYS + i * 8)?);
        }
        let value_count = if leaf { count } else { count + 1 };
        let mut values = Vec::with_capacity(value_count);
        for i in 0..value_count {
            values.push(page.read_u64(OFF_VALUES + i * 8)?);
        }
        Ok(Node { id, leaf, keys, values })
    }

    fn is_full(&self) -> bool {
        self.keys.len() >= DEGREE
    }

    /// Binary search for the first key `>= k`. Returns `(index, exact_match)`.
    fn search(&self, k: u64) -> (usize, bool) {
        match self.keys.binary_search(&k) {
            Ok(i) => (i, true),
            Err(i) => (i, false),
        }
    }
}

/// A single series' B-tree index, backed by one growable file of 8 KiB
/// node pages.
pub struct BTree {
    file: File,
    path: PathBuf,
    root: u64,
    next_id: u64,
}

impl BTree {
    /// Creates a new, empty index at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        let mut tree = BTree { file, path: path.to_path_buf(), root: 0, next_id: 1 };
        let root = Node::new_leaf(0);
        tree.write_node(&root)?;
        Ok(tree)
    }

    /// Opens an existing index file, scanning every page (two-pass, matching
    /// `db2_open`'s own approach: map first, resolve child wiring second —
    /// here wiring is implicit since children are addressed by id, not
    /// pointer, so only the node-count/degree validation pass is needed).
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 || len == 0 {
            return Err(RondoError::BadTree(format!("{}: truncated index file", path.display())));
        }
        let page_count = len / PAGE_SIZE as u64;
        // Validate every page parses; root is always node id 0.
        for i in 0..page_count {
            let node = Self::read_node_at(&file, i)?;
            let _ = node;
        }
        Ok(BTree { file, path: path.to_path_buf(), root: 0, next_id: page_count })
    }

    fn read_node_at(file: &File, id: u64) -> Result<Node> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        f.read_exact(&mut buf)?;
        Node::from_bytes(id, &buf)
    }

    fn read_node(&self, id: u64) -> Result<Node> {
        Self::read_node_at(&self.file, id)
    }

    fn write_node(&mut self, node: &Node) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(node.id * PAGE_SIZE as u64))?;
        self.file.write_all(&node.to_bytes())?;
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Looks up the value of the greatest key `<= k`.
    ///
    /// # Errors
    ///
    /// Returns [`RondoError::NotSet`] if the tree is empty or every key
    /// exceeds `k`.
    pub fn find(&self, k: u64) -> Result<u64> {
        let mut node = self.read_node(self.root)?;
        loop {
            if node.leaf {
                if node.keys.is_empty() {
                    return Err(RondoError::NotSet);
                }
                let (i, exact) = node.search(k);
                if exact {
                    return Ok(node.values[i]);
                }
                if i == 0 {
                    return Err(RondoError::NotSet);
                }
                return Ok(node.values[i - 1]);
            }
            let (i, exact) = node.search(k);
            let child_idx = if exact { i + 1 } else { i };
            let child_id = node.values[child_idx];
            node = self.read_node(child_id)?;
        }
    }

    /// Inserts `k -> v`, overwriting any existing value for an equal key.
    pub fn insert(&mut self, k: u64, v: u64) -> Result<()> {
        if let Some((median, sibling_id)) = self.insert_at(self.root, k, v)? {
            // Root split: clone current root contents into a new left node,
            // reinitialize the root as an interior node [left, median, right].
            let old_root = self.read_node(self.root)?;
            let left_id = self.alloc_id();
            let left = Node { id: left_id, leaf: old_root.leaf, keys: old_root.keys, values: old_root.values };
            self.write_node(&left)?;

            let new_root =
                Node { id: self.root, leaf: false, keys: vec![median], values: vec![left_id, sibling_id] };
            self.write_node(&new_root)?;
        }
        Ok(())
    }

    /// Recursive insert. Returns `Some((median_key, new_sibling_id))` if
    /// `node_id` split and the caller (parent, or `insert` for the root)
    /// must absorb the new sibling.
    fn insert_at(&mut self, node_id: u64, k: u64, v: u64) -> Result<Option<(u64, u64)>> {
        let mut node = self.read_node(node_id)?;

        if node.leaf {
            let (i, exact) = node.search(k);
            if exact {
                node.values[i] = v;
                self.write_node(&node)?;
                return Ok(None);
            }
            node.keys.insert(i, k);
            node.values.insert(i, v);
        } else {
            let (i, exact) = node.search(k);
            let child_idx = if exact { i + 1 } else { i };
            let child_id = node.values[child_idx];
            if let Some((median, sibling_id)) = self.insert_at(child_id, k, v)? {
                node.keys.insert(child_idx, median);
                node.values.insert(child_idx + 1, sibling_id);
            } else {
                self.write_node(&node)?; // child mutated in place, nothing to propagate
                return Ok(None);
            }
        }

        if !node.is_full() {
            self.write_node(&node)?;
            return Ok(None);
        }

        // Eager split: left keeps floor(DEGREE * 0.9) keys, promoting the
        // key just after that as the median.
        let split_at = ((DEGREE as f64) * SPLIT_FACTOR).floor() as usize;
        let median = node.keys[split_at];

        let sibling_id = self.alloc_id();
        // Both leaf and interior nodes split their child/value array at the
        // same point; only the key array differs, since a leaf keeps the
        // median key (it still addresses a real block) while an interior
        // node promotes it to the parent as the new separator.
        let sibling_keys = node.keys.split_off(split_at + 1);
        let sibling_values = node.values.split_off(split_at + 1);
        if !node.leaf {
            node.keys.pop();
        }
        let sibling = Node { id: sibling_id, leaf: node.leaf, keys: sibling_keys, values: sibling_values };

        self.write_node(&node)?;
        self.write_node(&sibling)?;
        Ok(Some((median, sibling_id)))
    }

    /// Flushes pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_single_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::create(&dir.path().join("a.idx")).unwrap();
        tree.insert(100, 1).unwrap();
        assert_eq!(tree.find(100).unwrap(), 1);
        assert_eq!(tree.find(150).unwrap(), 1); // greatest key <= 150
        assert!(tree.find(50).is_err());
    }

    #[test]
    fn find_returns_greatest_key_leq() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::create(&dir.path().join("b.idx")).unwrap();
        for (k, v) in [(100, 1), (200, 2), (300, 3)] {
            tree.insert(k, v).unwrap();
        }
        assert_eq!(tree.find(250).unwrap(), 2);
        assert_eq!(tree.find(300).unwrap(), 3);
        assert_eq!(tree.find(999).unwrap(), 3);
    }

    #[test]
    fn overwrite_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::create(&dir.path().join("c.idx")).unwrap();
        tree.insert(100, 1).unwrap();
        tree.insert(100, 2).unwrap();
        assert_eq!(tree.find(100).unwrap(), 2);
    }

    #[test]
    fn splits_when_full_and_stays_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::create(&dir.path().join("d.idx")).unwrap();
        let n = DEGREE * 3;
        for i in 0..n {
            tree.insert((i as u64) * 10, i as u64).unwrap();
        }
        for i in 0..n {
            assert_eq!(tree.find((i as u64) * 10).unwrap(), i as u64);
        }
    }

    #[test]
    fn reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.idx");
        {
            let mut tree = BTree::create(&path).unwrap();
            for i in 0..50u64 {
                tree.insert(i * 100, i).unwrap();
            }
            tree.sync().unwrap();
        }
        let tree = BTree::open(&path).unwrap();
        assert_eq!(tree.find(4900).unwrap(), 49);
    }
}
