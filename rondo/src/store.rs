//! The database facade: directory lifecycle, ingest, and query entry point.
//!
//! A database lives under one root directory:
//!
//! ```text
//! root/
//! ├── main.db          <- HMAC-sealed catalog (series -> tree id)
//! ├── idx/AAAA.BBBB/*.idx  <- one B-tree index file per series
//! └── slabs/*.slab         <- TSlab files, each up to 2048 TBlocks
//! ```
//!
//! `Store` owns the catalog and every mapped slab, and is the only type that
//! knows how a timestamp resolves to a slab bucket, a block, and (on
//! overflow) a fresh block with the forward-link of its predecessor updated.
//!
//! Grounded on bolo's `db2_init`/`db2_open`/`db2_insert` in `db2.c`; the
//! directory-lifecycle and `tracing`-span-per-mount conventions follow the
//! teacher's own `store.rs`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::catalog::{self, Catalog};
use crate::error::{Result, RondoError};
use crate::ingest::Submission;
use crate::query::{self, BlockSource, Query, QueryResult};
use crate::tblock::TBlock;
use crate::tslab::{TSlab, TBLOCKS_PER_SLAB};

/// Width, in milliseconds, of the timestamp bucket used to choose which
/// block a series' cells belong to. Always applied uniformly at both insert
/// and query time, per the resolved Open Question 2 in `SPEC_FULL.md` §9.
pub const SLAB_BUCKET_MS: u64 = 512_000;

/// The top-level database handle.
pub struct Store {
    root: PathBuf,
    key: Vec<u8>,
    catalog: Catalog,
    slabs: HashMap<u64, TSlab>,
    next_slab_number: u64,
}

impl Store {
    /// Creates a fresh, empty database under `root`.
    ///
    /// # Errors
    ///
    /// Returns an [`RondoError::Io`] if `root` cannot be created.
    #[instrument(skip(key))]
    pub fn init(root: &Path, key: Vec<u8>) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join("idx"))?;
        fs::create_dir_all(root.join("slabs"))?;

        let store = Store {
            root: root.to_path_buf(),
            key,
            catalog: Catalog::empty(),
            slabs: HashMap::new(),
            next_slab_number: 0,
        };
        store.catalog.sync(&store.root, &store.key)?;
        info!(root = %store.root.display(), "initialized database");
        Ok(store)
    }

    /// Mounts an existing database: validates and loads `main.db`, then maps
    /// every slab file under `root/slabs/`.
    ///
    /// # Errors
    ///
    /// Returns [`RondoError::NoDbRoot`] if `root` does not exist,
    /// [`RondoError::NoMainDb`]/[`RondoError::BadHash`] if the catalog is
    /// missing or fails its HMAC check, or [`RondoError::EndianMismatch`] if
    /// any slab was sealed on a host of the other byte order.
    #[instrument(skip(key))]
    pub fn mount(root: &Path, key: Vec<u8>) -> Result<Self> {
        if !root.is_dir() {
            return Err(RondoError::NoDbRoot(root.display().to_string()));
        }
        let catalog = Catalog::mount(root, &key)?;

        let mut slabs = HashMap::new();
        let mut next_slab_number = 0u64;
        let slabs_dir = root.join("slabs");
        if slabs_dir.is_dir() {
            for entry in fs::read_dir(&slabs_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("slab") {
                    continue;
                }
                let slab = TSlab::map(&path, &key)?;
                next_slab_number = next_slab_number.max(slab.number() + TBLOCKS_PER_SLAB as u64);
                slabs.insert(slab.number(), slab);
            }
        }

        debug!(root = %root.display(), slabs = slabs.len(), "mounted database");
        Ok(Store { root: root.to_path_buf(), key, catalog, slabs, next_slab_number })
    }

    /// Ingests one measurement submission, creating the series' catalog
    /// entry, B-tree index, and backing block on first write.
    ///
    /// # Errors
    ///
    /// Propagates any [`RondoError`] from catalog, index, or block I/O.
    pub fn insert(&mut self, sub: &Submission) -> Result<()> {
        let tree_id = self.catalog.upsert(&self.root, &sub.series)?;
        let bucket = align_down(sub.ts, SLAB_BUCKET_MS);

        let last = self.catalog.tree(tree_id).expect("just upserted").find(u64::MAX).ok();
        let reusable = last.and_then(|id| {
            let block = self.block(id)?;
            (block.base() == bucket && !block.is_full() && block.can_hold(sub.ts)).then_some(id)
        });

        let block_id = match reusable {
            Some(id) => id,
            None => {
                let new_id = self.allocate_block(bucket)?;
                if let Some(prev_id) = last {
                    if let Some(prev) = self.block_mut(prev_id) {
                        prev.set_next(new_id, &self.key)?;
                    }
                }
                self.catalog.tree_mut(tree_id).expect("just upserted").insert(bucket, new_id)?;
                new_id
            }
        };

        self.block_mut(block_id).ok_or(RondoError::NoBlock(block_id))?.append(sub.ts, sub.value, &self.key)
    }

    /// Ingests every submission in `batch`, in order. Stops at the first
    /// error, leaving earlier submissions in `batch` already durable in
    /// their mapped blocks (blocks are sealed per-append, not per-batch).
    pub fn insert_batch(&mut self, batch: &[Submission]) -> Result<()> {
        for sub in batch {
            self.insert(sub)?;
        }
        Ok(())
    }

    /// Plans and executes `query` against the current catalog and slabs.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::QueryError`] if the query's field programs
    /// are malformed.
    pub fn query(&self, query: Query) -> Result<QueryResult> {
        let query = query.normalize()?;
        let pushes = query::plan(&self.catalog, &query);
        query::execute(&self.catalog, self, &query, &pushes)
    }

    /// Flushes the catalog and every mapped slab to disk.
    pub fn sync(&self) -> Result<()> {
        for slab in self.slabs.values() {
            slab.sync()?;
        }
        self.catalog.sync(&self.root, &self.key)
    }

    /// Flushes and consumes this handle, releasing its mappings.
    pub fn unmount(self) -> Result<()> {
        self.sync()
    }

    /// Looks up a series' canonical tree id, if it has been written before.
    #[must_use]
    pub fn resolve(&self, series: &str) -> Option<u64> {
        self.catalog.resolve(series)
    }

    fn block(&self, id: u64) -> Option<&TBlock> {
        self.slabs.get(&(id & !0x7ff)).and_then(|s| s.block(id))
    }

    fn block_mut(&mut self, id: u64) -> Option<&mut TBlock> {
        self.slabs.get_mut(&(id & !0x7ff)).and_then(|s| s.block_mut(id))
    }

    /// Extends the first slab with a free slot, or creates a new one, and
    /// returns the id of the newly initialized block.
    fn allocate_block(&mut self, base: u64) -> Result<u64> {
        if let Some(slab) = self.slabs.values_mut().find(|s| !s.is_full()) {
            return slab.extend(base, &self.key);
        }

        let number = self.next_slab_number;
        self.next_slab_number += TBLOCKS_PER_SLAB as u64;
        let path = slab_path(&self.root, number);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut slab = TSlab::init(&path, number, &self.key)?;
        let id = slab.extend(base, &self.key)?;
        self.slabs.insert(slab.number(), slab);
        Ok(id)
    }
}

impl BlockSource for Store {
    fn block(&self, id: u64) -> Option<&TBlock> {
        Store::block(self, id)
    }
}

/// Path of the slab file for a given slab number.
fn slab_path(root: &Path, number: u64) -> PathBuf {
    root.join("slabs").join(format!("{number:016x}.slab"))
}

/// Aligns `ts_ms` down to the nearest `stride_ms` boundary.
fn align_down(ts_ms: u64, stride_ms: u64) -> u64 {
    ts_ms - (ts_ms % stride_ms)
}

/// Convenience re-export so callers don't need to reach into [`catalog`]
/// just to build a canonical series string before calling [`Store::insert`].
pub use catalog::canonical_series;
