//! TBlock: a fixed-size, append-only, HMAC-sealed block of measurement cells.
//!
//! A block is a 512 KiB memory-mapped region holding up to [`CELLS_PER_BLOCK`]
//! `(delta_ms, value)` cells relative to a base timestamp, plus a header
//! (magic, cell count, base timestamp, block id, forward-link) and a 64-byte
//! HMAC trailer. Blocks are strictly append-only: `cells` only ever
//! increases, and every append reseals the trailer.
//!
//! Grounded on the block format and operations in bolo's `tblock.c`.

use memmap2::MmapMut;

use crate::error::{Result, RondoError};
use crate::hmac;
use crate::page::{Page, PageRef};

/// Magic bytes identifying a TBlock.
pub const MAGIC: &[u8; 6] = b"BLOKv1";

/// Block size: 512 KiB.
pub const BLOCK_SIZE: usize = 1 << 19;

/// Bytes per cell: `u32` delta + `f64` value.
const CELL_SIZE: usize = 12;

/// Offset of the cell count (`u16`).
const OFF_CELLS: usize = 6;

/// Offset of the base timestamp (`u64`, milliseconds).
const OFF_BASE: usize = 8;

/// Offset of this block's id (`u64`).
const OFF_ID: usize = 16;

/// Offset of the forward-link block id (`u64`, `0` = none).
const OFF_NEXT: usize = 24;

/// Offset of the first cell.
const OFF_CELLS_START: usize = 32;

/// Maximum cells a block can hold. Fixed at 2048, matching bolo's
/// `TCELLS_PER_TBLOCK`, not derived from the space left in the 512 KiB
/// region — the block's byte layout is sized to fit this count exactly.
pub const CELLS_PER_BLOCK: usize = 2048;

/// A mapped, append-only block of measurement cells.
pub struct TBlock {
    mmap: MmapMut,
    cells: u16,
    base: u64,
    id: u64,
    next: u64,
}

impl TBlock {
    /// Initializes a freshly-extended block region: writes the header,
    /// zeroes the cell area, and seals it.
    pub fn init(mut mmap: MmapMut, id: u64, base: u64, key: &[u8]) -> Result<Self> {
        {
            let mut page = Page::new(&mut mmap);
            page.write_n(0, MAGIC)?;
            page.write_u16(OFF_CELLS, 0)?;
            page.write_u64(OFF_BASE, base)?;
            page.write_u64(OFF_ID, id)?;
            page.write_u64(OFF_NEXT, 0)?;
            page.zero(OFF_CELLS_START, BLOCK_SIZE - OFF_CELLS_START)?;
        }
        hmac::seal(key, &mut mmap);
        Ok(TBlock { mmap, cells: 0, base, id, next: 0 })
    }

    /// Maps an existing block region, validating its magic and HMAC and
    /// rehydrating its in-memory fields.
    pub fn map(mmap: MmapMut, key: &[u8]) -> Result<Self> {
        if mmap.len() != BLOCK_SIZE {
            return Err(RondoError::BadSlab(format!(
                "block region is {} bytes, expected {BLOCK_SIZE}",
                mmap.len()
            )));
        }
        hmac::check(key, &mmap, "tblock")?;

        let page = PageRef::new(&mmap);
        if page.read_n(0, 6)? != MAGIC {
            return Err(RondoError::BadSlab("block magic mismatch".to_string()));
        }
        let cells = page.read_u16(OFF_CELLS)?;
        let base = page.read_u64(OFF_BASE)?;
        let id = page.read_u64(OFF_ID)?;
        let next = page.read_u64(OFF_NEXT)?;

        Ok(TBlock { mmap, cells, base, id, next })
    }

    /// This block's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This block's base timestamp.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of cells currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells as usize
    }

    /// True if this block holds no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells == 0
    }

    /// True if this block cannot accept another cell.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cells as usize >= CELLS_PER_BLOCK
    }

    /// True if `ts` can be represented as a `u32` delta from this block's base.
    #[must_use]
    pub fn can_hold(&self, ts: u64) -> bool {
        ts >= self.base && ts - self.base <= u64::from(u32::MAX)
    }

    /// This block's forward-link, or `0` if it is the tail of its chain.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Sets this block's forward-link and reseals.
    ///
    /// Per the resolved Open Question in `SPEC_FULL.md` §9, this must always
    /// be called on the superseded block whenever a series continues into a
    /// new block, so chain traversal never silently stops early.
    pub fn set_next(&mut self, next: u64, key: &[u8]) -> Result<()> {
        Page::new(&mut self.mmap).write_u64(OFF_NEXT, next)?;
        self.next = next;
        hmac::seal(key, &mut self.mmap);
        Ok(())
    }

    /// Appends a `(ts, value)` cell.
    ///
    /// # Errors
    ///
    /// Returns [`RondoError::BlockFull`] if the block has no room, or
    /// [`RondoError::BlockRange`] if `ts` cannot be expressed as a delta
    /// from this block's base.
    pub fn append(&mut self, ts: u64, value: f64, key: &[u8]) -> Result<()> {
        if self.is_full() {
            return Err(RondoError::BlockFull { block_id: self.id });
        }
        if !self.can_hold(ts) {
            return Err(RondoError::BlockRange { block_id: self.id, base: self.base, ts });
        }
        let delta = (ts - self.base) as u32;
        let offset = OFF_CELLS_START + self.cells as usize * CELL_SIZE;

        let mut page = Page::new(&mut self.mmap);
        page.write_u32(offset, delta)?;
        page.write_f64(offset + 4, value)?;
        self.cells += 1;
        page.write_u16(OFF_CELLS, self.cells)?;

        hmac::seal(key, &mut self.mmap);
        Ok(())
    }

    /// Reads the `(ts, value)` cell at index `i`.
    pub fn read(&self, i: usize) -> Result<(u64, f64)> {
        if i >= self.cells as usize {
            return Err(RondoError::BadSlab(format!("cell index {i} out of range")));
        }
        let offset = OFF_CELLS_START + i * CELL_SIZE;
        let page = PageRef::new(&self.mmap);
        let delta = page.read_u32(offset)?;
        let value = page.read_f64(offset + 4)?;
        Ok((self.base + u64::from(delta), value))
    }

    /// Iterates all stored cells in append order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        (0..self.cells as usize).map(move |i| self.read(i).expect("index within len"))
    }

    /// Flushes this block's mapping to disk.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn mapped_block(dir: &std::path::Path, id: u64, base: u64, key: &[u8]) -> TBlock {
        let path = dir.join(format!("{id}.blk"));
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        file.set_len(BLOCK_SIZE as u64).unwrap();
        let mmap = unsafe { MmapMut::map_mut(&file).unwrap() };
        TBlock::init(mmap, id, base, key).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let key = b"test-key";
        let mut block = mapped_block(dir.path(), 1, 1_000, key);

        block.append(1_000, 1.0, key).unwrap();
        block.append(1_500, 2.5, key).unwrap();

        assert_eq!(block.len(), 2);
        assert_eq!(block.read(0).unwrap(), (1_000, 1.0));
        assert_eq!(block.read(1).unwrap(), (1_500, 2.5));
    }

    #[test]
    fn rejects_range_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let key = b"test-key";
        let mut block = mapped_block(dir.path(), 1, 0, key);
        let too_far = u64::from(u32::MAX) + 1;
        assert!(matches!(block.append(too_far, 1.0, key), Err(RondoError::BlockRange { .. })));
    }

    #[test]
    fn full_block_rejects_append() {
        let dir = tempfile::tempdir().unwrap();
        let key = b"test-key";
        let mut block = mapped_block(dir.path(), 1, 0, key);
        for i in 0..CELLS_PER_BLOCK {
            block.append(i as u64, i as f64, key).unwrap();
        }
        assert!(matches!(
            block.append(CELLS_PER_BLOCK as u64, 0.0, key),
            Err(RondoError::BlockFull { .. })
        ));
    }

    #[test]
    fn forward_link_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let key = b"test-key";
        let mut block = mapped_block(dir.path(), 1, 0, key);
        assert_eq!(block.next(), 0);
        block.set_next(42, key).unwrap();
        assert_eq!(block.next(), 42);
    }
}
