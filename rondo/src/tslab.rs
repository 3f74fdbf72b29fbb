//! TSlab: a file containing a fixed number of [`crate::tblock::TBlock`]s.
//!
//! A slab shares a 53-bit slab number across up to [`TBLOCKS_PER_SLAB`]
//! blocks; a block's id is `slab_number | (index_in_slab & 0x7ff)`. The slab
//! header carries an endian sentinel that is checked at mount time — a slab
//! sealed on one host's byte order is rejected, not silently misread, on a
//! host of the other order.
//!
//! Grounded on bolo's `tslab.c`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, RondoError};
use crate::hmac;
use crate::page::{Page, PageRef};
use crate::tblock::{TBlock, BLOCK_SIZE};

/// Magic bytes identifying a TSlab.
pub const MAGIC: &[u8; 6] = b"SLABv1";

/// Sentinel written into the header to detect a cross-endian mount.
pub const ENDIAN_MAGIC: u32 = 0x7ED1_324C;

/// Header region size: one page, block-aligned.
pub const HEADER_SIZE: usize = 4096;

/// Maximum blocks addressable within one slab (11 bits of intra-slab index).
pub const TBLOCKS_PER_SLAB: usize = 2048;

const OFF_BLOCK_SIZE_EXP: usize = 6;
const OFF_ENDIAN: usize = 8;
const OFF_NUMBER: usize = 16;

/// A memory-mapped file backing up to [`TBLOCKS_PER_SLAB`] [`TBlock`]s.
pub struct TSlab {
    file: File,
    path: PathBuf,
    number: u64,
    blocks: Vec<Option<TBlock>>,
}

impl TSlab {
    /// Slab id this file backs (low 11 bits always zero).
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path of the backing file, for error messages.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a new, empty slab file.
    pub fn init(path: &Path, number: u64, key: &[u8]) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;

        let mut header = vec![0u8; HEADER_SIZE];
        {
            let mut page = Page::new(&mut header);
            page.write_n(0, MAGIC)?;
            page.write_u8(OFF_BLOCK_SIZE_EXP, 19)?;
            page.write_u32(OFF_ENDIAN, ENDIAN_MAGIC)?;
            page.write_u64(OFF_NUMBER, number & !0x7ff)?;
        }
        hmac::seal(key, &mut header);

        use std::io::Write;
        let mut f = &file;
        f.write_all(&header)?;
        file.set_len(HEADER_SIZE as u64)?;

        Ok(TSlab {
            file,
            path: path.to_path_buf(),
            number: number & !0x7ff,
            blocks: (0..TBLOCKS_PER_SLAB).map(|_| None).collect(),
        })
    }

    /// Opens and validates an existing slab file, lazily mapping each valid
    /// block.
    pub fn map(path: &Path, key: &[u8]) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = vec![0u8; HEADER_SIZE];
        {
            use std::io::Read;
            let mut f = &file;
            f.read_exact(&mut header)?;
        }

        let page = PageRef::new(&header);
        if page.read_n(0, 6)? != MAGIC {
            return Err(RondoError::BadSlab(format!("{}: bad magic", path.display())));
        }
        hmac::check(key, &header, &path.display().to_string())?;

        let endian = page.read_u32(OFF_ENDIAN)?;
        if endian != ENDIAN_MAGIC {
            return Err(RondoError::EndianMismatch(path.display().to_string()));
        }
        let number = page.read_u64(OFF_NUMBER)?;

        let file_len = file.metadata()?.len();
        let available_blocks = ((file_len.saturating_sub(HEADER_SIZE as u64)) as usize) / BLOCK_SIZE;

        let mut blocks: Vec<Option<TBlock>> = (0..TBLOCKS_PER_SLAB).map(|_| None).collect();
        for (i, slot) in blocks.iter_mut().enumerate().take(available_blocks.min(TBLOCKS_PER_SLAB)) {
            let offset = HEADER_SIZE as u64 + (i as u64) * BLOCK_SIZE as u64;
            // SAFETY: `offset..offset+BLOCK_SIZE` is within the file as
            // established by `available_blocks` above; the file is opened
            // read-write and outlives this mapping.
            let mmap = unsafe { memmap_at(&file, offset, BLOCK_SIZE)? };
            *slot = Some(TBlock::map(mmap, key)?);
        }

        Ok(TSlab { file, path: path.to_path_buf(), number, blocks })
    }

    /// True if every block slot in this slab is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    /// Index of the first unoccupied block slot, if any.
    #[must_use]
    fn first_free(&self) -> Option<usize> {
        self.blocks.iter().position(Option::is_none)
    }

    /// Extends the file by one block and initializes it with base timestamp
    /// `base`. Returns the new block's id.
    ///
    /// # Errors
    ///
    /// Returns [`RondoError::BadSlab`] if this slab has no free slot.
    pub fn extend(&mut self, base: u64, key: &[u8]) -> Result<u64> {
        let i = self.first_free().ok_or_else(|| RondoError::BadSlab("slab full".to_string()))?;
        let offset = HEADER_SIZE as u64 + (i as u64) * BLOCK_SIZE as u64;
        self.file.set_len(offset + BLOCK_SIZE as u64)?;

        // SAFETY: the file was just extended to cover this range, and no
        // other mapping of this range is held concurrently.
        let mmap = unsafe { memmap_at(&self.file, offset, BLOCK_SIZE)? };
        let id = self.number | (i as u64 & 0x7ff);
        let block = TBlock::init(mmap, id, base, key)?;
        self.blocks[i] = Some(block);
        Ok(id)
    }

    /// Looks up a mapped block by id.
    #[must_use]
    pub fn block(&self, id: u64) -> Option<&TBlock> {
        let i = (id & 0x7ff) as usize;
        self.blocks.get(i).and_then(|b| b.as_ref())
    }

    /// Looks up a mapped block mutably by id.
    #[must_use]
    pub fn block_mut(&mut self, id: u64) -> Option<&mut TBlock> {
        let i = (id & 0x7ff) as usize;
        self.blocks.get_mut(i).and_then(|b| b.as_mut())
    }

    /// Syncs every mapped block's dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        for block in self.blocks.iter().flatten() {
            block.sync()?;
        }
        Ok(())
    }
}

/// Maps `len` bytes of `file` starting at `offset`.
///
/// # Safety
///
/// Callers must ensure the mapped range lies within the file's current
/// length and that no other live mapping aliases the same range mutably.
unsafe fn memmap_at(file: &File, offset: u64, len: usize) -> Result<MmapMut> {
    // SAFETY: propagated from caller contract; `memmap2::MmapOptions` performs
    // the underlying `mmap(2)` call with the given offset and length.
    let mmap = unsafe { memmap2::MmapOptions::new().offset(offset).len(len).map_mut(file)? };
    Ok(mmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_map_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001.slab");
        let key = b"test-key";

        {
            let mut slab = TSlab::init(&path, 0x1000, key).unwrap();
            assert!(!slab.is_full());
            let id = slab.extend(5_000, key).unwrap();
            slab.block_mut(id).unwrap().append(5_000, 3.14, key).unwrap();
            slab.sync().unwrap();
        }

        let slab = TSlab::map(&path, key).unwrap();
        assert_eq!(slab.number(), 0x1000 & !0x7ff);
        let id = slab.number();
        let block = slab.block(id).expect("block 0 mapped");
        assert_eq!(block.read(0).unwrap(), (5_000, 3.14));
    }

    #[test]
    fn rejects_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0002.slab");
        TSlab::init(&path, 0x2000, b"key-one").unwrap();
        assert!(TSlab::map(&path, b"key-two").is_err());
    }

    #[test]
    fn swapped_endian_sentinel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0004.slab");
        let key = b"test-key";
        TSlab::init(&path, 0, key).unwrap();

        // Simulate a header sealed on a host of the other byte order: swap
        // the endian sentinel's bytes and reseal with the correct key so
        // only the endian check (not the HMAC) can reject the mount.
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut header = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header).unwrap();
        header[OFF_ENDIAN..OFF_ENDIAN + 4].swap(0, 3);
        header[OFF_ENDIAN..OFF_ENDIAN + 4].swap(1, 2);
        hmac::seal(key, &mut header);
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&header).unwrap();
        drop(file);

        assert!(matches!(TSlab::map(&path, key), Err(RondoError::EndianMismatch(_))));
    }

    #[test]
    fn fills_up_after_max_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0003.slab");
        let key = b"test-key";
        let mut slab = TSlab::init(&path, 0, key).unwrap();
        for i in 0..TBLOCKS_PER_SLAB {
            slab.extend(i as u64 * 1000, key).unwrap();
        }
        assert!(slab.is_full());
        assert!(slab.extend(999_999, key).is_err());
    }
}
