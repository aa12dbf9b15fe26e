//! Transacted compound file.
//!
//! Stores many independently addressable byte payloads ("handles") in one
//! file. The file is a sequence of fixed-size sections; each section starts
//! and ends with a copy of its handle table and the blocks in between hold
//! payloads. Writes always go to free blocks, so the last committed state is
//! never overwritten until the next commit completes:
//!
//! ```text
//! section = [table copy 1][block 1][block 2]...[block n-2][table copy 2]
//! block   = [hdr size:1][len:4][crc32:4][block count:4][block id:4][payload]
//! ```
//!
//! Commit is two-phase: every dirty primary table copy is written and
//! flushed, then every secondary copy. A crash leaves at least one whole copy
//! per section and [`LoadingRule`] picks which one to trust on open.

mod block;
mod section;

pub use block::BLOCK_HEADER_SIZE;

use arbor_collections::OrdinalList;
use arbor_common::{ArborError, Result};
use block::{BLOCK_ORDINAL_MASK, BlockRef, HandleRef, MAX_ENCODED_BLOCKS, blocks_needed};
use parking_lot::Mutex;
use section::FileSection;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// First handle returned by `create` on an empty file.
pub const FIRST_IDENTITY: u32 = 1;

/// Which handle table copy to trust when opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingRule {
    /// Primary copies, then secondary copies, then the best copy per section.
    #[default]
    Default,
    /// Only the primary copies.
    Primary,
    /// Only the secondary copies.
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadFrom {
    FirstBlock,
    LastBlock,
    Either,
}

/// Configuration for a compound file.
#[derive(Debug, Clone)]
pub struct CompoundFileConfig {
    /// Path of the data file.
    pub path: PathBuf,
    /// Block size in bytes; a power of two in 512..=65536.
    pub block_size: u32,
    /// Truncate or create the file on open.
    pub create_new: bool,
    /// Open without write access.
    pub read_only: bool,
    /// Persist every handle table change immediately.
    pub commit_on_write: bool,
    /// Commit when the file is dropped.
    pub commit_on_dispose: bool,
    /// Sync every block write to disk.
    pub fsync: bool,
    /// Table copy selection on open.
    pub loading_rule: LoadingRule,
}

impl Default for CompoundFileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/arbor.dat"),
            block_size: 4096,
            create_new: false,
            read_only: false,
            commit_on_write: false,
            commit_on_dispose: false,
            fsync: false,
            loading_rule: LoadingRule::Default,
        }
    }
}

impl CompoundFileConfig {
    /// Creates a configuration for `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Largest payload a single handle can hold.
    pub fn max_write_size(&self) -> usize {
        let bs = self.block_size as usize;
        bs * ((bs / 4) - 2) - BLOCK_HEADER_SIZE
    }

    /// Checks the block size.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(ArborError::config(
                "BlockSize",
                "must be a power of two from 512 to 65536",
            ));
        }
        Ok(())
    }
}

/// Handle tables and free-space bookkeeping.
struct Inner {
    sections: Vec<FileSection>,
    free_handles: OrdinalList,
    free_blocks: OrdinalList,
    /// Blocks referenced by the last committed state; never reused before
    /// the next commit.
    reserved_blocks: OrdinalList,
    first_free_block: usize,
    prev_free_block: usize,
    prev_free_handle: usize,
}

/// Block file with handle-level addressing and file-level transactions.
pub struct TransactedCompoundFile {
    config: CompoundFileConfig,
    block_size: usize,
    blocks_per_section: usize,
    section_size: u64,
    file: File,
    inner: Mutex<Inner>,
}

impl TransactedCompoundFile {
    /// Opens or creates the file described by `config`.
    pub fn open(config: CompoundFileConfig) -> Result<Self> {
        config.validate()?;
        if config.read_only && config.create_new {
            return Err(ArborError::config(
                "CreateNew",
                "cannot create a file opened read only",
            ));
        }

        let file = if config.read_only {
            OpenOptions::new().read(true).open(&config.path)?
        } else if config.create_new {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&config.path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&config.path)?
        };

        let block_size = config.block_size as usize;
        let blocks_per_section = block_size >> 2;
        let compound = Self {
            block_size,
            blocks_per_section,
            section_size: (block_size * blocks_per_section) as u64,
            file,
            inner: Mutex::new(Inner {
                sections: Vec::new(),
                free_handles: OrdinalList::new(),
                free_blocks: OrdinalList::new(),
                reserved_blocks: OrdinalList::new(),
                first_free_block: 0,
                prev_free_block: 0,
                prev_free_handle: 0,
            }),
            config,
        };

        {
            let mut inner = compound.inner.lock();
            compound.load_sections(&mut inner)?;
            if inner.sections.is_empty() {
                compound.add_section(&mut inner)?;
            }
            info!(
                path = %compound.config.path.display(),
                sections = inner.sections.len(),
                block_size,
                "Opened compound file"
            );
        }
        Ok(compound)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CompoundFileConfig {
        &self.config
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Largest payload a single handle can hold.
    pub fn max_write_size(&self) -> usize {
        self.config.max_write_size()
    }

    /// Number of sections in the file.
    pub fn section_count(&self) -> usize {
        self.inner.lock().sections.len()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(ArborError::ReadOnly);
        }
        Ok(())
    }

    fn check_handle(&self, inner: &Inner, handle: u32) -> Result<HandleRef> {
        let href = HandleRef::new(handle, self.blocks_per_section);
        if handle == 0
            || href.section >= inner.sections.len()
            || inner.free_handles.contains(handle as usize)
        {
            return Err(ArborError::HandleNotFound(handle));
        }
        Ok(href)
    }

    /// Allocates a handle. The handle is only persisted once written.
    pub fn create(&self) -> Result<u32> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let handle = loop {
            if let Some(found) = inner.free_handles.next_from(inner.prev_free_handle) {
                inner.free_handles.remove(found);
                inner.prev_free_handle = found + 1;
                break found as u32;
            }
            self.add_section(&mut inner)?;
        };

        let href = HandleRef::new(handle, self.blocks_per_section);
        if inner.sections[href.section].handle(href.offset) != 0 {
            return Err(ArborError::corrupted(
                format!("handle {}", handle),
                "free handle already points at data",
            ));
        }
        Ok(handle)
    }

    /// Replaces the payload of `handle`.
    pub fn write(&self, handle: u32, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let max = self.max_write_size();
        if data.len() > max {
            return Err(ArborError::WriteTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut inner = self.inner.lock();
        let href = self.check_handle(&inner, handle)?;
        let old = inner.sections[href.section].handle(href.offset);

        let needed = blocks_needed(data.len(), self.block_size);
        if needed > self.blocks_per_section - 2 {
            return Err(ArborError::WriteTooLarge { size: data.len(), max });
        }
        let block_id = self.take_blocks(&mut inner, needed)?;
        let mut block = BlockRef::new(block_id, self.blocks_per_section)?;
        block.actual_blocks = needed;

        inner.sections[block.section].write_block(&self.file, &block, data)?;
        if self.config.fsync {
            self.file.sync_data()?;
        }
        self.set_handle(&mut inner, href, block_id)?;
        if old != 0 {
            self.free_blocks(&mut inner, old)?;
        }
        Ok(())
    }

    /// Reads the payload of `handle`. A handle never written reads as empty.
    pub fn read(&self, handle: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let href = self.check_handle(&inner, handle)?;
        let block_id = inner.sections[href.section].handle(href.offset);
        if block_id == 0 {
            return Ok(Vec::new());
        }
        if inner
            .free_blocks
            .contains((block_id & BLOCK_ORDINAL_MASK) as usize)
        {
            return Err(ArborError::corrupted(
                format!("handle {}", handle),
                "handle points at a free block",
            ));
        }
        let mut block = BlockRef::new(block_id, self.blocks_per_section)?;
        inner.sections[block.section].read_block(&self.file, &mut block, false)
    }

    /// Frees `handle` and its blocks.
    pub fn delete(&self, handle: u32) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let href = self.check_handle(&inner, handle)?;
        let old = inner.sections[href.section].handle(href.offset);
        self.set_handle(&mut inner, href, 0)?;
        if old != 0 {
            self.free_blocks(&mut inner, old)?;
        }
        inner.free_handles.add(handle as usize);
        inner.prev_free_handle = inner.prev_free_handle.min(handle as usize);
        Ok(())
    }

    /// Commits every handle table change.
    pub fn commit(&self) -> Result<()> {
        self.commit_with(|| Ok(()))
    }

    /// Two-phase commit that runs `stage` between the phases.
    ///
    /// Once phase one is flushed the new state survives a crash through the
    /// primary copies, so `stage` is the point to discard anything the commit
    /// makes redundant. Phase two runs even when `stage` fails.
    pub fn commit_with<F>(&self, stage: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.config.read_only {
            return stage();
        }
        if self.config.commit_on_write {
            self.flush()?;
            return stage();
        }

        let mut inner = self.inner.lock();
        let dirty = inner.sections.iter().filter(|s| s.is_dirty()).count();
        // Data blocks must be on disk before a table that points at them.
        if dirty > 0 && !self.config.fsync {
            self.flush()?;
        }
        for section in inner.sections.iter_mut() {
            section.commit(&self.file, false)?;
        }
        self.flush()?;

        let staged = stage();

        for section in inner.sections.iter_mut() {
            section.commit(&self.file, true)?;
        }
        self.flush()?;

        if let Some(first) = inner.reserved_blocks.next_from(0) {
            inner.first_free_block = inner.first_free_block.min(first);
        }
        let last = inner.sections.len() * self.blocks_per_section - 1;
        inner.reserved_blocks = inner.free_blocks.invert(last);
        debug!(path = %self.config.path.display(), sections = dirty, "Committed compound file");
        staged
    }

    /// Discards uncommitted changes by reloading the committed tables.
    pub fn rollback(&self) -> Result<()> {
        if self.config.commit_on_write {
            return Err(ArborError::InvalidOperation(
                "rollback is not available with commit-on-write".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        self.load_sections(&mut inner)?;
        if inner.sections.is_empty() {
            self.add_section(&mut inner)?;
        }
        debug!(path = %self.config.path.display(), "Rolled back compound file");
        Ok(())
    }

    /// Truncates the file and starts over with one empty section.
    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        self.file.set_len(0)?;
        inner.sections.clear();
        inner.free_handles.clear();
        inner.free_blocks.clear();
        inner.reserved_blocks.clear();
        inner.first_free_block = 0;
        inner.prev_free_block = 0;
        inner.prev_free_handle = 0;
        self.add_section(&mut inner)?;
        Ok(())
    }

    /// Syncs file contents to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn set_handle(&self, inner: &mut Inner, href: HandleRef, block_id: u32) -> Result<()> {
        let section = &mut inner.sections[href.section];
        section.set_handle(href.offset, block_id)?;
        if self.config.commit_on_write {
            section.commit(&self.file, false)?;
            section.commit(&self.file, true)?;
        }
        Ok(())
    }

    fn load_sections(&self, inner: &mut Inner) -> Result<()> {
        let loaded = match self.config.loading_rule {
            LoadingRule::Primary => self.try_load(inner, LoadFrom::FirstBlock)?,
            LoadingRule::Secondary => self.try_load(inner, LoadFrom::LastBlock)?,
            LoadingRule::Default => {
                if self.try_load(inner, LoadFrom::FirstBlock)? {
                    true
                } else if self.try_load(inner, LoadFrom::LastBlock)? {
                    warn!(path = %self.config.path.display(), "Primary tables invalid; loaded secondary copies");
                    true
                } else if self.try_load(inner, LoadFrom::Either)? {
                    warn!(path = %self.config.path.display(), "Loaded best table copy per section");
                    true
                } else {
                    false
                }
            }
        };
        if !loaded {
            return Err(ArborError::corrupted(
                self.config.path.display().to_string(),
                format!("no valid handle tables for {:?}", self.config.loading_rule),
            ));
        }
        Ok(())
    }

    fn try_load(&self, inner: &mut Inner, from: LoadFrom) -> Result<bool> {
        let count = (self.file.metadata()?.len() / self.section_size) as usize;
        let mut sections = Vec::with_capacity(count);
        for index in 0..count {
            let mut section = None;
            if from == LoadFrom::Either {
                section = FileSection::load(&self.file, false, index, self.block_size)?;
            }
            if section.is_none() {
                let alt = from != LoadFrom::FirstBlock;
                section = FileSection::load(&self.file, alt, index, self.block_size)?;
            }
            match section {
                Some(s) => {
                    if s.is_dirty() {
                        debug!(section = s.index(), "Section table copies differ");
                    }
                    sections.push(s);
                }
                None => return Ok(false),
            }
        }

        let mut free_handles = OrdinalList::new();
        let mut used_blocks = OrdinalList::new();
        let total = count * self.blocks_per_section;
        free_handles.set_ceiling(total);
        used_blocks.set_ceiling(total);
        for section in &sections {
            section.collect_free(&self.file, &mut free_handles, &mut used_blocks)?;
        }

        inner.free_blocks = if total == 0 {
            OrdinalList::new()
        } else {
            used_blocks.invert(total - 1)
        };
        inner.reserved_blocks = if self.config.commit_on_write {
            OrdinalList::new()
        } else {
            used_blocks
        };
        inner.sections = sections;
        inner.free_handles = free_handles;
        inner.first_free_block = 0;
        inner.prev_free_block = 0;
        inner.prev_free_handle = 0;
        Ok(true)
    }

    /// Appends an empty section and returns its first usable ordinal.
    fn add_section(&self, inner: &mut Inner) -> Result<usize> {
        self.ensure_writable()?;
        let mut section = FileSection::new(inner.sections.len(), self.block_size);
        section.commit(&self.file, false)?;
        section.commit(&self.file, true)?;
        inner.sections.push(section);

        let last_free = inner.sections.len() * self.blocks_per_section - 1;
        let first_free = last_free - self.blocks_per_section + 2;
        inner.free_handles.set_ceiling(last_free + 1);
        inner.free_blocks.set_ceiling(last_free + 1);
        for ordinal in first_free..last_free {
            inner.free_handles.add(ordinal);
            inner.free_blocks.add(ordinal);
        }
        debug!(
            path = %self.config.path.display(),
            sections = inner.sections.len(),
            "Added compound file section"
        );
        Ok(first_free)
    }

    /// Takes `needed` contiguous free blocks, first fit from the rolling
    /// cursor, growing the file when no run is large enough.
    fn take_blocks(&self, inner: &mut Inner, needed: usize) -> Result<u32> {
        let mut rescan = false;
        let mut resized = false;
        let mut starting_from = inner.prev_free_block;
        let mut ending_before = usize::MAX;

        loop {
            let mut found = 0usize;
            let mut last: Option<usize> = None;
            let mut cursor = inner.free_blocks.next_from(starting_from);
            while let Some(free) = cursor {
                if free >= ending_before {
                    break;
                }
                cursor = inner.free_blocks.next_from(free + 1);
                if inner.reserved_blocks.contains(free) {
                    continue;
                }
                if found == 0 {
                    inner.prev_free_block = free;
                    if !resized && rescan {
                        inner.first_free_block = free;
                    }
                }
                found = if last.map(|l| l + 1) == Some(free) {
                    found + 1
                } else {
                    1
                };
                last = Some(free);
                if found == needed {
                    let start = free + 1 - needed;
                    for ordinal in start..=free {
                        inner.free_blocks.remove(ordinal);
                    }
                    return Ok(BlockRef::encode(start, needed));
                }
            }

            if resized {
                return Err(ArborError::Internal(format!(
                    "no run of {} free blocks in a new section",
                    needed
                )));
            }
            if !rescan && inner.first_free_block < starting_from {
                rescan = true;
                ending_before = starting_from + needed - 1;
                starting_from = inner.first_free_block;
            } else {
                resized = true;
                starting_from = self.add_section(inner)?;
                ending_before = usize::MAX;
            }
        }
    }

    fn free_blocks(&self, inner: &mut Inner, block_id: u32) -> Result<()> {
        let mut block = BlockRef::new(block_id, self.blocks_per_section)?;
        let first = block.ordinal();
        if first == 0 {
            return Ok(());
        }
        inner.first_free_block = inner.first_free_block.min(first);
        if block.count == MAX_ENCODED_BLOCKS {
            inner.sections[block.section].read_block(&self.file, &mut block, true)?;
        }
        for ordinal in first..first + block.actual_blocks {
            inner.free_blocks.add(ordinal);
        }
        Ok(())
    }
}

impl Drop for TransactedCompoundFile {
    fn drop(&mut self) {
        if self.config.commit_on_dispose && !self.config.read_only {
            if let Err(e) = self.commit() {
                warn!(path = %self.config.path.display(), error = %e, "Commit on dispose failed");
            }
        }
    }
}
