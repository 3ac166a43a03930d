//! The store: a file of nodes published through a dual-slot header, the
//! top array tying everything together, and the transaction boundary.
//!
//! The top node round-trips five slots: the column roots array, the three
//! free-list arrays (positions, lengths, versions), and the tagged commit
//! version. Readers resolve the header indicator byte, follow the top ref
//! it selects, and get a complete, self-consistent version of the file no
//! matter what a concurrent or crashed writer was doing.
//!
//! Writer/reader coordination across processes is external (typically a
//! lock file); within this crate a reader is just a second `Store` opened
//! read-only, and [`Store::set_oldest_live_version`] tells the writer
//! which snapshots must stay reachable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use log::debug;
use zerocopy::IntoBytes;

use crate::alloc::{FileHeader, Ref, SlabAllocator};
use crate::column::{destroy_subtree, Column};
use crate::error::{Error, Result};
use crate::node::{Array, RefOrTagged};
use crate::writer::{CommitWriter, FreeSpan};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
    ReadWriteNoCreate,
}

pub struct Store {
    file: Option<File>,
    mode: Mode,
    alloc: SlabAllocator,
    version: u64,
    oldest_live: Option<u64>,
    roots: Vec<Ref>,
    committed_roots: Vec<Ref>,
    free: Vec<FreeSpan>,
    current_slot: u8,
    file_len: u64,
    generation: u64,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Store> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode != Mode::ReadOnly {
            options.write(true);
        }
        if mode == Mode::ReadWrite {
            options.create(true);
        }
        let file = options.open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len == 0 {
            if mode == Mode::ReadOnly {
                return Err(Error::InvalidFile { reason: "empty file" });
            }
            bootstrap(&file)?;
        }
        let alloc = SlabAllocator::attach_file(&file)?;
        let mut store = Store {
            file: Some(file),
            mode,
            file_len: alloc.mapped_len() as u64,
            current_slot: alloc.current_slot(),
            alloc,
            version: 1,
            oldest_live: None,
            roots: Vec::new(),
            committed_roots: Vec::new(),
            free: Vec::new(),
            generation: 0,
        };
        store.load_top()?;
        debug!(
            "opened store at version {} with {} columns",
            store.version,
            store.roots.len()
        );
        Ok(store)
    }

    /// Adopt a complete file image as a read-only store.
    pub fn from_buffer(buf: Vec<u8>) -> Result<Store> {
        let alloc = SlabAllocator::attach_buffer(buf)?;
        let mut store = Store {
            file: None,
            mode: Mode::ReadOnly,
            file_len: alloc.mapped_len() as u64,
            current_slot: alloc.current_slot(),
            alloc,
            version: 1,
            oldest_live: None,
            roots: Vec::new(),
            committed_roots: Vec::new(),
            free: Vec::new(),
            generation: 0,
        };
        store.load_top()?;
        Ok(store)
    }

    fn load_top(&mut self) -> Result<()> {
        self.roots.clear();
        self.free.clear();
        let top_ref = self.alloc.committed_top();
        if top_ref == 0 {
            self.version = 1;
            self.committed_roots.clear();
            return Ok(());
        }
        let top = Array::from_ref(&self.alloc, top_ref)?;
        if top.size() < 5 {
            return Err(Error::Corruption { detail: "top node too small" });
        }
        let roots = read_values(&self.alloc, top.get_ref(&self.alloc, 0))?;
        self.roots = roots.iter().map(|&v| v as Ref).collect();
        let fpos = read_values(&self.alloc, top.get_ref(&self.alloc, 1))?;
        let flen = read_values(&self.alloc, top.get_ref(&self.alloc, 2))?;
        let fver = read_values(&self.alloc, top.get_ref(&self.alloc, 3))?;
        if fpos.len() != flen.len() || fpos.len() != fver.len() {
            return Err(Error::Corruption { detail: "free-list arrays disagree" });
        }
        self.free = fpos
            .iter()
            .zip(&flen)
            .zip(&fver)
            .map(|((&pos, &len), &version)| FreeSpan {
                pos: pos as u64,
                len: len as u64,
                version: version as u64,
            })
            .collect();
        self.version = RefOrTagged::from_raw(top.get(&self.alloc, 4))
            .as_tagged()
            .ok_or(Error::Corruption { detail: "top version slot is not tagged" })?;
        self.committed_roots = self.roots.clone();
        Ok(())
    }

    pub fn alloc(&self) -> &SlabAllocator {
        &self.alloc
    }

    pub fn alloc_mut(&mut self) -> &mut SlabAllocator {
        &mut self.alloc
    }

    /// The committed version this store currently exposes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current_slot(&self) -> u8 {
        self.current_slot
    }

    /// Tell the next commit which snapshot version the oldest live
    /// reader still holds. Free spans at or past that version are
    /// neither merged nor reused. `None` means no outstanding readers.
    /// Coordination across processes is the caller's responsibility.
    pub fn set_oldest_live_version(&mut self, version: Option<u64>) {
        self.oldest_live = version;
    }

    fn writable(&self) -> Result<()> {
        if self.mode == Mode::ReadOnly || self.file.is_none() {
            return Err(Error::ReadOnlyViolation);
        }
        Ok(())
    }

    pub fn n_columns(&self) -> usize {
        self.roots.len()
    }

    /// Add an empty column, returning its slot.
    pub fn add_column(&mut self) -> Result<usize> {
        self.writable()?;
        self.roots.push(0);
        Ok(self.roots.len() - 1)
    }

    /// Destroy a column and drop its slot. Columns at higher slots shift
    /// down; accessors bound to them must be reopened.
    pub fn remove_column(&mut self, slot: usize) -> Result<()> {
        self.writable()?;
        if slot >= self.roots.len() {
            return Err(Error::IndexOutOfBounds { index: slot, size: self.roots.len() });
        }
        let root = self.roots.remove(slot);
        destroy_subtree(&mut self.alloc, root, true)
    }

    /// Open an accessor for the column in `slot`.
    pub fn column(&self, slot: usize) -> Result<Column> {
        if slot >= self.roots.len() {
            return Err(Error::IndexOutOfBounds { index: slot, size: self.roots.len() });
        }
        Column::open_slot(&self.alloc, self.roots[slot], slot)
    }

    /// Commit the transaction. `dirty` lists the column accessors mutated
    /// since attach; their roots are folded into the top array. On
    /// success every accessor is detached and must be reopened.
    ///
    /// A commit with no changes is a no-op and keeps the current top ref.
    pub fn commit(&mut self, dirty: &[&Column]) -> Result<()> {
        self.writable()?;
        for col in dirty {
            col.check(&self.alloc)?;
            let slot = col
                .slot()
                .ok_or(Error::Corruption { detail: "column is not bound to a store slot" })?;
            if slot >= self.roots.len() {
                return Err(Error::IndexOutOfBounds { index: slot, size: self.roots.len() });
            }
            self.roots[slot] = col.root();
        }
        let mut freed = self.alloc.take_freed();
        let unchanged = freed.is_empty()
            && self.roots == self.committed_roots
            && self
                .roots
                .iter()
                .all(|&root| root == 0 || self.alloc.is_read_only(root));
        if unchanged {
            return Ok(());
        }
        // The previous top node and its arrays are superseded by this
        // commit; they join the freed set like any copied-on-write node.
        let old_top = self.alloc.committed_top();
        if old_top != 0 {
            let top = Array::from_ref(&self.alloc, old_top)?;
            for slot in 0..4 {
                let arr_ref = top.get_ref(&self.alloc, slot);
                if arr_ref != 0 {
                    let arr = Array::from_ref(&self.alloc, arr_ref)?;
                    let len = arr.total_byte_len();
                    self.alloc.free(arr_ref, len);
                }
            }
            let len = top.total_byte_len();
            self.alloc.free(old_top, len);
            freed.extend(self.alloc.take_freed());
        }
        let version = self.version + 1;
        let readlock = self.oldest_live.unwrap_or(version);
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(Error::ReadOnlyViolation),
        };
        let writer = CommitWriter::new(
            file,
            self.file_len,
            std::mem::take(&mut self.free),
            version,
            readlock,
        );
        let outcome = writer.commit(&self.alloc, &self.roots, freed, self.current_slot)?;
        debug!(
            "store committed version {version} at top {} in slot {}, file {} bytes",
            outcome.top, outcome.slot, outcome.file_len
        );
        self.reattach()
    }

    /// Discard every in-memory mutation since attach. The slab is
    /// dropped wholesale; the committed bytes were never touched.
    pub fn rollback(&mut self) -> Result<()> {
        self.generation += 1;
        self.alloc.reset();
        self.alloc.set_generation(self.generation);
        self.load_top()
    }

    fn reattach(&mut self) -> Result<()> {
        let file = match self.file.as_ref() {
            Some(file) => file,
            None => return Err(Error::ReadOnlyViolation),
        };
        self.alloc = SlabAllocator::attach_file(file)?;
        self.generation += 1;
        self.alloc.set_generation(self.generation);
        self.current_slot = self.alloc.current_slot();
        self.file_len = self.alloc.mapped_len() as u64;
        self.load_top()
    }

    /// Begin a guarded transaction: dropping the guard without a commit
    /// rolls the store back.
    pub fn transact(&mut self) -> Transaction<'_> {
        Transaction { store: self, done: false }
    }
}

pub struct Transaction<'s> {
    store: &'s mut Store,
    done: bool,
}

impl<'s> Transaction<'s> {
    pub fn commit(mut self, dirty: &[&Column]) -> Result<()> {
        self.done = true;
        self.store.commit(dirty)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.store.rollback()
    }
}

impl Deref for Transaction<'_> {
    type Target = Store;

    fn deref(&self) -> &Store {
        self.store
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Store {
        self.store
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.store.rollback();
        }
    }
}

fn bootstrap(mut file: &File) -> Result<()> {
    let header = FileHeader::new_empty();
    file.write_all(header.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn read_values(alloc: &SlabAllocator, ref_: Ref) -> Result<Vec<i64>> {
    if ref_ == 0 {
        return Ok(Vec::new());
    }
    let node = Array::from_ref(alloc, ref_)?;
    Ok((0..node.size()).map(|i| node.get(alloc, i)).collect())
}
