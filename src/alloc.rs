//! The slab allocator: maps refs to memory and tracks free space across
//! transactions.
//!
//! A ref is a non-zero offset, divisible by 8, into a logical address space
//! split in two at `mapped_len`. Below the split lies the committed file
//! prefix, attached read-only; everything at or above it lives in writable
//! slab chunks created since the last commit. Mutating a committed node
//! therefore always goes through copy-on-write: the old bytes stay exactly
//! where readers of the previous version expect them.
//!
//! Chunks never move once handed out. The mapping is owned for the lifetime
//! of the allocator and slab chunks are individually boxed, so a pointer
//! obtained from [`translate`](SlabAllocator::translate) stays valid until
//! the allocator itself is replaced at commit or rollback.

use std::fs::File;

use log::debug;
use memmap2::{MmapOptions, MmapRaw};
use zerocopy::byteorder::little_endian::U64 as U64Le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// A stable, 8-byte-aligned, non-zero offset identifying a node. Zero is
/// reserved to mean "no node".
pub type Ref = u64;

pub const FILE_HEADER_LEN: usize = 24;
pub const MAGIC: [u8; 4] = *b"T-DB";
pub const FORMAT_VERSION: u8 = 1;

const MIN_SLAB: usize = 4096;

/// The 24-byte header at the start of every file: two top-ref slots, the
/// magic, the format version, and the indicator byte whose least
/// significant bit selects the live slot.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct FileHeader {
    pub top_refs: [U64Le; 2],
    pub magic: [u8; 4],
    pub format_version: u8,
    pub reserved: [u8; 2],
    pub current_slot: u8,
}

impl FileHeader {
    pub fn new_empty() -> Self {
        Self {
            top_refs: [U64Le::new(0), U64Le::new(0)],
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            reserved: [0; 2],
            current_slot: 0,
        }
    }

    pub fn validate(bytes: &[u8]) -> Result<FileHeader> {
        let header = FileHeader::read_from_bytes(
            bytes
                .get(..FILE_HEADER_LEN)
                .ok_or(Error::InvalidFile { reason: "file shorter than its header" })?,
        )
        .map_err(|_| Error::InvalidFile { reason: "unreadable header" })?;
        if header.magic != MAGIC {
            return Err(Error::InvalidFile { reason: "bad magic" });
        }
        if header.format_version != FORMAT_VERSION {
            return Err(Error::InvalidFile { reason: "unsupported format version" });
        }
        let top = header.top_ref();
        if top != 0 && (top < FILE_HEADER_LEN as u64 || top % 8 != 0) {
            return Err(Error::InvalidFile { reason: "misaligned top ref" });
        }
        Ok(header)
    }

    pub fn top_ref(&self) -> Ref {
        self.top_refs[(self.current_slot & 1) as usize].get()
    }
}

enum ReadRegion {
    Empty,
    Map(MmapRaw),
    Buffer(Vec<u8>),
}

struct Slab {
    start: u64,
    buf: Box<[u8]>,
}

/// A contiguous free byte range, identified by its starting ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    pub ref_: Ref,
    pub size: usize,
}

pub struct SlabAllocator {
    region: ReadRegion,
    mapped_len: usize,
    committed_top: Ref,
    current_slot: u8,
    slabs: Vec<Slab>,
    free_pool: Vec<FreeChunk>,
    freed: Vec<FreeChunk>,
    total: u64,
    generation: u64,
}

impl SlabAllocator {
    /// An allocator with no committed region at all; every ref is slab
    /// backed. Used for transient stores and tests.
    pub fn new_empty() -> Self {
        Self {
            region: ReadRegion::Empty,
            mapped_len: 0,
            committed_top: 0,
            current_slot: 0,
            slabs: Vec::new(),
            free_pool: Vec::new(),
            freed: Vec::new(),
            // Refs must be non-zero, so the logical space starts at 8.
            total: 8,
            generation: 0,
        }
    }

    /// Memory-map `file` read-only and validate its header. The file length
    /// recorded here is the read-only boundary for the whole transaction.
    pub fn attach_file(file: &File) -> Result<Self> {
        let len = file.metadata()?.len();
        if len < FILE_HEADER_LEN as u64 || len % 8 != 0 {
            return Err(Error::InvalidFile { reason: "truncated or misaligned file" });
        }
        let len = len as usize;
        let map = MmapOptions::new().len(len).map_raw_read_only(file)?;
        let bytes = unsafe { std::slice::from_raw_parts(map.as_ptr(), len) };
        let header = FileHeader::validate(bytes)?;
        let top = header.top_ref();
        if top as usize >= len {
            return Err(Error::InvalidFile { reason: "top ref beyond end of file" });
        }
        debug!("attached {len} byte file, top ref {top}");
        Ok(Self {
            region: ReadRegion::Map(map),
            mapped_len: len,
            committed_top: top,
            current_slot: header.current_slot & 1,
            slabs: Vec::new(),
            free_pool: Vec::new(),
            freed: Vec::new(),
            total: len as u64,
            generation: 0,
        })
    }

    /// Adopt an in-memory buffer holding a complete file image. The buffer
    /// is the read-only region; new allocations go to the slab as usual.
    pub fn attach_buffer(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN || buf.len() % 8 != 0 {
            return Err(Error::InvalidFile { reason: "truncated or misaligned buffer" });
        }
        let header = FileHeader::validate(&buf)?;
        let top = header.top_ref();
        if top as usize >= buf.len() {
            return Err(Error::InvalidFile { reason: "top ref beyond end of buffer" });
        }
        let len = buf.len();
        Ok(Self {
            region: ReadRegion::Buffer(buf),
            mapped_len: len,
            committed_top: top,
            current_slot: header.current_slot & 1,
            slabs: Vec::new(),
            free_pool: Vec::new(),
            freed: Vec::new(),
            total: len as u64,
            generation: 0,
        })
    }

    /// The top ref committed to the attached file, 0 for an empty store.
    pub fn committed_top(&self) -> Ref {
        self.committed_top
    }

    /// Which header slot the committed top ref was read from.
    pub fn current_slot(&self) -> u8 {
        self.current_slot
    }

    /// Drop every slab allocation and per-transaction record, keeping the
    /// committed region attached. This is the rollback primitive: the
    /// mapped bytes were never touched, so discarding the slab restores
    /// the committed state exactly.
    pub fn reset(&mut self) {
        self.slabs.clear();
        self.free_pool.clear();
        self.freed.clear();
        self.total = (self.mapped_len as u64).max(8);
    }

    /// Bytes of committed, read-only address space.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// True iff `ref_` lies in the committed region recorded at attach.
    pub fn is_read_only(&self, ref_: Ref) -> bool {
        (ref_ as usize) < self.mapped_len
    }

    /// Cheap validation that `ref_` points at least `len` addressable bytes.
    pub fn check_ref(&self, ref_: Ref, len: usize) -> Result<()> {
        if ref_ == 0 || ref_ % 8 != 0 {
            return Err(Error::Corruption { detail: "misaligned ref" });
        }
        let end = ref_ as usize + len;
        if self.is_read_only(ref_) {
            if end <= self.mapped_len {
                return Ok(());
            }
            return Err(Error::Corruption { detail: "ref spans the read-only boundary" });
        }
        match self.find_slab(ref_) {
            Some(slab) if end as u64 <= slab.start + slab.buf.len() as u64 => Ok(()),
            _ => Err(Error::Corruption { detail: "ref outside any region" }),
        }
    }

    /// Resolve a ref to memory. O(1) for the mapped region, logarithmic in
    /// the slab count otherwise.
    ///
    /// Panics on a ref no region covers; callers validate refs with
    /// [`check_ref`](Self::check_ref) when they first meet them.
    pub fn translate(&self, ref_: Ref) -> *const u8 {
        debug_assert!(ref_ != 0 && ref_ % 8 == 0);
        if self.is_read_only(ref_) {
            let base = match &self.region {
                ReadRegion::Map(map) => map.as_ptr() as *const u8,
                ReadRegion::Buffer(buf) => buf.as_ptr(),
                ReadRegion::Empty => unreachable!("read-only ref without a region"),
            };
            return unsafe { base.add(ref_ as usize) };
        }
        let slab = match self.find_slab(ref_) {
            Some(slab) => slab,
            None => panic!("ref {ref_} outside any region"),
        };
        unsafe { slab.buf.as_ptr().add((ref_ - slab.start) as usize) }
    }

    /// Mutable counterpart of [`translate`](Self::translate). Only legal
    /// for slab refs; committed refs must be copied first.
    pub fn translate_mut(&mut self, ref_: Ref) -> *mut u8 {
        debug_assert!(!self.is_read_only(ref_), "write against the committed region");
        let idx = match self.find_slab_idx(ref_) {
            Some(idx) => idx,
            None => panic!("ref {ref_} outside any region"),
        };
        let slab = &mut self.slabs[idx];
        unsafe { slab.buf.as_mut_ptr().add((ref_ - slab.start) as usize) }
    }

    /// A fresh region of at least `size` bytes, rounded up to a multiple of
    /// 8. Never overwrites ref-reachable data.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        let size = round_up(size.max(8));
        // Best fit keeps small holes for small requests instead of
        // nibbling every large chunk from the front.
        let mut best: Option<usize> = None;
        for idx in 0..self.free_pool.len() {
            let chunk = self.free_pool[idx];
            if chunk.size < size {
                continue;
            }
            if best.map_or(true, |b| chunk.size < self.free_pool[b].size) {
                best = Some(idx);
            }
        }
        if let Some(idx) = best {
            let chunk = self.free_pool[idx];
            if chunk.size == size {
                self.free_pool.swap_remove(idx);
            } else {
                self.free_pool[idx] = FreeChunk {
                    ref_: chunk.ref_ + size as u64,
                    size: chunk.size - size,
                };
            }
            return Ok(chunk.ref_);
        }
        let chunk_len = size.max(MIN_SLAB);
        let start = self.total;
        self.slabs.push(Slab {
            start,
            buf: vec![0u8; chunk_len].into_boxed_slice(),
        });
        self.total += chunk_len as u64;
        if chunk_len > size {
            self.free_pool.push(FreeChunk {
                ref_: start + size as u64,
                size: chunk_len - size,
            });
        }
        Ok(start)
    }

    /// Alloc + copy + free. The returned ref always differs from `ref_`
    /// when the source is read-only.
    pub fn realloc(&mut self, ref_: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        let new_ref = self.alloc(new_size)?;
        let copied = old_size.min(new_size);
        unsafe {
            let src = self.translate(ref_);
            let dst = self.translate_mut(new_ref);
            std::ptr::copy_nonoverlapping(src, dst, copied);
        }
        self.free(ref_, old_size);
        Ok(new_ref)
    }

    /// Release a region. Committed refs enter the per-transaction freed set
    /// (they reach the on-disk free list at commit); slab refs return to
    /// the pool immediately.
    pub fn free(&mut self, ref_: Ref, size: usize) {
        let size = round_up(size.max(8));
        if self.is_read_only(ref_) {
            self.freed.push(FreeChunk { ref_, size });
            return;
        }
        // Coalesce with a pool neighbour when one is adjacent.
        for chunk in &mut self.free_pool {
            if chunk.ref_ + chunk.size as u64 == ref_ {
                chunk.size += size;
                return;
            }
            if ref_ + size as u64 == chunk.ref_ {
                chunk.ref_ = ref_;
                chunk.size += size;
                return;
            }
        }
        self.free_pool.push(FreeChunk { ref_, size });
    }

    /// The committed refs freed during this transaction, sorted by offset.
    pub fn take_freed(&mut self) -> Vec<FreeChunk> {
        let mut freed = std::mem::take(&mut self.freed);
        freed.sort_by_key(|chunk| chunk.ref_);
        freed
    }

    fn find_slab(&self, ref_: Ref) -> Option<&Slab> {
        self.find_slab_idx(ref_).map(|idx| &self.slabs[idx])
    }

    fn find_slab_idx(&self, ref_: Ref) -> Option<usize> {
        // Slabs are created with ascending start offsets.
        let idx = self.slabs.partition_point(|slab| slab.start <= ref_);
        if idx == 0 {
            return None;
        }
        let slab = &self.slabs[idx - 1];
        if ref_ < slab.start + slab.buf.len() as u64 {
            Some(idx - 1)
        } else {
            None
        }
    }
}

fn round_up(size: usize) -> usize {
    (size + 7) & !7
}
