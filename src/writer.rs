//! The commit coordinator: serializes modified subtrees into free space,
//! maintains the versioned free list, grows the file, and publishes the
//! new top ref with a dual-slot header swap.
//!
//! Durability ordering is the whole point here. Node bytes and free-list
//! arrays land in space no live version can reach (free spans older than
//! the oldest reader, or the freshly extended tail), so a crash before
//! the final header flip leaves the previous version fully intact. The
//! flip itself is a single byte, written only after everything it points
//! to has been synced.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use log::debug;

use crate::alloc::{FreeChunk, Ref, SlabAllocator, FILE_HEADER_LEN};
use crate::error::Result;
use crate::node::{encode_node, Array, RefOrTagged, Width};

/// File growth doubles until this threshold, then continues in steps of
/// it. Never shrinks.
const STOP_DOUBLING: u64 = 128 * 1024 * 1024;

/// Byte sink for node serialization. Implementations return the ref the
/// node will be reachable under.
pub trait NodeWriter {
    fn write_node(&mut self, bytes: &[u8]) -> Result<Ref>;
}

/// Post-order subtree serialization. Children are written before their
/// parent so the parent image can carry their final refs; tagged slots
/// and null refs pass through untouched. With `only_if_modified`, any
/// subtree still rooted in the committed region keeps its old ref and
/// writes nothing.
pub(crate) fn write_subtree(
    alloc: &SlabAllocator,
    sink: &mut dyn NodeWriter,
    ref_: Ref,
    deep: bool,
    only_if_modified: bool,
) -> Result<Ref> {
    if only_if_modified && alloc.is_read_only(ref_) {
        return Ok(ref_);
    }
    let node = Array::from_ref(alloc, ref_)?;
    if !deep || !node.has_refs() {
        return sink.write_node(&node.serialized_bytes(alloc));
    }
    let mut values = Vec::with_capacity(node.size());
    for i in 0..node.size() {
        let raw = node.get(alloc, i);
        match RefOrTagged::from_raw(raw).as_ref_value() {
            Some(child) => {
                let new_child = write_subtree(alloc, sink, child, deep, only_if_modified)?;
                values.push(new_child as i64);
            }
            None => values.push(raw),
        }
    }
    let bytes = encode_node(
        &values,
        node.is_inner(),
        node.has_refs(),
        node.context_flag(),
        Width::W0,
    );
    sink.write_node(&bytes)
}

/// A free byte range in the file, tagged with the version that freed it.
/// Space is only reusable once no live reader can still reach the data
/// it used to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSpan {
    pub pos: u64,
    pub len: u64,
    pub version: u64,
}

pub(crate) struct CommitOutcome {
    pub top: Ref,
    pub slot: u8,
    pub file_len: u64,
}

pub(crate) struct CommitWriter<'a> {
    file: &'a mut File,
    file_len: u64,
    free: Vec<FreeSpan>,
    /// The version this commit creates.
    version: u64,
    /// Snapshot version of the oldest live reader; spans freed at or
    /// after it are off limits.
    readlock: u64,
}

impl<'a> CommitWriter<'a> {
    pub(crate) fn new(
        file: &'a mut File,
        file_len: u64,
        free: Vec<FreeSpan>,
        version: u64,
        readlock: u64,
    ) -> Self {
        Self { file, file_len, free, version, readlock }
    }

    pub(crate) fn commit(
        mut self,
        alloc: &SlabAllocator,
        roots: &[Ref],
        freed: Vec<FreeChunk>,
        current_slot: u8,
    ) -> Result<CommitOutcome> {
        self.merge_free_space();

        let mut new_roots = Vec::with_capacity(roots.len());
        for &root in roots {
            let new_root = if root == 0 {
                0
            } else {
                write_subtree(alloc, &mut self, root, true, true)?
            };
            new_roots.push(new_root as i64);
        }

        // This transaction's freed refs join the list at the new version:
        // visible to future commits, untouchable by this one.
        for chunk in freed {
            let span = FreeSpan {
                pos: chunk.ref_,
                len: chunk.size as u64,
                version: self.version,
            };
            let idx = self.free.partition_point(|s| s.pos < span.pos);
            self.free.insert(idx, span);
        }

        // Reserve one chunk covering the free-list arrays, the roots
        // array and the top node. Width-64 encoding makes the byte count
        // exact; the donor span must keep at least 8 spare bytes so the
        // remainder it leaves in the list is never empty, which is what
        // lets us size the arrays before carving the chunk out.
        let reserved = loop {
            let n = self.free.len() as u64;
            let need = 3 * array64_len(n)
                + array64_len(new_roots.len() as u64)
                + array64_len(TOP_SLOTS);
            if let Some(pos) = self.reserve(need) {
                break pos;
            }
            self.extend(need + 8)?;
        };

        let n = self.free.len() as u64;
        let fpos: Vec<i64> = self.free.iter().map(|s| s.pos as i64).collect();
        let flen: Vec<i64> = self.free.iter().map(|s| s.len as i64).collect();
        let fver: Vec<i64> = self.free.iter().map(|s| s.version as i64).collect();

        let fpos_pos = reserved;
        let flen_pos = fpos_pos + array64_len(n);
        let fver_pos = flen_pos + array64_len(n);
        let roots_pos = fver_pos + array64_len(n);
        let top_pos = roots_pos + array64_len(new_roots.len() as u64);

        self.write_at(fpos_pos, &encode_node(&fpos, false, false, false, Width::W64))?;
        self.write_at(flen_pos, &encode_node(&flen, false, false, false, Width::W64))?;
        self.write_at(fver_pos, &encode_node(&fver, false, false, false, Width::W64))?;
        self.write_at(
            roots_pos,
            &encode_node(&new_roots, false, true, false, Width::W64),
        )?;
        let top_values = [
            roots_pos as i64,
            fpos_pos as i64,
            flen_pos as i64,
            fver_pos as i64,
            RefOrTagged::make_tagged(self.version).raw(),
        ];
        self.write_at(top_pos, &encode_node(&top_values, false, true, false, Width::W64))?;

        let slot = self.publish(top_pos, current_slot)?;
        debug!(
            "committed version {} at top ref {top_pos}, {} free spans, file {} bytes",
            self.version, n, self.file_len
        );
        Ok(CommitOutcome { top: top_pos, slot, file_len: self.file_len })
    }

    /// Coalesce adjacent spans, but only where both sides are already
    /// older than every live reader. Merging across the boundary would
    /// let a later allocation clobber a version someone still reads.
    fn merge_free_space(&mut self) {
        let mut i = 0;
        while i + 1 < self.free.len() {
            let a = self.free[i];
            let b = self.free[i + 1];
            if a.version < self.readlock && b.version < self.readlock && a.pos + a.len == b.pos {
                self.free[i].len += b.len;
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    fn take(&mut self, size: u64) -> Option<u64> {
        for idx in 0..self.free.len() {
            let span = self.free[idx];
            if span.version < self.readlock && span.len >= size {
                self.free[idx].pos += size;
                self.free[idx].len -= size;
                if self.free[idx].len == 0 {
                    self.free.remove(idx);
                }
                return Some(span.pos);
            }
        }
        None
    }

    /// Like [`take`](Self::take) but insists on leaving a non-empty
    /// remainder span behind, keeping the span count stable.
    fn reserve(&mut self, size: u64) -> Option<u64> {
        for idx in 0..self.free.len() {
            let span = self.free[idx];
            if span.version < self.readlock && span.len >= size + 8 {
                self.free[idx].pos += size;
                self.free[idx].len -= size;
                return Some(span.pos);
            }
        }
        None
    }

    fn alloc_space(&mut self, size: u64) -> Result<u64> {
        loop {
            if let Some(pos) = self.take(size) {
                return Ok(pos);
            }
            self.extend(size)?;
        }
    }

    fn extend(&mut self, needed: u64) -> Result<()> {
        let min_size = self.file_len + needed;
        let mut new_size = self.file_len.max(FILE_HEADER_LEN as u64);
        while new_size < min_size {
            if new_size < STOP_DOUBLING {
                new_size *= 2;
            } else {
                new_size += STOP_DOUBLING;
            }
        }
        debug_assert!(new_size % 8 == 0);
        self.file.set_len(new_size)?;
        let delta = new_size - self.file_len;
        debug!("growing file {} -> {new_size} bytes", self.file_len);
        match self.free.last_mut() {
            Some(last) if last.pos + last.len == self.file_len && last.version < self.readlock => {
                last.len += delta;
            }
            _ => self.free.push(FreeSpan { pos: self.file_len, len: delta, version: 0 }),
        }
        self.file_len = new_size;
        Ok(())
    }

    fn write_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// The atomic publish: new top ref into the slot the indicator does
    /// not point at, sync, flip the indicator, sync again. Whichever
    /// slot the indicator selects after a crash is complete.
    fn publish(&mut self, top: Ref, current_slot: u8) -> Result<u8> {
        self.file.sync_data()?;
        let new_slot = current_slot ^ 1;
        self.write_at(8 * new_slot as u64, &top.to_le_bytes())?;
        self.file.sync_data()?;
        self.write_at(23, &[new_slot])?;
        self.file.sync_data()?;
        Ok(new_slot)
    }
}

impl NodeWriter for CommitWriter<'_> {
    fn write_node(&mut self, bytes: &[u8]) -> Result<Ref> {
        debug_assert!(bytes.len() % 8 == 0);
        let pos = self.alloc_space(bytes.len() as u64)?;
        self.write_at(pos, bytes)?;
        Ok(pos)
    }
}

const TOP_SLOTS: u64 = 5;

/// Byte length of a width-64 node image holding `n` elements.
fn array64_len(n: u64) -> u64 {
    8 + n * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FORMAT_VERSION, MAGIC};
    use crate::column::Column;

    /// Appends nodes to an in-memory file image.
    struct ImageSink {
        image: Vec<u8>,
    }

    impl ImageSink {
        fn new() -> Self {
            let mut image = vec![0u8; FILE_HEADER_LEN];
            image[16..20].copy_from_slice(&MAGIC);
            image[20] = FORMAT_VERSION;
            Self { image }
        }
    }

    impl NodeWriter for ImageSink {
        fn write_node(&mut self, bytes: &[u8]) -> Result<Ref> {
            let pos = self.image.len() as Ref;
            self.image.extend_from_slice(bytes);
            Ok(pos)
        }
    }

    #[test]
    fn serialized_trees_read_back_from_an_image() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..40i64 {
            col.append(&mut alloc, v * 7).unwrap();
        }

        let mut sink = ImageSink::new();
        let root = col.write(&alloc, &mut sink, true, false).unwrap();
        let mut image = sink.image;
        image[0..8].copy_from_slice(&root.to_le_bytes());

        let reloaded = SlabAllocator::attach_buffer(image).unwrap();
        let col2 = Column::open(&reloaded, reloaded.committed_top()).unwrap();
        assert_eq!(col2.size(), 40);
        for i in 0..40 {
            assert_eq!(col2.get(&reloaded, i).unwrap(), (i as i64) * 7);
        }
    }

    #[test]
    fn unmodified_committed_subtrees_keep_their_refs() {
        // Build an image, re-attach it, then serialize again with
        // only_if_modified: the root ref must come back unchanged with
        // nothing written.
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..20i64 {
            col.append(&mut alloc, v).unwrap();
        }
        let mut sink = ImageSink::new();
        let root = col.write(&alloc, &mut sink, true, false).unwrap();
        let mut image = sink.image;
        image[0..8].copy_from_slice(&root.to_le_bytes());

        let reloaded = SlabAllocator::attach_buffer(image).unwrap();
        let col2 = Column::open(&reloaded, root).unwrap();
        let mut sink2 = ImageSink::new();
        let len_before = sink2.image.len();
        let root2 = col2.write(&reloaded, &mut sink2, true, true).unwrap();
        assert_eq!(root2, root);
        assert_eq!(sink2.image.len(), len_before);
    }
}
