//! A prefix index over integer keys, keyed 4 bytes at a time.
//!
//! This is the classic consumer of the tagged-slot convention: an index
//! node pairs a sorted array of 4-byte key chunks with value slots that
//! hold either a tagged row number (one match), a ref to a sorted row
//! list (several rows sharing one key), or a ref to a nested sub-index
//! covering the next 4 key bytes (several keys sharing one chunk).
//! Sub-index nodes are marked with the header context flag so a scan can
//! tell them apart from row lists without any out-of-band bookkeeping.
//!
//! The index stores rows, not keys, beyond the chunks that guided the
//! descent, so lookups verify candidates against a [`KeySource`],
//! normally the indexed column itself.

use crate::alloc::{Ref, SlabAllocator};
use crate::column::Column;
use crate::error::{Error, Result};
use crate::node::{Array, NodeKind, RefOrTagged};

/// Where the index reads a row's full key back from.
pub trait KeySource {
    fn key_of(&self, alloc: &SlabAllocator, row: u64) -> Result<u64>;
}

impl KeySource for Column {
    fn key_of(&self, alloc: &SlabAllocator, row: u64) -> Result<u64> {
        Ok(self.get(alloc, row as usize)? as u64)
    }
}

pub struct PrefixIndex {
    root: Ref,
    unique: bool,
}

impl PrefixIndex {
    pub fn create(unique: bool) -> PrefixIndex {
        PrefixIndex { root: 0, unique }
    }

    pub fn open(alloc: &SlabAllocator, root: Ref, unique: bool) -> Result<PrefixIndex> {
        if root != 0 {
            let node = Array::from_ref(alloc, root)?;
            if !node.context_flag() || !node.has_refs() {
                return Err(Error::Corruption { detail: "index root is not an index node" });
            }
        }
        Ok(PrefixIndex { root, unique })
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn insert(
        &mut self,
        alloc: &mut SlabAllocator,
        key: u64,
        row: u64,
        source: &dyn KeySource,
    ) -> Result<()> {
        if self.root == 0 {
            self.root = new_index_node(alloc)?;
        }
        self.root = insert_at(alloc, self.root, key, row, 0, self.unique, source)?;
        Ok(())
    }

    /// The first (lowest) row indexed under `key`.
    pub fn find_first(
        &self,
        alloc: &SlabAllocator,
        key: u64,
        source: &dyn KeySource,
    ) -> Result<Option<u64>> {
        let mut rows = Vec::new();
        self.walk(alloc, key, source, true, &mut rows)?;
        Ok(rows.first().copied())
    }

    /// Every row indexed under `key`, ascending, appended to `out`.
    pub fn find_all(
        &self,
        alloc: &SlabAllocator,
        key: u64,
        source: &dyn KeySource,
        out: &mut Vec<u64>,
    ) -> Result<()> {
        self.walk(alloc, key, source, false, out)
    }

    fn walk(
        &self,
        alloc: &SlabAllocator,
        key: u64,
        source: &dyn KeySource,
        first_only: bool,
        out: &mut Vec<u64>,
    ) -> Result<()> {
        if self.root == 0 {
            return Ok(());
        }
        let mut ref_ = self.root;
        let mut depth = 0;
        loop {
            let node = Array::from_ref(alloc, ref_)?;
            let keys = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
            let chunk = chunk_of(key, depth) as i64;
            let s = keys.lower_bound(alloc, chunk);
            if s == keys.size() || keys.get(alloc, s) != chunk {
                return Ok(());
            }
            let slot = RefOrTagged::from_raw(node.get(alloc, 1 + s));
            if let Some(row) = slot.as_tagged() {
                if source.key_of(alloc, row)? == key {
                    out.push(row);
                }
                return Ok(());
            }
            let child = match slot.as_ref_value() {
                Some(child) => child,
                None => return Err(Error::Corruption { detail: "null slot in index node" }),
            };
            let child_node = Array::from_ref(alloc, child)?;
            if child_node.context_flag() {
                if depth >= MAX_DEPTH {
                    return Err(Error::Corruption { detail: "index deeper than its key space" });
                }
                ref_ = child;
                depth += 4;
                continue;
            }
            // A row list: every entry shares one full key.
            if child_node.is_empty() {
                return Err(Error::Corruption { detail: "empty row list in index" });
            }
            let probe = child_node.get(alloc, 0) as u64;
            if source.key_of(alloc, probe)? != key {
                return Ok(());
            }
            if first_only {
                out.push(probe);
            } else {
                for i in 0..child_node.size() {
                    out.push(child_node.get(alloc, i) as u64);
                }
            }
            return Ok(());
        }
    }

    /// Free the whole index. Tagged rows are skipped; sub-indexes, row
    /// lists and chunk arrays are all reachable through refs.
    pub fn destroy(self, alloc: &mut SlabAllocator) -> Result<()> {
        if self.root != 0 {
            Array::from_ref(alloc, self.root)?.destroy_deep(alloc)?;
        }
        Ok(())
    }
}

const MAX_DEPTH: usize = 4;

fn chunk_of(key: u64, depth: usize) -> u32 {
    debug_assert!(depth <= MAX_DEPTH);
    if depth == 0 {
        (key >> 32) as u32
    } else {
        key as u32
    }
}

fn new_index_node(alloc: &mut SlabAllocator) -> Result<Ref> {
    let keys = Array::create(alloc, NodeKind::Leaf, false)?;
    let mut node = Array::create(alloc, NodeKind::HasRefs, true)?;
    node.push(alloc, keys.ref_() as i64)?;
    Ok(node.ref_())
}

/// Insert `(chunk, raw_slot)` into an index node known not to contain the
/// chunk yet.
fn insert_pair(alloc: &mut SlabAllocator, ref_: Ref, chunk: i64, raw_slot: i64) -> Result<Ref> {
    let mut node = Array::from_ref(alloc, ref_)?;
    let mut keys = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let s = keys.lower_bound(alloc, chunk);
    debug_assert!(s == keys.size() || keys.get(alloc, s) != chunk);
    keys.insert(alloc, s, chunk)?;
    node.insert(alloc, 1 + s, raw_slot)?;
    if node.get_ref(alloc, 0) != keys.ref_() {
        node.set_ref(alloc, 0, keys.ref_())?;
    }
    Ok(node.ref_())
}

fn insert_at(
    alloc: &mut SlabAllocator,
    ref_: Ref,
    key: u64,
    row: u64,
    depth: usize,
    unique: bool,
    source: &dyn KeySource,
) -> Result<Ref> {
    let mut node = Array::from_ref(alloc, ref_)?;
    let mut keys = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let chunk = chunk_of(key, depth) as i64;
    let s = keys.lower_bound(alloc, chunk);

    if s == keys.size() || keys.get(alloc, s) != chunk {
        keys.insert(alloc, s, chunk)?;
        node.insert(alloc, 1 + s, RefOrTagged::make_tagged(row).raw())?;
        if node.get_ref(alloc, 0) != keys.ref_() {
            node.set_ref(alloc, 0, keys.ref_())?;
        }
        return Ok(node.ref_());
    }

    let slot = RefOrTagged::from_raw(node.get(alloc, 1 + s));
    if let Some(other) = slot.as_tagged() {
        let other_key = source.key_of(alloc, other)?;
        if other_key == key {
            if unique {
                return Err(Error::UniqueConstraint { key });
            }
            let mut list = Array::create(alloc, NodeKind::Leaf, false)?;
            let (lo, hi) = if other <= row { (other, row) } else { (row, other) };
            list.push(alloc, lo as i64)?;
            list.push(alloc, hi as i64)?;
            node.set(alloc, 1 + s, list.ref_() as i64)?;
        } else {
            // Two keys share this chunk: push both down one level.
            debug_assert!(depth < MAX_DEPTH);
            let sub = new_index_node(alloc)?;
            let sub = insert_at(alloc, sub, other_key, other, depth + 4, unique, source)?;
            let sub = insert_at(alloc, sub, key, row, depth + 4, unique, source)?;
            node.set(alloc, 1 + s, sub as i64)?;
        }
    } else {
        let child = match slot.as_ref_value() {
            Some(child) => child,
            None => return Err(Error::Corruption { detail: "null slot in index node" }),
        };
        let child_node = Array::from_ref(alloc, child)?;
        if child_node.context_flag() {
            let new_child = insert_at(alloc, child, key, row, depth + 4, unique, source)?;
            if new_child != child {
                node.set(alloc, 1 + s, new_child as i64)?;
            }
        } else {
            // An existing row list.
            if child_node.is_empty() {
                return Err(Error::Corruption { detail: "empty row list in index" });
            }
            let probe = child_node.get(alloc, 0) as u64;
            let list_key = source.key_of(alloc, probe)?;
            if list_key == key {
                if unique {
                    return Err(Error::UniqueConstraint { key });
                }
                let mut list = child_node;
                let at = list.lower_bound(alloc, row as i64);
                list.insert(alloc, at, row as i64)?;
                if list.ref_() != child {
                    node.set(alloc, 1 + s, list.ref_() as i64)?;
                }
            } else {
                // The list's key and ours share the chunk: move the list
                // down a level, then insert ours beside it.
                debug_assert!(depth < MAX_DEPTH);
                let sub = new_index_node(alloc)?;
                let sub = insert_pair(
                    alloc,
                    sub,
                    chunk_of(list_key, depth + 4) as i64,
                    child as i64,
                )?;
                let sub = insert_at(alloc, sub, key, row, depth + 4, unique, source)?;
                node.set(alloc, 1 + s, sub as i64)?;
            }
        }
    }
    if node.get_ref(alloc, 0) != keys.ref_() {
        node.set_ref(alloc, 0, keys.ref_())?;
    }
    Ok(node.ref_())
}
