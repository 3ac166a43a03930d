//! The B+-tree column: stable element indices over arbitrary sizes, built
//! entirely from bit-packed nodes.
//!
//! A column root is 0 (empty, not yet materialized), a single leaf, or an
//! inner node. Inner nodes keep their running element counts in a separate
//! offsets node at slot 0; slots 1..k are child refs, and every child of
//! one inner node has the same height. Finding an element binary-searches
//! the offsets at each level, so position lookups are logarithmic no
//! matter how lopsided insertion order was.
//!
//! All mutations funnel through the nodes' copy-on-write, which means any
//! operation can relocate any node on the path it touched. The recursion
//! returns the possibly-new ref at each level and the caller stores it
//! into the parent slot; the column itself only remembers the root.

mod seq;

pub use seq::SequentialGetter;

use crate::alloc::{Ref, SlabAllocator};
use crate::error::{Error, Result};
use crate::node::{Array, Cmp, NodeKind};
use crate::writer::{write_subtree, NodeWriter};

/// Default cap on leaf size and inner fanout. Small enough that a linear
/// pass within one node stays cache friendly.
pub const DEFAULT_LEAF_CAP: usize = 1000;

#[derive(Debug)]
pub struct Column {
    root: Ref,
    len: usize,
    slot: Option<usize>,
    leaf_cap: usize,
    generation: u64,
    poisoned: bool,
}

impl Column {
    /// A fresh empty column. Nothing is allocated until the first insert.
    pub fn create(alloc: &SlabAllocator) -> Column {
        Column {
            root: 0,
            len: 0,
            slot: None,
            leaf_cap: DEFAULT_LEAF_CAP,
            generation: alloc.generation(),
            poisoned: false,
        }
    }

    /// Attach to an existing tree rooted at `root` (0 for an empty one).
    pub fn open(alloc: &SlabAllocator, root: Ref) -> Result<Column> {
        let len = subtree_size(alloc, root)? as usize;
        Ok(Column {
            root,
            len,
            slot: None,
            leaf_cap: DEFAULT_LEAF_CAP,
            generation: alloc.generation(),
            poisoned: false,
        })
    }

    pub(crate) fn open_slot(alloc: &SlabAllocator, root: Ref, slot: usize) -> Result<Column> {
        let mut col = Column::open(alloc, root)?;
        col.slot = Some(slot);
        Ok(col)
    }

    /// Tune the leaf/fanout cap. Mostly a test hook for forcing deep
    /// trees; must be at least 2.
    pub fn with_leaf_cap(mut self, cap: usize) -> Column {
        assert!(cap >= 2);
        self.leaf_cap = cap;
        self
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fails with `DetachedAccessor` once a commit or rollback has
    /// replaced the allocator state this column was opened under, and
    /// with `Poisoned` after a partial mutation failed.
    pub(crate) fn check(&self, alloc: &SlabAllocator) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        if self.generation != alloc.generation() {
            return Err(Error::DetachedAccessor);
        }
        Ok(())
    }

    fn bounds(&self, i: usize) -> Result<()> {
        if i >= self.len {
            return Err(Error::IndexOutOfBounds { index: i, size: self.len });
        }
        Ok(())
    }

    /// Mark the column unusable when a mutation failed midway.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.poisoned = true;
            }
        }
        result
    }

    pub fn get(&self, alloc: &SlabAllocator, i: usize) -> Result<i64> {
        self.check(alloc)?;
        self.bounds(i)?;
        let (leaf, start) = self.leaf_for(alloc, i)?;
        Ok(leaf.get(alloc, i - start))
    }

    /// The leaf holding element `i` and the global index of its first
    /// element.
    pub(crate) fn leaf_for(&self, alloc: &SlabAllocator, i: usize) -> Result<(Array, usize)> {
        let mut ref_ = self.root;
        let mut local = i;
        let mut start = 0usize;
        loop {
            let node = Array::from_ref(alloc, ref_)?;
            if !node.is_inner() {
                return Ok((node, start));
            }
            let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
            let s = offsets.upper_bound(alloc, local as i64);
            if s >= offsets.size() {
                return Err(Error::Corruption { detail: "offsets out of sync with subtree" });
            }
            let prior = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
            local -= prior;
            start += prior;
            ref_ = node.get_ref(alloc, 1 + s);
        }
    }

    pub fn seq(&self) -> SequentialGetter<'_> {
        SequentialGetter::new(self)
    }

    pub fn set(&mut self, alloc: &mut SlabAllocator, i: usize, v: i64) -> Result<()> {
        self.check(alloc)?;
        self.bounds(i)?;
        let result = set_walk(alloc, self.root, i, v);
        let new_root = self.guard(result)?;
        self.root = new_root;
        Ok(())
    }

    pub fn insert(&mut self, alloc: &mut SlabAllocator, i: usize, v: i64) -> Result<()> {
        self.check(alloc)?;
        if i > self.len {
            return Err(Error::IndexOutOfBounds { index: i, size: self.len });
        }
        let result = self.insert_inner(alloc, i, v);
        self.guard(result)
    }

    pub fn append(&mut self, alloc: &mut SlabAllocator, v: i64) -> Result<()> {
        self.insert(alloc, self.len, v)
    }

    fn insert_inner(&mut self, alloc: &mut SlabAllocator, i: usize, v: i64) -> Result<()> {
        if self.root == 0 {
            let mut node = Array::create(alloc, NodeKind::Leaf, false)?;
            node.push(alloc, v)?;
            self.root = node.ref_();
            self.len = 1;
            return Ok(());
        }
        let (new_root, split) = insert_walk(alloc, self.root, i, v, self.leaf_cap)?;
        self.root = new_root;
        if let Some(split) = split {
            // The root overflowed: raise the tree by one level.
            let left_total = subtree_size(alloc, new_root)?;
            let mut offsets = Array::create(alloc, NodeKind::Leaf, false)?;
            offsets.push(alloc, left_total as i64)?;
            offsets.push(alloc, (left_total + split.moved) as i64)?;
            let mut root = Array::create(alloc, NodeKind::Inner, false)?;
            root.push(alloc, offsets.ref_() as i64)?;
            root.push(alloc, new_root as i64)?;
            root.push(alloc, split.sibling as i64)?;
            self.root = root.ref_();
        }
        self.len += 1;
        Ok(())
    }

    pub fn erase(&mut self, alloc: &mut SlabAllocator, i: usize) -> Result<()> {
        self.check(alloc)?;
        self.bounds(i)?;
        let result = self.erase_inner(alloc, i);
        self.guard(result)
    }

    fn erase_inner(&mut self, alloc: &mut SlabAllocator, i: usize) -> Result<()> {
        let (new_root, empty) = erase_walk(alloc, self.root, i)?;
        self.root = new_root;
        self.len -= 1;
        if empty {
            let node = Array::from_ref(alloc, self.root)?;
            if node.is_inner() {
                // All children gone; only the shell is left.
                free_shell(alloc, self.root)?;
                self.root = 0;
            }
        } else {
            self.collapse_root(alloc)?;
        }
        Ok(())
    }

    pub fn erase_range(&mut self, alloc: &mut SlabAllocator, begin: usize, end: usize) -> Result<()> {
        self.check(alloc)?;
        if begin > end || end > self.len {
            return Err(Error::IndexOutOfBounds { index: end, size: self.len });
        }
        for _ in begin..end {
            self.erase(alloc, begin)?;
        }
        Ok(())
    }

    /// Cut the column down to `n` elements, deep-destroying refs held by
    /// removed leaves. Costs O(log size) plus the freed nodes.
    pub fn truncate(&mut self, alloc: &mut SlabAllocator, n: usize) -> Result<()> {
        self.truncate_impl(alloc, n, true)
    }

    /// Like [`truncate`](Self::truncate) but without following refs held
    /// in removed leaves.
    pub fn truncate_shallow(&mut self, alloc: &mut SlabAllocator, n: usize) -> Result<()> {
        self.truncate_impl(alloc, n, false)
    }

    pub fn clear(&mut self, alloc: &mut SlabAllocator) -> Result<()> {
        self.truncate(alloc, 0)
    }

    fn truncate_impl(&mut self, alloc: &mut SlabAllocator, n: usize, deep: bool) -> Result<()> {
        self.check(alloc)?;
        if n > self.len {
            return Err(Error::IndexOutOfBounds { index: n, size: self.len });
        }
        if n == self.len {
            return Ok(());
        }
        if n == 0 {
            let result = destroy_subtree(alloc, self.root, deep);
            self.guard(result)?;
            self.root = 0;
            self.len = 0;
            return Ok(());
        }
        let result = truncate_walk(alloc, self.root, n, deep);
        let new_root = self.guard(result)?;
        self.root = new_root;
        self.len = n;
        let result = self.collapse_root(alloc);
        self.guard(result)
    }

    fn collapse_root(&mut self, alloc: &mut SlabAllocator) -> Result<()> {
        loop {
            if self.root == 0 {
                return Ok(());
            }
            let node = Array::from_ref(alloc, self.root)?;
            if !node.is_inner() || node.size() != 2 {
                return Ok(());
            }
            let child = node.get_ref(alloc, 1);
            free_shell(alloc, self.root)?;
            self.root = child;
        }
    }

    /// First index in `[from, to)` matching `cmp` against `value`.
    pub fn find_first(
        &self,
        alloc: &SlabAllocator,
        cmp: Cmp,
        value: i64,
        from: usize,
        to: usize,
    ) -> Result<Option<usize>> {
        self.check(alloc)?;
        let to = to.min(self.len);
        if from >= to || self.root == 0 {
            return Ok(None);
        }
        find_walk(alloc, self.root, 0, from, to, cmp, value)
    }

    /// Append the global index of every match in `[from, to)` to the
    /// integer sink column `out`.
    pub fn find_all(
        &self,
        alloc: &mut SlabAllocator,
        out: &mut Column,
        cmp: Cmp,
        value: i64,
        from: usize,
        to: usize,
    ) -> Result<()> {
        self.check(alloc)?;
        let to = to.min(self.len);
        if from >= to || self.root == 0 {
            return Ok(());
        }
        let mut hits = Vec::new();
        find_all_walk(alloc, self.root, 0, from, to, cmp, value, &mut hits)?;
        for hit in hits {
            out.append(alloc, hit as i64)?;
        }
        Ok(())
    }

    pub fn sum(&self, alloc: &SlabAllocator, from: usize, to: usize) -> Result<i64> {
        self.check(alloc)?;
        let to = to.min(self.len);
        if from >= to || self.root == 0 {
            return Ok(0);
        }
        sum_walk(alloc, self.root, from, to)
    }

    /// First index whose element is not less than `value`; the column
    /// must be sorted ascending.
    pub fn lower_bound(&self, alloc: &SlabAllocator, value: i64) -> Result<usize> {
        self.check(alloc)?;
        if self.root == 0 {
            return Ok(0);
        }
        bound_walk(alloc, self.root, value, false)
    }

    /// First index whose element is greater than `value`; the column must
    /// be sorted ascending.
    pub fn upper_bound(&self, alloc: &SlabAllocator, value: i64) -> Result<usize> {
        self.check(alloc)?;
        if self.root == 0 {
            return Ok(0);
        }
        bound_walk(alloc, self.root, value, true)
    }

    /// Indices of 64-bit elements within Hamming distance `max_dist` of
    /// `value`, appended to `out`.
    pub fn find_hamming(
        &self,
        alloc: &SlabAllocator,
        value: u64,
        max_dist: u32,
        out: &mut Vec<usize>,
    ) -> Result<()> {
        self.check(alloc)?;
        if self.root == 0 {
            return Ok(());
        }
        hamming_walk(alloc, self.root, 0, value, max_dist, out)
    }

    /// Serialize the tree through `sink`, returning the new root ref.
    /// With `deep`, children are written first and their slots rewritten
    /// to the new positions. With `only_if_modified`, subtrees whose root
    /// ref is still committed are skipped and keep their old refs.
    pub fn write(
        &self,
        alloc: &SlabAllocator,
        sink: &mut dyn NodeWriter,
        deep: bool,
        only_if_modified: bool,
    ) -> Result<Ref> {
        self.check(alloc)?;
        if self.root == 0 {
            return Ok(0);
        }
        write_subtree(alloc, sink, self.root, deep, only_if_modified)
    }

    pub fn commit_write(&self, alloc: &SlabAllocator, sink: &mut dyn NodeWriter) -> Result<Ref> {
        self.write(alloc, sink, true, true)
    }
}

/// Total element count of the subtree at `ref_`.
pub(crate) fn subtree_size(alloc: &SlabAllocator, ref_: Ref) -> Result<u64> {
    if ref_ == 0 {
        return Ok(0);
    }
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        return Ok(node.size() as u64);
    }
    let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    if offsets.is_empty() {
        return Ok(0);
    }
    Ok(offsets.get(alloc, offsets.size() - 1) as u64)
}

fn subtree_last(alloc: &SlabAllocator, mut ref_: Ref) -> Result<i64> {
    loop {
        let node = Array::from_ref(alloc, ref_)?;
        if !node.is_inner() {
            if node.is_empty() {
                return Err(Error::Corruption { detail: "empty leaf inside a tree" });
            }
            return Ok(node.get(alloc, node.size() - 1));
        }
        if node.size() < 2 {
            return Err(Error::Corruption { detail: "inner node without children" });
        }
        ref_ = node.get_ref(alloc, node.size() - 1);
    }
}

struct Split {
    sibling: Ref,
    moved: u64,
}

fn set_walk(alloc: &mut SlabAllocator, ref_: Ref, i: usize, v: i64) -> Result<Ref> {
    let mut node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        node.set(alloc, i, v)?;
        return Ok(node.ref_());
    }
    let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let s = offsets.upper_bound(alloc, i as i64);
    if s >= offsets.size() {
        return Err(Error::Corruption { detail: "offsets out of sync with subtree" });
    }
    let prior = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
    let child = node.get_ref(alloc, 1 + s);
    let new_child = set_walk(alloc, child, i - prior, v)?;
    if new_child != child {
        node.set_ref(alloc, 1 + s, new_child)?;
    }
    Ok(node.ref_())
}

fn insert_walk(
    alloc: &mut SlabAllocator,
    ref_: Ref,
    i: usize,
    v: i64,
    leaf_cap: usize,
) -> Result<(Ref, Option<Split>)> {
    let mut node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        if node.size() < leaf_cap {
            node.insert(alloc, i, v)?;
            return Ok((node.ref_(), None));
        }
        // Full leaf. Appends open a fresh sibling; mid-leaf inserts move
        // the tail over and keep the new value at the end of the left
        // half. Order is preserved and both halves stay non-empty.
        let mut sibling = Array::create(alloc, NodeKind::Leaf, false)?;
        if i == node.size() {
            sibling.push(alloc, v)?;
            return Ok((node.ref_(), Some(Split { sibling: sibling.ref_(), moved: 1 })));
        }
        for j in i..node.size() {
            let moved = node.get(alloc, j);
            sibling.push(alloc, moved)?;
        }
        let moved = (node.size() - i) as u64;
        node.truncate_shallow(alloc, i)?;
        node.push(alloc, v)?;
        Ok((node.ref_(), Some(Split { sibling: sibling.ref_(), moved })))
    } else {
        let mut offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
        if offsets.is_empty() {
            return Err(Error::Corruption { detail: "inner node without children" });
        }
        let total = offsets.get(alloc, offsets.size() - 1) as usize;
        let s = if i >= total {
            offsets.size() - 1
        } else {
            offsets.upper_bound(alloc, i as i64)
        };
        let prior = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
        let child = node.get_ref(alloc, 1 + s);
        let (new_child, split) = insert_walk(alloc, child, i - prior, v, leaf_cap)?;
        if new_child != child {
            node.set_ref(alloc, 1 + s, new_child)?;
        }
        let mut split_out = None;
        match split {
            None => offsets.adjust(alloc, s, 1)?,
            Some(split) => {
                let left_total = subtree_size(alloc, new_child)? as i64;
                let old_cum = offsets.get(alloc, s);
                offsets.set(alloc, s, prior as i64 + left_total)?;
                offsets.insert(alloc, s + 1, old_cum + 1)?;
                offsets.adjust(alloc, s + 2, 1)?;
                node.insert(alloc, 2 + s, split.sibling as i64)?;
                if node.size() - 1 > leaf_cap {
                    split_out = Some(split_inner(alloc, &mut node, &mut offsets)?);
                }
            }
        }
        if node.get_ref(alloc, 0) != offsets.ref_() {
            node.set_ref(alloc, 0, offsets.ref_())?;
        }
        Ok((node.ref_(), split_out))
    }
}

/// Split an overflowing inner node in half, moving the upper children
/// into a fresh sibling of the same height.
fn split_inner(alloc: &mut SlabAllocator, node: &mut Array, offsets: &mut Array) -> Result<Split> {
    let children = node.size() - 1;
    let keep = children / 2;
    let boundary = offsets.get(alloc, keep - 1);

    let mut right_offsets = Array::create(alloc, NodeKind::Leaf, false)?;
    for j in keep..children {
        let cum = offsets.get(alloc, j);
        right_offsets.push(alloc, cum - boundary)?;
    }
    let mut right = Array::create(alloc, NodeKind::Inner, false)?;
    right.push(alloc, right_offsets.ref_() as i64)?;
    for j in keep..children {
        let child = node.get(alloc, 1 + j);
        right.push(alloc, child)?;
    }
    let moved = (offsets.get(alloc, children - 1) - boundary) as u64;
    node.truncate_shallow(alloc, 1 + keep)?;
    offsets.truncate_shallow(alloc, keep)?;
    Ok(Split { sibling: right.ref_(), moved })
}

fn erase_walk(alloc: &mut SlabAllocator, ref_: Ref, i: usize) -> Result<(Ref, bool)> {
    let mut node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        node.erase(alloc, i)?;
        return Ok((node.ref_(), node.is_empty()));
    }
    let mut offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let s = offsets.upper_bound(alloc, i as i64);
    if s >= offsets.size() {
        return Err(Error::Corruption { detail: "offsets out of sync with subtree" });
    }
    let prior = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
    let child = node.get_ref(alloc, 1 + s);
    let (new_child, child_empty) = erase_walk(alloc, child, i - prior)?;
    offsets.adjust(alloc, s, -1)?;
    if child_empty {
        free_shell(alloc, new_child)?;
        node.erase(alloc, 1 + s)?;
        offsets.erase(alloc, s)?;
    } else if new_child != child {
        node.set_ref(alloc, 1 + s, new_child)?;
    }
    if node.get_ref(alloc, 0) != offsets.ref_() {
        node.set_ref(alloc, 0, offsets.ref_())?;
    }
    Ok((node.ref_(), node.size() <= 1))
}

fn truncate_walk(alloc: &mut SlabAllocator, ref_: Ref, n: usize, deep: bool) -> Result<Ref> {
    debug_assert!(n >= 1);
    let mut node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        if deep {
            node.truncate(alloc, n)?;
        } else {
            node.truncate_shallow(alloc, n)?;
        }
        return Ok(node.ref_());
    }
    let mut offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let s = offsets.upper_bound(alloc, n as i64 - 1);
    if s >= offsets.size() {
        return Err(Error::Corruption { detail: "offsets out of sync with subtree" });
    }
    let prior = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
    let children = node.size() - 1;
    for t in (s + 1)..children {
        let gone = node.get_ref(alloc, 1 + t);
        destroy_subtree(alloc, gone, deep)?;
    }
    node.truncate_shallow(alloc, 2 + s)?;
    offsets.truncate_shallow(alloc, s + 1)?;

    let child = node.get_ref(alloc, 1 + s);
    let new_child = truncate_walk(alloc, child, n - prior, deep)?;
    if new_child != child {
        node.set_ref(alloc, 1 + s, new_child)?;
    }
    offsets.set(alloc, s, n as i64)?;
    if node.get_ref(alloc, 0) != offsets.ref_() {
        node.set_ref(alloc, 0, offsets.ref_())?;
    }
    Ok(node.ref_())
}

/// Free an inner node and its offsets node, or a bare leaf. Only legal
/// once the node has no remaining children.
fn free_shell(alloc: &mut SlabAllocator, ref_: Ref) -> Result<()> {
    let node = Array::from_ref(alloc, ref_)?;
    if node.is_inner() {
        let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
        offsets.destroy(alloc);
    }
    node.destroy(alloc);
    Ok(())
}

/// Free a whole subtree. `deep` also follows refs stored in leaves.
pub(crate) fn destroy_subtree(alloc: &mut SlabAllocator, ref_: Ref, deep: bool) -> Result<()> {
    if ref_ == 0 {
        return Ok(());
    }
    let node = Array::from_ref(alloc, ref_)?;
    if node.is_inner() {
        let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
        offsets.destroy(alloc);
        for s in 1..node.size() {
            let child = node.get_ref(alloc, s);
            destroy_subtree(alloc, child, deep)?;
        }
        node.destroy(alloc);
        Ok(())
    } else if deep {
        node.destroy_deep(alloc)
    } else {
        node.destroy(alloc);
        Ok(())
    }
}

/// Visit the children of `node` overlapping the local range `[from, to)`,
/// handing each its own local range and global base.
fn for_children<T>(
    alloc: &SlabAllocator,
    node: &Array,
    base: usize,
    from: usize,
    to: usize,
    mut f: impl FnMut(&SlabAllocator, Ref, usize, usize, usize) -> Result<Option<T>>,
) -> Result<Option<T>> {
    let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let mut s = offsets.upper_bound(alloc, from as i64);
    while s < offsets.size() {
        let lo = if s == 0 { 0 } else { offsets.get(alloc, s - 1) as usize };
        if lo >= to {
            break;
        }
        let hi = offsets.get(alloc, s) as usize;
        let child = node.get_ref(alloc, 1 + s);
        let child_from = from.saturating_sub(lo);
        let child_to = to.min(hi) - lo;
        if let Some(found) = f(alloc, child, base + lo, child_from, child_to)? {
            return Ok(Some(found));
        }
        s += 1;
    }
    Ok(None)
}

fn find_walk(
    alloc: &SlabAllocator,
    ref_: Ref,
    base: usize,
    from: usize,
    to: usize,
    cmp: Cmp,
    value: i64,
) -> Result<Option<usize>> {
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        return Ok(node.find_first(alloc, cmp, value, from, to).map(|i| base + i));
    }
    for_children(alloc, &node, base, from, to, |alloc, child, base, from, to| {
        find_walk(alloc, child, base, from, to, cmp, value)
    })
}

#[allow(clippy::too_many_arguments)]
fn find_all_walk(
    alloc: &SlabAllocator,
    ref_: Ref,
    base: usize,
    from: usize,
    to: usize,
    cmp: Cmp,
    value: i64,
    out: &mut Vec<usize>,
) -> Result<()> {
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        let mut local = Vec::new();
        node.find_all(alloc, cmp, value, from, to, &mut local);
        out.extend(local.into_iter().map(|i| base + i));
        return Ok(());
    }
    for_children::<()>(alloc, &node, base, from, to, |alloc, child, base, from, to| {
        find_all_walk(alloc, child, base, from, to, cmp, value, out)?;
        Ok(None)
    })?;
    Ok(())
}

fn sum_walk(alloc: &SlabAllocator, ref_: Ref, from: usize, to: usize) -> Result<i64> {
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        return Ok(node.sum(alloc, from, to));
    }
    let mut acc = 0i64;
    for_children::<()>(alloc, &node, 0, from, to, |alloc, child, _, from, to| {
        acc = acc.wrapping_add(sum_walk(alloc, child, from, to)?);
        Ok(None)
    })?;
    Ok(acc)
}

fn hamming_walk(
    alloc: &SlabAllocator,
    ref_: Ref,
    base: usize,
    value: u64,
    max_dist: u32,
    out: &mut Vec<usize>,
) -> Result<()> {
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        let mut local = Vec::new();
        node.find_hamming(alloc, value, max_dist, 0, node.size(), &mut local);
        out.extend(local.into_iter().map(|i| base + i));
        return Ok(());
    }
    let size = subtree_size(alloc, ref_)? as usize;
    for_children::<()>(alloc, &node, base, 0, size, |alloc, child, base, _, _| {
        hamming_walk(alloc, child, base, value, max_dist, out)?;
        Ok(None)
    })?;
    Ok(())
}

/// Binary search over child subtrees by their last element, then recurse.
fn bound_walk(alloc: &SlabAllocator, ref_: Ref, value: i64, upper: bool) -> Result<usize> {
    let node = Array::from_ref(alloc, ref_)?;
    if !node.is_inner() {
        return Ok(if upper {
            node.upper_bound(alloc, value)
        } else {
            node.lower_bound(alloc, value)
        });
    }
    let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0))?;
    let children = offsets.size();
    let mut lo = 0;
    let mut hi = children;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let last = subtree_last(alloc, node.get_ref(alloc, 1 + mid))?;
        let descend_right = if upper { last <= value } else { last < value };
        if descend_right {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == children {
        return Ok(offsets.get(alloc, children - 1) as usize);
    }
    let prior = if lo == 0 { 0 } else { offsets.get(alloc, lo - 1) as usize };
    let child = node.get_ref(alloc, 1 + lo);
    Ok(prior + bound_walk(alloc, child, value, upper)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(col: &Column, alloc: &SlabAllocator) -> Vec<i64> {
        (0..col.size()).map(|i| col.get(alloc, i).unwrap()).collect()
    }

    #[test]
    fn append_and_get_across_splits() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..10 {
            col.append(&mut alloc, v).unwrap();
        }
        assert_eq!(col.size(), 10);
        assert_eq!(contents(&col, &alloc), (0..10).collect::<Vec<_>>());

        // Appending into a cap-4 tree leaves leaves of sizes 4, 4, 2.
        let root = Array::from_ref(&alloc, col.root()).unwrap();
        assert!(root.is_inner());
        let offsets = Array::from_ref(&alloc, root.get_ref(&alloc, 0)).unwrap();
        let bounds: Vec<i64> = (0..offsets.size()).map(|i| offsets.get(&alloc, i)).collect();
        assert_eq!(bounds, vec![4, 8, 10]);
    }

    #[test]
    fn erase_keeps_order() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..10 {
            col.append(&mut alloc, v).unwrap();
        }
        col.erase(&mut alloc, 2).unwrap();
        assert_eq!(contents(&col, &alloc), vec![0, 1, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn deep_trees_stay_consistent() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(3);
        for v in 0..500 {
            col.append(&mut alloc, v).unwrap();
        }
        assert_eq!(col.size(), 500);
        for i in (0..500).step_by(37) {
            assert_eq!(col.get(&alloc, i).unwrap(), i as i64);
        }
        check_tree(&alloc, col.root());
    }

    #[test]
    fn random_inserts_match_a_vec() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        let mut model: Vec<i64> = Vec::new();
        // Deterministic but scattered insertion points.
        let mut pos = 0usize;
        for v in 0..200i64 {
            pos = (pos * 31 + 17) % (model.len() + 1);
            model.insert(pos, v);
            col.insert(&mut alloc, pos, v).unwrap();
        }
        assert_eq!(contents(&col, &alloc), model);
        check_tree(&alloc, col.root());
    }

    #[test]
    fn erase_all_collapses_to_empty() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..50 {
            col.append(&mut alloc, v).unwrap();
        }
        for _ in 0..50 {
            col.erase(&mut alloc, 0).unwrap();
        }
        assert_eq!(col.size(), 0);
        for v in [7, 8, 9] {
            col.append(&mut alloc, v).unwrap();
        }
        assert_eq!(contents(&col, &alloc), vec![7, 8, 9]);
    }

    #[test]
    fn erase_collapses_tall_roots() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(2);
        for v in 0..32 {
            col.append(&mut alloc, v).unwrap();
        }
        // Erase everything but one element; the root must become a leaf
        // again rather than a chain of single-child inner nodes.
        for _ in 0..31 {
            col.erase(&mut alloc, col.size() - 1).unwrap();
        }
        let root = Array::from_ref(&alloc, col.root()).unwrap();
        assert!(!root.is_inner());
        assert_eq!(contents(&col, &alloc), vec![0]);
    }

    #[test]
    fn truncate_drops_the_tail() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..100 {
            col.append(&mut alloc, v).unwrap();
        }
        col.truncate(&mut alloc, 33).unwrap();
        assert_eq!(col.size(), 33);
        assert_eq!(contents(&col, &alloc), (0..33).collect::<Vec<_>>());
        check_tree(&alloc, col.root());

        col.truncate(&mut alloc, 0).unwrap();
        assert_eq!(col.root(), 0);
        assert!(col.is_empty());
    }

    #[test]
    fn search_and_aggregate() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..100i64 {
            col.append(&mut alloc, v * 3).unwrap();
        }
        assert_eq!(col.find_first(&alloc, Cmp::Eq, 150, 0, 100).unwrap(), Some(50));
        assert_eq!(col.find_first(&alloc, Cmp::Eq, 151, 0, 100).unwrap(), None);
        assert_eq!(col.find_first(&alloc, Cmp::Gt, 290, 0, 100).unwrap(), Some(97));
        assert_eq!(col.find_first(&alloc, Cmp::Eq, 30, 11, 100).unwrap(), None);
        assert_eq!(col.sum(&alloc, 0, 100).unwrap(), 3 * (99 * 100) / 2);
        assert_eq!(col.sum(&alloc, 10, 12).unwrap(), 30 + 33);
        assert_eq!(col.lower_bound(&alloc, 150).unwrap(), 50);
        assert_eq!(col.lower_bound(&alloc, 151).unwrap(), 51);
        assert_eq!(col.upper_bound(&alloc, 150).unwrap(), 51);
    }

    #[test]
    fn find_all_feeds_a_sink_column() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in [5, 1, 5, 2, 5, 3, 5, 5, 0, 5] {
            col.append(&mut alloc, v).unwrap();
        }
        let mut out = Column::create(&alloc);
        col.find_all(&mut alloc, &mut out, Cmp::Eq, 5, 0, 10).unwrap();
        assert_eq!(contents(&out, &alloc), vec![0, 2, 4, 6, 7, 9]);
    }

    #[test]
    fn sequential_getter_caches_leaves() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc).with_leaf_cap(4);
        for v in 0..64 {
            col.append(&mut alloc, v * 2).unwrap();
        }
        let mut seq = col.seq();
        for i in 0..64 {
            assert_eq!(seq.get(&alloc, i).unwrap(), (i as i64) * 2);
        }
        // Backwards and random access still work, just re-resolve.
        assert_eq!(seq.get(&alloc, 3).unwrap(), 6);
        assert_eq!(seq.get(&alloc, 63).unwrap(), 126);
        assert!(matches!(
            seq.get(&alloc, 64),
            Err(Error::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn detached_accessors_fail() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc);
        col.append(&mut alloc, 1).unwrap();
        alloc.set_generation(1);
        assert!(matches!(col.get(&alloc, 0), Err(Error::DetachedAccessor)));
        assert!(matches!(
            col.append(&mut alloc, 2),
            Err(Error::DetachedAccessor)
        ));
    }

    #[test]
    fn bounds_are_reported() {
        let mut alloc = SlabAllocator::new_empty();
        let mut col = Column::create(&alloc);
        col.append(&mut alloc, 1).unwrap();
        assert!(matches!(
            col.get(&alloc, 1),
            Err(Error::IndexOutOfBounds { index: 1, size: 1 })
        ));
        assert!(matches!(
            col.set(&mut alloc, 5, 0),
            Err(Error::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            col.insert(&mut alloc, 3, 0),
            Err(Error::IndexOutOfBounds { .. })
        ));
    }

    /// Walk a tree checking the shape invariants: offsets strictly
    /// increasing and matching child subtree sizes, uniform child height,
    /// non-empty nodes.
    fn check_tree(alloc: &SlabAllocator, ref_: Ref) -> usize {
        let node = Array::from_ref(alloc, ref_).unwrap();
        if !node.is_inner() {
            return 0;
        }
        let offsets = Array::from_ref(alloc, node.get_ref(alloc, 0)).unwrap();
        assert_eq!(offsets.size() + 1, node.size(), "one offset per child");
        assert!(offsets.size() >= 1, "inner node must have children");
        let mut cum = 0i64;
        let mut height = None;
        for s in 0..offsets.size() {
            let child = node.get_ref(alloc, 1 + s);
            let child_height = check_tree(alloc, child);
            match height {
                None => height = Some(child_height),
                Some(h) => assert_eq!(h, child_height, "uneven child heights"),
            }
            cum += subtree_size(alloc, child).unwrap() as i64;
            assert_eq!(offsets.get(alloc, s), cum, "offset mismatch at slot {s}");
        }
        height.unwrap() + 1
    }
}
