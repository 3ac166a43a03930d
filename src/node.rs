//! The node: a self-describing bit-packed array of signed integers, and the
//! sole on-disk representation of everything in a store.
//!
//! A node is an 8-byte header followed by a payload of `size` elements at
//! one of eight widths (0, 1, 2, 4, 8, 16, 32 or 64 bits). The header packs
//! three flag bits, the width code, and 24-bit big-endian size and capacity
//! fields; byte 7 is reserved and must be zero. Total byte length is always
//! a multiple of 8.
//!
//! Widths only ever grow. Storing a value that does not fit re-encodes the
//! whole payload at the next sufficient width; erasing never narrows.
//!
//! An [`Array`] is an accessor over a node ref. It caches the decoded
//! header and threads an explicit [`SlabAllocator`] through every
//! operation; mutations funnel through copy-on-write, so the accessor's
//! ref may change and callers holding the node's slot in a parent are
//! expected to store the ref back after mutating.

mod width;

pub use width::Width;

use crate::alloc::{Ref, SlabAllocator};
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 8;

/// Size and capacity are 24-bit header fields; payloads cap at ~16 MiB.
pub const MAX_PAYLOAD: usize = 0xFF_FFF8;
pub const MAX_ELEMS: usize = 0xFF_FFFF;

/// What a node stores, mirrored in the header flag bits. `Inner` implies
/// that slots are refs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    /// Plain integer elements.
    Leaf,
    /// Elements are refs (or tagged integers) that deep-destroy follows.
    HasRefs,
    /// An inner B+-tree node: slot 0 is the offsets node, the rest are
    /// child refs.
    Inner,
}

/// Comparator tag for the search operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub fn matches(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
        }
    }
}

/// A 64-bit slot value that is either a ref or a small integer,
/// distinguished by the least significant bit. Refs are always even; a
/// tagged integer is `(value << 1) | 1`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RefOrTagged(i64);

impl RefOrTagged {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_ref(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn is_tagged(self) -> bool {
        !self.is_ref()
    }

    pub fn as_ref_value(self) -> Option<Ref> {
        if self.is_ref() && self.0 != 0 {
            Some(self.0 as Ref)
        } else {
            None
        }
    }

    pub fn as_tagged(self) -> Option<u64> {
        if self.is_tagged() {
            Some((self.0 as u64) >> 1)
        } else {
            None
        }
    }

    pub fn make_ref(ref_: Ref) -> Self {
        debug_assert!(ref_ % 2 == 0);
        Self(ref_ as i64)
    }

    pub fn make_tagged(value: u64) -> Self {
        debug_assert!(value < 1 << 63);
        Self(((value << 1) | 1) as i64)
    }
}

/// Accessor over a single node.
#[derive(Clone, Debug)]
pub struct Array {
    ref_: Ref,
    width: Width,
    size: usize,
    capacity: usize,
    is_inner: bool,
    has_refs: bool,
    context_flag: bool,
}

impl Array {
    /// Allocate a fresh empty node.
    pub fn create(alloc: &mut SlabAllocator, kind: NodeKind, context_flag: bool) -> Result<Array> {
        let ref_ = alloc.alloc(HEADER_LEN)?;
        let node = Array {
            ref_,
            width: Width::W0,
            size: 0,
            capacity: 0,
            is_inner: kind == NodeKind::Inner,
            has_refs: kind != NodeKind::Leaf,
            context_flag,
        };
        node.store_header(alloc);
        Ok(node)
    }

    /// Attach an accessor to an existing node, validating its header.
    pub fn from_ref(alloc: &SlabAllocator, ref_: Ref) -> Result<Array> {
        alloc.check_ref(ref_, HEADER_LEN)?;
        let header = unsafe { std::slice::from_raw_parts(alloc.translate(ref_), HEADER_LEN) };
        if header[7] != 0 || header[0] & 0b0001_1000 != 0 {
            return Err(Error::Corruption { detail: "reserved header bits set" });
        }
        let width = match Width::from_code(header[0] & 0b0000_0111) {
            Some(width) => width,
            None => return Err(Error::Corruption { detail: "bad width code" }),
        };
        let size = be24(&header[1..4]);
        let capacity = be24(&header[4..7]);
        if capacity % 8 != 0 {
            return Err(Error::Corruption { detail: "node byte length not a multiple of 8" });
        }
        if capacity < width.byte_len(size) {
            return Err(Error::Corruption { detail: "capacity below payload size" });
        }
        alloc.check_ref(ref_, HEADER_LEN + capacity)?;
        Ok(Array {
            ref_,
            width,
            size,
            capacity,
            is_inner: header[0] & 0b1000_0000 != 0,
            has_refs: header[0] & 0b0100_0000 != 0,
            context_flag: header[0] & 0b0010_0000 != 0,
        })
    }

    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn is_inner(&self) -> bool {
        self.is_inner
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub fn context_flag(&self) -> bool {
        self.context_flag
    }

    /// Header plus payload bytes actually in use, rounded to the 8-byte
    /// grain the file format requires. This is what serialization writes.
    pub fn used_byte_len(&self) -> usize {
        round_up(HEADER_LEN + self.width.byte_len(self.size))
    }

    /// Header plus allocated capacity; the unit handed back on free.
    pub fn total_byte_len(&self) -> usize {
        HEADER_LEN + self.capacity
    }

    pub fn header_bytes(&self) -> [u8; 8] {
        let mut header = [0u8; 8];
        header[0] = ((self.is_inner as u8) << 7)
            | ((self.has_refs as u8) << 6)
            | ((self.context_flag as u8) << 5)
            | self.width.code();
        put_be24(&mut header[1..4], self.size);
        put_be24(&mut header[4..7], self.capacity);
        header
    }

    fn store_header(&self, alloc: &mut SlabAllocator) {
        let bytes = self.header_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), alloc.translate_mut(self.ref_), HEADER_LEN);
        }
    }

    fn payload<'a>(&self, alloc: &'a SlabAllocator) -> &'a [u8] {
        unsafe {
            std::slice::from_raw_parts(alloc.translate(self.ref_).add(HEADER_LEN), self.capacity)
        }
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAllocator) -> &'a mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                alloc.translate_mut(self.ref_).add(HEADER_LEN),
                self.capacity,
            )
        }
    }

    pub fn get(&self, alloc: &SlabAllocator, i: usize) -> i64 {
        debug_assert!(i < self.size);
        get_from(self.payload(alloc), self.width, i)
    }

    /// Slot `i` interpreted as a ref. Only meaningful on has-refs nodes.
    pub fn get_ref(&self, alloc: &SlabAllocator, i: usize) -> Ref {
        let v = self.get(alloc, i);
        debug_assert!(v >= 0 && v & 1 == 0);
        v as Ref
    }

    /// Fill `out` with up to 8 consecutive elements starting at `i`,
    /// zero-padding past the end.
    pub fn get_chunk(&self, alloc: &SlabAllocator, i: usize, out: &mut [i64; 8]) {
        debug_assert!(i < self.size);
        let n = (self.size - i).min(8);
        let data = self.payload(alloc);
        match self.width {
            Width::W0 => out[..n].fill(0),
            Width::W8 => {
                for (j, slot) in out[..n].iter_mut().enumerate() {
                    *slot = data[i + j] as i8 as i64;
                }
            }
            Width::W64 => {
                for (j, slot) in out[..n].iter_mut().enumerate() {
                    let at = (i + j) * 8;
                    *slot = i64::from_le_bytes(data[at..at + 8].try_into().unwrap());
                }
            }
            w => {
                for (j, slot) in out[..n].iter_mut().enumerate() {
                    *slot = get_from(data, w, i + j);
                }
            }
        }
        out[n..].fill(0);
    }

    /// Raw element write. The value must fit the current width and the
    /// node must be writable.
    fn put(&self, alloc: &mut SlabAllocator, i: usize, v: i64) {
        debug_assert!(Width::for_value(v) <= self.width);
        put_into(self.payload_mut(alloc), self.width, i, v)
    }

    /// Copy the node into the slab if its ref is committed. Returns true
    /// when the ref changed.
    pub fn ensure_writable(&mut self, alloc: &mut SlabAllocator) -> Result<bool> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(false);
        }
        let total = self.total_byte_len();
        self.ref_ = alloc.realloc(self.ref_, total, total)?;
        Ok(true)
    }

    /// Make room for `count` elements at the current width, growing by
    /// half like the original allocator to avoid realloc thrash. Also
    /// covers the copy-on-write case.
    fn ensure_capacity(&mut self, alloc: &mut SlabAllocator, count: usize) -> Result<()> {
        if count > MAX_ELEMS {
            return Err(Error::NodeFull);
        }
        let needed = self.width.byte_len(count);
        if needed > MAX_PAYLOAD {
            return Err(Error::NodeFull);
        }
        if needed <= self.capacity && !alloc.is_read_only(self.ref_) {
            return Ok(());
        }
        let mut capacity = self.capacity.max(16);
        while capacity < needed {
            capacity += capacity / 2;
        }
        let capacity = round_up(capacity.min(MAX_PAYLOAD));
        self.ref_ = alloc.realloc(
            self.ref_,
            HEADER_LEN + self.capacity,
            HEADER_LEN + capacity,
        )?;
        self.capacity = capacity;
        self.store_header(alloc);
        Ok(())
    }

    /// Re-encode every element at `new_width`, optionally leaving an
    /// unwritten gap at `gap` for a pending insert. Allocates a new node,
    /// so this also resolves copy-on-write.
    fn rewrite(
        &mut self,
        alloc: &mut SlabAllocator,
        new_width: Width,
        gap: Option<usize>,
    ) -> Result<()> {
        let new_count = self.size + gap.is_some() as usize;
        if new_count > MAX_ELEMS {
            return Err(Error::NodeFull);
        }
        let needed = new_width.byte_len(new_count);
        if needed > MAX_PAYLOAD {
            return Err(Error::NodeFull);
        }
        let capacity = round_up(needed);
        let new_ref = alloc.alloc(HEADER_LEN + capacity)?;
        unsafe {
            let src = alloc.translate(self.ref_).add(HEADER_LEN);
            let dst = alloc.translate_mut(new_ref).add(HEADER_LEN);
            for j in 0..self.size {
                let v = read_elem(src, self.width, j);
                let out = j + gap.map_or(0, |g| (j >= g) as usize);
                write_elem(dst, new_width, out, v);
            }
        }
        alloc.free(self.ref_, self.total_byte_len());
        self.ref_ = new_ref;
        self.width = new_width;
        self.capacity = capacity;
        self.store_header(alloc);
        Ok(())
    }

    pub fn set(&mut self, alloc: &mut SlabAllocator, i: usize, v: i64) -> Result<()> {
        debug_assert!(i < self.size);
        if Width::for_value(v) > self.width {
            self.rewrite(alloc, Width::for_value(v), None)?;
        } else {
            self.ensure_writable(alloc)?;
        }
        self.put(alloc, i, v);
        Ok(())
    }

    pub fn set_ref(&mut self, alloc: &mut SlabAllocator, i: usize, ref_: Ref) -> Result<()> {
        self.set(alloc, i, ref_ as i64)
    }

    pub fn insert(&mut self, alloc: &mut SlabAllocator, i: usize, v: i64) -> Result<()> {
        debug_assert!(i <= self.size);
        let need = Width::for_value(v);
        if need > self.width {
            self.rewrite(alloc, need, Some(i))?;
        } else {
            self.ensure_capacity(alloc, self.size + 1)?;
            match self.width.bits() {
                0 => {}
                bits @ (8 | 16 | 32 | 64) => {
                    let esz = bits / 8;
                    let data = self.payload_mut(alloc);
                    data.copy_within(i * esz..self.size * esz, (i + 1) * esz);
                }
                _ => {
                    for j in (i..self.size).rev() {
                        let moved = self.get(alloc, j);
                        self.put(alloc, j + 1, moved);
                    }
                }
            }
        }
        self.size += 1;
        self.put(alloc, i, v);
        self.store_header(alloc);
        Ok(())
    }

    pub fn push(&mut self, alloc: &mut SlabAllocator, v: i64) -> Result<()> {
        self.insert(alloc, self.size, v)
    }

    pub fn erase(&mut self, alloc: &mut SlabAllocator, i: usize) -> Result<()> {
        self.erase_range(alloc, i, i + 1)
    }

    pub fn erase_range(&mut self, alloc: &mut SlabAllocator, begin: usize, end: usize) -> Result<()> {
        debug_assert!(begin <= end && end <= self.size);
        if begin == end {
            return Ok(());
        }
        self.ensure_writable(alloc)?;
        let gap = end - begin;
        match self.width.bits() {
            0 => {}
            bits @ (8 | 16 | 32 | 64) => {
                let esz = bits / 8;
                let data = self.payload_mut(alloc);
                data.copy_within(end * esz..self.size * esz, begin * esz);
            }
            _ => {
                for j in end..self.size {
                    let moved = self.get(alloc, j);
                    self.put(alloc, j - gap, moved);
                }
            }
        }
        self.size -= gap;
        self.store_header(alloc);
        Ok(())
    }

    /// Drop the tail down to `n` elements, deep-destroying any refs in it.
    pub fn truncate(&mut self, alloc: &mut SlabAllocator, n: usize) -> Result<()> {
        debug_assert!(n <= self.size);
        if self.has_refs {
            for j in n..self.size {
                let slot = RefOrTagged::from_raw(self.get(alloc, j));
                if let Some(child) = slot.as_ref_value() {
                    Array::from_ref(alloc, child)?.destroy_deep(alloc)?;
                }
            }
        }
        self.truncate_shallow(alloc, n)
    }

    /// Drop the tail without following any refs it holds.
    pub fn truncate_shallow(&mut self, alloc: &mut SlabAllocator, n: usize) -> Result<()> {
        debug_assert!(n <= self.size);
        if n == self.size {
            return Ok(());
        }
        self.ensure_writable(alloc)?;
        self.size = n;
        self.store_header(alloc);
        Ok(())
    }

    /// Free this node only.
    pub fn destroy(self, alloc: &mut SlabAllocator) {
        alloc.free(self.ref_, self.total_byte_len());
    }

    /// Free this node and, when it holds refs, everything reachable from
    /// it. Tagged slots are skipped.
    pub fn destroy_deep(self, alloc: &mut SlabAllocator) -> Result<()> {
        if self.has_refs {
            for j in 0..self.size {
                let slot = RefOrTagged::from_raw(self.get(alloc, j));
                if let Some(child) = slot.as_ref_value() {
                    Array::from_ref(alloc, child)?.destroy_deep(alloc)?;
                }
            }
        }
        alloc.free(self.ref_, self.total_byte_len());
        Ok(())
    }

    /// Add `delta` to every element at or past `from`. Used by inner
    /// nodes to maintain their running offsets.
    pub fn adjust(&mut self, alloc: &mut SlabAllocator, from: usize, delta: i64) -> Result<()> {
        for i in from..self.size {
            let v = self.get(alloc, i);
            self.set(alloc, i, v + delta)?;
        }
        Ok(())
    }

    /// First index in `[from, to)` whose element satisfies `cmp` against
    /// `value`. Equality and inequality run 64 bits at a time.
    pub fn find_first(
        &self,
        alloc: &SlabAllocator,
        cmp: Cmp,
        value: i64,
        from: usize,
        to: usize,
    ) -> Option<usize> {
        let to = to.min(self.size);
        if from >= to {
            return None;
        }
        match self.width {
            Width::W0 => {
                if cmp.matches(0, value) {
                    Some(from)
                } else {
                    None
                }
            }
            Width::W64 => self.scan(alloc, from, to, |v| cmp.matches(v, value)),
            _ => match cmp {
                Cmp::Eq => self.parallel_eq(alloc, value, from, to),
                Cmp::Ne => self.parallel_ne(alloc, value, from, to),
                _ => self.scan(alloc, from, to, |v| cmp.matches(v, value)),
            },
        }
    }

    /// Append every matching index in `[from, to)` to `out`.
    pub fn find_all(
        &self,
        alloc: &SlabAllocator,
        cmp: Cmp,
        value: i64,
        from: usize,
        to: usize,
        out: &mut Vec<usize>,
    ) {
        let to = to.min(self.size);
        let mut at = from;
        while at < to {
            match self.find_first(alloc, cmp, value, at, to) {
                Some(i) => {
                    out.push(i);
                    at = i + 1;
                }
                None => break,
            }
        }
    }

    pub fn sum(&self, alloc: &SlabAllocator, from: usize, to: usize) -> i64 {
        let to = to.min(self.size);
        if from >= to {
            return 0;
        }
        match self.width {
            Width::W0 => 0,
            Width::W1 => {
                // Values are 0 or 1, so the sum is a population count.
                let data = self.payload(alloc);
                let mut i = from;
                let mut acc = 0i64;
                while i < to && i % 64 != 0 {
                    acc += self.get(alloc, i);
                    i += 1;
                }
                while i + 64 <= to {
                    let byte = i / 8;
                    let chunk = u64::from_le_bytes(data[byte..byte + 8].try_into().unwrap());
                    acc += chunk.count_ones() as i64;
                    i += 64;
                }
                while i < to {
                    acc += self.get(alloc, i);
                    i += 1;
                }
                acc
            }
            _ => {
                let mut acc = 0i64;
                self.scan(alloc, from, to, |v| {
                    acc = acc.wrapping_add(v);
                    false
                });
                acc
            }
        }
    }

    /// First index whose element is not less than `value`. The node must
    /// be sorted ascending.
    pub fn lower_bound(&self, alloc: &SlabAllocator, value: i64) -> usize {
        let mut lo = 0;
        let mut rest = self.size;
        while rest > 0 {
            let half = rest / 2;
            let mid = lo + half;
            if self.get(alloc, mid) < value {
                lo = mid + 1;
                rest -= half + 1;
            } else {
                rest = half;
            }
        }
        lo
    }

    /// First index whose element is greater than `value`. The node must be
    /// sorted ascending.
    pub fn upper_bound(&self, alloc: &SlabAllocator, value: i64) -> usize {
        let mut lo = 0;
        let mut rest = self.size;
        while rest > 0 {
            let half = rest / 2;
            let mid = lo + half;
            if self.get(alloc, mid) <= value {
                lo = mid + 1;
                rest -= half + 1;
            } else {
                rest = half;
            }
        }
        lo
    }

    /// Append the index of every 64-bit lane within Hamming distance
    /// `max_dist` of `value`. Defined only for width 64.
    pub fn find_hamming(
        &self,
        alloc: &SlabAllocator,
        value: u64,
        max_dist: u32,
        from: usize,
        to: usize,
        out: &mut Vec<usize>,
    ) {
        debug_assert!(self.width == Width::W64);
        if self.width != Width::W64 {
            return;
        }
        let to = to.min(self.size);
        let mut i = from;
        self.scan(alloc, from, to, |v| {
            if ((v as u64) ^ value).count_ones() < max_dist {
                out.push(i);
            }
            i += 1;
            false
        });
    }

    /// Serialized image of this node: header plus used payload, with the
    /// capacity field trimmed to the bytes actually written.
    pub(crate) fn serialized_bytes(&self, alloc: &SlabAllocator) -> Vec<u8> {
        let used = self.used_byte_len();
        let mut buf = vec![0u8; used];
        unsafe {
            std::ptr::copy_nonoverlapping(alloc.translate(self.ref_), buf.as_mut_ptr(), used);
        }
        put_be24(&mut buf[4..7], used - HEADER_LEN);
        buf
    }

    /// Width-dispatched element scan: decode once per range, not once per
    /// element. `f` returns true to stop; the index of the stopping
    /// element is returned.
    fn scan<F: FnMut(i64) -> bool>(
        &self,
        alloc: &SlabAllocator,
        from: usize,
        to: usize,
        mut f: F,
    ) -> Option<usize> {
        let data = self.payload(alloc);
        match self.width {
            Width::W0 => (from..to).find(|_| f(0)),
            Width::W1 => (from..to).find(|&i| f(((data[i >> 3] >> (i & 7)) & 1) as i64)),
            Width::W2 => (from..to).find(|&i| f(((data[i >> 2] >> ((i & 3) << 1)) & 3) as i64)),
            Width::W4 => (from..to).find(|&i| f(((data[i >> 1] >> ((i & 1) << 2)) & 0xF) as i64)),
            Width::W8 => (from..to).find(|&i| f(data[i] as i8 as i64)),
            Width::W16 => (from..to).find(|&i| {
                f(i16::from_le_bytes(data[i * 2..i * 2 + 2].try_into().unwrap()) as i64)
            }),
            Width::W32 => (from..to).find(|&i| {
                f(i32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap()) as i64)
            }),
            Width::W64 => (from..to)
                .find(|&i| f(i64::from_le_bytes(data[i * 8..i * 8 + 8].try_into().unwrap()))),
        }
    }

    /// Equality search, 64 bits at a time: broadcast the value across the
    /// chunk, XOR to zero out matching lanes, and detect a zero lane with
    /// `(x - L) & !x & H`. Lane borrow can produce false positives, so a
    /// hit re-checks its chunk element by element.
    fn parallel_eq(
        &self,
        alloc: &SlabAllocator,
        value: i64,
        from: usize,
        to: usize,
    ) -> Option<usize> {
        if Width::for_value(value) > self.width {
            return None;
        }
        let bits = self.width.bits();
        let lanes = self.width.per_chunk();
        let mask = lane_mask(bits);
        let lmul = !0u64 / mask;
        let hbit = (1u64 << (bits - 1)).wrapping_mul(lmul);
        let pattern = ((value as u64) & mask).wrapping_mul(lmul);
        let data = self.payload(alloc);

        let mut i = from;
        while i < to && i % lanes != 0 {
            if self.get(alloc, i) == value {
                return Some(i);
            }
            i += 1;
        }
        while i + lanes <= to {
            let byte = i / lanes * 8;
            let chunk = u64::from_le_bytes(data[byte..byte + 8].try_into().unwrap());
            let x = chunk ^ pattern;
            if x.wrapping_sub(lmul) & !x & hbit != 0 {
                for j in i..i + lanes {
                    if self.get(alloc, j) == value {
                        return Some(j);
                    }
                }
            }
            i += lanes;
        }
        while i < to {
            if self.get(alloc, i) == value {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Inequality search: skip chunks that are entirely the broadcast
    /// pattern, scan the first chunk that is not.
    fn parallel_ne(
        &self,
        alloc: &SlabAllocator,
        value: i64,
        from: usize,
        to: usize,
    ) -> Option<usize> {
        if Width::for_value(value) > self.width {
            return Some(from);
        }
        let bits = self.width.bits();
        let lanes = self.width.per_chunk();
        let mask = lane_mask(bits);
        let pattern = ((value as u64) & mask).wrapping_mul(!0u64 / mask);
        let data = self.payload(alloc);

        let mut i = from;
        while i < to && i % lanes != 0 {
            if self.get(alloc, i) != value {
                return Some(i);
            }
            i += 1;
        }
        while i + lanes <= to {
            let byte = i / lanes * 8;
            let chunk = u64::from_le_bytes(data[byte..byte + 8].try_into().unwrap());
            if chunk != pattern {
                for j in i..i + lanes {
                    if self.get(alloc, j) != value {
                        return Some(j);
                    }
                }
            }
            i += lanes;
        }
        while i < to {
            if self.get(alloc, i) != value {
                return Some(i);
            }
            i += 1;
        }
        None
    }
}

fn lane_mask(bits: usize) -> u64 {
    if bits >= 64 {
        !0
    } else {
        (1u64 << bits) - 1
    }
}

fn get_from(data: &[u8], width: Width, i: usize) -> i64 {
    match width {
        Width::W0 => 0,
        Width::W1 => ((data[i >> 3] >> (i & 7)) & 1) as i64,
        Width::W2 => ((data[i >> 2] >> ((i & 3) << 1)) & 3) as i64,
        Width::W4 => ((data[i >> 1] >> ((i & 1) << 2)) & 0xF) as i64,
        Width::W8 => data[i] as i8 as i64,
        Width::W16 => i16::from_le_bytes(data[i * 2..i * 2 + 2].try_into().unwrap()) as i64,
        Width::W32 => i32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap()) as i64,
        Width::W64 => i64::from_le_bytes(data[i * 8..i * 8 + 8].try_into().unwrap()),
    }
}

fn put_into(data: &mut [u8], width: Width, i: usize, v: i64) {
    match width {
        Width::W0 => debug_assert!(v == 0),
        Width::W1 => {
            let bit = 1u8 << (i & 7);
            if v != 0 {
                data[i >> 3] |= bit;
            } else {
                data[i >> 3] &= !bit;
            }
        }
        Width::W2 => {
            let shift = (i & 3) << 1;
            let byte = &mut data[i >> 2];
            *byte = (*byte & !(3 << shift)) | (((v as u8) & 3) << shift);
        }
        Width::W4 => {
            let shift = (i & 1) << 2;
            let byte = &mut data[i >> 1];
            *byte = (*byte & !(0xF << shift)) | (((v as u8) & 0xF) << shift);
        }
        Width::W8 => data[i] = v as u8,
        Width::W16 => data[i * 2..i * 2 + 2].copy_from_slice(&(v as i16).to_le_bytes()),
        Width::W32 => data[i * 4..i * 4 + 4].copy_from_slice(&(v as i32).to_le_bytes()),
        Width::W64 => data[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes()),
    }
}

/// Raw-pointer variants for re-encoding between two live regions.
unsafe fn read_elem(data: *const u8, width: Width, i: usize) -> i64 {
    let len = width.byte_len(i + 1);
    let slice = std::slice::from_raw_parts(data, len);
    get_from(slice, width, i)
}

unsafe fn write_elem(data: *mut u8, width: Width, i: usize, v: i64) {
    let len = width.byte_len(i + 1);
    let slice = std::slice::from_raw_parts_mut(data, len);
    put_into(slice, width, i, v)
}

/// Encode a fresh node image from values. `min_width` pins the encoding
/// width from below; the commit writer uses this to keep free-list array
/// sizes predictable while reserving space for them.
pub(crate) fn encode_node(
    values: &[i64],
    is_inner: bool,
    has_refs: bool,
    context_flag: bool,
    min_width: Width,
) -> Vec<u8> {
    let width = values
        .iter()
        .fold(min_width, |w, &v| w.max(Width::for_value(v)));
    let payload = round_up(width.byte_len(values.len()));
    let mut buf = vec![0u8; HEADER_LEN + payload];
    buf[0] = ((is_inner as u8) << 7)
        | ((has_refs as u8) << 6)
        | ((context_flag as u8) << 5)
        | width.code();
    put_be24(&mut buf[1..4], values.len());
    put_be24(&mut buf[4..7], payload);
    for (i, &v) in values.iter().enumerate() {
        put_into(&mut buf[HEADER_LEN..], width, i, v);
    }
    buf
}

fn be24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

fn put_be24(bytes: &mut [u8], v: usize) {
    debug_assert!(v <= 0xFF_FFFF);
    bytes[0] = (v >> 16) as u8;
    bytes[1] = (v >> 8) as u8;
    bytes[2] = v as u8;
}

fn round_up(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FORMAT_VERSION, MAGIC};

    fn leaf(alloc: &mut SlabAllocator) -> Array {
        Array::create(alloc, NodeKind::Leaf, false).unwrap()
    }

    #[test]
    fn width_promotes_on_insert() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in [1, 2, 3] {
            node.push(&mut alloc, v).unwrap();
        }
        assert_eq!(node.width(), Width::W2);
        assert_eq!(node.size(), 3);
        assert_eq!(
            (0..3).map(|i| node.get(&alloc, i)).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        node.push(&mut alloc, 200).unwrap();
        assert_eq!(node.width(), Width::W8);
        assert_eq!(node.size(), 4);
        assert_eq!(
            (0..4).map(|i| node.get(&alloc, i)).collect::<Vec<_>>(),
            vec![1, 2, 3, 200]
        );
    }

    #[test]
    fn negative_values_force_byte_widths() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        node.push(&mut alloc, 1).unwrap();
        node.push(&mut alloc, -1).unwrap();
        assert_eq!(node.width(), Width::W8);
        assert_eq!(node.get(&alloc, 0), 1);
        assert_eq!(node.get(&alloc, 1), -1);
    }

    #[test]
    fn values_round_trip_at_every_width() {
        let samples: &[&[i64]] = &[
            &[0, 0, 0],
            &[1, 0, 1, 1],
            &[3, 1, 2, 0],
            &[15, 7, 0, 9],
            &[-128, 127, -1, 42],
            &[-32768, 32767, 1000, -1],
            &[i32::MIN as i64, i32::MAX as i64, 7],
            &[i64::MIN, i64::MAX, 1 << 40],
        ];
        for values in samples {
            let mut alloc = SlabAllocator::new_empty();
            let mut node = leaf(&mut alloc);
            for &v in *values {
                node.push(&mut alloc, v).unwrap();
            }
            for (i, &v) in values.iter().enumerate() {
                assert_eq!(node.get(&alloc, i), v, "width {:?}", node.width());
            }
        }
    }

    #[test]
    fn set_overwrites_and_promotes() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in 0..16 {
            node.push(&mut alloc, v).unwrap();
        }
        assert_eq!(node.width(), Width::W4);
        node.set(&mut alloc, 3, 100_000).unwrap();
        assert_eq!(node.width(), Width::W32);
        assert_eq!(node.get(&alloc, 3), 100_000);
        assert_eq!(node.get(&alloc, 2), 2);
        assert_eq!(node.get(&alloc, 15), 15);
    }

    #[test]
    fn insert_in_the_middle_shifts_up() {
        for probe in [3i64, 200, 70_000, 1 << 40] {
            let mut alloc = SlabAllocator::new_empty();
            let mut node = leaf(&mut alloc);
            for v in 0..3 {
                node.push(&mut alloc, v).unwrap();
            }
            node.insert(&mut alloc, 1, probe).unwrap();
            let got: Vec<i64> = (0..4).map(|i| node.get(&alloc, i)).collect();
            assert_eq!(got, vec![0, probe, 1, 2]);
        }
    }

    #[test]
    fn erase_shifts_down() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in 0..10 {
            node.push(&mut alloc, v).unwrap();
        }
        node.erase(&mut alloc, 0).unwrap();
        node.erase(&mut alloc, 3).unwrap();
        let got: Vec<i64> = (0..node.size()).map(|i| node.get(&alloc, i)).collect();
        assert_eq!(got, vec![1, 2, 3, 5, 6, 7, 8, 9]);
        node.erase_range(&mut alloc, 1, 4).unwrap();
        let got: Vec<i64> = (0..node.size()).map(|i| node.get(&alloc, i)).collect();
        assert_eq!(got, vec![1, 6, 7, 8, 9]);
        assert_eq!(node.width(), Width::W4, "erase must not narrow");
    }

    #[test]
    fn parallel_find_at_width_8() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in [10, 20, 30, 40, 50, 60, 70, 80] {
            node.push(&mut alloc, v).unwrap();
        }
        assert_eq!(node.width(), Width::W8);
        assert_eq!(node.find_first(&alloc, Cmp::Eq, 50, 0, 8), Some(4));
        assert_eq!(node.find_first(&alloc, Cmp::Eq, 99, 0, 8), None);
        assert_eq!(node.find_first(&alloc, Cmp::Gt, 65, 0, 8), Some(6));
        assert_eq!(node.find_first(&alloc, Cmp::Lt, 10, 0, 8), None);
        assert_eq!(node.find_first(&alloc, Cmp::Le, 10, 0, 8), Some(0));
        assert_eq!(node.find_first(&alloc, Cmp::Ne, 10, 0, 8), Some(1));
        assert_eq!(node.find_first(&alloc, Cmp::Eq, 50, 5, 8), None);
    }

    #[test]
    fn find_covers_every_width() {
        let cases: &[(&[i64], i64)] = &[
            (&[1, 1, 0, 1, 0, 1, 1, 1, 1, 0], 0),
            (&[1, 2, 3, 0, 2, 2, 1, 3, 3], 0),
            (&[5, 9, 14, 3, 3, 7, 1, 0, 12], 3),
            (&[-5, 90, 14, -3, 33, 7, 1, 0, 12], -3),
            (&[1000, -2000, 500, 30_000, -1], 500),
            (&[1 << 20, -(1 << 22), 9, 1 << 30], 9),
            (&[1 << 40, -(1 << 50), 17, i64::MAX], 17),
        ];
        for (values, needle) in cases {
            let mut alloc = SlabAllocator::new_empty();
            let mut node = leaf(&mut alloc);
            for &v in *values {
                node.push(&mut alloc, v).unwrap();
            }
            let expect = values.iter().position(|v| v == needle);
            assert_eq!(
                node.find_first(&alloc, Cmp::Eq, *needle, 0, values.len()),
                expect,
                "width {:?}",
                node.width()
            );
            let expect_ne = values.iter().position(|v| v != needle);
            assert_eq!(
                node.find_first(&alloc, Cmp::Ne, *needle, 0, values.len()),
                expect_ne
            );
        }
    }

    #[test]
    fn find_skips_values_wider_than_the_node() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in [1, 0, 1] {
            node.push(&mut alloc, v).unwrap();
        }
        assert_eq!(node.width(), Width::W1);
        assert_eq!(node.find_first(&alloc, Cmp::Eq, 1000, 0, 3), None);
        assert_eq!(node.find_first(&alloc, Cmp::Ne, 1000, 0, 3), Some(0));
    }

    #[test]
    fn find_all_collects_matches() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in [7, 1, 7, 7, 2, 7] {
            node.push(&mut alloc, v).unwrap();
        }
        let mut out = Vec::new();
        node.find_all(&alloc, Cmp::Eq, 7, 0, node.size(), &mut out);
        assert_eq!(out, vec![0, 2, 3, 5]);
    }

    #[test]
    fn sums_are_width_exact() {
        let mut alloc = SlabAllocator::new_empty();
        let mut ones = leaf(&mut alloc);
        for i in 0..200 {
            ones.push(&mut alloc, (i % 2 == 0) as i64).unwrap();
        }
        assert_eq!(ones.width(), Width::W1);
        assert_eq!(ones.sum(&alloc, 0, 200), 100);
        assert_eq!(ones.sum(&alloc, 1, 2), 0);
        assert_eq!(ones.sum(&alloc, 0, 63), 32);

        let mut wide = leaf(&mut alloc);
        for v in [-5i64, 1 << 33, 7, -(1 << 20)] {
            wide.push(&mut alloc, v).unwrap();
        }
        assert_eq!(wide.sum(&alloc, 0, 4), -5 + (1i64 << 33) + 7 - (1 << 20));
    }

    #[test]
    fn bounds_on_sorted_nodes() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in [1, 3, 3, 7, 9] {
            node.push(&mut alloc, v).unwrap();
        }
        assert_eq!(node.lower_bound(&alloc, 3), 1);
        assert_eq!(node.upper_bound(&alloc, 3), 3);
        assert_eq!(node.lower_bound(&alloc, 0), 0);
        assert_eq!(node.lower_bound(&alloc, 10), 5);
        assert_eq!(node.upper_bound(&alloc, 9), 5);
    }

    #[test]
    fn hamming_search_counts_differing_bits() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        node.push(&mut alloc, 0b1111i64).unwrap();
        node.push(&mut alloc, 0b1011i64).unwrap();
        node.push(&mut alloc, -1i64).unwrap();
        assert_eq!(node.width(), Width::W64);
        let mut out = Vec::new();
        node.find_hamming(&alloc, 0b1111, 2, 0, 3, &mut out);
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn chunked_get_pads_with_zeros() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = leaf(&mut alloc);
        for v in 0..5 {
            node.push(&mut alloc, v * 1000).unwrap();
        }
        let mut out = [0i64; 8];
        node.get_chunk(&alloc, 2, &mut out);
        assert_eq!(out, [2000, 3000, 4000, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn tagged_slots_round_trip() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = Array::create(&mut alloc, NodeKind::HasRefs, false).unwrap();
        node.push(&mut alloc, RefOrTagged::make_ref(64).raw()).unwrap();
        node.push(&mut alloc, RefOrTagged::make_tagged(7).raw()).unwrap();
        node.push(&mut alloc, RefOrTagged::make_ref(128).raw()).unwrap();

        assert_eq!(node.get(&alloc, 0), 64);
        assert_eq!(node.get(&alloc, 1), 15);
        assert_eq!(node.get(&alloc, 2), 128);

        let decoded: Vec<(bool, u64)> = (0..3)
            .map(|i| {
                let slot = RefOrTagged::from_raw(node.get(&alloc, i));
                match (slot.as_ref_value(), slot.as_tagged()) {
                    (Some(r), None) => (true, r),
                    (None, Some(v)) => (false, v),
                    _ => unreachable!(),
                }
            })
            .collect();
        assert_eq!(decoded, vec![(true, 64), (false, 7), (true, 128)]);
    }

    #[test]
    fn header_survives_reload() {
        let mut alloc = SlabAllocator::new_empty();
        let mut node = Array::create(&mut alloc, NodeKind::Inner, true).unwrap();
        for v in [8i64, 16, 24] {
            node.push(&mut alloc, v).unwrap();
        }
        let reloaded = Array::from_ref(&alloc, node.ref_()).unwrap();
        assert!(reloaded.is_inner());
        assert!(reloaded.has_refs());
        assert!(reloaded.context_flag());
        assert_eq!(reloaded.size(), 3);
        assert_eq!(reloaded.width(), node.width());
        assert_eq!(reloaded.get(&alloc, 2), 24);
    }

    #[test]
    fn committed_nodes_copy_on_write() {
        // A minimal file image: header, then one width-8 leaf of [1, 2, 3]
        // at ref 24.
        let mut image = vec![0u8; 40];
        image[16..20].copy_from_slice(&MAGIC);
        image[20] = FORMAT_VERSION;
        image[24] = Width::W8.code();
        image[25..28].copy_from_slice(&[0, 0, 3]);
        image[28..31].copy_from_slice(&[0, 0, 8]);
        image[32] = 1;
        image[33] = 2;
        image[34] = 3;

        let mut alloc = SlabAllocator::attach_buffer(image).unwrap();
        let mut node = Array::from_ref(&alloc, 24).unwrap();
        assert!(alloc.is_read_only(node.ref_()));
        assert_eq!(node.get(&alloc, 1), 2);

        node.set(&mut alloc, 1, 9).unwrap();
        assert_ne!(node.ref_(), 24, "write must relocate a committed node");
        assert_eq!(node.get(&alloc, 1), 9);

        // The committed bytes are untouched and the old ref is in the
        // transaction's freed set.
        let old = Array::from_ref(&alloc, 24).unwrap();
        assert_eq!(old.get(&alloc, 1), 2);
        let freed = alloc.take_freed();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].ref_, 24);
    }

    #[test]
    fn destroy_deep_follows_refs_only() {
        // File image with a width-8 leaf [42] at ref 24 and a has-refs
        // parent at ref 40 holding {ref 24, tagged 5}.
        let mut image = vec![0u8; 56];
        image[16..20].copy_from_slice(&MAGIC);
        image[20] = FORMAT_VERSION;
        image[24] = Width::W8.code();
        image[25..28].copy_from_slice(&[0, 0, 1]);
        image[28..31].copy_from_slice(&[0, 0, 8]);
        image[32] = 42;
        image[40] = 0b0100_0000 | Width::W8.code();
        image[41..44].copy_from_slice(&[0, 0, 2]);
        image[44..47].copy_from_slice(&[0, 0, 8]);
        image[48] = 24;
        image[49] = RefOrTagged::make_tagged(5).raw() as u8;

        let mut alloc = SlabAllocator::attach_buffer(image).unwrap();
        let parent = Array::from_ref(&alloc, 40).unwrap();
        parent.destroy_deep(&mut alloc).unwrap();

        let freed = alloc.take_freed();
        assert_eq!(
            freed.iter().map(|c| (c.ref_, c.size)).collect::<Vec<_>>(),
            vec![(24, 16), (40, 16)],
            "the child ref is followed, the tagged slot is skipped"
        );
    }
}
