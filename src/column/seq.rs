//! Streaming access with a single-leaf cache.

use crate::alloc::SlabAllocator;
use crate::column::Column;
use crate::error::{Error, Result};
use crate::node::Array;

/// Sequential reader over a column.
///
/// `get` resolves the tree once per leaf, not once per element: while the
/// requested index stays inside the cached leaf's range the tree is not
/// walked at all. This is the hot path for aggregation. The borrow on the
/// column keeps it immutable for the getter's lifetime; a commit or
/// rollback still detaches the getter like any other accessor.
pub struct SequentialGetter<'c> {
    col: &'c Column,
    leaf: Option<(Array, usize, usize)>,
}

impl<'c> SequentialGetter<'c> {
    pub(crate) fn new(col: &'c Column) -> Self {
        Self { col, leaf: None }
    }

    pub fn get(&mut self, alloc: &SlabAllocator, i: usize) -> Result<i64> {
        self.col.check(alloc)?;
        if i >= self.col.size() {
            return Err(Error::IndexOutOfBounds { index: i, size: self.col.size() });
        }
        if let Some((node, start, end)) = &self.leaf {
            if (*start..*end).contains(&i) {
                return Ok(node.get(alloc, i - start));
            }
        }
        let (node, start) = self.col.leaf_for(alloc, i)?;
        let end = start + node.size();
        let v = node.get(alloc, i - start);
        self.leaf = Some((node, start, end));
        Ok(v)
    }
}
