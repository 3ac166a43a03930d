#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod column;
pub mod error;
pub mod index;
pub mod node;
pub mod store;
pub mod writer;

pub use alloc::{Ref, SlabAllocator};
pub use column::{Column, SequentialGetter, DEFAULT_LEAF_CAP};
pub use error::{Error, Result};
pub use index::{KeySource, PrefixIndex};
pub use node::{Array, Cmp, NodeKind, RefOrTagged, Width};
pub use store::{Mode, Store, Transaction};
pub use writer::NodeWriter;
