//! Error taxonomy shared by the allocator, node, column and commit layers.
//!
//! Allocation and IO failures propagate out of any operation that touched
//! them; logic errors (bounds, detached accessors) surface at the nearest
//! API boundary. Nothing is swallowed.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// An underlying file or mapping operation failed.
    Io(std::io::Error),
    /// The allocator could not extend the slab or the file.
    OutOfMemory,
    /// A node reached the 24-bit size/capacity limit of the header format.
    NodeFull,
    /// The file magic, format version or header failed validation at attach.
    InvalidFile { reason: &'static str },
    /// A node header or tree invariant does not hold.
    Corruption { detail: &'static str },
    /// A write was attempted against a read-only attachment.
    ReadOnlyViolation,
    /// Index past the end of a column or node.
    IndexOutOfBounds { index: usize, size: usize },
    /// An index insert would duplicate a key that must be unique.
    UniqueConstraint { key: u64 },
    /// The accessor outlived the transaction it was opened under.
    DetachedAccessor,
    /// A previous partial mutation failed; the column refuses further work
    /// until the enclosing transaction is rolled back.
    Poisoned,
}

impl Error {
    /// Exit code mapping for embedders that surface errors from a process:
    /// 2 for format mismatches, 3 for IO, 4 for out-of-space, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidFile { .. } => 2,
            Error::Io(_) => 3,
            Error::OutOfMemory | Error::NodeFull => 4,
            _ => 1,
        }
    }

    /// True for failures that leave a partially applied mutation behind and
    /// therefore poison the column they occurred in.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::OutOfMemory | Error::NodeFull | Error::Corruption { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::NodeFull => write!(f, "node exceeds the 16 MiB payload limit"),
            Error::InvalidFile { reason } => write!(f, "invalid file: {reason}"),
            Error::Corruption { detail } => write!(f, "corrupted data: {detail}"),
            Error::ReadOnlyViolation => write!(f, "write against a read-only attachment"),
            Error::IndexOutOfBounds { index, size } => {
                write!(f, "index {index} out of bounds for size {size}")
            }
            Error::UniqueConstraint { key } => {
                write!(f, "duplicate key {key} in unique index")
            }
            Error::DetachedAccessor => write!(f, "accessor detached by a commit or rollback"),
            Error::Poisoned => write!(f, "column poisoned by an earlier failed mutation"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
