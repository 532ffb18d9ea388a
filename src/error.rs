use thiserror::Error;

use crate::extents::ForkKind;

/// Errors reported by the volume reader.
///
/// End-of-fork and short reads are not errors; they are ordinary return
/// values of the read paths.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixed-layout structure failed validation while decoding
    /// (signature, version or length mismatch). No partial structure is
    /// ever returned.
    #[error("malformed structure: {0}")]
    MalformedStructure(String),

    /// A B-tree node or record is inconsistent (bad node kind, child
    /// pointer out of range, record bounds violation). Fatal for the
    /// current lookup; the tree handle stays usable.
    #[error("corrupt B-tree: {0}")]
    CorruptBTree(String),

    /// The extent map of a fork cannot be completed: no overflow record
    /// exists for the requested position. Bytes covered by already
    /// resolved extents remain readable.
    #[error("no overflow extent record for {fork} fork of CNID {file_id} at block {start_block}")]
    MissingOverflowExtent {
        fork: ForkKind,
        file_id: u32,
        start_block: u64,
    },

    /// A block number or file ID exceeds the bit width of the volume
    /// variant. Rejected before any I/O is attempted.
    #[error("out of range: {0}")]
    OutOfRange(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
