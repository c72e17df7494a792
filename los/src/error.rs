//! Error types of the large object spaces.
//!
//! Only recoverable conditions are represented here. Heap consistency
//! violations (freeing an untracked pointer, broken free block bookkeeping)
//! are fatal and panic after dumping the space.

use std::io;

use thiserror::Error;

/// Failure of the mapping primitive.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot map zero bytes for {name}")]
    ZeroSize { name: String },

    #[error("cannot map {size} bytes for {name}: size overflows")]
    TooLarge { name: String, size: usize },

    #[error("mmap of {size} bytes for {name} failed: {source}")]
    Os {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },
}

/// Recoverable allocation failure. The caller decides what to do next
/// (collect and retry, grow, or report out of memory).
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("large object allocation failed: {0}")]
    Map(#[from] MapError),

    #[error(
        "no free block of {required} bytes in {space} for a {requested} byte request (trailing free region is {free_end} bytes)"
    )]
    OutOfSpace {
        space: String,
        requested: usize,
        required: usize,
        free_end: usize,
    },

    #[error("allocation of {requested} bytes overflows")]
    Overflow { requested: usize },
}

/// Failure to create a space.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("invalid space settings: {0}")]
    InvalidSettings(&'static str),

    #[error("failed to allocate large object space mem map: {0}")]
    Map(#[from] MapError),
}
