//! walb - userspace tooling for the WalB block-level write-ahead log
//!
//! WalB records every write to a block device as a stream of *log packs*
//! identified by a monotonically increasing logical sequence number (LSID).
//! This crate implements the userspace side of that design:
//!
//! - **wlog**: the on-disk log-pack stream format ([`log`])
//! - **wdiff**: the sorted, non-overlapping diff file format ([`diff`])
//! - **conversion** of a log stream into a sparse diff ([`convert`])
//! - **N-way streaming merge** of diff chains ([`merge`])
//! - **log redo** onto a target block device with async I/O ([`redo`])
//!
//! # Quick start
//!
//! ```rust,ignore
//! use walb::convert::Converter;
//!
//! let mut conv = Converter::new(0);
//! conv.convert(std::io::stdin().lock(), std::io::stdout().lock())?;
//! ```

pub mod block;
pub mod config;
pub mod convert;
pub mod device;
pub mod diff;
pub mod error;
pub mod log;
pub mod merge;
pub mod redo;
pub mod util;

pub use error::{Result, WalbError};

/// Constants used throughout the library
pub mod constants {
    /// Logical block size in bytes; the unit of addressing and IO sizes.
    pub const LOGICAL_BLOCK_SIZE: usize = 512;

    /// Size of a device UUID in bytes
    pub const UUID_SIZE: usize = 16;

    /// Largest single device IO produced by coalescing (1 MiB)
    pub const MAX_IO_SIZE: usize = 1 << 20;

    /// Default redo buffer size (4 MiB)
    pub const DEFAULT_REDO_BUFFER_SIZE: usize = 4 << 20;

    /// Default merge look-ahead window in logical blocks (1 MiB / 512 B)
    pub const DEFAULT_MERGE_BUFFER_LB: u64 = (1 << 20) / LOGICAL_BLOCK_SIZE as u64;
}
