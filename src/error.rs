//! Error taxonomy shared by the walb toolchain.
//!
//! All errors are fatal at the subsystem boundary; there is no internal
//! retry. End-of-stream on read is normal termination and is reported
//! through `Option`/`bool` return values, never through this type.

use std::io;

/// Errors surfaced by the walb core.
#[derive(Debug, thiserror::Error)]
pub enum WalbError {
    /// Structural mismatch: magic, version, sector type, or field layout.
    #[error("bad format: {0}")]
    BadFormat(String),
    /// Header or record checksum mismatch.
    #[error("bad checksum: {0}")]
    BadChecksum(String),
    /// A concatenated wlog does not continue the previous LSID range.
    #[error("lsid mismatch: expected {expected}, got {actual}")]
    LsidMismatch {
        /// End LSID of the previous wlog.
        expected: u64,
        /// Begin LSID of the offending wlog.
        actual: u64,
    },
    /// Device UUID differs between inputs that must agree.
    #[error("uuid mismatch")]
    UuidMismatch,
    /// Target device block size incompatible with the log block size.
    #[error("incompatible block size: log pbs {log_pbs}, device pbs {dev_pbs}")]
    Incompatible {
        /// Physical block size recorded in the wlog header.
        log_pbs: u32,
        /// Physical block size of the target device.
        dev_pbs: u32,
    },
    /// Underlying read/write/ioctl failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Contradictory options or invalid operation parameters.
    #[error("argument error: {0}")]
    Arg(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WalbError>;
