//! wdiff: the sorted, non-overlapping diff file format.
//!
//! A wdiff file is `[file header][pack]*[end-marker pack]`. Each pack is a
//! fixed-size header block listing up to 170 records, followed by the
//! concatenated record payloads. Records address logical blocks on the
//! restored device; all-zero and discard records carry no payload.

pub mod file;
pub mod io;
pub mod mem;
pub mod record;

pub use file::{DiffFileHeader, DiffReader, DiffWriter};
pub use io::DiffIo;
pub use mem::{DiffMemory, DiffRecIo};
pub use record::DiffRecord;
