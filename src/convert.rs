//! wlog to wdiff conversion.
//!
//! Every non-padding log record becomes a diff record: discards map to
//! DISCARD, all-zero payloads map to ALLZERO with no payload, everything
//! else is copied verbatim. Records are folded through the in-memory diff
//! map so later writes override earlier ones across the whole log, then the
//! map is serialized with snappy compression.

use std::io::{Read, Write};

use tracing::{debug, info};

use crate::diff::file::{DiffFileHeader, DiffWriter};
use crate::diff::io::DiffIo;
use crate::diff::mem::DiffMemory;
use crate::diff::record::DiffRecord;
use crate::error::{Result, WalbError};
use crate::log::file::{LogBlocks, LogReader};
use crate::log::record::LogRecord;

/// Convert one log record into a diff record.
///
/// Returns `None` for padding records, which carry no target IO.
pub fn log_to_diff(rec: &LogRecord, blocks: &LogBlocks) -> Result<Option<(DiffRecord, DiffIo)>> {
    if rec.is_padding() {
        return Ok(None);
    }
    let io_blocks = u16::try_from(rec.io_size)
        .map_err(|_| WalbError::BadFormat(format!("io size {} too large for diff", rec.io_size)))?;

    if rec.is_discard() {
        return Ok(Some((
            DiffRecord::new_discard(rec.offset, io_blocks),
            DiffIo::empty(),
        )));
    }
    if blocks.is_all_zero(rec.io_size) {
        return Ok(Some((
            DiffRecord::new_all_zero(rec.offset, io_blocks),
            DiffIo::empty(),
        )));
    }
    let data = blocks.to_contiguous(rec.io_size);
    let io = DiffIo::new(io_blocks, crate::diff::record::DIFF_CMPR_NONE, data);
    let mut diff_rec = DiffRecord::new_normal(rec.offset, io_blocks);
    diff_rec.checksum = io.calc_checksum();
    Ok(Some((diff_rec, io)))
}

/// The wlog to wdiff converter.
pub struct Converter {
    max_io_blocks: u32,
}

impl Converter {
    /// `max_io_blocks > 0` splits output records into chunks of at most
    /// that many logical blocks.
    pub fn new(max_io_blocks: u32) -> Self {
        Self { max_io_blocks }
    }

    /// Read one or more concatenated wlogs from `input` and write one wdiff
    /// to `output`.
    ///
    /// Every wlog after the first must continue the previous LSID range and
    /// carry the same device UUID.
    pub fn convert<R: Read, W: Write>(&self, input: R, output: W) -> Result<()> {
        let mut reader = LogReader::new(input);
        let mut mem = DiffMemory::new(self.max_io_blocks);
        let mut first_header = None;
        let mut written_blocks = 0u64;

        loop {
            // end_lsid() refers to the previous wlog until the next header
            // is read, which resets it.
            let prev_end_lsid = reader.end_lsid();
            let Some(header) = reader.read_header()? else {
                break;
            };
            match &first_header {
                None => first_header = Some(header.clone()),
                Some(first) => {
                    if header.begin_lsid != prev_end_lsid {
                        return Err(WalbError::LsidMismatch {
                            expected: prev_end_lsid,
                            actual: header.begin_lsid,
                        });
                    }
                    if header.uuid != first.uuid {
                        return Err(WalbError::UuidMismatch);
                    }
                }
            }
            while reader.fetch_next()? {
                while let Some((rec, blocks)) = reader.read_log()? {
                    if let Some((diff_rec, io)) = log_to_diff(&rec, &blocks)? {
                        written_blocks += diff_rec.io_blocks as u64;
                        mem.add(diff_rec, io)?;
                    }
                }
            }
            debug!(end_lsid = reader.end_lsid(), "converted one wlog");
        }

        let first = first_header
            .ok_or_else(|| WalbError::BadFormat("input contains no wlog header".into()))?;
        let stats = mem.stats();
        info!(
            written_blocks,
            n_ios = stats.n_ios,
            n_blocks = stats.n_blocks,
            end_lsid = reader.end_lsid(),
            "conversion finished"
        );

        let mut writer = DiffWriter::with_snappy(output);
        writer.write_header(&DiffFileHeader {
            max_io_blocks: self.max_io_blocks.min(u16::MAX as u32) as u16,
            uuid: first.uuid,
        })?;
        mem.write_to(&mut writer)?;
        writer.close()?;
        Ok(())
    }
}
