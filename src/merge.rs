//! N-way streaming merge of wdiff chains.
//!
//! Streams are added chronologically, oldest first. The merger keeps a
//! scratch diff map and a watermark `done_addr`: an entry can be emitted
//! once every open stream has advanced past its end address, so memory
//! stays bounded by the look-ahead window instead of the input size.

use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};

use tracing::debug;

use crate::constants::DEFAULT_MERGE_BUFFER_LB;
use crate::diff::file::{DiffFileHeader, DiffReader, DiffWriter};
use crate::diff::mem::{DiffMemory, DiffRecIo};
use crate::diff::record::DiffRecord;
use crate::error::{Result, WalbError};

/// Per-kind record counters of a diff stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStatistics {
    /// Normal records.
    pub n_normal: u64,
    /// All-zero records.
    pub n_all_zero: u64,
    /// Discard records.
    pub n_discard: u64,
    /// Logical blocks covered by all records.
    pub n_blocks: u64,
}

impl DiffStatistics {
    fn update(&mut self, rec: &DiffRecord) {
        if rec.is_discard() {
            self.n_discard += 1;
        } else if rec.is_all_zero() {
            self.n_all_zero += 1;
        } else {
            self.n_normal += 1;
        }
        self.n_blocks += rec.io_blocks as u64;
    }
}

impl fmt::Display for DiffStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "normal {} allzero {} discard {} blocks {}",
            self.n_normal, self.n_all_zero, self.n_discard, self.n_blocks
        )
    }
}

/// One open input stream with a lazily filled front record.
struct Wdiff<R: Read> {
    reader: DiffReader<R>,
    header: DiffFileHeader,
    front: Option<DiffRecIo>,
    is_end: bool,
}

impl<R: Read> Wdiff<R> {
    fn new(inner: R) -> Result<Self> {
        let mut reader = DiffReader::new(inner);
        let header = reader.read_header()?;
        Ok(Self {
            reader,
            header,
            front: None,
            is_end: false,
        })
    }

    fn fill(&mut self) -> Result<()> {
        if self.front.is_none() && !self.is_end {
            match self.reader.read_and_uncompress()? {
                Some((rec, io)) => self.front = Some(DiffRecIo::new(rec, io)),
                None => self.is_end = true,
            }
        }
        Ok(())
    }

    fn front_rec(&mut self) -> Result<Option<DiffRecord>> {
        self.fill()?;
        Ok(self.front.as_ref().map(|f| f.rec))
    }

    fn pop(&mut self) -> Result<DiffRecIo> {
        self.fill()?;
        self.front
            .take()
            .ok_or_else(|| WalbError::Arg("pop on exhausted wdiff stream".into()))
    }

    /// Address of the front record, or `u64::MAX` at end of stream.
    fn current_address(&mut self) -> Result<u64> {
        self.fill()?;
        Ok(self.front.as_ref().map_or(u64::MAX, |f| f.rec.io_address))
    }

    fn is_end(&mut self) -> Result<bool> {
        self.fill()?;
        Ok(self.is_end)
    }
}

/// The diff merger.
///
/// Usage: configure with [`DiffMerger::set_max_io_blocks`] and
/// [`DiffMerger::set_should_validate_uuid`], add streams oldest first with
/// [`DiffMerger::add_wdiff`], then either call [`DiffMerger::merge_to`] or
/// call [`DiffMerger::prepare`] and drain with
/// [`DiffMerger::get_and_remove`].
pub struct DiffMerger<R: Read> {
    wdiffs: Vec<Wdiff<R>>,
    mem: DiffMemory,
    merged_q: VecDeque<DiffRecIo>,
    done_addr: u64,
    search_len: u64,
    should_validate_uuid: bool,
    header: DiffFileHeader,
    prepared: bool,
    stat_in: DiffStatistics,
}

impl<R: Read> DiffMerger<R> {
    /// Merger with the default look-ahead window.
    pub fn new() -> Self {
        Self::with_search_len(DEFAULT_MERGE_BUFFER_LB)
    }

    /// Merger with an explicit look-ahead window in logical blocks.
    pub fn with_search_len(search_len: u64) -> Self {
        Self {
            wdiffs: Vec::new(),
            mem: DiffMemory::new(0),
            merged_q: VecDeque::new(),
            done_addr: 0,
            search_len: search_len.max(1),
            should_validate_uuid: false,
            header: DiffFileHeader::default(),
            prepared: false,
            stat_in: DiffStatistics::default(),
        }
    }

    /// Split output records into chunks of at most `max_io_blocks` logical
    /// blocks. 0 means no limit.
    pub fn set_max_io_blocks(&mut self, max_io_blocks: u32) {
        self.mem = DiffMemory::new(max_io_blocks);
    }

    /// Require all input UUIDs to match (default: off; inputs produced from
    /// different devices are then merged without complaint).
    pub fn set_should_validate_uuid(&mut self, should_validate_uuid: bool) {
        self.should_validate_uuid = should_validate_uuid;
    }

    /// Add an input stream. Newer diffs must be added later.
    pub fn add_wdiff(&mut self, inner: R) -> Result<()> {
        if self.prepared {
            return Err(WalbError::Arg("can not add inputs after prepare".into()));
        }
        self.wdiffs.push(Wdiff::new(inner)?);
        Ok(())
    }

    /// Validate inputs and build the output header: the last stream's UUID
    /// and the maximum of the inputs' `max_io_blocks` hints.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        if self.should_validate_uuid {
            let mut uuids = self.wdiffs.iter().map(|w| w.header.uuid);
            if let Some(first) = uuids.next() {
                if uuids.any(|u| u != first) {
                    return Err(WalbError::UuidMismatch);
                }
            }
        }
        if let Some(last) = self.wdiffs.last() {
            self.header.uuid = last.header.uuid;
        }
        self.header.max_io_blocks = self
            .wdiffs
            .iter()
            .map(|w| w.header.max_io_blocks)
            .max()
            .unwrap_or(0);
        self.prepared = true;
        Ok(())
    }

    /// The output header. Valid after [`DiffMerger::prepare`].
    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    /// Input statistics accumulated so far.
    pub fn stat_in(&self) -> &DiffStatistics {
        &self.stat_in
    }

    /// Take the next merged entry, or `None` when all inputs are drained.
    pub fn get_and_remove(&mut self) -> Result<Option<DiffRecIo>> {
        self.prepare()?;
        loop {
            if let Some(e) = self.merged_q.pop_front() {
                return Ok(Some(e));
            }
            if self.wdiffs.is_empty() {
                // Flush the scratch map in address order.
                return Ok(self.mem.extract_first());
            }
            self.move_to_diff_memory()?;
            self.move_to_merged_queue();
            self.remove_ended_wdiffs()?;
        }
    }

    /// Merge everything into `out`, re-compressing payloads with snappy.
    pub fn merge_to<W: Write>(&mut self, out: W) -> Result<DiffStatistics> {
        self.prepare()?;
        let mut writer = DiffWriter::with_snappy(out);
        writer.write_header(&self.header.clone())?;
        let mut stat_out = DiffStatistics::default();
        while let Some(e) = self.get_and_remove()? {
            stat_out.update(&e.rec);
            writer.add(e.rec, e.io)?;
        }
        writer.close()?;
        debug!(stat_in = %self.stat_in, stat_out = %stat_out, "merge finished");
        Ok(stat_out)
    }

    /// Pull records inside the window into the scratch map, oldest stream
    /// first. A record of stream `i` may only enter once every older stream
    /// has advanced past its end address; insertion order then matches
    /// chronology and the map's newcomer-wins rule yields merge semantics.
    fn move_to_diff_memory(&mut self) -> Result<()> {
        let done_before = self.done_addr;
        let nr = self.try_move_to_diff_memory()?;
        if nr == 0 && self.done_addr == done_before && !self.wdiffs.is_empty() {
            // A record wider than the window blocks every stream; widen.
            self.search_len = self.search_len.saturating_mul(2);
            debug!(search_len = self.search_len, "widened merge window");
        }
        Ok(())
    }

    fn try_move_to_diff_memory(&mut self) -> Result<usize> {
        let mut nr = 0;
        let mut min_addr = u64::MAX;
        let window_end = self.done_addr.saturating_add(self.search_len);
        for w in &mut self.wdiffs {
            while let Some(rec) = w.front_rec()? {
                if rec.io_address < window_end && rec.end_io_address() <= min_addr {
                    let e = w.pop()?;
                    self.stat_in.update(&e.rec);
                    self.mem.add(e.rec, e.io)?;
                    nr += 1;
                } else {
                    break;
                }
            }
            min_addr = min_addr.min(w.current_address()?);
        }
        if min_addr != u64::MAX {
            self.done_addr = min_addr;
        }
        Ok(nr)
    }

    /// Emit every map entry no future record can touch.
    fn move_to_merged_queue(&mut self) {
        while let Some(first) = self.mem.first() {
            if first.rec.end_io_address() > self.done_addr {
                break;
            }
            let e = self.mem.extract_first().expect("non-empty");
            self.merged_q.push_back(e);
        }
    }

    fn remove_ended_wdiffs(&mut self) -> Result<()> {
        let mut kept = Vec::with_capacity(self.wdiffs.len());
        for mut w in self.wdiffs.drain(..) {
            if !w.is_end()? {
                kept.push(w);
            }
        }
        self.wdiffs = kept;
        Ok(())
    }
}

impl<R: Read> Default for DiffMerger<R> {
    fn default() -> Self {
        Self::new()
    }
}
