//! Log redo: apply a wlog to a target block device with async direct I/O.
//!
//! The engine is logically synchronous: one thread splits each log record
//! into device-block-sized IOs, tracks overlaps so writes to the same bytes
//! become device-visible in record order, coalesces adjacent IOs, elides
//! fully-overwritten ones, and submits batches through an async write ring,
//! waiting for completions FIFO.

pub mod aio;
pub mod io;
pub mod pool;

use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::rc::Rc;

use tracing::debug;

use crate::constants::LOGICAL_BLOCK_SIZE;
use crate::device::BlockDevice;
use crate::error::{Result, WalbError};
use crate::log::file::{LogBlocks, LogReader};
use crate::log::record::LogRecord;
use crate::redo::aio::Aio;
use crate::redo::io::{Io, IoKind, IoPtr, IoQueue, OverlappedData};
use crate::redo::pool::BlockPool;

/// What to do with discard log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscardMode {
    /// Issue a device discard ioctl.
    Issue,
    /// Drop discard records.
    #[default]
    Ignore,
    /// Write zeros over the discarded range.
    Zero,
}

/// Counters reported after a redo run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoStats {
    /// IOs written to the device.
    pub n_written: u64,
    /// IOs elided because a later IO fully overwrote them.
    pub n_overwritten: u64,
    /// Records dropped because they exceeded the device size.
    pub n_clipped: u64,
    /// Discarded physical blocks (or zeroed block IOs in zero mode).
    pub n_discard: u64,
    /// Padding physical blocks skipped.
    pub n_padding: u64,
    /// First LSID applied.
    pub begin_lsid: u64,
    /// One past the last LSID applied.
    pub end_lsid: u64,
}

impl fmt::Display for RedoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "applied lsid range [{}, {})",
            self.begin_lsid, self.end_lsid
        )?;
        writeln!(f, "n_written: {}", self.n_written)?;
        writeln!(f, "n_overwritten: {}", self.n_overwritten)?;
        writeln!(f, "n_clipped: {}", self.n_clipped)?;
        writeln!(f, "n_discard: {}", self.n_discard)?;
        write!(f, "n_padding: {}", self.n_padding)
    }
}

/// The redo engine.
pub struct LogApplier {
    bd: BlockDevice,
    dev_pbs: usize,
    device_size: u64,
    queue_size: usize,
    aio: Aio,
    pool: BlockPool,
    discard_mode: DiscardMode,

    /// All outstanding IOs, FIFO in creation order.
    io_q: VecDeque<IoPtr>,
    /// IOs with no live overlap, eligible to submit.
    ready_q: VecDeque<IoPtr>,
    /// Staged for batched submission, sorted by offset.
    submit_q: Vec<IoPtr>,
    /// Created but not yet overlap-tracked; the tail may still coalesce.
    staging: IoQueue,
    staged_blocks: usize,
    n_pending_blocks: usize,
    overlap: OverlappedData,
    stats: RedoStats,
}

impl LogApplier {
    /// Set up against an open device.
    ///
    /// `buffer_size` caps the bytes in flight; the submission ring holds
    /// `buffer_size / device_pbs` entries.
    pub fn new(bd: BlockDevice, buffer_size: usize, discard_mode: DiscardMode) -> Result<Self> {
        let dev_pbs = bd.physical_block_size()? as usize;
        if buffer_size <= dev_pbs {
            return Err(WalbError::Arg(format!(
                "buffer size {buffer_size} must exceed device block size {dev_pbs}"
            )));
        }
        let queue_size = buffer_size / dev_pbs;
        let device_size = bd.size()?;
        let aio = Aio::new(bd.as_raw_fd(), queue_size);
        let pool = BlockPool::new(queue_size * 2, dev_pbs, dev_pbs.max(4096)).ok_or_else(|| {
            WalbError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "block pool allocation failed",
            ))
        })?;
        Ok(Self {
            bd,
            dev_pbs,
            device_size,
            queue_size,
            aio,
            pool,
            discard_mode,
            io_q: VecDeque::new(),
            ready_q: VecDeque::new(),
            submit_q: Vec::new(),
            staging: IoQueue::new(),
            staged_blocks: 0,
            n_pending_blocks: 0,
            overlap: OverlappedData::new(),
            stats: RedoStats::default(),
        })
    }

    /// Read a wlog from `input` and apply it. Returns the run statistics.
    pub fn apply<R: Read>(&mut self, input: R) -> Result<RedoStats> {
        let mut reader = LogReader::new(input);
        let header = reader
            .read_header()?
            .ok_or_else(|| WalbError::BadFormat("input contains no wlog header".into()))?;
        if (header.pbs as usize) < self.dev_pbs || header.pbs as usize % self.dev_pbs != 0 {
            return Err(WalbError::Incompatible {
                log_pbs: header.pbs,
                dev_pbs: self.dev_pbs as u32,
            });
        }
        self.stats.begin_lsid = header.begin_lsid;
        let log_pbs = header.pbs;

        while reader.fetch_next()? {
            while let Some((rec, blocks)) = reader.read_log()? {
                self.redo_record(log_pbs, &rec, blocks)?;
            }
        }
        self.stats.end_lsid = reader.end_lsid();

        self.flush_staged()?;
        self.submit_ios()?;
        self.wait_for_all_pending()?;
        self.bd.fdatasync()?;
        Ok(self.stats)
    }

    /// Statistics of the run so far.
    pub fn stats(&self) -> &RedoStats {
        &self.stats
    }

    fn redo_record(&mut self, log_pbs: u32, rec: &LogRecord, blocks: LogBlocks) -> Result<()> {
        if rec.is_padding() {
            self.stats.n_padding += rec.io_size_pb(log_pbs) as u64;
            return Ok(());
        }
        if rec.is_discard() {
            match self.discard_mode {
                DiscardMode::Issue => {
                    self.flush_staged()?;
                    self.submit_ios()?;
                    self.wait_for_all_pending()?;
                    self.bd.discard(
                        rec.offset * LOGICAL_BLOCK_SIZE as u64,
                        rec.io_size as u64 * LOGICAL_BLOCK_SIZE as u64,
                    )?;
                    self.stats.n_discard += rec.io_size_pb(log_pbs) as u64;
                    return Ok(());
                }
                DiscardMode::Ignore => {
                    self.stats.n_discard += rec.io_size_pb(log_pbs) as u64;
                    return Ok(());
                }
                DiscardMode::Zero => {} // falls through to the normal path
            }
        }
        self.redo_normal(rec, blocks)
    }

    /// Split a record into device-block-sized IOs and stage them.
    fn redo_normal(&mut self, rec: &LogRecord, blocks: LogBlocks) -> Result<()> {
        let total = rec.io_size as usize * LOGICAL_BLOCK_SIZE;
        let record_end = rec.offset * LOGICAL_BLOCK_SIZE as u64 + total as u64;
        if record_end > self.device_size {
            // The whole record is dropped; no partial write happens.
            debug!(offset = rec.offset, io_size = rec.io_size, "clipped");
            self.stats.n_clipped += 1;
            return Ok(());
        }
        let zeroing = rec.is_discard();
        let payload = if zeroing {
            Vec::new()
        } else {
            blocks.to_contiguous(rec.io_size)
        };

        let mut off = rec.offset * LOGICAL_BLOCK_SIZE as u64;
        let mut copied = 0usize;
        while copied < total {
            let size = (total - copied).min(self.dev_pbs);
            let (block, kind) = if zeroing {
                (self.pool.alloc_zeroed(), IoKind::Zero)
            } else {
                let mut block = self.pool.alloc();
                block.as_mut_slice()[..size].copy_from_slice(&payload[copied..copied + size]);
                (block, IoKind::Data)
            };
            let iop = Io::with_kind(off, size, block, kind);
            self.staging.add(iop);
            self.staged_blocks += 1;
            if zeroing {
                self.stats.n_discard += 1;
            }
            off += size as u64;
            copied += size;

            // Do not accumulate too many blocks at once.
            if self.staged_blocks >= self.queue_size / 2 {
                self.flush_staged()?;
            }
        }
        Ok(())
    }

    /// Move staged IOs into the tracked queues, waiting out flow control.
    fn flush_staged(&mut self) -> Result<()> {
        while !self.io_q.is_empty() && self.queue_size < self.n_pending_blocks + self.staged_blocks
        {
            self.wait_for_an_io_completion()?;
        }
        self.n_pending_blocks += self.staged_blocks;
        self.staged_blocks = 0;

        while let Some(iop) = self.staging.pop() {
            self.overlap.insert(&iop);
            let n_overlapped = iop.borrow().n_overlapped;
            if n_overlapped == 0 {
                self.ready_q.push_back(Rc::clone(&iop));
            } else {
                debug!(
                    offset = iop.borrow().offset,
                    n_overlapped, "overlapped IO deferred"
                );
            }
            self.io_q.push_back(iop);
        }
        self.schedule_ios()?;
        Ok(())
    }

    /// Move ready IOs into the sorted submit queue, flushing full batches.
    fn schedule_ios(&mut self) -> Result<()> {
        while let Some(iop) = self.ready_q.pop_front() {
            if iop.borrow().overwritten {
                continue;
            }
            let offset = iop.borrow().offset;
            let pos = self
                .submit_q
                .partition_point(|p| p.borrow().offset < offset);
            self.submit_q.insert(pos, iop);
            if self.submit_q.len() >= self.queue_size {
                self.submit_ios()?;
            }
        }
        Ok(())
    }

    /// Submit everything staged in the submit queue as one batch.
    fn submit_ios(&mut self) -> Result<()> {
        let mut n_bulk = 0;
        for iop in std::mem::take(&mut self.submit_q) {
            let mut io = iop.borrow_mut();
            if io.overwritten {
                continue;
            }
            debug_assert_eq!(io.n_overlapped, 0);
            let (ptr, len, offset) = (io.first_block_ptr(), io.size, io.offset);
            // Safety: the blocks stay owned by this Io until its completion
            // is awaited; overwritten IOs are filtered before this point.
            io.aio_key = unsafe { self.aio.prepare_write(offset, ptr, len)? };
            io.submitted = true;
            n_bulk += 1;
            debug!(offset = io.offset, size = io.size, "submit");
        }
        if n_bulk > 0 {
            self.aio.submit()?;
        }
        Ok(())
    }

    /// Wait for the oldest outstanding IO, submitting it first if needed.
    fn wait_for_an_io_completion(&mut self) -> Result<()> {
        let iop = self
            .io_q
            .pop_front()
            .ok_or_else(|| WalbError::Arg("no outstanding IO to wait for".into()))?;

        let (submitted, overwritten) = {
            let io = iop.borrow();
            (io.submitted, io.overwritten)
        };
        if !submitted && !overwritten {
            // Push it (and everything ready) to the device now.
            self.schedule_ios()?;
            self.submit_ios()?;
        }

        let io_size = {
            let mut io = iop.borrow_mut();
            if io.submitted {
                self.aio.wait_for(io.aio_key)?;
                io.completed = true;
                io.release_blocks();
                self.stats.n_written += 1;
            } else {
                debug_assert!(io.overwritten);
                self.stats.n_overwritten += 1;
            }
            io.size
        };
        self.n_pending_blocks -= io_size.div_ceil(self.dev_pbs);

        let mut unblocked = VecDeque::new();
        self.overlap.remove(&iop, &mut unblocked);
        // FIFO by completion order at that address: newly runnable IOs go
        // to the front of the ready queue.
        while let Some(p) = unblocked.pop_front() {
            if p.borrow().overwritten {
                continue;
            }
            debug_assert_eq!(p.borrow().n_overlapped, 0);
            self.ready_q.push_front(p);
        }
        debug!(
            n_pending_blocks = self.n_pending_blocks,
            "completed one IO"
        );
        Ok(())
    }

    fn wait_for_all_pending(&mut self) -> Result<()> {
        while !self.io_q.is_empty() {
            self.wait_for_an_io_completion()?;
        }
        debug_assert!(self.overlap.is_empty());
        self.ready_q.clear();
        self.submit_q.clear();
        Ok(())
    }
}

impl Drop for LogApplier {
    fn drop(&mut self) {
        // Drain submitted IOs so their buffers outlive the kernel's view.
        while let Some(iop) = self.io_q.pop_front() {
            let io = iop.borrow();
            if io.submitted && !io.completed {
                let _ = self.aio.wait_for(io.aio_key);
            }
        }
    }
}
