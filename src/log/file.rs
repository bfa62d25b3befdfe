//! wlog file header, reader and writer.
//!
//! ## File Header Format (4096 bytes, little-endian)
//!
//! ```text
//! offset field              size
//! 0      checksum           4    whole header with this field zeroed, salt 0
//! 4      magic              4    = 0x57616c42 ("WalB")
//! 8      version            2    = 1
//! 10     header_size        2    = 4096
//! 12     logical_bs         4    = 512
//! 16     physical_bs        4
//! 20     log_checksum_salt  4
//! 24     uuid               16
//! 40     begin_lsid         8
//! 48     end_lsid           8
//! rest   zero padding
//! ```
//!
//! The header is followed by log packs; the stream terminates with an
//! end-marker pack header (`n_records == 0`, `logpack_lsid == u64::MAX`).

use std::io::{Read, Write};

use uuid::Uuid;

use crate::block::{checksum, checksum_finish, checksum_partial, is_all_zero};
use crate::constants::LOGICAL_BLOCK_SIZE;
use crate::error::{Result, WalbError};
use crate::log::pack::LogPackHeader;
use crate::log::record::LogRecord;

/// Fixed size of the wlog file header.
pub const WLOG_HEADER_SIZE: usize = 4096;
/// "WalB" in a little-endian u32.
pub const WLOG_MAGIC: u32 = 0x5761_6c42;
/// Current wlog format version.
pub const WLOG_VERSION: u16 = 1;

/// wlog file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WlogHeader {
    /// Physical block size of the log device.
    pub pbs: u32,
    /// Salt mixed into every log checksum.
    pub salt: u32,
    /// Device UUID.
    pub uuid: Uuid,
    /// First LSID contained in this file.
    pub begin_lsid: u64,
    /// One past the last LSID contained in this file.
    pub end_lsid: u64,
}

impl WlogHeader {
    /// Serialize into a fresh header block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; WLOG_HEADER_SIZE];
        buf[4..8].copy_from_slice(&WLOG_MAGIC.to_le_bytes());
        buf[8..10].copy_from_slice(&WLOG_VERSION.to_le_bytes());
        buf[10..12].copy_from_slice(&(WLOG_HEADER_SIZE as u16).to_le_bytes());
        buf[12..16].copy_from_slice(&(LOGICAL_BLOCK_SIZE as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.pbs.to_le_bytes());
        buf[20..24].copy_from_slice(&self.salt.to_le_bytes());
        buf[24..40].copy_from_slice(self.uuid.as_bytes());
        buf[40..48].copy_from_slice(&self.begin_lsid.to_le_bytes());
        buf[48..56].copy_from_slice(&self.end_lsid.to_le_bytes());
        let csum = checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Deserialize and validate a header block.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != WLOG_HEADER_SIZE {
            return Err(WalbError::BadFormat("wlog header size".into()));
        }
        let magic = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != WLOG_MAGIC {
            return Err(WalbError::BadFormat(format!("wlog magic {magic:#x}")));
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if version != WLOG_VERSION {
            return Err(WalbError::BadFormat(format!("wlog version {version}")));
        }
        let header_size = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        if header_size as usize != WLOG_HEADER_SIZE {
            return Err(WalbError::BadFormat(format!("header size {header_size}")));
        }
        let lbs = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if lbs as usize != LOGICAL_BLOCK_SIZE {
            return Err(WalbError::BadFormat(format!("logical block size {lbs}")));
        }
        if checksum(buf, 0) != 0 {
            return Err(WalbError::BadChecksum("wlog header".into()));
        }
        let pbs = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if pbs == 0 || pbs % LOGICAL_BLOCK_SIZE as u32 != 0 || !pbs.is_power_of_two() {
            return Err(WalbError::BadFormat(format!("physical block size {pbs}")));
        }
        Ok(Self {
            pbs,
            salt: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            uuid: Uuid::from_slice(&buf[24..40]).expect("16 bytes"),
            begin_lsid: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            end_lsid: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        })
    }
}

/// Payload blocks of one log record, each `pbs` bytes.
#[derive(Debug, Default)]
pub struct LogBlocks {
    pbs: u32,
    blocks: Vec<Vec<u8>>,
}

impl LogBlocks {
    /// Create an empty block run.
    pub fn new(pbs: u32) -> Self {
        Self {
            pbs,
            blocks: Vec::new(),
        }
    }

    /// Number of physical blocks held.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Block at `idx`.
    pub fn get(&self, idx: usize) -> &[u8] {
        &self.blocks[idx]
    }

    /// Read `n_pb` physical blocks from `r`.
    pub fn read_from<R: Read>(&mut self, r: &mut R, n_pb: u32) -> Result<()> {
        for _ in 0..n_pb {
            let mut block = vec![0u8; self.pbs as usize];
            r.read_exact(&mut block)?;
            self.blocks.push(block);
        }
        Ok(())
    }

    /// Salted checksum of the first `io_size_lb` logical blocks.
    pub fn checksum(&self, io_size_lb: u32, salt: u32) -> u32 {
        let mut acc = salt;
        let mut remaining = io_size_lb as usize * LOGICAL_BLOCK_SIZE;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let s = remaining.min(self.pbs as usize);
            acc = checksum_partial(acc, &block[..s]);
            remaining -= s;
        }
        checksum_finish(acc)
    }

    /// Whether the first `io_size_lb` logical blocks are all zero.
    pub fn is_all_zero(&self, io_size_lb: u32) -> bool {
        let mut remaining = io_size_lb as usize * LOGICAL_BLOCK_SIZE;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let s = remaining.min(self.pbs as usize);
            if !is_all_zero(&block[..s]) {
                return false;
            }
            remaining -= s;
        }
        true
    }

    /// Copy the first `io_size_lb` logical blocks into one contiguous buffer.
    pub fn to_contiguous(&self, io_size_lb: u32) -> Vec<u8> {
        let total = io_size_lb as usize * LOGICAL_BLOCK_SIZE;
        let mut out = Vec::with_capacity(total);
        let mut remaining = total;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let s = remaining.min(self.pbs as usize);
            out.extend_from_slice(&block[..s]);
            remaining -= s;
        }
        debug_assert_eq!(out.len(), total);
        out
    }
}

/// Read `buf.len()` bytes; `Ok(false)` on clean EOF before the first byte.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        let n = r.read(&mut buf[off..])?;
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(WalbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated wlog stream",
            )));
        }
        off += n;
    }
    Ok(true)
}

/// Pull-based wlog reader.
///
/// Usage: `read_header()` once per concatenated wlog, then `fetch_next()` /
/// `read_log()` until exhausted.
pub struct LogReader<R: Read> {
    inner: R,
    header: Option<WlogHeader>,
    pack: Option<LogPackHeader>,
    rec_idx: usize,
    end_lsid: u64,
    reached_end: bool,
}

impl<R: Read> LogReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: None,
            pack: None,
            rec_idx: 0,
            end_lsid: 0,
            reached_end: false,
        }
    }

    /// Read the next wlog file header. `Ok(None)` on clean end of stream.
    pub fn read_header(&mut self) -> Result<Option<WlogHeader>> {
        let mut buf = vec![0u8; WLOG_HEADER_SIZE];
        if !read_exact_or_eof(&mut self.inner, &mut buf)? {
            return Ok(None);
        }
        let header = WlogHeader::decode(&buf)?;
        self.end_lsid = header.begin_lsid;
        self.pack = None;
        self.rec_idx = 0;
        self.reached_end = false;
        self.header = Some(header.clone());
        Ok(Some(header))
    }

    /// The most recently read file header.
    pub fn header(&self) -> Option<&WlogHeader> {
        self.header.as_ref()
    }

    /// LSID one past the last pack consumed so far.
    pub fn end_lsid(&self) -> u64 {
        self.end_lsid
    }

    /// The pack header currently being iterated.
    pub fn pack(&self) -> Option<&LogPackHeader> {
        self.pack.as_ref()
    }

    /// Advance to the next pack. `Ok(false)` at the end marker.
    pub fn fetch_next(&mut self) -> Result<bool> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| WalbError::Arg("read_header() must be called first".into()))?;
        if self.reached_end {
            return Ok(false);
        }
        // Skip unread records of the current pack.
        while self.read_log()?.is_some() {}

        let mut buf = vec![0u8; header.pbs as usize];
        self.inner.read_exact(&mut buf)?;
        let pack = LogPackHeader::decode(&buf, header.pbs, header.salt)?;
        if pack.is_end() {
            self.reached_end = true;
            self.pack = None;
            return Ok(false);
        }
        self.end_lsid = pack.next_logpack_lsid();
        self.pack = Some(pack);
        self.rec_idx = 0;
        Ok(true)
    }

    /// Read the next record of the current pack along with its payload
    /// blocks, verifying the payload checksum. `Ok(None)` when the pack is
    /// exhausted.
    pub fn read_log(&mut self) -> Result<Option<(LogRecord, LogBlocks)>> {
        let (pbs, salt) = match &self.header {
            Some(h) => (h.pbs, h.salt),
            None => return Ok(None),
        };
        let rec = match &self.pack {
            Some(pack) if self.rec_idx < pack.n_records() => *pack.record(self.rec_idx),
            _ => return Ok(None),
        };
        let mut blocks = LogBlocks::new(pbs);
        if rec.has_data() {
            blocks.read_from(&mut self.inner, rec.io_size_pb(pbs))?;
        }
        if rec.has_data_for_checksum() {
            let csum = blocks.checksum(rec.io_size, salt);
            if csum != rec.checksum {
                return Err(WalbError::BadChecksum(format!(
                    "log record at lsid {}: {csum:#010x} != {:#010x}",
                    rec.lsid, rec.checksum
                )));
            }
        }
        self.rec_idx += 1;
        Ok(Some((rec, blocks)))
    }
}

/// Push-based wlog writer.
///
/// `add_*` return `false` when the current pack is full; the caller then
/// calls [`LogWriter::flush_pack`] and retries. [`LogWriter::close`] writes
/// the end marker.
pub struct LogWriter<W: Write> {
    inner: W,
    pbs: u32,
    salt: u32,
    pack: LogPackHeader,
    payloads: Vec<Vec<u8>>,
    header_written: bool,
    closed: bool,
}

impl<W: Write> LogWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pbs: 0,
            salt: 0,
            pack: LogPackHeader::new(512, 0, 0),
            payloads: Vec::new(),
            header_written: false,
            closed: false,
        }
    }

    /// Write the file header. Must be the first call.
    pub fn write_header(&mut self, header: &WlogHeader) -> Result<()> {
        if self.header_written {
            return Err(WalbError::Arg("wlog header already written".into()));
        }
        self.inner.write_all(&header.encode())?;
        self.pbs = header.pbs;
        self.salt = header.salt;
        self.pack = LogPackHeader::new(header.pbs, header.salt, header.begin_lsid);
        self.header_written = true;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.header_written {
            return Err(WalbError::Arg("write_header() must be called first".into()));
        }
        if self.closed {
            return Err(WalbError::Arg("wlog writer already closed".into()));
        }
        Ok(())
    }

    /// Append a normal IO. `data` must be exactly `size * 512` bytes.
    pub fn add_normal(&mut self, offset: u64, size: u32, data: &[u8]) -> Result<bool> {
        self.check_open()?;
        if data.len() != size as usize * LOGICAL_BLOCK_SIZE {
            return Err(WalbError::Arg(format!(
                "payload length {} does not match io size {}",
                data.len(),
                size
            )));
        }
        if !self.pack.add_normal_io(offset, size)? {
            return Ok(false);
        }
        let idx = self.pack.n_records() - 1;
        self.pack.record_mut(idx).checksum = checksum(data, self.salt);
        let mut payload =
            vec![0u8; self.pack.record(idx).io_size_pb(self.pbs) as usize * self.pbs as usize];
        payload[..data.len()].copy_from_slice(data);
        self.payloads.push(payload);
        Ok(true)
    }

    /// Append a discard record.
    pub fn add_discard(&mut self, offset: u64, size: u32) -> Result<bool> {
        self.check_open()?;
        self.pack.add_discard_io(offset, size)
    }

    /// Append a padding record of `size` logical blocks (pbs-aligned).
    pub fn add_padding(&mut self, size: u32) -> Result<bool> {
        self.check_open()?;
        if !self.pack.add_padding(size)? {
            return Ok(false);
        }
        let idx = self.pack.n_records() - 1;
        let n_pb = self.pack.record(idx).io_size_pb(self.pbs);
        self.payloads
            .push(vec![0u8; n_pb as usize * self.pbs as usize]);
        Ok(true)
    }

    /// Write out the current pack and start a new one.
    pub fn flush_pack(&mut self) -> Result<()> {
        self.check_open()?;
        if self.pack.n_records() == 0 {
            return Ok(());
        }
        self.inner.write_all(&self.pack.encode())?;
        for payload in &self.payloads {
            self.inner.write_all(payload)?;
        }
        self.payloads.clear();
        let next = self.pack.next_logpack_lsid();
        self.pack.init(next);
        Ok(())
    }

    /// Flush the pending pack, write the end marker, and return the end
    /// LSID of the stream.
    pub fn close(&mut self) -> Result<u64> {
        self.check_open()?;
        self.flush_pack()?;
        let end_lsid = self.pack.logpack_lsid();
        self.pack.set_end();
        self.inner.write_all(&self.pack.encode())?;
        self.inner.flush()?;
        self.closed = true;
        Ok(end_lsid)
    }

    /// Unwrap the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}
