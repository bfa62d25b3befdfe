//! wdiff file header, pack codec, reader and writer.
//!
//! ## File Header Format (4096 bytes, little-endian)
//!
//! ```text
//! offset field          size
//! 0      checksum       4    whole block with this field zeroed, salt 0
//! 4      magic          4    = "wdif"
//! 8      version        2    = 1
//! 10     max_io_blocks  2    largest record hint, 0 = unknown
//! 12     uuid           16
//! rest   zero padding
//! ```
//!
//! ## Pack Format
//!
//! A 4096-byte pack header followed by the concatenated record payloads:
//!
//! ```text
//! offset field       size
//! 0      checksum    4     whole header block, salt 0
//! 4      n_records   2
//! 6      is_end      1
//! 7      reserved    1
//! 8      total_size  4     payload bytes following the header
//! 12     record[N]   24 each
//! ```
//!
//! `data_offset` of each record is relative to the start of the payload
//! area. The payload area is bounded by [`DIFF_PACK_MAX_BYTES`]. The file
//! ends with a pack whose `is_end` flag is set and `n_records == 0`.

use std::io::{Read, Write};

use uuid::Uuid;

use crate::block::checksum;
use crate::diff::io::DiffIo;
use crate::diff::record::{DiffRecord, DIFF_CMPR_NONE, DIFF_CMPR_SNAPPY, DIFF_RECORD_SIZE};
use crate::error::{Result, WalbError};

/// Fixed size of the wdiff file header block.
pub const DIFF_FILE_HEADER_SIZE: usize = 4096;
/// Fixed size of a pack header block.
pub const DIFF_PACK_HEADER_SIZE: usize = 4096;
/// Bytes of record table prefix in a pack header.
const DIFF_PACK_PREFIX_SIZE: usize = 12;
/// Maximum records per pack.
pub const MAX_N_RECORDS_IN_PACK: usize =
    (DIFF_PACK_HEADER_SIZE - DIFF_PACK_PREFIX_SIZE) / DIFF_RECORD_SIZE;
/// Maximum payload bytes per pack (1 MiB).
pub const DIFF_PACK_MAX_BYTES: usize = 1 << 20;
/// wdiff magic bytes.
pub const DIFF_MAGIC: [u8; 4] = *b"wdif";
/// Current wdiff format version.
pub const DIFF_VERSION: u16 = 1;

/// wdiff file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffFileHeader {
    /// Hint: largest `io_blocks` in the file, 0 when unknown.
    pub max_io_blocks: u16,
    /// Device UUID.
    pub uuid: Uuid,
}

impl DiffFileHeader {
    /// Serialize into a fresh header block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIFF_FILE_HEADER_SIZE];
        buf[4..8].copy_from_slice(&DIFF_MAGIC);
        buf[8..10].copy_from_slice(&DIFF_VERSION.to_le_bytes());
        buf[10..12].copy_from_slice(&self.max_io_blocks.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        let csum = checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Deserialize and validate a header block.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DIFF_FILE_HEADER_SIZE {
            return Err(WalbError::BadFormat("wdiff header size".into()));
        }
        if buf[4..8] != DIFF_MAGIC {
            return Err(WalbError::BadFormat("wdiff magic".into()));
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if version != DIFF_VERSION {
            return Err(WalbError::BadFormat(format!("wdiff version {version}")));
        }
        if checksum(buf, 0) != 0 {
            return Err(WalbError::BadChecksum("wdiff header".into()));
        }
        Ok(Self {
            max_io_blocks: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            uuid: Uuid::from_slice(&buf[12..28]).expect("16 bytes"),
        })
    }
}

/// Parsed pack header.
#[derive(Debug, Clone, Default)]
struct DiffPackHeader {
    is_end: bool,
    total_size: u32,
    records: Vec<DiffRecord>,
}

impl DiffPackHeader {
    fn can_add(&self, data_size: u32) -> bool {
        self.records.len() < MAX_N_RECORDS_IN_PACK
            && self.total_size as usize + data_size as usize <= DIFF_PACK_MAX_BYTES
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIFF_PACK_HEADER_SIZE];
        buf[4..6].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        buf[6] = self.is_end as u8;
        buf[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = DIFF_PACK_PREFIX_SIZE + i * DIFF_RECORD_SIZE;
            rec.encode(&mut buf[off..off + DIFF_RECORD_SIZE]);
        }
        let csum = checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DIFF_PACK_HEADER_SIZE {
            return Err(WalbError::BadFormat("wdiff pack header size".into()));
        }
        if checksum(buf, 0) != 0 {
            return Err(WalbError::BadChecksum("wdiff pack header".into()));
        }
        let n_records = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
        if n_records > MAX_N_RECORDS_IN_PACK {
            return Err(WalbError::BadFormat(format!("pack n_records {n_records}")));
        }
        let is_end = buf[6] != 0;
        let total_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if total_size as usize > DIFF_PACK_MAX_BYTES {
            return Err(WalbError::BadFormat(format!("pack total_size {total_size}")));
        }
        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let off = DIFF_PACK_PREFIX_SIZE + i * DIFF_RECORD_SIZE;
            let rec = DiffRecord::decode(&buf[off..off + DIFF_RECORD_SIZE]);
            if !rec.is_valid() {
                return Err(WalbError::BadFormat(format!("pack record {i} invalid")));
            }
            records.push(rec);
        }
        Ok(Self {
            is_end,
            total_size,
            records,
        })
    }
}

/// Buffering wdiff writer.
///
/// Records are buffered until a pack fills, then one pack header plus its
/// payload area are written out. Uncompressed normal payloads are
/// snappy-compressed when the writer's compression type says so.
pub struct DiffWriter<W: Write> {
    inner: W,
    compression_type: u8,
    pack: DiffPackHeader,
    payloads: Vec<Vec<u8>>,
    header_written: bool,
    closed: bool,
}

impl<W: Write> DiffWriter<W> {
    /// Writer that stores payloads verbatim.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            compression_type: DIFF_CMPR_NONE,
            pack: DiffPackHeader::default(),
            payloads: Vec::new(),
            header_written: false,
            closed: false,
        }
    }

    /// Writer that compresses uncompressed payloads with snappy.
    pub fn with_snappy(inner: W) -> Self {
        let mut w = Self::new(inner);
        w.compression_type = DIFF_CMPR_SNAPPY;
        w
    }

    /// Write the file header. Must be the first call.
    pub fn write_header(&mut self, header: &DiffFileHeader) -> Result<()> {
        if self.header_written {
            return Err(WalbError::Arg("wdiff header already written".into()));
        }
        self.inner.write_all(&header.encode())?;
        self.header_written = true;
        Ok(())
    }

    /// Append one record with its payload.
    ///
    /// `data_offset`, `data_size` and `checksum` are recomputed here, so
    /// records coming from the in-memory diff map (whose checksums may be
    /// stale after trimming) can be passed as-is.
    pub fn add(&mut self, mut rec: DiffRecord, mut io: DiffIo) -> Result<()> {
        if !self.header_written {
            return Err(WalbError::Arg("write_header() must be called first".into()));
        }
        if self.closed {
            return Err(WalbError::Arg("wdiff writer already closed".into()));
        }
        if !rec.is_valid() {
            return Err(WalbError::Arg("invalid diff record".into()));
        }
        if rec.is_normal() {
            if self.compression_type == DIFF_CMPR_SNAPPY && !io.is_compressed() {
                io = io.compress()?;
            }
            rec.compression_type = io.compression_type;
            rec.data_size = io.data.len() as u32;
            rec.checksum = io.calc_checksum();
        } else {
            io = DiffIo::empty();
            rec.compression_type = DIFF_CMPR_NONE;
            rec.data_size = 0;
            rec.checksum = 0;
        }
        if rec.data_size as usize > DIFF_PACK_MAX_BYTES {
            return Err(WalbError::Arg(format!(
                "record payload {} exceeds the pack capacity; split the record first",
                rec.data_size
            )));
        }
        if !self.pack.can_add(rec.data_size) {
            self.flush_pack()?;
        }
        rec.data_offset = self.pack.total_size;
        self.pack.total_size += rec.data_size;
        self.pack.records.push(rec);
        if !io.data.is_empty() {
            self.payloads.push(io.data);
        }
        Ok(())
    }

    /// Write out the buffered pack, if any.
    pub fn flush_pack(&mut self) -> Result<()> {
        if self.pack.records.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.pack.encode())?;
        for payload in &self.payloads {
            self.inner.write_all(payload)?;
        }
        self.pack = DiffPackHeader::default();
        self.payloads.clear();
        Ok(())
    }

    /// Flush pending records and write the end marker.
    pub fn close(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(WalbError::Arg("write_header() must be called first".into()));
        }
        if self.closed {
            return Ok(());
        }
        self.flush_pack()?;
        let end = DiffPackHeader {
            is_end: true,
            ..Default::default()
        };
        self.inner.write_all(&end.encode())?;
        self.inner.flush()?;
        self.closed = true;
        Ok(())
    }

    /// Unwrap the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Pull-based wdiff reader.
pub struct DiffReader<R: Read> {
    inner: R,
    header: Option<DiffFileHeader>,
    pack: DiffPackHeader,
    payload: Vec<u8>,
    rec_idx: usize,
    reached_end: bool,
}

impl<R: Read> DiffReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: None,
            pack: DiffPackHeader::default(),
            payload: Vec::new(),
            rec_idx: 0,
            reached_end: false,
        }
    }

    /// Read and validate the file header. Must be the first call.
    pub fn read_header(&mut self) -> Result<DiffFileHeader> {
        let mut buf = vec![0u8; DIFF_FILE_HEADER_SIZE];
        self.inner.read_exact(&mut buf)?;
        let header = DiffFileHeader::decode(&buf)?;
        self.header = Some(header.clone());
        Ok(header)
    }

    /// The file header, once read.
    pub fn header(&self) -> Option<&DiffFileHeader> {
        self.header.as_ref()
    }

    /// Read the next record and its stored payload. `Ok(None)` at the end
    /// marker or at clean end of stream.
    pub fn read_diff(&mut self) -> Result<Option<(DiffRecord, DiffIo)>> {
        if self.header.is_none() {
            return Err(WalbError::Arg("read_header() must be called first".into()));
        }
        if self.reached_end {
            return Ok(None);
        }
        while self.rec_idx >= self.pack.records.len() {
            if !self.read_pack()? {
                return Ok(None);
            }
        }
        let rec = self.pack.records[self.rec_idx];
        self.rec_idx += 1;
        let io = if rec.is_normal() {
            let begin = rec.data_offset as usize;
            let end = begin + rec.data_size as usize;
            if end > self.payload.len() {
                return Err(WalbError::BadFormat(format!(
                    "record payload [{begin}, {end}) exceeds pack payload {}",
                    self.payload.len()
                )));
            }
            let io = DiffIo::from_record(&rec, self.payload[begin..end].to_vec());
            let csum = io.calc_checksum();
            if csum != rec.checksum {
                return Err(WalbError::BadChecksum(format!(
                    "diff record at address {}: {csum:#010x} != {:#010x}",
                    rec.io_address, rec.checksum
                )));
            }
            io
        } else {
            DiffIo::empty()
        };
        Ok(Some((rec, io)))
    }

    /// Like [`DiffReader::read_diff`] but with the payload uncompressed.
    pub fn read_and_uncompress(&mut self) -> Result<Option<(DiffRecord, DiffIo)>> {
        match self.read_diff()? {
            Some((mut rec, mut io)) => {
                io.uncompress_if_needed()?;
                if rec.is_normal() {
                    rec.compression_type = DIFF_CMPR_NONE;
                    rec.data_size = io.data.len() as u32;
                    rec.checksum = io.calc_checksum();
                }
                Ok(Some((rec, io)))
            }
            None => Ok(None),
        }
    }

    /// Read the next pack header plus payload area. A short read of zero
    /// bytes at a pack boundary counts as end of stream.
    fn read_pack(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; DIFF_PACK_HEADER_SIZE];
        let mut off = 0;
        while off < buf.len() {
            let n = self.inner.read(&mut buf[off..])?;
            if n == 0 {
                if off == 0 {
                    // Missing end marker; tolerated on read.
                    self.reached_end = true;
                    return Ok(false);
                }
                return Err(WalbError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated wdiff pack header",
                )));
            }
            off += n;
        }
        let pack = DiffPackHeader::decode(&buf)?;
        if pack.is_end {
            self.reached_end = true;
            return Ok(false);
        }
        self.payload = vec![0u8; pack.total_size as usize];
        self.inner.read_exact(&mut self.payload)?;
        self.pack = pack;
        self.rec_idx = 0;
        Ok(true)
    }
}
