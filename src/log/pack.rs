//! Log-pack header codec and builder.
//!
//! ## Header Format (one physical block, little-endian)
//!
//! ```text
//! offset field          size
//! 0      checksum       4     whole PB with this field zeroed, salt mixed
//! 4      sector_type    2     = 1 (LOGPACK)
//! 6      reserved       2
//! 8      total_io_size  4     payload size in physical blocks
//! 12     logpack_lsid   8
//! 20     n_records      2
//! 22     n_padding      2
//! 24     reserved       4
//! 28     record[0..N]   32 each
//! rest   zero padding to PB
//! ```

use crate::block::{capacity_pb, checksum, n_lb_in_pb};
use crate::error::{Result, WalbError};
use crate::log::record::{
    LogRecord, LOG_RECORD_DISCARD, LOG_RECORD_EXIST, LOG_RECORD_PADDING, LOG_RECORD_SIZE,
};

/// Sector type tag of a log pack header.
pub const SECTOR_TYPE_LOGPACK: u16 = 1;

/// Fixed bytes of a pack header before the record array.
pub const LOGPACK_HEADER_PREFIX_SIZE: usize = 28;

/// Payload cap per pack: 1 MiB worth of physical blocks.
pub const fn max_total_io_size_pb(pbs: u32) -> u32 {
    (1u32 << 20) / pbs
}

/// Record slots that fit in one pack header block.
pub const fn max_records_in_pb(pbs: u32) -> usize {
    (pbs as usize - LOGPACK_HEADER_PREFIX_SIZE) / LOG_RECORD_SIZE
}

/// In-memory form of a log-pack header.
///
/// The builder methods (`add_normal_io`, `add_discard_io`, `add_padding`)
/// return `false` when the pack is full; the caller then writes this pack
/// out and starts a new one.
#[derive(Debug, Clone)]
pub struct LogPackHeader {
    pbs: u32,
    salt: u32,
    total_io_size: u32,
    logpack_lsid: u64,
    n_padding: u16,
    records: Vec<LogRecord>,
}

impl LogPackHeader {
    /// Create an empty pack starting at `lsid`.
    pub fn new(pbs: u32, salt: u32, lsid: u64) -> Self {
        Self {
            pbs,
            salt,
            total_io_size: 0,
            logpack_lsid: lsid,
            n_padding: 0,
            records: Vec::new(),
        }
    }

    /// Physical block size this pack was sectored with.
    pub fn pbs(&self) -> u32 {
        self.pbs
    }

    /// Checksum salt.
    pub fn salt(&self) -> u32 {
        self.salt
    }

    /// Payload size in physical blocks.
    pub fn total_io_size(&self) -> u32 {
        self.total_io_size
    }

    /// LSID of this pack.
    pub fn logpack_lsid(&self) -> u64 {
        self.logpack_lsid
    }

    /// Number of records in the pack.
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Number of padding records (0 or 1).
    pub fn n_padding(&self) -> u16 {
        self.n_padding
    }

    /// Record at `pos`.
    pub fn record(&self, pos: usize) -> &LogRecord {
        &self.records[pos]
    }

    /// Mutable record at `pos`.
    pub fn record_mut(&mut self, pos: usize) -> &mut LogRecord {
        &mut self.records[pos]
    }

    /// All records.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Reset to an empty pack at `lsid`.
    pub fn init(&mut self, lsid: u64) {
        self.total_io_size = 0;
        self.logpack_lsid = lsid;
        self.n_padding = 0;
        self.records.clear();
    }

    /// Turn this header into the stream terminator.
    pub fn set_end(&mut self) {
        self.init(u64::MAX);
    }

    /// Whether this is the stream terminator.
    pub fn is_end(&self) -> bool {
        self.records.is_empty() && self.logpack_lsid == u64::MAX
    }

    /// LSID of the next pack.
    pub fn next_logpack_lsid(&self) -> u64 {
        if self.records.is_empty() {
            self.logpack_lsid
        } else {
            self.logpack_lsid + 1 + self.total_io_size as u64
        }
    }

    /// Physical blocks consumed by padding records.
    pub fn total_padding_pb(&self) -> u64 {
        if self.n_padding == 0 {
            return 0;
        }
        self.records
            .iter()
            .filter(|r| r.is_padding())
            .map(|r| r.io_size_pb(self.pbs) as u64)
            .sum()
    }

    /// Add a normal IO record.
    ///
    /// `size` is in logical blocks and must not be zero. Returns `false`
    /// when the pack is full.
    pub fn add_normal_io(&mut self, offset: u64, size: u32) -> Result<bool> {
        if size == 0 {
            return Err(WalbError::Arg("normal IO can not be zero-sized".into()));
        }
        if self.records.len() >= max_records_in_pb(self.pbs) {
            return Ok(false);
        }
        if self.n_padding > 0 {
            // A padding record closes the pack.
            return Ok(false);
        }
        if self.total_io_size + capacity_pb(self.pbs, size) > max_total_io_size_pb(self.pbs) {
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0, // set when the payload is known
            lsid: self.logpack_lsid + lsid_local as u64,
            lsid_local,
            io_size: size,
            offset,
            flags: LOG_RECORD_EXIST,
        });
        self.total_io_size += capacity_pb(self.pbs, size);
        Ok(true)
    }

    /// Add a discard record. Discards carry no payload and do not advance
    /// `total_io_size`.
    pub fn add_discard_io(&mut self, offset: u64, size: u32) -> Result<bool> {
        if size == 0 {
            return Err(WalbError::Arg("discard IO can not be zero-sized".into()));
        }
        if self.records.len() >= max_records_in_pb(self.pbs) {
            return Ok(false);
        }
        if self.n_padding > 0 {
            // A padding record closes the pack.
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0,
            lsid: self.logpack_lsid + lsid_local as u64,
            lsid_local,
            io_size: size,
            offset,
            flags: LOG_RECORD_EXIST | LOG_RECORD_DISCARD,
        });
        Ok(true)
    }

    /// Add a padding record. At most one per pack, always last; `size` must
    /// be aligned to the physical block size.
    pub fn add_padding(&mut self, size: u32) -> Result<bool> {
        if size % n_lb_in_pb(self.pbs) != 0 {
            return Err(WalbError::Arg("padding size must be pbs-aligned".into()));
        }
        if self.records.len() >= max_records_in_pb(self.pbs) {
            return Ok(false);
        }
        if self.total_io_size + capacity_pb(self.pbs, size) > max_total_io_size_pb(self.pbs) {
            return Ok(false);
        }
        if self.n_padding > 0 {
            return Ok(false);
        }
        let lsid_local = self.total_io_size + 1;
        self.records.push(LogRecord {
            checksum: 0,
            lsid: self.logpack_lsid + lsid_local as u64,
            lsid_local,
            io_size: size,
            offset: 0,
            flags: LOG_RECORD_EXIST | LOG_RECORD_PADDING,
        });
        self.total_io_size += capacity_pb(self.pbs, size);
        self.n_padding += 1;
        Ok(true)
    }

    /// Serialize into one physical block, computing the header checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.pbs as usize];
        buf[4..6].copy_from_slice(&SECTOR_TYPE_LOGPACK.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_io_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.logpack_lsid.to_le_bytes());
        buf[20..22].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        buf[22..24].copy_from_slice(&self.n_padding.to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = LOGPACK_HEADER_PREFIX_SIZE + i * LOG_RECORD_SIZE;
            rec.encode(&mut buf[off..off + LOG_RECORD_SIZE]);
        }
        let csum = checksum(&buf, self.salt);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Deserialize one physical block, verifying sector type, checksum and
    /// record structure.
    pub fn decode(buf: &[u8], pbs: u32, salt: u32) -> Result<Self> {
        if buf.len() != pbs as usize {
            return Err(WalbError::BadFormat(format!(
                "logpack header must be {} bytes, got {}",
                pbs,
                buf.len()
            )));
        }
        let sector_type = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if sector_type != SECTOR_TYPE_LOGPACK {
            return Err(WalbError::BadFormat(format!(
                "bad sector type {sector_type}"
            )));
        }
        if checksum(buf, salt) != 0 {
            return Err(WalbError::BadChecksum("logpack header".into()));
        }
        let total_io_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let logpack_lsid = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let n_records = u16::from_le_bytes(buf[20..22].try_into().unwrap()) as usize;
        let n_padding = u16::from_le_bytes(buf[22..24].try_into().unwrap());
        if n_records > max_records_in_pb(pbs) {
            return Err(WalbError::BadFormat(format!("n_records {n_records}")));
        }
        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let off = LOGPACK_HEADER_PREFIX_SIZE + i * LOG_RECORD_SIZE;
            records.push(LogRecord::decode(&buf[off..off + LOG_RECORD_SIZE]));
        }
        let header = Self {
            pbs,
            salt,
            total_io_size,
            logpack_lsid,
            n_padding,
            records,
        };
        header.verify_structure()?;
        Ok(header)
    }

    fn verify_structure(&self) -> Result<()> {
        let mut io_size_pb = 0u32;
        let mut n_padding = 0u16;
        for (i, rec) in self.records.iter().enumerate() {
            if !rec.is_valid() {
                return Err(WalbError::BadFormat(format!("record {i} invalid")));
            }
            if rec.lsid != self.logpack_lsid + rec.lsid_local as u64 {
                return Err(WalbError::BadFormat(format!("record {i} lsid")));
            }
            if rec.is_padding() {
                n_padding += 1;
                if i + 1 != self.records.len() {
                    return Err(WalbError::BadFormat("padding record not last".into()));
                }
            }
            if !rec.is_discard() {
                io_size_pb += rec.io_size_pb(self.pbs);
            }
        }
        if n_padding != self.n_padding || n_padding > 1 {
            return Err(WalbError::BadFormat("n_padding".into()));
        }
        if io_size_pb != self.total_io_size {
            return Err(WalbError::BadFormat(format!(
                "total_io_size {} != {}",
                self.total_io_size, io_size_pb
            )));
        }
        Ok(())
    }
}
