//! Diff record codec.
//!
//! ## Record Format (24 bytes, little-endian)
//!
//! ```text
//! +------------+-----------+-------+------+-------------+-----------+----------+
//! | io_address | io_blocks | flags | cmpr | data_offset | data_size | checksum |
//! |  8 bytes   |  2 bytes  |  1 b  | 1 b  |   4 bytes   |  4 bytes  |  4 bytes |
//! +------------+-----------+-------+------+-------------+-----------+----------+
//! ```
//!
//! A record is *normal* iff neither ALLZERO nor DISCARD; non-normal records
//! have `data_size == 0`.

use crate::constants::LOGICAL_BLOCK_SIZE;
use crate::error::{Result, WalbError};

/// Encoded size of one diff record.
pub const DIFF_RECORD_SIZE: usize = 24;

/// Record is in use.
pub const DIFF_FLAG_EXIST: u8 = 1 << 0;
/// Record stands for a fully-zeroed region.
pub const DIFF_FLAG_ALLZERO: u8 = 1 << 1;
/// Record is a deallocation hint.
pub const DIFF_FLAG_DISCARD: u8 = 1 << 2;

/// Payload stored verbatim.
pub const DIFF_CMPR_NONE: u8 = 0;
/// Payload compressed with snappy.
pub const DIFF_CMPR_SNAPPY: u8 = 1;

/// One region of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRecord {
    /// Target address in logical blocks.
    pub io_address: u64,
    /// Region size in logical blocks.
    pub io_blocks: u16,
    /// `DIFF_FLAG_*` bits.
    pub flags: u8,
    /// `DIFF_CMPR_*` payload encoding.
    pub compression_type: u8,
    /// Payload offset within the pack's payload area. Unused in merged
    /// in-memory records.
    pub data_offset: u32,
    /// Payload size in bytes as stored.
    pub data_size: u32,
    /// Checksum of the stored payload, salt 0.
    pub checksum: u32,
}

impl DiffRecord {
    /// Fresh normal record; payload fields are filled by the caller.
    pub fn new_normal(io_address: u64, io_blocks: u16) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: DIFF_FLAG_EXIST,
            compression_type: DIFF_CMPR_NONE,
            data_offset: 0,
            data_size: io_blocks as u32 * LOGICAL_BLOCK_SIZE as u32,
            checksum: 0,
        }
    }

    /// Fresh all-zero record.
    pub fn new_all_zero(io_address: u64, io_blocks: u16) -> Self {
        Self {
            flags: DIFF_FLAG_EXIST | DIFF_FLAG_ALLZERO,
            data_size: 0,
            ..Self::new_normal(io_address, io_blocks)
        }
    }

    /// Fresh discard record.
    pub fn new_discard(io_address: u64, io_blocks: u16) -> Self {
        Self {
            flags: DIFF_FLAG_EXIST | DIFF_FLAG_DISCARD,
            data_size: 0,
            ..Self::new_normal(io_address, io_blocks)
        }
    }

    /// One past the last logical block this record covers.
    pub fn end_io_address(&self) -> u64 {
        self.io_address + self.io_blocks as u64
    }

    /// Whether the record slot is in use.
    pub fn exists(&self) -> bool {
        self.flags & DIFF_FLAG_EXIST != 0
    }

    /// Whether this is an all-zero record.
    pub fn is_all_zero(&self) -> bool {
        self.flags & DIFF_FLAG_ALLZERO != 0
    }

    /// Whether this is a discard record.
    pub fn is_discard(&self) -> bool {
        self.flags & DIFF_FLAG_DISCARD != 0
    }

    /// Whether this record carries payload data.
    pub fn is_normal(&self) -> bool {
        !self.is_all_zero() && !self.is_discard()
    }

    /// Whether the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression_type != DIFF_CMPR_NONE
    }

    /// Structural validity.
    pub fn is_valid(&self) -> bool {
        if !self.exists() {
            return false;
        }
        if !self.is_normal() {
            // ALLZERO and DISCARD are mutually exclusive.
            return !(self.is_all_zero() && self.is_discard()) && self.data_size == 0;
        }
        if self.compression_type > DIFF_CMPR_SNAPPY {
            return false;
        }
        self.io_blocks != 0
    }

    /// Split into two records at `first_blocks`.
    ///
    /// Only uncompressed records can be split; the checksums of the halves
    /// are invalid until recomputed.
    pub fn split(&self, first_blocks: u16) -> Result<(DiffRecord, DiffRecord)> {
        if first_blocks == 0 || first_blocks >= self.io_blocks {
            return Err(WalbError::Arg(format!(
                "split point {first_blocks} out of range (io_blocks {})",
                self.io_blocks
            )));
        }
        if self.is_compressed() {
            return Err(WalbError::Arg("can not split a compressed record".into()));
        }
        let mut r0 = *self;
        let mut r1 = *self;
        let second_blocks = self.io_blocks - first_blocks;
        r0.io_blocks = first_blocks;
        r1.io_blocks = second_blocks;
        r1.io_address = self.io_address + first_blocks as u64;
        if self.is_normal() {
            r0.data_size = first_blocks as u32 * LOGICAL_BLOCK_SIZE as u32;
            r1.data_size = second_blocks as u32 * LOGICAL_BLOCK_SIZE as u32;
        }
        Ok((r0, r1))
    }

    /// Split into consecutive records of at most `max_blocks` each.
    pub fn split_all(&self, max_blocks: u16) -> Result<Vec<DiffRecord>> {
        if max_blocks == 0 {
            return Err(WalbError::Arg("max_blocks must not be 0".into()));
        }
        if self.is_compressed() {
            return Err(WalbError::Arg("can not split a compressed record".into()));
        }
        let mut out = Vec::new();
        let mut addr = self.io_address;
        let mut remaining = self.io_blocks;
        while remaining > 0 {
            let blocks = remaining.min(max_blocks);
            let mut rec = *self;
            rec.io_address = addr;
            rec.io_blocks = blocks;
            if self.is_normal() {
                rec.data_size = blocks as u32 * LOGICAL_BLOCK_SIZE as u32;
            }
            out.push(rec);
            addr += blocks as u64;
            remaining -= blocks;
        }
        Ok(out)
    }

    /// Serialize into `buf[..DIFF_RECORD_SIZE]`.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= DIFF_RECORD_SIZE);
        buf[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        buf[8..10].copy_from_slice(&self.io_blocks.to_le_bytes());
        buf[10] = self.flags;
        buf[11] = self.compression_type;
        buf[12..16].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.data_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Deserialize from `buf[..DIFF_RECORD_SIZE]`.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= DIFF_RECORD_SIZE);
        Self {
            io_address: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            io_blocks: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            flags: buf[10],
            compression_type: buf[11],
            data_offset: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            data_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let rec = DiffRecord {
            io_address: 12345,
            io_blocks: 16,
            flags: DIFF_FLAG_EXIST,
            compression_type: DIFF_CMPR_SNAPPY,
            data_offset: 100,
            data_size: 2000,
            checksum: 0xdeadbeef,
        };
        let mut buf = [0u8; DIFF_RECORD_SIZE];
        rec.encode(&mut buf);
        assert_eq!(DiffRecord::decode(&buf), rec);
    }

    #[test]
    fn test_kinds() {
        assert!(DiffRecord::new_normal(0, 8).is_normal());
        assert!(DiffRecord::new_all_zero(0, 8).is_all_zero());
        assert!(DiffRecord::new_discard(0, 8).is_discard());
        assert!(DiffRecord::new_all_zero(0, 8).is_valid());
        assert_eq!(DiffRecord::new_normal(10, 8).end_io_address(), 18);
    }

    #[test]
    fn test_allzero_discard_exclusive() {
        let mut rec = DiffRecord::new_all_zero(0, 8);
        rec.flags |= DIFF_FLAG_DISCARD;
        assert!(!rec.is_valid());
    }

    #[test]
    fn test_split() {
        let rec = DiffRecord::new_normal(100, 10);
        let (a, b) = rec.split(4).unwrap();
        assert_eq!((a.io_address, a.io_blocks), (100, 4));
        assert_eq!((b.io_address, b.io_blocks), (104, 6));
        assert_eq!(a.data_size, 4 * 512);
        assert_eq!(b.data_size, 6 * 512);

        assert!(rec.split(0).is_err());
        assert!(rec.split(10).is_err());
    }

    #[test]
    fn test_split_compressed_rejected() {
        let mut rec = DiffRecord::new_normal(0, 10);
        rec.compression_type = DIFF_CMPR_SNAPPY;
        assert!(rec.split(4).is_err());
        assert!(rec.split_all(4).is_err());
    }

    #[test]
    fn test_split_all() {
        let rec = DiffRecord::new_discard(10, 10);
        let parts = rec.split_all(4).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts
                .iter()
                .map(|r| (r.io_address, r.io_blocks))
                .collect::<Vec<_>>(),
            vec![(10, 4), (14, 4), (18, 2)]
        );
        assert!(parts.iter().all(|r| r.is_discard()));
    }
}
