//! Diff payload buffers and the snappy codec.

use crate::block::{checksum, is_all_zero};
use crate::constants::LOGICAL_BLOCK_SIZE;
use crate::diff::record::{DiffRecord, DIFF_CMPR_NONE, DIFF_CMPR_SNAPPY};
use crate::error::{Result, WalbError};

/// Owned payload of one diff record.
///
/// All-zero and discard records are represented by an empty payload with
/// `io_blocks == 0`; their region size lives in the [`DiffRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffIo {
    /// Logical blocks covered; 0 for payload-less records.
    pub io_blocks: u16,
    /// `DIFF_CMPR_*` encoding of `data`.
    pub compression_type: u8,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl DiffIo {
    /// The empty payload used by all-zero and discard records.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload for a normal record.
    pub fn new(io_blocks: u16, compression_type: u8, data: Vec<u8>) -> Self {
        Self {
            io_blocks,
            compression_type,
            data,
        }
    }

    /// Whether this payload is empty.
    pub fn is_empty(&self) -> bool {
        self.io_blocks == 0
    }

    /// Whether the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression_type != DIFF_CMPR_NONE
    }

    /// Consistency with payload-size rules.
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return self.data.is_empty();
        }
        if self.is_compressed() {
            return !self.data.is_empty();
        }
        self.data.len() == self.io_blocks as usize * LOGICAL_BLOCK_SIZE
    }

    /// Checksum of the stored payload (salt 0); 0 when empty.
    pub fn calc_checksum(&self) -> u32 {
        if self.data.is_empty() {
            return 0;
        }
        checksum(&self.data, 0)
    }

    /// Whether an uncompressed payload is entirely zero.
    pub fn calc_is_all_zero(&self) -> bool {
        if self.is_compressed() || self.data.is_empty() {
            return false;
        }
        is_all_zero(&self.data)
    }

    /// Compress with snappy. The payload must be uncompressed.
    pub fn compress(&self) -> Result<DiffIo> {
        if self.is_compressed() {
            return Err(WalbError::Arg(
                "can not compress an already compressed diff IO".into(),
            ));
        }
        if self.is_empty() {
            return Ok(DiffIo::empty());
        }
        let data = snap::raw::Encoder::new()
            .compress_vec(&self.data)
            .map_err(|e| WalbError::BadFormat(format!("snappy compress: {e}")))?;
        Ok(DiffIo {
            io_blocks: self.io_blocks,
            compression_type: DIFF_CMPR_SNAPPY,
            data,
        })
    }

    /// Uncompress a snappy payload; the result must be exactly
    /// `io_blocks * 512` bytes.
    pub fn uncompress(&self) -> Result<DiffIo> {
        if !self.is_compressed() {
            return Err(WalbError::Arg(
                "need not uncompress an uncompressed diff IO".into(),
            ));
        }
        let data = snap::raw::Decoder::new()
            .decompress_vec(&self.data)
            .map_err(|e| WalbError::BadFormat(format!("snappy uncompress: {e}")))?;
        let expected = self.io_blocks as usize * LOGICAL_BLOCK_SIZE;
        if data.len() != expected {
            return Err(WalbError::BadFormat(format!(
                "uncompressed size {} != {expected}",
                data.len()
            )));
        }
        Ok(DiffIo {
            io_blocks: self.io_blocks,
            compression_type: DIFF_CMPR_NONE,
            data,
        })
    }

    /// Uncompress in place when compressed; no-op otherwise.
    pub fn uncompress_if_needed(&mut self) -> Result<()> {
        if self.is_compressed() {
            *self = self.uncompress()?;
        }
        Ok(())
    }

    /// Split an uncompressed payload into chunks of at most `max_blocks`.
    pub fn split_all(&self, max_blocks: u16) -> Result<Vec<DiffIo>> {
        if max_blocks == 0 {
            return Err(WalbError::Arg("max_blocks must not be 0".into()));
        }
        if self.is_compressed() {
            return Err(WalbError::Arg("can not split a compressed IO".into()));
        }
        let mut out = Vec::new();
        let mut off = 0usize;
        let mut remaining = self.io_blocks;
        while remaining > 0 {
            let blocks = remaining.min(max_blocks);
            let size = blocks as usize * LOGICAL_BLOCK_SIZE;
            out.push(DiffIo {
                io_blocks: blocks,
                compression_type: DIFF_CMPR_NONE,
                data: self.data[off..off + size].to_vec(),
            });
            off += size;
            remaining -= blocks;
        }
        debug_assert_eq!(off, self.data.len());
        Ok(out)
    }

    /// Build the payload matching `rec`: empty for non-normal records,
    /// `data` as-is otherwise.
    pub fn from_record(rec: &DiffRecord, data: Vec<u8>) -> Self {
        if !rec.is_normal() {
            return Self::empty();
        }
        Self {
            io_blocks: rec.io_blocks,
            compression_type: rec.compression_type,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_io(blocks: u16) -> DiffIo {
        let data: Vec<u8> = (0..blocks as usize * LOGICAL_BLOCK_SIZE)
            .map(|i| (i % 7) as u8)
            .collect();
        DiffIo::new(blocks, DIFF_CMPR_NONE, data)
    }

    #[test]
    fn test_compress_roundtrip() {
        let io = sample_io(4);
        let compressed = io.compress().unwrap();
        assert!(compressed.is_compressed());
        assert!(compressed.data.len() < io.data.len());
        let restored = compressed.uncompress().unwrap();
        assert_eq!(restored, io);
    }

    #[test]
    fn test_double_compress_rejected() {
        let io = sample_io(1);
        let c = io.compress().unwrap();
        assert!(c.compress().is_err());
        assert!(io.uncompress().is_err());
    }

    #[test]
    fn test_uncompress_wrong_length() {
        let io = sample_io(2);
        let mut c = io.compress().unwrap();
        c.io_blocks = 4; // lies about the region size
        assert!(c.uncompress().is_err());
    }

    #[test]
    fn test_checksum_and_allzero() {
        let io = sample_io(1);
        assert_ne!(io.calc_checksum(), 0);
        assert!(!io.calc_is_all_zero());

        let zeros = DiffIo::new(1, DIFF_CMPR_NONE, vec![0u8; 512]);
        assert!(zeros.calc_is_all_zero());
        assert_eq!(DiffIo::empty().calc_checksum(), 0);
    }

    #[test]
    fn test_split_all() {
        let io = sample_io(5);
        let parts = io.split_all(2).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].io_blocks, 2);
        assert_eq!(parts[2].io_blocks, 1);
        let rejoined: Vec<u8> = parts.iter().flat_map(|p| p.data.clone()).collect();
        assert_eq!(rejoined, io.data);
    }

    #[test]
    fn test_is_valid() {
        assert!(DiffIo::empty().is_valid());
        assert!(sample_io(1).is_valid());
        let bad = DiffIo::new(2, DIFF_CMPR_NONE, vec![0u8; 100]);
        assert!(!bad.is_valid());
    }
}
