//! Log record codec.
//!
//! ## Record Format (32 bytes, little-endian)
//!
//! ```text
//! +----------+--------+------------+---------+--------+-------+
//! | checksum |  lsid  | lsid_local | io_size | offset | flags |
//! | 4 bytes  | 8 bytes|  4 bytes   | 4 bytes | 8 bytes| 4 b   |
//! +----------+--------+------------+---------+--------+-------+
//! ```
//!
//! `offset` and `io_size` are in logical blocks on the target device.

use crate::block::capacity_pb;

/// Encoded size of one log record.
pub const LOG_RECORD_SIZE: usize = 32;

/// Record is in use.
pub const LOG_RECORD_EXIST: u32 = 1 << 0;
/// Record is filler aligning the next pack to a physical block.
pub const LOG_RECORD_PADDING: u32 = 1 << 1;
/// Record is a deallocation hint and carries no payload.
pub const LOG_RECORD_DISCARD: u32 = 1 << 2;

/// One IO recorded in a log pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogRecord {
    /// Salted checksum of the payload blocks; unused for discard and padding.
    pub checksum: u32,
    /// Logical sequence number of the first payload block.
    pub lsid: u64,
    /// `lsid - pack lsid`.
    pub lsid_local: u32,
    /// IO size in logical blocks.
    pub io_size: u32,
    /// Target offset in logical blocks.
    pub offset: u64,
    /// `LOG_RECORD_*` bits.
    pub flags: u32,
}

impl LogRecord {
    /// LSID of the pack this record belongs to.
    pub fn pack_lsid(&self) -> u64 {
        self.lsid - self.lsid_local as u64
    }

    /// Whether the record slot is in use.
    pub fn is_exist(&self) -> bool {
        self.flags & LOG_RECORD_EXIST != 0
    }

    /// Whether this is a padding record.
    pub fn is_padding(&self) -> bool {
        self.flags & LOG_RECORD_PADDING != 0
    }

    /// Whether this is a discard record.
    pub fn is_discard(&self) -> bool {
        self.flags & LOG_RECORD_DISCARD != 0
    }

    /// Whether payload blocks follow in the log stream.
    pub fn has_data(&self) -> bool {
        self.is_exist() && !self.is_discard()
    }

    /// Whether the payload checksum field is meaningful.
    pub fn has_data_for_checksum(&self) -> bool {
        self.is_exist() && !self.is_discard() && !self.is_padding()
    }

    /// IO size in physical blocks.
    pub fn io_size_pb(&self, pbs: u32) -> u32 {
        capacity_pb(pbs, self.io_size)
    }

    /// IO size in logical blocks.
    pub fn io_size_lb(&self) -> u32 {
        self.io_size
    }

    /// Structural validity of the record in isolation.
    pub fn is_valid(&self) -> bool {
        if !self.is_exist() {
            return false;
        }
        if self.is_padding() && self.is_discard() {
            return false;
        }
        if self.lsid_local as u64 > self.lsid {
            return false;
        }
        true
    }

    /// Serialize into `buf[..LOG_RECORD_SIZE]`.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= LOG_RECORD_SIZE);
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..12].copy_from_slice(&self.lsid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.lsid_local.to_le_bytes());
        buf[16..20].copy_from_slice(&self.io_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
    }

    /// Deserialize from `buf[..LOG_RECORD_SIZE]`.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= LOG_RECORD_SIZE);
        Self {
            checksum: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            lsid: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            lsid_local: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            io_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let rec = LogRecord {
            checksum: 0x1234_5678,
            lsid: 100,
            lsid_local: 3,
            io_size: 16,
            offset: 4096,
            flags: LOG_RECORD_EXIST,
        };
        let mut buf = [0u8; LOG_RECORD_SIZE];
        rec.encode(&mut buf);
        assert_eq!(LogRecord::decode(&buf), rec);
        assert_eq!(rec.pack_lsid(), 97);
    }

    #[test]
    fn test_flags() {
        let mut rec = LogRecord {
            flags: LOG_RECORD_EXIST,
            ..Default::default()
        };
        assert!(rec.is_exist());
        assert!(rec.has_data());
        assert!(rec.has_data_for_checksum());

        rec.flags |= LOG_RECORD_DISCARD;
        assert!(!rec.has_data());
        assert!(!rec.has_data_for_checksum());

        rec.flags = LOG_RECORD_EXIST | LOG_RECORD_PADDING;
        assert!(rec.has_data());
        assert!(!rec.has_data_for_checksum());
    }

    #[test]
    fn test_is_valid() {
        let mut rec = LogRecord::default();
        assert!(!rec.is_valid());
        rec.flags = LOG_RECORD_EXIST;
        assert!(rec.is_valid());
        rec.flags = LOG_RECORD_EXIST | LOG_RECORD_PADDING | LOG_RECORD_DISCARD;
        assert!(!rec.is_valid());
    }

    #[test]
    fn test_io_size_pb() {
        let rec = LogRecord {
            io_size: 9,
            flags: LOG_RECORD_EXIST,
            ..Default::default()
        };
        assert_eq!(rec.io_size_pb(4096), 2);
        assert_eq!(rec.io_size_pb(512), 9);
    }
}
