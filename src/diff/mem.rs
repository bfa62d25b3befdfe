//! Address-ordered, non-overlapping in-memory diff map.
//!
//! The map holds owned `(record, payload)` pairs keyed by `io_address`.
//! Insertion resolves overlaps in favor of the newcomer: every existing
//! entry intersecting the new range is removed and re-inserted as zero, one
//! or two trimmed entries, so at any point no two entries overlap and
//! iteration is in ascending address order.

use std::collections::BTreeMap;
use std::io::Write;

use crate::constants::LOGICAL_BLOCK_SIZE;
use crate::diff::file::DiffWriter;
use crate::diff::io::DiffIo;
use crate::diff::record::DiffRecord;
use crate::error::{Result, WalbError};

/// One owned diff entry: record plus payload.
#[derive(Debug, Clone)]
pub struct DiffRecIo {
    /// The record.
    pub rec: DiffRecord,
    /// The payload; empty for all-zero and discard records.
    pub io: DiffIo,
}

impl DiffRecIo {
    /// Pair a record with its payload.
    pub fn new(rec: DiffRecord, io: DiffIo) -> Self {
        Self { rec, io }
    }

    /// Record/payload consistency.
    pub fn is_valid(&self) -> bool {
        if !self.rec.is_valid() || !self.io.is_valid() {
            return false;
        }
        if !self.rec.is_normal() {
            return self.io.is_empty();
        }
        self.io.io_blocks == self.rec.io_blocks
    }
}

/// Counters over the current map content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffMemStats {
    /// Number of entries.
    pub n_ios: u64,
    /// Logical blocks covered by all entries.
    pub n_blocks: u64,
}

/// The in-memory diff map.
#[derive(Debug, Default)]
pub struct DiffMemory {
    map: BTreeMap<u64, DiffRecIo>,
    max_io_blocks: u32,
}

impl DiffMemory {
    /// Create a map. `max_io_blocks > 0` splits inserted records into
    /// chunks of at most that many logical blocks.
    pub fn new(max_io_blocks: u32) -> Self {
        Self {
            map: BTreeMap::new(),
            max_io_blocks,
        }
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert `(rec, io)`, resolving overlaps in favor of the newcomer.
    pub fn add(&mut self, mut rec: DiffRecord, mut io: DiffIo) -> Result<()> {
        if !rec.is_valid() || rec.io_blocks == 0 {
            return Err(WalbError::Arg("invalid diff record".into()));
        }
        io.uncompress_if_needed()?;
        if rec.is_normal() {
            rec.compression_type = io.compression_type;
            rec.data_size = io.data.len() as u32;
        }
        let recio = DiffRecIo::new(rec, io);
        if !recio.is_valid() {
            return Err(WalbError::Arg("record/payload mismatch".into()));
        }
        let (rec, io) = (recio.rec, recio.io);

        // Collect entries intersecting [rec.io_address, rec.end_io_address).
        // Entries are non-overlapping, so walking backwards from the end of
        // the range stops at the first entry ending at or before the start.
        let mut hit_keys = Vec::new();
        for (&addr, e) in self.map.range(..rec.end_io_address()).rev() {
            if e.rec.end_io_address() <= rec.io_address {
                break;
            }
            hit_keys.push(addr);
        }
        for key in hit_keys {
            let existing = self.map.remove(&key).expect("key just seen");
            for piece in trim_pieces(existing, rec.io_address, rec.end_io_address())? {
                self.map.insert(piece.rec.io_address, piece);
            }
        }

        // Insert the newcomer, split when it exceeds the configured bound.
        if self.max_io_blocks > 0 && rec.io_blocks as u32 > self.max_io_blocks {
            let recs = rec.split_all(self.max_io_blocks as u16)?;
            let ios = if rec.is_normal() {
                io.split_all(self.max_io_blocks as u16)?
            } else {
                vec![DiffIo::empty(); recs.len()]
            };
            for (mut r, i) in recs.into_iter().zip(ios) {
                r.checksum = i.calc_checksum();
                self.map.insert(r.io_address, DiffRecIo::new(r, i));
            }
        } else {
            self.map.insert(rec.io_address, DiffRecIo::new(rec, io));
        }
        Ok(())
    }

    /// In-order traversal.
    pub fn iter(&self) -> impl Iterator<Item = &DiffRecIo> {
        self.map.values()
    }

    /// Remove and return the smallest-address entry.
    pub fn extract_first(&mut self) -> Option<DiffRecIo> {
        self.map.pop_first().map(|(_, v)| v)
    }

    /// The smallest-address entry without removing it.
    pub fn first(&self) -> Option<&DiffRecIo> {
        self.map.values().next()
    }

    /// Current counters.
    pub fn stats(&self) -> DiffMemStats {
        DiffMemStats {
            n_ios: self.map.len() as u64,
            n_blocks: self.map.values().map(|e| e.rec.io_blocks as u64).sum(),
        }
    }

    /// Serialize all entries into `writer` in address order.
    pub fn write_to<W: Write>(self, writer: &mut DiffWriter<W>) -> Result<()> {
        for (_, e) in self.map {
            writer.add(e.rec, e.io)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut prev_end = 0u64;
        for (addr, e) in &self.map {
            assert_eq!(*addr, e.rec.io_address);
            assert!(e.rec.io_address >= prev_end, "entries overlap");
            assert!(e.is_valid());
            prev_end = e.rec.end_io_address();
        }
    }
}

/// Produce the surviving pieces of `existing` outside `[new_start, new_end)`.
fn trim_pieces(mut existing: DiffRecIo, new_start: u64, new_end: u64) -> Result<Vec<DiffRecIo>> {
    let ex_start = existing.rec.io_address;
    let ex_end = existing.rec.end_io_address();
    debug_assert!(ex_start < new_end && new_start < ex_end);

    // Fully covered: the newcomer replaces it outright.
    if new_start <= ex_start && ex_end <= new_end {
        return Ok(Vec::new());
    }

    // Slicing needs raw bytes.
    if existing.rec.is_normal() {
        existing.io.uncompress_if_needed()?;
        existing.rec.compression_type = existing.io.compression_type;
    }

    let mut out = Vec::with_capacity(2);
    if ex_start < new_start {
        // Keep the head: truncate on the right.
        let blocks = (new_start - ex_start) as u16;
        let mut rec = existing.rec;
        rec.io_blocks = blocks;
        let io = if rec.is_normal() {
            let size = blocks as usize * LOGICAL_BLOCK_SIZE;
            rec.data_size = size as u32;
            DiffIo::new(blocks, rec.compression_type, existing.io.data[..size].to_vec())
        } else {
            DiffIo::empty()
        };
        rec.checksum = io.calc_checksum();
        out.push(DiffRecIo::new(rec, io));
    }
    if new_end < ex_end {
        // Keep the tail: trim on the left.
        let blocks = (ex_end - new_end) as u16;
        let mut rec = existing.rec;
        rec.io_address = new_end;
        rec.io_blocks = blocks;
        let io = if rec.is_normal() {
            let skip = (new_end - ex_start) as usize * LOGICAL_BLOCK_SIZE;
            let size = blocks as usize * LOGICAL_BLOCK_SIZE;
            rec.data_size = size as u32;
            DiffIo::new(
                blocks,
                rec.compression_type,
                existing.io.data[skip..skip + size].to_vec(),
            )
        } else {
            DiffIo::empty()
        };
        rec.checksum = io.calc_checksum();
        out.push(DiffRecIo::new(rec, io));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::record::DIFF_CMPR_NONE;

    fn normal(addr: u64, blocks: u16, byte: u8) -> (DiffRecord, DiffIo) {
        let mut rec = DiffRecord::new_normal(addr, blocks);
        let io = DiffIo::new(blocks, DIFF_CMPR_NONE, vec![byte; blocks as usize * 512]);
        rec.checksum = io.calc_checksum();
        (rec, io)
    }

    fn entries(mem: &DiffMemory) -> Vec<(u64, u16, u8)> {
        mem.iter()
            .map(|e| {
                let byte = if e.rec.is_normal() { e.io.data[0] } else { 0 };
                (e.rec.io_address, e.rec.io_blocks, byte)
            })
            .collect()
    }

    #[test]
    fn test_disjoint_inserts_stay_sorted() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(100, 8, 1);
        mem.add(r, i).unwrap();
        let (r, i) = normal(0, 8, 2);
        mem.add(r, i).unwrap();
        let (r, i) = normal(50, 8, 3);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(entries(&mem), vec![(0, 8, 2), (50, 8, 3), (100, 8, 1)]);
    }

    #[test]
    fn test_full_cover_drops_existing() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(10, 4, 1);
        mem.add(r, i).unwrap();
        let (r, i) = normal(8, 8, 2);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(entries(&mem), vec![(8, 8, 2)]);
    }

    #[test]
    fn test_left_overlap_truncates_existing() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(0, 8, 1);
        mem.add(r, i).unwrap();
        let (r, i) = normal(4, 8, 2);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(entries(&mem), vec![(0, 4, 1), (4, 8, 2)]);
    }

    #[test]
    fn test_right_overlap_trims_existing() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(4, 8, 1);
        mem.add(r, i).unwrap();
        let (r, i) = normal(0, 8, 2);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(entries(&mem), vec![(0, 8, 2), (8, 4, 1)]);
    }

    #[test]
    fn test_straddle_splits_existing() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(100, 100, 0xA);
        mem.add(r, i).unwrap();
        let (r, i) = normal(150, 20, 0xB);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(
            entries(&mem),
            vec![(100, 50, 0xA), (150, 20, 0xB), (170, 30, 0xA)]
        );
    }

    #[test]
    fn test_newcomer_wins_bytes() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(0, 8, 0xAA);
        mem.add(r, i).unwrap();
        let (r, i) = normal(2, 2, 0xBB);
        mem.add(r, i).unwrap();
        mem.assert_invariants();

        // Reconstruct the 8-block range and check byte ownership.
        let mut volume = vec![0u8; 8 * 512];
        for e in mem.iter() {
            let off = e.rec.io_address as usize * 512;
            volume[off..off + e.io.data.len()].copy_from_slice(&e.io.data);
        }
        assert!(volume[..2 * 512].iter().all(|&b| b == 0xAA));
        assert!(volume[2 * 512..4 * 512].iter().all(|&b| b == 0xBB));
        assert!(volume[4 * 512..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_discard_overwrites_normal() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(0, 64, 0xA);
        mem.add(r, i).unwrap();
        mem.add(DiffRecord::new_discard(16, 16), DiffIo::empty())
            .unwrap();
        mem.assert_invariants();
        let kinds: Vec<_> = mem
            .iter()
            .map(|e| (e.rec.io_address, e.rec.io_blocks, e.rec.is_discard()))
            .collect();
        assert_eq!(kinds, vec![(0, 16, false), (16, 16, true), (32, 32, false)]);
    }

    #[test]
    fn test_normal_trims_allzero() {
        let mut mem = DiffMemory::new(0);
        mem.add(DiffRecord::new_all_zero(0, 16), DiffIo::empty())
            .unwrap();
        let (r, i) = normal(4, 4, 0xC);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        let kinds: Vec<_> = mem
            .iter()
            .map(|e| (e.rec.io_address, e.rec.io_blocks, e.rec.is_all_zero()))
            .collect();
        assert_eq!(kinds, vec![(0, 4, true), (4, 4, false), (8, 8, true)]);
    }

    #[test]
    fn test_compressed_existing_is_uncompressed_before_trim() {
        let mut mem = DiffMemory::new(0);
        let (mut rec, io) = normal(0, 8, 0xDD);
        let compressed = io.compress().unwrap();
        rec.compression_type = compressed.compression_type;
        rec.data_size = compressed.data.len() as u32;
        rec.checksum = compressed.calc_checksum();
        mem.add(rec, compressed).unwrap();

        let (r, i) = normal(4, 2, 0xEE);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        let e: Vec<_> = mem.iter().collect();
        assert_eq!(e.len(), 3);
        assert!(e.iter().all(|x| !x.rec.is_compressed()));
        assert!(e[0].io.data.iter().all(|&b| b == 0xDD));
        assert!(e[2].io.data.iter().all(|&b| b == 0xDD));
    }

    #[test]
    fn test_split_on_max_io_blocks() {
        let mut mem = DiffMemory::new(4);
        let (r, i) = normal(0, 10, 0x1);
        mem.add(r, i).unwrap();
        mem.assert_invariants();
        assert_eq!(entries(&mem), vec![(0, 4, 1), (4, 4, 1), (8, 2, 1)]);
        // Split checksums are recomputed.
        for e in mem.iter() {
            assert_eq!(e.rec.checksum, e.io.calc_checksum());
        }
    }

    #[test]
    fn test_extract_first_and_stats() {
        let mut mem = DiffMemory::new(0);
        let (r, i) = normal(8, 4, 1);
        mem.add(r, i).unwrap();
        let (r, i) = normal(0, 4, 2);
        mem.add(r, i).unwrap();
        assert_eq!(
            mem.stats(),
            DiffMemStats {
                n_ios: 2,
                n_blocks: 8
            }
        );
        let first = mem.extract_first().unwrap();
        assert_eq!(first.rec.io_address, 0);
        let second = mem.extract_first().unwrap();
        assert_eq!(second.rec.io_address, 8);
        assert!(mem.extract_first().is_none());
    }

    #[test]
    fn test_many_random_adds_keep_invariants() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x57616c42);
        let mut mem = DiffMemory::new(0);
        for _ in 0..500 {
            let addr = rng.gen_range(0..256u64);
            let blocks = rng.gen_range(1..32u16);
            match rng.gen_range(0..3) {
                0 => {
                    let (r, i) = normal(addr, blocks, rng.gen());
                    mem.add(r, i).unwrap();
                }
                1 => mem
                    .add(DiffRecord::new_all_zero(addr, blocks), DiffIo::empty())
                    .unwrap(),
                _ => mem
                    .add(DiffRecord::new_discard(addr, blocks), DiffIo::empty())
                    .unwrap(),
            }
            mem.assert_invariants();
        }
    }
}
