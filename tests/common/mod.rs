//! Shared fixture builders for the end-to-end tests.
#![allow(dead_code)] // each test binary uses a subset

use uuid::Uuid;

use walb::diff::file::{DiffFileHeader, DiffReader, DiffWriter};
use walb::diff::io::DiffIo;
use walb::diff::record::{DiffRecord, DIFF_CMPR_NONE};
use walb::log::file::{LogWriter, WlogHeader};

/// One entry of a test wlog.
pub enum WlogEntry {
    /// Normal write of `data` (length = blocks * 512) at `offset` LB.
    Normal { offset: u64, data: Vec<u8> },
    /// Discard of `size` LB at `offset`.
    Discard { offset: u64, size: u32 },
    /// Padding of `size` LB (pbs-aligned).
    Padding { size: u32 },
}

/// Build a complete wlog byte stream; returns the stream and its end LSID.
pub fn build_wlog(
    pbs: u32,
    salt: u32,
    uuid: Uuid,
    begin_lsid: u64,
    entries: &[WlogEntry],
) -> (Vec<u8>, u64) {
    let mut w = LogWriter::new(Vec::new());
    w.write_header(&WlogHeader {
        pbs,
        salt,
        uuid,
        begin_lsid,
        end_lsid: begin_lsid,
    })
    .unwrap();
    for entry in entries {
        let added = match entry {
            WlogEntry::Normal { offset, data } => {
                let size = (data.len() / 512) as u32;
                w.add_normal(*offset, size, data).unwrap()
            }
            WlogEntry::Discard { offset, size } => w.add_discard(*offset, *size).unwrap(),
            WlogEntry::Padding { size } => w.add_padding(*size).unwrap(),
        };
        if !added {
            w.flush_pack().unwrap();
            let retried = match entry {
                WlogEntry::Normal { offset, data } => {
                    let size = (data.len() / 512) as u32;
                    w.add_normal(*offset, size, data).unwrap()
                }
                WlogEntry::Discard { offset, size } => w.add_discard(*offset, *size).unwrap(),
                WlogEntry::Padding { size } => w.add_padding(*size).unwrap(),
            };
            assert!(retried, "entry does not fit an empty pack");
        }
    }
    let end_lsid = w.close().unwrap();
    (w.into_inner(), end_lsid)
}

/// One entry of a test wdiff.
#[derive(Clone)]
pub enum WdiffEntry {
    /// Normal write filled with `byte`.
    Normal { addr: u64, blocks: u16, byte: u8 },
    /// All-zero region.
    AllZero { addr: u64, blocks: u16 },
    /// Discard region.
    Discard { addr: u64, blocks: u16 },
}

/// Build a complete wdiff byte stream (uncompressed payloads).
pub fn build_wdiff(uuid: Uuid, entries: &[WdiffEntry]) -> Vec<u8> {
    let mut w = DiffWriter::new(Vec::new());
    w.write_header(&DiffFileHeader {
        max_io_blocks: 0,
        uuid,
    })
    .unwrap();
    for entry in entries {
        match *entry {
            WdiffEntry::Normal { addr, blocks, byte } => {
                let rec = DiffRecord::new_normal(addr, blocks);
                let io = DiffIo::new(blocks, DIFF_CMPR_NONE, vec![byte; blocks as usize * 512]);
                w.add(rec, io).unwrap();
            }
            WdiffEntry::AllZero { addr, blocks } => {
                w.add(DiffRecord::new_all_zero(addr, blocks), DiffIo::empty())
                    .unwrap();
            }
            WdiffEntry::Discard { addr, blocks } => {
                w.add(DiffRecord::new_discard(addr, blocks), DiffIo::empty())
                    .unwrap();
            }
        }
    }
    w.close().unwrap();
    w.into_inner()
}

/// Apply a wdiff stream to an in-memory volume. Discards zero their range,
/// so a restored volume compares byte-for-byte.
pub fn apply_wdiff(volume: &mut [u8], wdiff: &[u8]) {
    let mut r = DiffReader::new(wdiff);
    r.read_header().unwrap();
    while let Some((rec, io)) = r.read_and_uncompress().unwrap() {
        let begin = rec.io_address as usize * 512;
        let end = rec.end_io_address() as usize * 512;
        if rec.is_normal() {
            volume[begin..end].copy_from_slice(&io.data);
        } else {
            volume[begin..end].fill(0);
        }
    }
}

/// Collect `(addr, blocks, payload-or-None)` from a wdiff stream, verifying
/// ordering and non-overlap along the way.
pub fn read_wdiff(wdiff: &[u8]) -> Vec<(u64, u16, Option<Vec<u8>>)> {
    let mut r = DiffReader::new(wdiff);
    r.read_header().unwrap();
    let mut out: Vec<(u64, u16, Option<Vec<u8>>)> = Vec::new();
    let mut prev_end = 0u64;
    while let Some((rec, io)) = r.read_and_uncompress().unwrap() {
        assert!(rec.io_address >= prev_end, "records overlap or are unsorted");
        prev_end = rec.end_io_address();
        let payload = if rec.is_normal() {
            Some(io.data)
        } else {
            None
        };
        out.push((rec.io_address, rec.io_blocks, payload));
    }
    out
}
