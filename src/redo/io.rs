//! Redo IO objects, the coalescing queue, and the overlap map.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::MAX_IO_SIZE;
use crate::redo::pool::Block;

/// Process-wide sequence id generator; feeds ordering tie-breaks and debug
/// output only.
static SEQUENCE_ID: AtomicU64 = AtomicU64::new(0);

fn next_sequence_id() -> u64 {
    SEQUENCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// What an IO writes; only IOs of the same kind coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// Log payload data.
    Data,
    /// Zero blocks substituted for a discard.
    Zero,
}

/// One outstanding device write.
pub struct Io {
    /// Target offset in bytes.
    pub offset: u64,
    /// Write size in bytes.
    pub size: usize,
    /// Key of the submitted async write.
    pub aio_key: u32,
    /// Whether the write was handed to the ring.
    pub submitted: bool,
    /// Whether the completion was awaited.
    pub completed: bool,
    /// Whether a later IO fully covers this one.
    pub overwritten: bool,
    /// Live overlapping IOs that must complete first.
    pub n_overlapped: u32,
    /// Tie-break and debug id.
    pub sequence_id: u64,
    /// Payload buffers; physically contiguous across the run.
    blocks: VecDeque<Block>,
    /// Payload kind.
    pub kind: IoKind,
}

/// Shared handle: one IO is referenced from the FIFO queue, the ready and
/// submit queues, and the overlap map at once.
pub type IoPtr = Rc<RefCell<Io>>;

impl Io {
    /// New data IO owning one block.
    pub fn new_ptr(offset: u64, size: usize, block: Block) -> IoPtr {
        Self::with_kind(offset, size, block, IoKind::Data)
    }

    /// New IO of an explicit kind.
    pub fn with_kind(offset: u64, size: usize, block: Block, kind: IoKind) -> IoPtr {
        let mut blocks = VecDeque::new();
        blocks.push_back(block);
        Rc::new(RefCell::new(Io {
            offset,
            size,
            aio_key: 0,
            submitted: false,
            completed: false,
            overwritten: false,
            n_overlapped: 0,
            sequence_id: next_sequence_id(),
            blocks,
            kind,
        }))
    }

    /// One past the last byte written.
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Pointer to the start of the (contiguous) payload.
    pub fn first_block_ptr(&self) -> *const u8 {
        self.blocks.front().expect("io has payload").as_ptr()
    }

    /// Whether the byte ranges of `self` and `other` intersect.
    pub fn is_overlapped(&self, other: &Io) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Whether `other` fully covers `self`.
    pub fn is_overwritten_by(&self, other: &Io) -> bool {
        other.offset <= self.offset && self.end() <= other.end()
    }

    /// Mark fully overwritten; an unsubmitted IO frees its payload early.
    pub fn mark_overwritten(&mut self) {
        if !self.overwritten {
            self.overwritten = true;
            if !self.submitted {
                self.blocks.clear();
            }
        }
    }

    /// Free payload blocks after completion, returning them to the pool.
    pub fn release_blocks(&mut self) {
        self.blocks.clear();
    }

    /// Whether an IO can be merged onto the tail of this one: same kind,
    /// adjacent on the device, physically contiguous buffers, and within
    /// the size cap.
    fn can_merge(&self, next: &Io) -> bool {
        if self.kind != next.kind {
            return false;
        }
        if self.blocks.is_empty() || next.blocks.is_empty() {
            return false;
        }
        if self.end() != next.offset {
            return false;
        }
        if self.size + next.size > MAX_IO_SIZE {
            return false;
        }
        // The payload run must stay contiguous in memory.
        (self.first_block_ptr() as usize) + self.size == next.first_block_ptr() as usize
    }

    /// Merge `next` into this IO, taking its blocks.
    fn merge(&mut self, next: &mut Io) {
        debug_assert!(self.can_merge(next));
        self.size += next.size;
        self.blocks.append(&mut next.blocks);
    }
}

/// Staging queue that coalesces each added IO with the queue tail.
pub struct IoQueue {
    q: VecDeque<IoPtr>,
}

impl IoQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self { q: VecDeque::new() }
    }

    /// Add an IO, merging it into the tail when possible.
    pub fn add(&mut self, iop: IoPtr) {
        if let Some(back) = self.q.back() {
            let mut back_mut = back.borrow_mut();
            let mut io = iop.borrow_mut();
            if back_mut.can_merge(&io) {
                back_mut.merge(&mut io);
                return;
            }
        }
        self.q.push_back(iop);
    }

    /// Take the oldest staged IO.
    pub fn pop(&mut self) -> Option<IoPtr> {
        self.q.pop_front()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Address-ordered map of live IOs used to serialize overlapping writes.
///
/// Keys are `(offset, sequence_id)` so IOs at the same offset coexist.
/// Range scans are bounded on the left by the largest live IO size.
pub struct OverlappedData {
    set: BTreeMap<(u64, u64), IoPtr>,
    max_size: usize,
}

impl OverlappedData {
    /// Empty map.
    pub fn new() -> Self {
        Self {
            set: BTreeMap::new(),
            max_size: 0,
        }
    }

    /// Whether no IO is tracked.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Track a new IO: count its live overlaps into `n_overlapped` and mark
    /// existing IOs it fully covers as overwritten.
    pub fn insert(&mut self, iop: &IoPtr) {
        let mut io = iop.borrow_mut();
        let key0 = io.offset.saturating_sub(self.max_size as u64);
        let key1 = io.end();

        io.n_overlapped = 0;
        for (_, p) in self.set.range((key0, 0)..(key1, u64::MAX)) {
            let mut p = p.borrow_mut();
            if p.is_overlapped(&io) {
                io.n_overlapped += 1;
                if p.is_overwritten_by(&io) {
                    p.mark_overwritten();
                }
            }
        }

        let key = (io.offset, io.sequence_id);
        self.max_size = self.max_size.max(io.size);
        drop(io);
        self.set.insert(key, Rc::clone(iop));
    }

    /// Untrack a finished IO and decrement its overlap peers; peers whose
    /// count reaches zero are pushed to `unblocked` in map order.
    pub fn remove(&mut self, iop: &IoPtr, unblocked: &mut VecDeque<IoPtr>) {
        let io = iop.borrow();
        debug_assert_eq!(io.n_overlapped, 0);
        let removed = self.set.remove(&(io.offset, io.sequence_id));
        debug_assert!(removed.is_some());
        if self.set.is_empty() {
            self.max_size = 0;
        }

        let key0 = io.offset.saturating_sub(self.max_size as u64);
        let key1 = io.end();
        for (_, p) in self.set.range((key0, 0)..(key1, u64::MAX)) {
            let mut peer = p.borrow_mut();
            if peer.is_overlapped(&io) {
                peer.n_overlapped -= 1;
                if peer.n_overlapped == 0 {
                    drop(peer);
                    unblocked.push_back(Rc::clone(p));
                }
            }
        }
    }
}

impl Default for OverlappedData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::pool::BlockPool;

    fn make_io(pool: &BlockPool, offset: u64, size: usize) -> IoPtr {
        Io::new_ptr(offset, size, pool.alloc())
    }

    #[test]
    fn test_queue_merges_adjacent_contiguous() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let mut q = IoQueue::new();
        for i in 0..4u64 {
            q.add(make_io(&pool, i * 512, 512));
        }
        let merged = q.pop().unwrap();
        assert_eq!(merged.borrow().size, 4 * 512);
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_does_not_merge_gap() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let mut q = IoQueue::new();
        q.add(make_io(&pool, 0, 512));
        q.add(make_io(&pool, 2 * 512, 512));
        assert_eq!(q.pop().unwrap().borrow().size, 512);
        assert_eq!(q.pop().unwrap().borrow().size, 512);
    }

    #[test]
    fn test_queue_does_not_merge_noncontiguous_buffers() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let a = make_io(&pool, 0, 512);
        let skipped = pool.alloc(); // burn a slot to break contiguity
        let b = make_io(&pool, 512, 512);
        let mut q = IoQueue::new();
        q.add(a);
        q.add(b);
        drop(skipped);
        assert_eq!(q.pop().unwrap().borrow().size, 512);
        assert!(!q.is_empty());
    }

    #[test]
    fn test_queue_does_not_merge_kinds() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let a = Io::with_kind(0, 512, pool.alloc(), IoKind::Data);
        let b = Io::with_kind(512, 512, pool.alloc(), IoKind::Zero);
        let mut q = IoQueue::new();
        q.add(a);
        q.add(b);
        assert_eq!(q.pop().unwrap().borrow().size, 512);
        assert!(!q.is_empty());
    }

    #[test]
    fn test_merge_respects_max_io_size() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let a = make_io(&pool, 0, 512);
        a.borrow_mut().size = MAX_IO_SIZE; // pretend it is already maximal
        let b = make_io(&pool, MAX_IO_SIZE as u64, 512);
        let mut q = IoQueue::new();
        q.q.push_back(a);
        q.add(b);
        assert_eq!(q.q.len(), 2);
    }

    #[test]
    fn test_overlap_counting_and_overwrite() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let mut ol = OverlappedData::new();

        let a = make_io(&pool, 0, 1024);
        let b = make_io(&pool, 512, 512); // overlaps a
        let c = make_io(&pool, 0, 2048); // covers both

        ol.insert(&a);
        assert_eq!(a.borrow().n_overlapped, 0);
        ol.insert(&b);
        assert_eq!(b.borrow().n_overlapped, 1);
        ol.insert(&c);
        assert_eq!(c.borrow().n_overlapped, 2);
        assert!(a.borrow().overwritten);
        assert!(b.borrow().overwritten);

        // Completing a unblocks b and leaves c waiting on b.
        let mut unblocked = VecDeque::new();
        ol.remove(&a, &mut unblocked);
        assert_eq!(unblocked.len(), 1);
        assert!(Rc::ptr_eq(&unblocked[0], &b));
        assert_eq!(c.borrow().n_overlapped, 1);

        let mut unblocked = VecDeque::new();
        ol.remove(&b, &mut unblocked);
        assert_eq!(unblocked.len(), 1);
        assert!(Rc::ptr_eq(&unblocked[0], &c));
        assert_eq!(c.borrow().n_overlapped, 0);

        let mut unblocked = VecDeque::new();
        ol.remove(&c, &mut unblocked);
        assert!(unblocked.is_empty());
        assert!(ol.is_empty());
    }

    #[test]
    fn test_overlap_same_offset_pair() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let mut ol = OverlappedData::new();
        let a = make_io(&pool, 0, 512);
        let b = make_io(&pool, 0, 512);
        ol.insert(&a);
        ol.insert(&b);
        assert!(a.borrow().overwritten);
        assert_eq!(b.borrow().n_overlapped, 1);

        let mut unblocked = VecDeque::new();
        ol.remove(&a, &mut unblocked);
        assert_eq!(unblocked.len(), 1);
        assert!(Rc::ptr_eq(&unblocked[0], &b));
    }

    #[test]
    fn test_overwritten_unsubmitted_releases_blocks() {
        let pool = BlockPool::new(2, 512, 4096).unwrap();
        let a = make_io(&pool, 0, 512);
        assert_eq!(pool.available(), 1);
        a.borrow_mut().mark_overwritten();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_sequence_ids_increase() {
        let pool = BlockPool::new(4, 512, 4096).unwrap();
        let a = make_io(&pool, 0, 512);
        let b = make_io(&pool, 0, 512);
        assert!(a.borrow().sequence_id < b.borrow().sequence_id);
    }
}
