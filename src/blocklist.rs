use core::fmt;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::ALIGNMENT;

/// What a block is currently used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// In the arena, available for reuse.
    Free,
    /// In the arena, handed out to a caller.
    Allocated,
    /// A region of its own, obtained from `mmap`. Never linked into a
    /// `BlockList`.
    Mapped,
}

/// The header preceding every block's payload.
///
/// `prev` and `next` are the neighbors in memory, not an ownership relation:
/// in the arena, `next` starts exactly where this block's payload ends.
///
/// ```text
/// +------------------+ <- header address
/// |  size            |
/// |  status          |
/// |  prev            |
/// |  next            |
/// +------------------+ <- payload address = header address + META_SIZE
/// |  payload         |
/// |  (size bytes)    |
/// +------------------+ <- next header (arena blocks only)
/// ```
#[repr(C, align(8))]
pub struct BlockHeader {
    size: usize,
    prev: Option<Block>,
    next: Option<Block>,
    status: Status,
}

/// Size of a block header. Payloads start this many bytes after their
/// header.
pub const META_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(META_SIZE % ALIGNMENT == 0);

/// An enum for easy comparison of blocks and their order
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a block header somewhere in memory.
///
/// It is `Copy`: the header, not the handle, is the source of truth, and
/// several handles to one header may exist while the list is relinked.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks only ever point into memory owned by the allocator holding the
// list, so moving the whole allocator across threads is fine. There is no
// internal synchronization, hence no Sync.
unsafe impl Send for Block {}

impl Block {
    /// Write a new, unlinked header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGNMENT` and valid for writes of
    /// `META_SIZE + size` bytes, none of which may be tracked by any other
    /// block.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize, status: Status) -> Block {
        let header = ptr.cast::<BlockHeader>();
        header.as_ptr().write(BlockHeader {
            size,
            prev: None,
            next: None,
            status,
        });
        Block { header }
    }

    /// Recover the block owning a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`Block::payload`] of a block
    /// whose header is still intact.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        let header = payload.as_ptr().sub(META_SIZE).cast::<BlockHeader>();
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// Address of the header.
    pub fn addr(&self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    /// The pointer handed to callers.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.addr().add(META_SIZE)) }
    }

    /// One past the last payload byte.
    pub fn end(&self) -> *mut u8 {
        unsafe { self.payload().as_ptr().add(self.size()) }
    }

    /// The whole span of the block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        (self.addr() as *const u8)..(self.end() as *const u8)
    }

    pub fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// Usable payload size in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn status(&self) -> Status {
        self.header_view().status
    }

    pub fn is_free(&self) -> bool {
        self.status() == Status::Free
    }

    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    /// An immutable view of the header
    pub fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This allows changing the size or links of a block in safe code, which
    /// could corrupt the list.
    pub unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// # Safety
    ///
    /// The new size must keep the block inside memory it owns.
    pub unsafe fn set_size(&mut self, size: usize) {
        self.header_mut().size = size;
    }

    /// # Safety
    ///
    /// See [`Block::header_mut`].
    pub unsafe fn set_status(&mut self, status: Status) {
        self.header_mut().status = status;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?}, {}, {:?})", self.header, self.size(), self.status())
    }
}

/// A `BlockList` is the directory of every block in the arena, in address
/// order.
///
/// Invariants, maintained by the methods below:
///
/// - `head` is the arena's first block and `tail` its last.
/// - Each block's `next` starts exactly at that block's end.
/// - `next` and `prev` agree with each other.
///
/// Whether adjacent free blocks exist is up to the caller; see
/// [`Validity::adjacent_frees`].
#[derive(Default)]
pub struct BlockList {
    head: Option<Block>,
    tail: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    marker: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;

        self.next = next.next();

        Some(next)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Pairs of neighboring free blocks that were not coalesced.
    pub adjacent_frees: usize,
    /// Blocks that do not start exactly where the previous one ends, but
    /// after it.
    pub gaps: usize,
    /// Blocks starting inside the previous one. This is corruption.
    pub overlaps: usize,
    /// Blocks at a lower address than the previous one.
    pub out_of_orders: usize,
    /// Blocks whose `prev` is not the block before them.
    pub broken_links: usize,
    /// Blocks whose size is not a multiple of `ALIGNMENT`.
    pub misaligned: usize,
    /// `Mapped` blocks found in the list.
    pub stray_mapped: usize,
    /// Whether `tail` is something other than the last block.
    pub bad_tail: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.adjacent_frees == 0
            && self.gaps == 0
            && self.overlaps == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
            && self.misaligned == 0
            && self.stray_mapped == 0
            && !self.bad_tail
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the list.
    pub length: usize,
    pub free_blocks: usize,
    /// Payload bytes in free blocks.
    pub free_size: usize,
    pub allocated_blocks: usize,
    /// Payload bytes in allocated blocks.
    pub allocated_size: usize,
    /// Bytes between the arena base and its high-water mark. Filled in by
    /// `RawAlloc::stats`.
    pub arena_size: usize,
    /// Live mapped regions. Filled in by `RawAlloc::stats`.
    pub mapped_regions: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList {
            head: None,
            tail: None,
        }
    }

    pub const fn header_size() -> usize {
        META_SIZE
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Write a block at `ptr` and link it in as the new tail.
    ///
    /// # Safety
    ///
    /// `ptr` must satisfy [`Block::from_raw`], and must be the end of the
    /// current tail (or anywhere, if the list is empty).
    pub unsafe fn push_back(&mut self, ptr: NonNull<u8>, size: usize, status: Status) -> Block {
        let mut block = Block::from_raw(ptr, size, status);

        match self.tail {
            None => {
                self.head = Some(block);
            }
            Some(mut tail) => {
                debug_assert_eq!(tail.end(), ptr.as_ptr());
                tail.header_mut().next = Some(block);
                block.header_mut().prev = Some(tail);
            }
        }

        self.tail = Some(block);
        block
    }

    /// Find the smallest free block holding at least `size` bytes. Ties go to
    /// the lowest address.
    pub fn best_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;

        for block in self {
            if !block.is_free() || block.size() < size {
                continue;
            }
            match best {
                Some(b) if b.size() <= block.size() => {}
                _ => best = Some(block),
            }
        }

        best
    }

    /// Shrink `block` to `size` bytes and turn the rest into a new free block
    /// right after it, if the rest can hold a header and at least one more
    /// byte. Returns the new free block.
    ///
    /// The status of `block` is left alone.
    ///
    /// # Safety
    ///
    /// `block` must be in this list, and `size` must be a multiple of
    /// `ALIGNMENT`.
    pub unsafe fn split(&mut self, mut block: Block, size: usize) -> Option<Block> {
        let remaining = block.size().checked_sub(size)?;
        if remaining <= META_SIZE {
            return None;
        }

        let ptr = NonNull::new_unchecked(block.payload().as_ptr().add(size));
        let mut rest = Block::from_raw(ptr, remaining - META_SIZE, Status::Free);
        let next = block.next();

        {
            let header = rest.header_mut();
            header.prev = Some(block);
            header.next = next;
        }
        match next {
            Some(mut next) => next.header_mut().prev = Some(rest),
            None => self.tail = Some(rest),
        }

        let header = block.header_mut();
        header.next = Some(rest);
        header.size = size;

        Some(rest)
    }

    /// Fold the block after `block` into it, header and all, whatever its
    /// status. Returns false if there is no next block.
    ///
    /// # Safety
    ///
    /// `block` must be in this list, and nothing may still be using the next
    /// block's payload.
    pub unsafe fn absorb_next(&mut self, mut block: Block) -> bool {
        let next = match block.next() {
            None => return false,
            Some(n) => n,
        };
        let after = next.next();

        let header = block.header_mut();
        header.size += next.size() + META_SIZE;
        header.next = after;

        match after {
            Some(mut after) => after.header_mut().prev = Some(block),
            None => self.tail = Some(block),
        }

        true
    }

    /// Fold the next block into `block` if it is free.
    ///
    /// # Safety
    ///
    /// `block` must be in this list.
    pub unsafe fn merge_next(&mut self, block: Block) -> bool {
        match block.next() {
            Some(next) if next.is_free() => self.absorb_next(block),
            _ => false,
        }
    }

    /// Check the list's invariants and count what is in it.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for block in self {
            if block.prev() != previous {
                validity.broken_links += 1;
            }
            if block.size() % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }

            if let Some(p) = previous {
                match p.relation(&block) {
                    Relation::AdjacentBefore => {
                        // This is valid, do nothing.
                    }
                    Relation::Before => {
                        validity.gaps += 1;
                    }
                    Relation::Overlapping => {
                        validity.overlaps += 1;
                    }
                    Relation::AdjacentAfter | Relation::After => {
                        validity.out_of_orders += 1;
                    }
                }
                if p.is_free() && block.is_free() {
                    validity.adjacent_frees += 1;
                }
            }

            match block.status() {
                Status::Free => {
                    stats.free_blocks += 1;
                    stats.free_size += block.size();
                }
                Status::Allocated => {
                    stats.allocated_blocks += 1;
                    stats.allocated_size += block.size();
                }
                Status::Mapped => {
                    validity.stray_mapped += 1;
                }
            }

            stats.length += 1;
            previous = Some(block);
        }

        validity.bad_tail = previous != self.tail;

        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn base(buf: &mut [u64]) -> NonNull<u8> {
        NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap()
    }

    // Lay out blocks back to back at the start of `buf`.
    fn build(buf: &mut [u64], blocks: &[(usize, Status)]) -> BlockList {
        let mut list = BlockList::new();
        let mut ptr = base(buf);
        for &(size, status) in blocks {
            let block = unsafe { list.push_back(ptr, size, status) };
            ptr = NonNull::new(block.end()).unwrap();
        }
        list
    }

    fn sizes(list: &BlockList) -> Vec<(usize, Status)> {
        list.iter().map(|b| (b.size(), b.status())).collect()
    }

    #[test]
    fn header_is_aligned() {
        assert_eq!(META_SIZE % ALIGNMENT, 0);
        assert_eq!(BlockList::header_size(), META_SIZE);
    }

    #[test]
    fn payload_round_trip() {
        let mut buf = vec![0u64; 64];
        let list = build(&mut buf, &[(64, Status::Allocated)]);
        let block = list.head().unwrap();

        assert_eq!(block.payload().as_ptr(), unsafe { block.addr().add(META_SIZE) });
        let found = unsafe { Block::from_payload(block.payload()) };
        assert_eq!(found, block);
        assert_eq!(found.size(), 64);
    }

    #[test]
    fn push_back_links() {
        let mut buf = vec![0u64; 256];
        let list = build(
            &mut buf,
            &[
                (64, Status::Allocated),
                (32, Status::Free),
                (128, Status::Allocated),
            ],
        );

        assert_eq!(list.len(), 3);
        let first = list.head().unwrap();
        let last = list.tail().unwrap();
        assert!(first.prev().is_none());
        assert!(last.next().is_none());
        assert_eq!(last.prev().unwrap().next(), Some(last));
        assert_eq!(first.next().unwrap().addr(), first.end());

        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_size, 32);
        assert_eq!(stats.allocated_size, 192);
        log::info!("{}", list);
    }

    #[test]
    fn best_fit_prefers_smallest() {
        let mut buf = vec![0u64; 512];
        let list = build(
            &mut buf,
            &[
                (64, Status::Free),
                (16, Status::Allocated),
                (256, Status::Free),
                (16, Status::Allocated),
                (128, Status::Free),
                (16, Status::Allocated),
            ],
        );

        let found = list.best_fit(104).unwrap();
        assert_eq!(found.size(), 128);

        let found = list.best_fit(8).unwrap();
        assert_eq!(found.size(), 64);

        assert!(list.best_fit(512).is_none());
    }

    #[test]
    fn best_fit_ties_go_to_lowest_address() {
        let mut buf = vec![0u64; 256];
        let list = build(
            &mut buf,
            &[
                (128, Status::Free),
                (16, Status::Allocated),
                (128, Status::Free),
            ],
        );

        let found = list.best_fit(100).unwrap();
        assert_eq!(found, list.head().unwrap());
    }

    #[test]
    fn best_fit_skips_allocated() {
        let mut buf = vec![0u64; 128];
        let list = build(&mut buf, &[(256, Status::Allocated), (64, Status::Free)]);
        assert_eq!(list.best_fit(64).unwrap().size(), 64);
        assert!(list.best_fit(72).is_none());
    }

    #[test]
    fn split_leaves_free_remainder() {
        let mut buf = vec![0u64; 128];
        let mut list = build(&mut buf, &[(256, Status::Free)]);
        let block = list.head().unwrap();

        let rest = unsafe { list.split(block, 104) }.unwrap();

        assert_eq!(
            sizes(&list),
            vec![(104, Status::Free), (256 - 104 - META_SIZE, Status::Free)]
        );
        assert_eq!(rest.addr(), block.end());
        assert_eq!(list.tail(), Some(rest));
        assert_eq!(rest.prev(), Some(block));
    }

    #[test]
    fn split_keeps_tail_when_not_last() {
        let mut buf = vec![0u64; 128];
        let mut list = build(&mut buf, &[(256, Status::Allocated), (64, Status::Allocated)]);
        let block = list.head().unwrap();
        let last = list.tail().unwrap();

        let rest = unsafe { list.split(block, 64) }.unwrap();

        assert_eq!(list.tail(), Some(last));
        assert_eq!(last.prev(), Some(rest));
        assert_eq!(rest.next(), Some(last));
        let (validity, _) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn split_needs_room_for_a_header() {
        let mut buf = vec![0u64; 128];
        let mut list = build(&mut buf, &[(256, Status::Free)]);
        let block = list.head().unwrap();

        // Exactly one header left over: not enough.
        assert!(unsafe { list.split(block, 256 - META_SIZE) }.is_none());
        // Smaller than a header.
        assert!(unsafe { list.split(block, 256 - 8) }.is_none());
        assert!(unsafe { list.split(block, 256) }.is_none());
        assert_eq!(list.len(), 1);
        assert_eq!(block.size(), 256);

        // A header plus eight bytes is enough.
        let rest = unsafe { list.split(block, 256 - META_SIZE - 8) }.unwrap();
        assert_eq!(rest.size(), 8);
    }

    #[test]
    fn absorb_next_reclaims_header() {
        let mut buf = vec![0u64; 128];
        let mut list = build(
            &mut buf,
            &[
                (64, Status::Free),
                (32, Status::Allocated),
                (16, Status::Allocated),
            ],
        );
        let first = list.head().unwrap();

        assert!(unsafe { list.absorb_next(first) });

        assert_eq!(
            sizes(&list),
            vec![(64 + 32 + META_SIZE, Status::Free), (16, Status::Allocated)]
        );
        assert_eq!(list.tail().unwrap().prev(), Some(first));
    }

    #[test]
    fn absorbing_tail_moves_tail() {
        let mut buf = vec![0u64; 128];
        let mut list = build(&mut buf, &[(64, Status::Allocated), (32, Status::Free)]);
        let first = list.head().unwrap();

        assert!(unsafe { list.absorb_next(first) });
        assert_eq!(list.tail(), Some(first));
        assert!(first.next().is_none());
        assert!(!unsafe { list.absorb_next(first) });
    }

    #[test]
    fn merge_next_only_takes_free_blocks() {
        let mut buf = vec![0u64; 128];
        let mut list = build(
            &mut buf,
            &[
                (64, Status::Allocated),
                (32, Status::Allocated),
                (16, Status::Free),
            ],
        );
        let first = list.head().unwrap();
        let second = first.next().unwrap();

        assert!(!unsafe { list.merge_next(first) });
        assert!(unsafe { list.merge_next(second) });
        assert_eq!(
            sizes(&list),
            vec![
                (64, Status::Allocated),
                (32 + 16 + META_SIZE, Status::Allocated)
            ]
        );
    }

    #[test]
    fn stats_flags_adjacent_frees() {
        let mut buf = vec![0u64; 128];
        let list = build(&mut buf, &[(64, Status::Free), (32, Status::Free)]);

        let (validity, _) = list.stats();
        assert_eq!(validity.adjacent_frees, 1);
        assert!(!validity.is_valid());
    }

    #[test]
    fn stats_flags_broken_sizes() {
        let mut buf = vec![0u64; 128];
        let list = build(&mut buf, &[(64, Status::Allocated), (32, Status::Allocated)]);
        let mut first = list.head().unwrap();

        // Claim more than the block owns: it now overlaps its neighbor.
        unsafe { first.set_size(72) };
        let (validity, _) = list.stats();
        assert_eq!(validity.overlaps, 1);

        // Claim less: there is a gap, and the size is misaligned.
        unsafe { first.set_size(60) };
        let (validity, _) = list.stats();
        assert_eq!(validity.gaps, 1);
        assert_eq!(validity.misaligned, 1);
    }
}
