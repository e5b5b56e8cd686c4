//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap manager: best-fit
//! reuse of freed arena blocks, splitting, coalescing, mapped regions for
//! large requests, and in-place resizing. Failures of the underlying OS calls
//! are returned as [`AllocError`](enum.AllocError.html)s.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` wraps `RawAlloc` with a spin lock to make it thread-safe,
//! allowing it to be used as the global allocator. It combines `RawAlloc`
//! with the system's `sbrk` and `mmap`, and terminates the process if either
//! fails.
//!
//! ### [`RegionSource`](trait.RegionSource.html)
//!
//! `RegionSource` is a simple trait interface meant to abstract over the calls
//! to the OS to grow the arena and to map or unmap regions.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` pretends borrowed buffers are the program break and the mmap
//! area, and implements `RegionSource` for such a purpose. It is mainly useful
//! for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::blocklist::{Block, BlockList, Stats, Status, Validity, META_SIZE};
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
use crate::unix::{self, SyscallError};
use crate::{align_up, ALIGNMENT, MMAP_THRESHOLD};

pub trait RegionSource {
    type Err: fmt::Debug;

    /// Extend the arena by exactly `size` bytes, like `sbrk`. Returns the old
    /// end of the arena, which is where the new bytes start.
    ///
    /// # Safety
    ///
    /// The returned memory must be valid for `size` bytes and untracked by
    /// any other Rust code, including the allocator itself.
    unsafe fn grow_arena(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Obtain a fresh region of at least `size` bytes, independent of the
    /// arena, aligned to at least `ALIGNMENT`.
    ///
    /// # Safety
    ///
    /// As for `grow_arena`.
    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Return a region obtained from `map_region`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly those of a live mapping, and nothing
    /// may use it afterwards.
    unsafe fn unmap_region(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::Err>;

    fn page_size(&self) -> usize;

    /// Report an unrecoverable failure and stop.
    fn die(&self, diagnostic: &str) -> !;
}

/// `LibcRegions` uses `sbrk` and `mmap` from libc.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcRegions {
    // Just for tracking, not really needed
    growths: usize,
    maps: usize,
}

#[cfg(feature = "use_libc")]
impl RegionSource for LibcRegions {
    type Err = Errno;

    unsafe fn grow_arena(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let increment = libc::intptr_t::try_from(size).map_err(|_| Errno(libc::ENOMEM))?;
        let ptr = libc::sbrk(increment);

        if ptr as isize == -1 {
            return Err(errno::errno());
        }

        self.growths += 1;
        NonNull::new(ptr.cast()).ok_or(Errno(libc::ENOMEM))
    }

    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            size,
            libc::PROT_WRITE | libc::PROT_READ,
            // Anonymous, and not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file backs this mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        self.maps += 1;
        NonNull::new(ptr.cast()).ok_or(Errno(libc::ENOMEM))
    }

    unsafe fn unmap_region(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr().cast(), size) != 0 {
            return Err(errno::errno());
        }
        self.maps -= 1;
        Ok(())
    }

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    fn die(&self, diagnostic: &str) -> ! {
        let msg = Diagnostic::with_counts(diagnostic, self.growths, self.maps);
        let msg = msg.as_str();
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
            libc::abort()
        }
    }
}

/// `SyscallRegions` makes the `brk` and `mmap` system calls directly.
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
#[derive(Default)]
pub struct SyscallRegions {
    // Just for tracking, not really needed
    growths: usize,
    maps: usize,
}

#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
impl RegionSource for SyscallRegions {
    type Err = SyscallError;

    unsafe fn grow_arena(&mut self, size: usize) -> Result<NonNull<u8>, SyscallError> {
        // The kernel's brk moves the break to an address rather than by an
        // increment, so read where it is first.
        let old = unix::brk(null_mut()) as usize;
        let wanted = old
            .checked_add(size)
            .ok_or(SyscallError(unix::ENOMEM))?;

        let new = unix::brk(wanted as *mut u8) as usize;
        if new < wanted {
            return Err(SyscallError(unix::ENOMEM));
        }

        self.growths += 1;
        NonNull::new(old as *mut u8).ok_or(SyscallError(unix::ENOMEM))
    }

    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, SyscallError> {
        let ptr = unix::mmap(size)?;
        self.maps += 1;
        NonNull::new(ptr).ok_or(SyscallError(unix::ENOMEM))
    }

    unsafe fn unmap_region(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SyscallError> {
        unix::munmap(ptr.as_ptr(), size)?;
        self.maps -= 1;
        Ok(())
    }

    fn page_size(&self) -> usize {
        // Page size is 4 kb "on most architectures"
        4096
    }

    fn die(&self, diagnostic: &str) -> ! {
        let msg = Diagnostic::with_counts(diagnostic, self.growths, self.maps);
        unix::write_stderr(msg.as_str().as_bytes());
        unix::exit_group(134)
    }
}

/// The failure of an OS call, or of the arena's layout assumptions.
///
/// None of these can be recovered from by the allocator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError<E> {
    GrowArena(E),
    MapRegion(E),
    UnmapRegion(E),
    /// The arena grew somewhere other than its end: something else moved the
    /// program break.
    Discontiguous { expected: usize, found: usize },
}

impl<E: fmt::Debug> fmt::Display for AllocError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::GrowArena(e) => write!(f, "sbrk failed: {:?}", e),
            AllocError::MapRegion(e) => write!(f, "mmap failed: {:?}", e),
            AllocError::UnmapRegion(e) => write!(f, "munmap failed: {:?}", e),
            AllocError::Discontiguous { expected, found } => write!(
                f,
                "arena is not contiguous: expected growth at {:#x}, got {:#x}",
                expected, found
            ),
        }
    }
}

pub type AllocResult<T, E> = Result<T, AllocError<E>>;

// The end of a span of `len` bytes at `start`, if it fits in the address space.
fn span_end(start: usize, len: usize) -> Option<usize> {
    start
        .checked_add(len)
        .filter(|&end| end <= isize::MAX as usize)
}

/// A raw allocator: it grows the arena, hands out blocks, and tracks and
/// reuses freed memory.
///
/// All state lives in this struct. It starts empty; the arena is created by
/// the first small allocation, as one `MMAP_THRESHOLD`-sized chunk. The arena
/// is never returned to the OS.
///
/// `allocate`, `zero_allocate` and `resize` return `Ok(None)` for requests
/// that cannot be satisfied by their nature (zero sizes, arithmetic
/// overflow, stale pointers), and `Err` only when the OS refuses.
pub struct RawAlloc<S> {
    pub source: S,
    pub blocks: BlockList,
    // First header address and high-water mark of the arena; both zero
    // until the arena exists.
    arena_start: usize,
    arena_end: usize,
    // Live mapped regions.
    mapped: usize,
}

impl<S: RegionSource + Default> Default for RawAlloc<S> {
    fn default() -> Self {
        RawAlloc::new(S::default())
    }
}

impl<S: RegionSource> RawAlloc<S> {
    /// Create a new `RawAlloc`
    pub fn new(source: S) -> Self {
        RawAlloc {
            source,
            blocks: BlockList::new(),
            arena_start: 0,
            arena_end: 0,
            mapped: 0,
        }
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        let (mut validity, mut stats) = self.blocks.stats();
        if let Some(tail) = self.blocks.tail() {
            if tail.end() as usize > self.arena_end {
                // The tail claims memory the arena never got.
                validity.overlaps += 1;
            }
        }
        stats.arena_size = self.arena_end - self.arena_start;
        stats.mapped_regions = self.mapped;
        (validity, stats)
    }

    /// The arena's high-water mark, or zero if there is no arena yet.
    pub fn arena_end(&self) -> usize {
        self.arena_end
    }

    ////////////////////////////////////////////////////////////
    // Region handling

    unsafe fn grow_arena(&mut self, size: usize) -> AllocResult<NonNull<u8>, S::Err> {
        let ptr = self
            .source
            .grow_arena(size)
            .map_err(AllocError::GrowArena)?;
        let found = ptr.as_ptr() as usize;

        if self.arena_end == 0 {
            self.arena_start = found;
        } else if found != self.arena_end {
            return Err(AllocError::Discontiguous {
                expected: self.arena_end,
                found,
            });
        }

        self.arena_end = found + size;
        debug!("Grew arena by {} bytes to {:#x}", size, self.arena_end);
        Ok(ptr)
    }

    /// Make sure the arena reaches at least `end`, growing it by the
    /// shortfall, rounded up to `ALIGNMENT`.
    unsafe fn reach(&mut self, end: usize) -> AllocResult<(), S::Err> {
        if end <= self.arena_end {
            return Ok(());
        }
        let shortfall = (end - self.arena_end + ALIGNMENT - 1) & !(ALIGNMENT - 1);
        self.grow_arena(shortfall).map(|_| ())
    }

    unsafe fn map_block(&mut self, size: usize) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let total = match span_end(size, META_SIZE) {
            Some(total) => total,
            None => return Ok(None),
        };
        let ptr = self
            .source
            .map_region(total)
            .map_err(AllocError::MapRegion)?;
        let block = Block::from_raw(ptr, size, Status::Mapped);
        self.mapped += 1;
        debug!("Mapped {} bytes at {:?}", total, ptr);
        Ok(Some(block.payload()))
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate at least `size` bytes, aligned to `ALIGNMENT`.
    ///
    /// Requests of `MMAP_THRESHOLD` bytes or more get their own mapped
    /// region. Everything else comes from the arena: the smallest free block
    /// that fits, split if the rest can stand on its own; failing that, the
    /// free tail block extended in place; failing that, a new block at the
    /// end of the arena.
    ///
    /// # Safety
    ///
    /// `source` must uphold the `RegionSource` contract.
    pub unsafe fn allocate(&mut self, size: usize) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        if size == 0 {
            return Ok(None);
        }
        let aligned = match align_up(size, ALIGNMENT) {
            Some(aligned) => aligned,
            None => return Ok(None),
        };

        if size >= MMAP_THRESHOLD {
            trace!("allocate({}): mapping a region", size);
            return self.map_block(aligned);
        }

        let tail = match self.blocks.tail() {
            None => return self.create_arena(aligned).map(Some),
            Some(tail) => tail,
        };

        if let Some(mut block) = self.blocks.best_fit(aligned) {
            trace!("allocate({}): best fit {:?}", size, block);
            if let Some(rest) = self.blocks.split(block, aligned) {
                trace!("  split off {:?}", rest);
            }
            block.set_status(Status::Allocated);
            return Ok(Some(block.payload()));
        }

        if tail.is_free() {
            trace!("allocate({}): expanding free tail {:?}", size, tail);
            return self.expand_tail(tail, aligned);
        }

        trace!("allocate({}): appending after {:?}", size, tail);
        self.push_block(tail, aligned)
    }

    // The arena starts as one MMAP_THRESHOLD chunk holding a single
    // allocated block; the rest of the chunk is slack for later blocks.
    unsafe fn create_arena(&mut self, size: usize) -> AllocResult<NonNull<u8>, S::Err> {
        let start = if self.arena_end == 0 {
            let base = self.grow_arena(MMAP_THRESHOLD)?.as_ptr() as usize;
            let start = (base + ALIGNMENT - 1) & !(ALIGNMENT - 1);
            self.arena_start = start;
            start
        } else {
            // An earlier attempt got the first chunk but could not grow past it.
            self.arena_start
        };

        self.reach(start + META_SIZE + size)?;
        let block = self.blocks.push_back(
            NonNull::new_unchecked(start as *mut u8),
            size,
            Status::Allocated,
        );
        trace!("Created arena at {:#x} with {:?}", start, block);
        Ok(block.payload())
    }

    // Grow the tail block in place, extending the arena by whatever the slack
    // after it cannot cover.
    unsafe fn expand_tail(
        &mut self,
        mut tail: Block,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let end = match span_end(tail.payload().as_ptr() as usize, size) {
            Some(end) => end,
            None => return Ok(None),
        };
        self.reach(end)?;

        tail.set_size(size);
        tail.set_status(Status::Allocated);
        Ok(Some(tail.payload()))
    }

    unsafe fn push_block(
        &mut self,
        tail: Block,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let start = tail.end() as usize;
        let end = match span_end(start, META_SIZE + size) {
            Some(end) => end,
            None => return Ok(None),
        };
        self.reach(end)?;

        let block =
            self.blocks
                .push_back(NonNull::new_unchecked(start as *mut u8), size, Status::Allocated);
        Ok(Some(block.payload()))
    }

    /// Allocate `count * size` bytes, all zero.
    ///
    /// Anything that will not fit in one page along with its header gets a
    /// mapped region of its own, regardless of `MMAP_THRESHOLD`.
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::allocate`].
    pub unsafe fn zero_allocate(
        &mut self,
        count: usize,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        if count == 0 || size == 0 {
            return Ok(None);
        }
        let total = match count
            .checked_mul(size)
            .and_then(|total| align_up(total, ALIGNMENT))
        {
            Some(total) => total,
            None => return Ok(None),
        };

        let ptr = if total.saturating_add(META_SIZE) > self.source.page_size() {
            trace!("zero_allocate({}, {}): mapping a region", count, size);
            self.map_block(total)?
        } else {
            self.allocate(total)?
        };

        if let Some(ptr) = ptr {
            ptr::write_bytes(ptr.as_ptr(), 0, total);
        }
        Ok(ptr)
    }

    ////////////////////////////////////////////////////////////
    // Reclamation

    /// Free a pointer returned by this allocator.
    ///
    /// Null pointers are ignored. So are pointers to blocks that are already
    /// free: double frees are not detected.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by this allocator, and must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> AllocResult<(), S::Err> {
        let payload = match NonNull::new(ptr) {
            None => return Ok(()),
            Some(p) => p,
        };
        let block = Block::from_payload(payload);

        match block.status() {
            Status::Free => {
                trace!("free({:?}): already free", ptr);
            }
            Status::Mapped => {
                let total = block.size() + META_SIZE;
                self.source
                    .unmap_region(NonNull::new_unchecked(block.addr()), total)
                    .map_err(AllocError::UnmapRegion)?;
                self.mapped -= 1;
                debug!("Unmapped {} bytes at {:?}", total, block.addr());
            }
            Status::Allocated => {
                self.release(block);
            }
        }

        Ok(())
    }

    // Mark an arena block free, merging it with free neighbors on both sides.
    // Returns the merged block.
    unsafe fn release(&mut self, mut block: Block) -> Block {
        if let Some(prev) = block.prev().filter(Block::is_free) {
            trace!("Coalescing {:?} into {:?}", block, prev);
            self.blocks.absorb_next(prev);
            block = prev;
        }

        if self.blocks.merge_next(block) {
            trace!("Coalesced next into {:?}", block);
        }

        block.set_status(Status::Free);
        block
    }

    ////////////////////////////////////////////////////////////
    // Resizing

    /// Resize an allocation to `size` bytes, preserving its contents up to
    /// the smaller of the two sizes.
    ///
    /// A null `ptr` allocates; a zero `size` frees and returns `Ok(None)`; a
    /// pointer to a free block returns `Ok(None)`. Otherwise the block is
    /// shrunk or grown in place when its neighbors allow, and moved when
    /// they don't.
    ///
    /// # Safety
    ///
    /// As for [`RawAlloc::free`]. If a different pointer is returned, `ptr`
    /// must not be used afterwards.
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let payload = match NonNull::new(ptr) {
            None => return self.allocate(size),
            Some(p) => p,
        };
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = Block::from_payload(payload);
        if block.is_free() {
            trace!("resize({:?}, {}): block is free", ptr, size);
            return Ok(None);
        }
        if size == block.size() {
            return Ok(Some(payload));
        }

        let aligned = match align_up(size, ALIGNMENT) {
            Some(aligned) => aligned,
            None => return Ok(None),
        };

        if size < block.size() {
            self.shrink(block, size, aligned)
        } else {
            self.grow(block, size, aligned)
        }
    }

    // `requested` is the caller's size and decides where a moved block goes;
    // `size` is its aligned form, used for in-place changes.
    unsafe fn shrink(
        &mut self,
        block: Block,
        requested: usize,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        if block.size() - size <= META_SIZE {
            // Too little left over for a block of its own; keep the span.
            return Ok(Some(block.payload()));
        }

        if block.status() == Status::Mapped {
            trace!("Shrinking mapped {:?} to {} by moving it", block, size);
            return self.relocate(block, requested, requested);
        }

        if let Some(rest) = self.blocks.split(block, size) {
            trace!("Shrunk {:?}, freeing {:?}", block, rest);
            self.blocks.merge_next(rest);
        }
        Ok(Some(block.payload()))
    }

    unsafe fn grow(
        &mut self,
        block: Block,
        requested: usize,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let old_size = block.size();

        if block.status() == Status::Mapped {
            trace!("Growing mapped {:?} to {} by moving it", block, size);
            return self.relocate(block, requested, old_size);
        }

        if block.next().is_none() {
            trace!("Growing tail {:?} to {} in place", block, size);
            return self.expand_tail(block, size);
        }

        if self.blocks.merge_next(block) {
            trace!("Grew {:?} into its free neighbor", block);
        }

        if block.size() >= size {
            self.blocks.split(block, size);
            return Ok(Some(block.payload()));
        }

        if block.next().is_none() {
            // The neighbor was the tail; the arena can take it from here.
            return self.expand_tail(block, size);
        }

        trace!("Moving {:?} to grow it to {}", block, size);
        self.relocate(block, requested, old_size)
    }

    // Allocate a fresh block of `size`, copy `keep` bytes over, and free the
    // old one. The old block stays untouched if the allocation comes back
    // empty.
    unsafe fn relocate(
        &mut self,
        block: Block,
        size: usize,
        keep: usize,
    ) -> AllocResult<Option<NonNull<u8>>, S::Err> {
        let new = match self.allocate(size)? {
            Some(new) => new,
            None => return Ok(None),
        };

        ptr::copy_nonoverlapping(block.payload().as_ptr(), new.as_ptr(), keep.min(size));
        self.free(block.payload().as_ptr())?;
        Ok(Some(new))
    }
}

// A fixed-size buffer to format diagnostics into without allocating.
struct Diagnostic {
    buf: [u8; 256],
    len: usize,
}

impl Diagnostic {
    fn new() -> Self {
        Diagnostic {
            buf: [0; 256],
            len: 0,
        }
    }

    // Used by the OS backends to tack their counters onto a diagnostic.
    #[allow(dead_code)]
    fn with_counts(diagnostic: &str, growths: usize, maps: usize) -> Self {
        let mut msg = Diagnostic::new();
        let _ = writeln!(
            msg,
            "{} ({} arena growths, {} live mappings)",
            diagnostic.trim_end(),
            growths,
            maps
        );
        msg
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("brk_allocator: fatal error\n")
    }
}

impl Write for Diagnostic {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn die<S: RegionSource>(source: &S, err: &AllocError<S::Err>) -> ! {
    let mut msg = Diagnostic::new();
    let _ = writeln!(msg, "brk_allocator: {}", err);
    source.die(msg.as_str())
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// The `RawAlloc` is built on first use, so a `GenericAllocator` can be
/// constructed in a `static`. Any `AllocError` is fatal here: it is reported
/// through `RegionSource::die`.
pub struct GenericAllocator<S> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawAlloc<S>>>>,
}

// The RawAlloc is only reachable through the mutex once initialized.
unsafe impl<S: Send> Sync for GenericAllocator<S> {}

impl<S: RegionSource + Default> Default for GenericAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> GenericAllocator<S> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<S: RegionSource + Default> GenericAllocator<S> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> MutexGuard<'_, RawAlloc<S>> {
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // This is fully initialized, no need to do anything
            }
            Ok(_) => {
                (*self.raw.get()).write(Mutex::new(RawAlloc::default()));
                // Let other threads know that the mutex and raw allocator are
                // now initialized.
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                while self.init.load(Ordering::SeqCst) != 2 {
                    core::hint::spin_loop();
                }
            }
            Err(v) => panic!("Unexpected init state {}", v),
        }

        (*self.raw.get()).assume_init_ref().lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }

    fn settle<T>(raw: &RawAlloc<S>, result: AllocResult<T, S::Err>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => die(&raw.source, &err),
        }
    }

    /// Allocate `size` bytes. Returns null for a zero size.
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::allocate`].
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let mut raw = self.get_raw();
        let result = raw.allocate(size);
        Self::settle(&raw, result).map_or(null_mut(), NonNull::as_ptr)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::zero_allocate`].
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let mut raw = self.get_raw();
        let result = raw.zero_allocate(count, size);
        Self::settle(&raw, result).map_or(null_mut(), NonNull::as_ptr)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        let mut raw = self.get_raw();
        let result = raw.free(ptr);
        Self::settle(&raw, result)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::resize`].
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        let mut raw = self.get_raw();
        let result = raw.resize(ptr, size);
        Self::settle(&raw, result).map_or(null_mut(), NonNull::as_ptr)
    }

    // Payloads are only ALIGNMENT-aligned, so stronger alignments allocate
    // `align` extra bytes and keep the real payload pointer in the word
    // before the one handed out.
    unsafe fn allocate_over_aligned(&self, layout: Layout) -> *mut u8 {
        let total = match layout.size().checked_add(layout.align()) {
            Some(total) => total,
            None => return null_mut(),
        };
        let base = self.allocate(total);
        if base.is_null() {
            return base;
        }

        let addr = base as usize + core::mem::size_of::<usize>();
        let aligned = (addr + layout.align() - 1) & !(layout.align() - 1);
        let ptr = base.add(aligned - base as usize);
        ptr.cast::<*mut u8>().sub(1).write(base);
        ptr
    }

    unsafe fn over_aligned_base(ptr: *mut u8) -> *mut u8 {
        ptr.cast::<*mut u8>().sub(1).read()
    }
}

unsafe impl<S: RegionSource + Default> GlobalAlloc for GenericAllocator<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            self.allocate(layout.size())
        } else {
            self.allocate_over_aligned(layout)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= ALIGNMENT {
            self.free(ptr)
        } else {
            self.free(Self::over_aligned_base(ptr))
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.zero_allocate(1, layout.size());
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.resize(ptr, new_size);
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}

/// The OS backend used by `UnixAllocator`.
#[cfg(feature = "use_libc")]
pub type SystemRegions = LibcRegions;

/// The OS backend used by `UnixAllocator`.
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
pub type SystemRegions = SyscallRegions;

/// The allocator over the real program break and `mmap`, fit for
/// `#[global_allocator]`.
///
/// The four operations take and return raw pointers, with null standing for
/// "no allocation". If the OS refuses memory, the process is terminated with
/// a diagnostic on standard error.
#[cfg(any(
    feature = "use_libc",
    all(target_os = "linux", target_arch = "x86_64")
))]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<SystemRegions>,
}

#[cfg(any(
    feature = "use_libc",
    all(target_os = "linux", target_arch = "x86_64")
))]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    /// # Safety
    ///
    /// See [`RawAlloc::allocate`].
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        self.alloc.allocate(size)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::zero_allocate`].
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.alloc.zero_allocate(count, size)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.alloc.free(ptr)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::resize`].
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.alloc.resize(ptr, size)
    }
}

#[cfg(any(
    feature = "use_libc",
    all(target_os = "linux", target_arch = "x86_64")
))]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

/// A pretend OS: the arena and the mapped regions are carved out of two
/// borrowed buffers.
///
/// Mapped regions are handed out bump-style and never reused; every unmap is
/// recorded instead.
pub struct ToyHeap<'a> {
    pub page_size: usize,
    arena: &'a mut [u64],
    /// Bytes of the arena handed out so far.
    pub arena_used: usize,
    maps: &'a mut [u64],
    /// Bytes of the mapping buffer handed out so far.
    pub mapped_used: usize,
    pub live_maps: usize,
    pub unmaps: usize,
    /// Address and length of the last unmapped region.
    pub last_unmap: Option<(usize, usize)>,
}

impl<'a> ToyHeap<'a> {
    pub fn new(arena: &'a mut [u64], maps: &'a mut [u64]) -> Self {
        ToyHeap {
            page_size: 4096,
            arena,
            arena_used: 0,
            maps,
            mapped_used: 0,
            live_maps: 0,
            unmaps: 0,
            last_unmap: None,
        }
    }

    pub fn arena_base(&self) -> *const u8 {
        self.arena.as_ptr().cast()
    }

    pub fn arena_capacity(&self) -> usize {
        core::mem::size_of_val(self.arena)
    }

    pub fn maps_capacity(&self) -> usize {
        core::mem::size_of_val(self.maps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError();

impl RegionSource for ToyHeap<'_> {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_arena(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if size > self.arena_capacity() - self.arena_used {
            return Err(ToyHeapOverflowError());
        }

        let ptr = self.arena.as_mut_ptr().cast::<u8>().add(self.arena_used);
        self.arena_used += size;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let allocating = align_up(size, ALIGNMENT).ok_or(ToyHeapOverflowError())?;
        if allocating > self.maps_capacity() - self.mapped_used {
            return Err(ToyHeapOverflowError());
        }

        let ptr = self.maps.as_mut_ptr().cast::<u8>().add(self.mapped_used);
        self.mapped_used += allocating;
        self.live_maps += 1;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn unmap_region(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::Err> {
        let start = self.maps.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < start || addr + size > start + self.mapped_used || self.live_maps == 0 {
            return Err(ToyHeapOverflowError());
        }

        self.live_maps -= 1;
        self.unmaps += 1;
        self.last_unmap = Some((addr, size));
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn die(&self, diagnostic: &str) -> ! {
        panic!("{}", diagnostic.trim_end())
    }
}
