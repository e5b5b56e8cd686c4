#![cfg_attr(not(test), no_std)]

//! A best-fit heap allocator.
//!
//! Small requests are carved out of a single arena that grows like the
//! classic program break (`sbrk`). Every block in the arena is preceded by a
//! header, and the headers form an address-ordered, doubly linked list: the
//! [`BlockList`](blocklist/struct.BlockList.html). Freed blocks are merged
//! with free neighbors, so the list never holds two adjacent free blocks.
//!
//! Requests of [`MMAP_THRESHOLD`](constant.MMAP_THRESHOLD.html) bytes or more
//! skip the arena and get a region of their own from `mmap`, which is handed
//! back to the OS as soon as it is freed.
//!
//! ```text
//!  arena base                                          tail         high-water mark
//!  |                                                   |            |
//!  +--------+---------+--------+------+--------+-------+--------+---+
//!  | header | payload | header | free | header | payld | header |...|
//!  +--------+---------+--------+------+--------+-------+--------+---+
//! ```
//!
//! The arena itself is never returned to the OS.
//!
//! ## Types
//!
//! - [`RawAlloc`](allocators/struct.RawAlloc.html) is the allocator proper.
//!   It is single-threaded, owns no global state, and reports OS failures as
//!   [`AllocError`](allocators/enum.AllocError.html)s.
//! - [`RegionSource`](allocators/trait.RegionSource.html) abstracts the OS
//!   calls; [`ToyHeap`](allocators/struct.ToyHeap.html) implements it over
//!   borrowed buffers for testing.
//! - [`UnixAllocator`](allocators/struct.UnixAllocator.html) wraps a
//!   `RawAlloc` in a spin lock so it can live in a `static`, terminates the
//!   process on OS failure, and implements `GlobalAlloc`.

pub mod allocators;
pub mod blocklist;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
pub mod unix;

pub use allocators::{AllocError, RawAlloc, RegionSource, ToyHeap};
#[cfg(any(
    feature = "use_libc",
    all(target_os = "linux", target_arch = "x86_64")
))]
pub use allocators::UnixAllocator;
pub use blocklist::{Block, BlockList, Stats, Status, Validity, META_SIZE};

/// Every block size is a multiple of this, and so is every header.
pub const ALIGNMENT: usize = 8;

/// Requests at or above this size bypass the arena and are mapped directly.
/// This is also the size of the arena's first chunk.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// Round `value` up to the nearest multiple of `increment`, which must be a
/// power of two. Returns `None` on overflow.
pub fn align_up(value: usize, increment: usize) -> Option<usize> {
    debug_assert!(increment.is_power_of_two());
    Some(value.checked_add(increment - 1)? & !(increment - 1))
}
