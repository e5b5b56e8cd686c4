//! This is a very minimal example to show using the RegionSource functions.

use brk_allocator::allocators::RegionSource;
#[cfg(feature = "use_libc")]
use brk_allocator::allocators::LibcRegions;
#[cfg(not(feature = "use_libc"))]
use brk_allocator::allocators::SyscallRegions;

fn show<S: RegionSource>(mut source: S) {
    println!("Page size: {}", source.page_size());

    let first = unsafe { source.grow_arena(8).unwrap() };
    let second = unsafe { source.grow_arena(8).unwrap() };
    println!("Arena grew at {:p}, then at {:p}", first, second);

    let page = source.page_size();
    unsafe {
        let region = source.map_region(page).unwrap();
        println!("Mapped {} bytes at {:p}", page, region);
        source.unmap_region(region, page).unwrap();
    }
}

fn main() {
    #[cfg(feature = "use_libc")]
    {
        // LibcRegions uses libc to call sbrk and mmap
        println!("Using libc");
        show(LibcRegions::default());
    }

    #[cfg(not(feature = "use_libc"))]
    {
        // SyscallRegions uses inline assembly to make direct brk and mmap syscalls.
        println!("Using assembly syscalls");
        show(SyscallRegions::default());
    }
}
