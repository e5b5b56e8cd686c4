//! The smallest program using `UnixAllocator` as its global allocator.

use brk_allocator::UnixAllocator;

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);

    let (validity, stats) = ALLOCATOR.stats();
    println!("Valid: {}, {:?}", validity.is_valid(), stats);
}
