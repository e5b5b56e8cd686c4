use core::ptr::{null_mut, NonNull};

use brk_allocator::allocators::{RawAlloc, ToyHeap};
use brk_allocator::{Block, Status, MMAP_THRESHOLD};

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

// A live allocation, and the byte its payload was filled with.
#[derive(Clone, Copy)]
struct Slot {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

const EMPTY: Slot = Slot {
    ptr: null_mut(),
    size: 0,
    fill: 0,
};

unsafe fn block_of(ptr: *mut u8) -> Block {
    Block::from_payload(NonNull::new(ptr).unwrap())
}

unsafe fn check_fill(slot: &Slot, len: usize) {
    let bytes = core::slice::from_raw_parts(slot.ptr, len);
    assert!(
        bytes.iter().all(|&b| b == slot.fill),
        "{:?} lost its contents",
        slot.ptr
    );
}

fn validate(allocator: &RawAlloc<ToyHeap>, slots: &[Slot]) {
    let (validity, stats) = allocator.stats();
    log::debug!("Validity: {:?}, Stats: {:?}", validity, stats);
    assert!(validity.is_valid(), "{:?}\n{}", validity, allocator.blocks);

    let mut arena_size = 0;
    let mut mapped = 0;
    for slot in slots.iter().filter(|s| !s.ptr.is_null()) {
        let block = unsafe { block_of(slot.ptr) };
        assert!(block.size() >= slot.size);
        match block.status() {
            Status::Allocated => arena_size += block.size(),
            Status::Mapped => mapped += 1,
            Status::Free => panic!("live pointer {:?} is in a free block", slot.ptr),
        }
    }
    assert_eq!(stats.allocated_size, arena_size);
    assert_eq!(stats.mapped_regions, mapped);
    assert_eq!(allocator.source.live_maps, mapped);
}

#[test]
fn test_stress() {
    let mut arena = vec![0u64; 1024 * 1024];
    let mut maps = vec![0u64; 4 * 1024 * 1024];
    let mut allocator = RawAlloc::new(ToyHeap::new(&mut arena, &mut maps));

    let mut slots = [EMPTY; 128];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = Uniform::new_inclusive(1usize, 48);
    let large = Uniform::new_inclusive(MMAP_THRESHOLD, MMAP_THRESHOLD + 64 * 1024);

    for step in 0..1024 * 10 {
        // The toy mmap never reuses memory, so large requests are rationed.
        let room = allocator.source.maps_capacity() - allocator.source.mapped_used;
        let pick_size = |rng: &mut rand::rngs::StdRng| {
            if room > 4 * MMAP_THRESHOLD && rng.gen_ratio(1, 64) {
                large.sample(rng)
            } else {
                range.sample(rng) * range.sample(rng)
            }
        };

        let slot = slots.choose_mut(&mut rng).unwrap();
        let fill = (step % 251) as u8 + 1;

        if slot.ptr.is_null() {
            let size = pick_size(&mut rng);
            let ptr = if rng.gen_bool(0.25) {
                log::info!("Zero-allocating {}", size);
                let p = unsafe { allocator.zero_allocate(1, size) }.unwrap().unwrap();
                let zeroed = Slot {
                    ptr: p.as_ptr(),
                    size,
                    fill: 0,
                };
                unsafe { check_fill(&zeroed, size) };
                p.as_ptr()
            } else {
                log::info!("Allocating {}", size);
                unsafe { allocator.allocate(size) }.unwrap().unwrap().as_ptr()
            };
            unsafe { core::ptr::write_bytes(ptr, fill, size) };
            *slot = Slot { ptr, size, fill };
        } else if rng.gen_bool(0.3) {
            let size = pick_size(&mut rng);
            log::info!("Resizing {:?} from {} to {}", slot.ptr, slot.size, size);
            let ptr = unsafe { allocator.resize(slot.ptr, size) }
                .unwrap()
                .unwrap()
                .as_ptr();
            let moved = Slot { ptr, ..*slot };
            unsafe {
                check_fill(&moved, slot.size.min(size));
                core::ptr::write_bytes(ptr, fill, size);
            }
            *slot = Slot { ptr, size, fill };
        } else {
            log::info!("Freeing {:?} ({})", slot.ptr, slot.size);
            unsafe {
                check_fill(slot, slot.size);
                allocator.free(slot.ptr).unwrap();
            }
            *slot = EMPTY;
        }

        validate(&allocator, &slots);
    }

    for slot in slots.iter_mut().filter(|s| !s.ptr.is_null()) {
        unsafe { allocator.free(slot.ptr).unwrap() };
        *slot = EMPTY;
    }
    validate(&allocator, &slots);

    let (_, stats) = allocator.stats();
    assert!(stats.length <= 1, "{}", allocator.blocks);
    assert_eq!(stats.allocated_blocks, 0);
}
