//! End-to-end bump strategy behavior against a live page provider

use std::sync::Barrier;

use strata_alloc::{
    BumpConfig, Error, LockFreeBump, LockFreePage, Strategy, WhenFull, PAGE_SIZE,
};

type T = u64;
const SIZE_OF_T: usize = core::mem::size_of::<T>();

/// A block sized for exactly ten objects hands out ten neighboring
/// slots, then refuses until reset
#[test]
fn test_fixed_block_serves_exactly_ten_objects() {
    let provider = LockFreePage::default();
    let bump = LockFreeBump::with_config(
        &provider,
        BumpConfig {
            size: SIZE_OF_T * 10,
            grow: WhenFull::ReturnNull,
            ..BumpConfig::default()
        },
    );

    let mut slots = Vec::with_capacity(10);
    for _ in 0..10 {
        slots.push(bump.find_sized(SIZE_OF_T).unwrap().cast::<T>());
    }

    // Slots are neighbors in memory.
    for pair in slots.windows(2) {
        assert_eq!(unsafe { pair[0].as_ptr().add(1) }, pair[1].as_ptr());
    }

    // The block is exhausted and per-object release is unsupported.
    assert_eq!(bump.find_sized(SIZE_OF_T), Err(Error::ReachedMemoryLimit));
    assert_eq!(
        bump.release(slots[0].cast()),
        Err(Error::OperationNotSupported)
    );

    // A reset makes room for ten more.
    bump.reset().unwrap();
    for _ in 0..10 {
        bump.find_sized(SIZE_OF_T).unwrap();
    }
}

/// Growth-enabled bump serves an open-ended stream of requests
#[test]
fn test_growing_bump_serves_a_hundred_requests() {
    let provider = LockFreePage::default();
    let bump = LockFreeBump::new(&provider);

    for _ in 0..100 {
        bump.find_sized(SIZE_OF_T).unwrap();
    }

    bump.reset().unwrap();
    assert_eq!(provider.available(), provider.limit());

    // A request larger than one block can never be served.
    assert_eq!(
        bump.find_sized(PAGE_SIZE + 1),
        Err(Error::SizeRequestTooLarge)
    );
}

/// Offsets advance strictly within a superblock
#[test]
fn test_bump_monotonicity() {
    let provider = LockFreePage::default();
    let bump = LockFreeBump::new(&provider);

    let mut previous = None;
    for _ in 0..64 {
        let addr = bump.find_sized(24).unwrap().as_ptr() as usize;
        if let Some(previous) = previous {
            assert!(addr > previous);
        }
        previous = Some(addr);
    }
}

/// Double reset equals a single reset
#[test]
fn test_reset_idempotence() {
    let provider = LockFreePage::default();
    let bump = LockFreeBump::new(&provider);

    bump.find_sized(128).unwrap();
    bump.reset().unwrap();
    bump.reset().unwrap();
    assert_eq!(provider.available(), provider.limit());
}

/// Parallel allocators never hand out overlapping regions
#[test]
fn test_concurrent_finds_are_disjoint() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;
    const CHUNK: usize = 32;

    let provider = LockFreePage::default();
    let bump = LockFreeBump::new(&provider);
    let barrier = Barrier::new(THREADS);

    let all: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|_| {
                            let ptr = bump.find_sized(CHUNK).unwrap();
                            // Touch the slot to make overlap corruption
                            // observable.
                            unsafe { ptr.as_ptr().cast::<u64>().write(ptr.as_ptr() as u64) };
                            ptr.as_ptr() as usize
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let mut sorted = all.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), THREADS * PER_THREAD);

    // Every slot is word-aligned and no two slots overlap.
    for pair in sorted.windows(2) {
        assert_eq!(pair[0] % 8, 0);
        assert!(pair[0] + CHUNK <= pair[1]);
    }

    bump.reset().unwrap();
    assert_eq!(provider.available(), provider.limit());
}
