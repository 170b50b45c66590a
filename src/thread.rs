// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread identity, as far as heap selection is concerned.

/// Return a key identifying the calling thread.
///
/// This is the address of a thread-local byte: distinct for every live
/// thread, and obtained without allocating, which matters since this runs
/// inside the allocator.
#[cfg(feature = "std")]
pub fn current_key() -> usize {
    std::thread_local! {
        static KEY: u8 = const { 0 };
    }
    KEY.with(|key| key as *const u8 as usize)
}

/// Map a thread key onto one of `heap_count` thread heaps.
///
/// Heap `0` is the global heap, so the result is in `1..=heap_count`.
pub(crate) fn heap_index(key: usize, heap_count: usize) -> usize {
    // Fibonacci hashing: spreads keys that only differ in their high bits,
    // as thread-local addresses usually do.
    let hash = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mixed = (hash ^ (hash >> 29)) as usize;
    1 + mixed % heap_count
}
