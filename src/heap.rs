// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

//! Heaps: collections of superblocks bucketed by size class and fullness.
//!
//! The same type serves both as a per-thread heap and as the global heap;
//! the latter is simply never allocated from directly.

use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::ops::Add;
use core::ptr;
use core::ptr::NonNull;

use spin::Mutex;
use spin::MutexGuard;
use typenum::NonZero;
use typenum::PowerOfTwo;
use typenum::Unsigned;

use super::superblock::Superblock;
use super::utils::log2;
use super::HoardError;

type Link<SB, FK> = Option<NonNull<Superblock<SB, FK>>>;

/// A snapshot of the counters of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes reserved in the superblocks owned by the heap.
    pub allocated: usize,
    /// Bytes of those actually handed out to callers.
    pub used: usize,
    /// Number of superblocks owned by the heap.
    pub superblocks: usize,
}

impl Add for HeapStats {
    type Output = HeapStats;
    fn add(self, other: HeapStats) -> HeapStats {
        HeapStats {
            allocated: self.allocated + other.allocated,
            used: self.used + other.used,
            superblocks: self.superblocks + other.superblocks,
        }
    }
}

/// The lock-protected part of a heap.
pub(crate) struct HeapInner<SB, FK> {
    /// `SIZE_KINDS * FULLNESS_KINDS` list heads, row-major by size kind.
    buckets: NonNull<Link<SB, FK>>,
    stats: HeapStats,
}

// The bucket array and the superblocks it links are only reached through
// the heap mutex.
unsafe impl<SB, FK> Send for HeapInner<SB, FK> {}

/// A heap, i.e. a lock around a set of superblock lists.
///
/// Its address identifies it: superblocks store a pointer to the heap
/// owning them.
pub(crate) struct Heap<SB, FK> {
    inner: Mutex<HeapInner<SB, FK>>,
}

/// A locked heap, on which all the heap operations are performed.
pub(crate) struct LockedHeap<'a, SB, FK> {
    heap: &'a Heap<SB, FK>,
    inner: MutexGuard<'a, HeapInner<SB, FK>>,
}

impl<SB, FK> Heap<SB, FK>
where
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    /// Number of size classes: blocks of `1 << k` for `k < log2(SB)`.
    pub(crate) const SIZE_KINDS: usize = log2(SB::USIZE);

    /// Number of list heads a heap needs.
    pub(crate) const BUCKETS: usize = Self::SIZE_KINDS * Superblock::<SB, FK>::FULLNESS_KINDS;

    /// Create an empty heap using the `BUCKETS` heads at `buckets`.
    ///
    /// # Safety
    /// `buckets` must be valid for `BUCKETS` writes and outlive the heap.
    unsafe fn new(buckets: NonNull<Link<SB, FK>>) -> Self {
        for i in 0..Self::BUCKETS {
            buckets.as_ptr().add(i).write(None);
        }
        Heap {
            inner: Mutex::new(HeapInner {
                buckets,
                stats: HeapStats::default(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> LockedHeap<'_, SB, FK> {
        LockedHeap {
            heap: self,
            inner: self.inner.lock(),
        }
    }
}

impl<SB, FK> HeapInner<SB, FK>
where
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    #[inline]
    fn head(&mut self, size_kind: usize, fullness: usize) -> &mut Link<SB, FK> {
        debug_assert!(size_kind < Heap::<SB, FK>::SIZE_KINDS);
        debug_assert!(fullness < Superblock::<SB, FK>::FULLNESS_KINDS);
        let index = size_kind * Superblock::<SB, FK>::FULLNESS_KINDS + fullness;
        unsafe { &mut *self.buckets.as_ptr().add(index) }
    }

    fn push(&mut self, size_kind: usize, fullness: usize, sb: NonNull<Superblock<SB, FK>>) {
        let head = self.head(size_kind, fullness);
        let this = unsafe { sb.as_ref() };
        this.prev.set(None);
        this.next.set(*head);
        if let Some(next) = *head {
            unsafe { next.as_ref() }.prev.set(Some(sb));
        }
        *head = Some(sb);
    }

    fn unlink(&mut self, size_kind: usize, fullness: usize, sb: NonNull<Superblock<SB, FK>>) {
        let this = unsafe { sb.as_ref() };
        let (prev, next) = (this.prev.take(), this.next.take());
        if let Some(next) = next {
            unsafe { next.as_ref() }.prev.set(prev);
        }
        match prev {
            Some(prev) => unsafe { prev.as_ref() }.next.set(next),
            None => {
                let head = self.head(size_kind, fullness);
                debug_assert_eq!(*head, Some(sb));
                *head = next;
            }
        }
    }

    fn pop(&mut self, size_kind: usize, fullness: usize) -> Link<SB, FK> {
        let sb = (*self.head(size_kind, fullness))?;
        self.unlink(size_kind, fullness, sb);
        Some(sb)
    }

    /// Move `sb` to the bucket matching its fullness, if it changed.
    fn rebucket(&mut self, sb: NonNull<Superblock<SB, FK>>, old: usize) {
        let this = unsafe { sb.as_ref() };
        let new = this.fullness_kind();
        if new != old {
            self.unlink(this.size_kind(), old, sb);
            self.push(this.size_kind(), new, sb);
        }
    }

    /// Account for `sb` leaving the heap.
    fn forget(&mut self, sb: NonNull<Superblock<SB, FK>>) {
        let used = unsafe { sb.as_ref() }.used();
        self.stats.allocated -= SB::USIZE;
        self.stats.used -= used;
        self.stats.superblocks -= 1;
    }
}

impl<'a, SB, FK> LockedHeap<'a, SB, FK>
where
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    /// Whether this is the lock of `heap`.
    pub(crate) fn is(&self, heap: *const Heap<SB, FK>) -> bool {
        ptr::eq(self.heap, heap)
    }

    pub(crate) fn heap(&self) -> &'a Heap<SB, FK> {
        self.heap
    }

    pub(crate) fn stats(&self) -> HeapStats {
        self.inner.stats
    }

    /// Allocate a block of `1 << size_kind` bytes from the fullest non-full
    /// superblock of that class.
    ///
    /// Returns `None` when every superblock of the class is full (or there
    /// is none), in which case the heap needs a new superblock.
    pub(crate) fn allocate(&mut self, size_kind: usize) -> Option<NonNull<u8>> {
        for fullness in (0..=FK::USIZE).rev() {
            if let Some(sb) = *self.inner.head(size_kind, fullness) {
                let this = unsafe { sb.as_ref() };
                let block = this.get_block();
                self.inner.rebucket(sb, fullness);
                self.inner.stats.used += this.block_size();
                return Some(block);
            }
        }
        None
    }

    /// Release `block` to the superblock it was carved from.
    ///
    /// # Safety
    /// `block` must be a live block of a superblock owned by this heap.
    pub(crate) unsafe fn free(&mut self, block: NonNull<u8>) {
        let Some(sb) = Superblock::<SB, FK>::owner_of(block) else {
            debug_assert!(false, "{:p} is not a superblock block", block);
            return;
        };
        let this = sb.as_ref();
        debug_assert!(self.is(this.owner()));

        let fullness = this.fullness_kind();
        this.free_block(block);
        self.inner.rebucket(sb, fullness);
        self.inner.stats.used -= this.block_size();
    }

    /// Take ownership of `sb`.
    ///
    /// When `sb` comes from another heap, the lock of that heap must still
    /// be held, so that nobody observes `sb` without an owner.
    pub(crate) fn acquire_superblock(&mut self, sb: NonNull<Superblock<SB, FK>>) {
        let this = unsafe { sb.as_ref() };
        this.set_owner(self.heap);
        self.inner.push(this.size_kind(), this.fullness_kind(), sb);
        self.inner.stats.allocated += SB::USIZE;
        self.inner.stats.used += this.used();
        self.inner.stats.superblocks += 1;
    }

    /// Remove the emptiest non-full superblock of the given class.
    pub(crate) fn release_superblock(&mut self, size_kind: usize) -> Link<SB, FK> {
        for fullness in 0..=FK::USIZE {
            if let Some(sb) = self.inner.pop(size_kind, fullness) {
                self.inner.forget(sb);
                return Some(sb);
            }
        }
        None
    }

    /// Remove the emptiest non-full superblock, whatever its class.
    pub(crate) fn release_any_superblock(&mut self) -> Link<SB, FK> {
        for fullness in 0..=FK::USIZE {
            for size_kind in 0..Heap::<SB, FK>::SIZE_KINDS {
                if let Some(sb) = self.inner.pop(size_kind, fullness) {
                    self.inner.forget(sb);
                    return Some(sb);
                }
            }
        }
        None
    }

    /// Remove any superblock, full ones included.
    fn take_superblock(&mut self) -> Link<SB, FK> {
        for fullness in 0..Superblock::<SB, FK>::FULLNESS_KINDS {
            for size_kind in 0..Heap::<SB, FK>::SIZE_KINDS {
                if let Some(sb) = self.inner.pop(size_kind, fullness) {
                    self.inner.forget(sb);
                    return Some(sb);
                }
            }
        }
        None
    }

    /// Number of superblocks in the given bucket.
    #[cfg(test)]
    pub(crate) fn bucket_len(&mut self, size_kind: usize, fullness: usize) -> usize {
        let mut len = 0;
        let mut cursor = *self.inner.head(size_kind, fullness);
        while let Some(sb) = cursor {
            len += 1;
            cursor = unsafe { sb.as_ref() }.next.get();
        }
        len
    }
}

/// The global heap followed by the thread heaps, in a single allocation
/// obtained from the backing allocator together with their bucket arrays.
pub(crate) struct HeapTable<SB, FK> {
    heaps: NonNull<Heap<SB, FK>>,
    len: usize,
    layout: Layout,
}

// Heaps are only mutated through their own locks.
unsafe impl<SB, FK> Send for HeapTable<SB, FK> {}
unsafe impl<SB, FK> Sync for HeapTable<SB, FK> {}

impl<SB, FK> HeapTable<SB, FK>
where
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    /// Build the global heap and `heap_count` thread heaps.
    pub(crate) fn create<A: GlobalAlloc>(backing: &A, heap_count: usize) -> Result<Self, HoardError> {
        let len = heap_count.checked_add(1).ok_or(HoardError::InvalidLayout)?;
        let heaps = Layout::array::<Heap<SB, FK>>(len).map_err(|_| HoardError::InvalidLayout)?;
        let buckets = len
            .checked_mul(Heap::<SB, FK>::BUCKETS)
            .and_then(|n| Layout::array::<Link<SB, FK>>(n).ok())
            .ok_or(HoardError::InvalidLayout)?;
        let (layout, offset) = heaps.extend(buckets).map_err(|_| HoardError::InvalidLayout)?;
        let layout = layout.pad_to_align();

        unsafe {
            let base = NonNull::new(backing.alloc(layout))
                .ok_or(HoardError::OutOfMemory { size: layout.size() })?;
            let first_bucket = base.as_ptr().add(offset) as *mut Link<SB, FK>;
            for i in 0..len {
                let buckets = first_bucket.add(i * Heap::<SB, FK>::BUCKETS);
                let heap = Heap::new(NonNull::new_unchecked(buckets));
                base.cast::<Heap<SB, FK>>().as_ptr().add(i).write(heap);
            }
            Ok(HeapTable {
                heaps: base.cast(),
                len,
                layout,
            })
        }
    }

    pub(crate) fn as_slice(&self) -> &[Heap<SB, FK>] {
        unsafe { core::slice::from_raw_parts(self.heaps.as_ptr(), self.len) }
    }

    /// The heap superblocks are donated to and stolen from.
    pub(crate) fn global(&self) -> &Heap<SB, FK> {
        &self.as_slice()[0]
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Heap<SB, FK>> {
        self.as_slice().get(index)
    }

    /// Give every superblock, then the table itself, back to `backing`.
    /// Returns the number of superblocks released.
    ///
    /// # Safety
    /// No block served from this table may be used afterwards, and the
    /// table must not be used again.
    pub(crate) unsafe fn release<A: GlobalAlloc>(&mut self, backing: &A) -> usize {
        let mut released = 0;
        for heap in self.as_slice() {
            let mut locked = heap.lock();
            while let Some(sb) = locked.take_superblock() {
                Superblock::destroy(sb, backing);
                released += 1;
            }
        }
        backing.dealloc(self.heaps.as_ptr() as *mut u8, self.layout);
        self.len = 0;
        released
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::System;

    use typenum::consts::U16384;
    use typenum::consts::U5;

    use super::*;

    type Table = HeapTable<U16384, U5>;
    type Sb = Superblock<U16384, U5>;

    const SIZE_KIND_64: usize = 6;

    fn table(heaps: usize) -> Table {
        Table::create(&System, heaps).unwrap()
    }

    fn fresh(heap: &Heap<U16384, U5>, size_kind: usize) -> NonNull<Sb> {
        unsafe { Sb::create(&System, size_kind, heap).unwrap() }
    }

    #[test]
    fn table_layout() {
        let mut table = table(3);
        assert_eq!(table.as_slice().len(), 4);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
        assert_eq!(Heap::<U16384, U5>::SIZE_KINDS, 14);
        assert_eq!(Heap::<U16384, U5>::BUCKETS, 14 * 7);
        for heap in table.as_slice() {
            assert_eq!(heap.lock().stats(), HeapStats::default());
        }
        assert_eq!(unsafe { table.release(&System) }, 0);
    }

    #[test]
    fn allocate_misses_without_superblock() {
        let mut table = table(1);
        let heap = table.get(1).unwrap();
        assert!(heap.lock().allocate(SIZE_KIND_64).is_none());
        unsafe { table.release(&System) };
    }

    #[test]
    fn acquire_then_allocate() {
        let mut table = table(1);
        let heap = table.get(1).unwrap();
        let mut locked = heap.lock();

        let sb = fresh(heap, SIZE_KIND_64);
        locked.acquire_superblock(sb);
        assert_eq!(locked.stats(), HeapStats { allocated: 16384, used: 0, superblocks: 1 });
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 0), 1);

        let blocks: Vec<_> = (0..256).map(|_| locked.allocate(SIZE_KIND_64).unwrap()).collect();
        assert_eq!(locked.stats().used, 16384);
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 6), 1);
        assert!(locked.allocate(SIZE_KIND_64).is_none());

        for block in &blocks {
            unsafe { locked.free(*block) };
        }
        assert_eq!(locked.stats().used, 0);
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 0), 1);
        drop(locked);
        assert_eq!(unsafe { table.release(&System) }, 1);
    }

    #[test]
    fn prefers_fullest_superblock() {
        let mut table = table(1);
        let heap = table.get(1).unwrap();
        let mut locked = heap.lock();

        // fill `a` up to the third quantile, then add an empty `b`
        let a = fresh(heap, SIZE_KIND_64);
        locked.acquire_superblock(a);
        for _ in 0..128 {
            locked.allocate(SIZE_KIND_64).unwrap();
        }
        let b = fresh(heap, SIZE_KIND_64);
        locked.acquire_superblock(b);
        assert_eq!(locked.stats().used, 128 * 64);
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 3), 1);
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 0), 1);

        let block = locked.allocate(SIZE_KIND_64).unwrap();
        assert_eq!(unsafe { Sb::owner_of(block) }, Some(a));
        assert_eq!(unsafe { b.as_ref() }.used(), 0);

        // releasing prefers the emptiest one
        assert_eq!(locked.release_superblock(SIZE_KIND_64), Some(b));
        assert_eq!(locked.stats(), HeapStats { allocated: 16384, used: 129 * 64, superblocks: 1 });
        drop(locked);
        unsafe { Sb::destroy(b, &System) };
        unsafe { table.release(&System) };
    }

    #[test]
    fn free_rebuckets_to_near_empty() {
        let mut table = table(1);
        let heap = table.get(1).unwrap();
        let mut locked = heap.lock();
        locked.acquire_superblock(fresh(heap, SIZE_KIND_64));

        let blocks: Vec<_> = (0..256).map(|_| locked.allocate(SIZE_KIND_64).unwrap()).collect();
        for block in &blocks[..250] {
            unsafe { locked.free(*block) };
        }
        assert_eq!(locked.stats().used, 6 * 64);
        assert_eq!(locked.bucket_len(SIZE_KIND_64, 1), 1);
        for fullness in 2..7 {
            assert_eq!(locked.bucket_len(SIZE_KIND_64, fullness), 0);
        }
        drop(locked);
        unsafe { table.release(&System) };
    }

    #[test]
    fn release_any_skips_full_superblocks() {
        let mut table = table(1);
        let heap = table.get(1).unwrap();
        let mut locked = heap.lock();

        // a full superblock of the largest class
        locked.acquire_superblock(fresh(heap, 13));
        locked.allocate(13).unwrap();
        locked.allocate(13).unwrap();
        assert!(locked.release_any_superblock().is_none());

        let small = fresh(heap, 4);
        locked.acquire_superblock(small);
        assert_eq!(locked.release_any_superblock(), Some(small));
        assert_eq!(locked.stats(), HeapStats { allocated: 16384, used: 16384, superblocks: 1 });
        drop(locked);
        unsafe { Sb::destroy(small, &System) };
        assert_eq!(unsafe { table.release(&System) }, 1);
    }

    #[test]
    fn transfer_between_heaps() {
        let mut table = table(2);
        let (global, local) = (table.global(), table.get(1).unwrap());
        let mut local_lock = local.lock();
        let sb = fresh(local, 5);
        local_lock.acquire_superblock(sb);
        let block = local_lock.allocate(5).unwrap();

        {
            let mut global_lock = global.lock();
            let sb = local_lock.release_any_superblock().unwrap();
            global_lock.acquire_superblock(sb);
            assert!(global_lock.is(unsafe { sb.as_ref() }.owner()));
            assert_eq!(global_lock.stats(), HeapStats { allocated: 16384, used: 32, superblocks: 1 });
        }
        assert_eq!(local_lock.stats(), HeapStats::default());
        drop(local_lock);

        let mut global_lock = global.lock();
        unsafe { global_lock.free(block) };
        assert_eq!(global_lock.stats().used, 0);
        drop(global_lock);
        assert_eq!(unsafe { table.release(&System) }, 1);
    }
}
