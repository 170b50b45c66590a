// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::cmp::max;
use core::mem::size_of;
use core::ptr;
use core::ptr::NonNull;

use spin::Once;
use typenum::consts::U16384;
use typenum::consts::U5;
use typenum::NonZero;
use typenum::PowerOfTwo;
use typenum::Unsigned;

use super::heap::Heap;
use super::heap::HeapStats;
use super::heap::HeapTable;
use super::heap::LockedHeap;
use super::superblock::BlockHeader;
use super::superblock::Superblock;
use super::superblock::BLOCK_ALIGN;
use super::superblock::MIN_BLOCK_SIZE;
use super::thread::heap_index;
use super::utils::align_up;
use super::utils::ceil_log2;
use super::Config;
use super::HoardError;

/// Header of a big object, stored right before the user pointer.
///
/// Ends with the same [`BlockHeader`] as superblock blocks, set to `None`,
/// which is how `deallocate` tells both kinds apart.
#[repr(C)]
struct BigHeader<SB, FK> {
    size: usize,
    align: usize,
    tag: BlockHeader<SB, FK>,
}

/// Where the superblock a heap was refilled with came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refill {
    Stolen,
    Created,
}

/// A multithreaded allocator with per-thread heaps, wrapping a backing
/// allocator it only uses for superblocks and big objects.
///
/// # Compile-time configuration
///
/// Superblock geometry is set using numeric types from the
/// [`typenum`](https://docs.rs/typenum) crate. The parameters are
/// (in the order of appearance in the struct signature):
///
/// * **SB** (superblock size): the number of bytes of blocks a superblock
///   holds. Requests larger than half of it bypass the superblocks.
/// * **FK** (fullness kinds): the number of quantiles superblocks are
///   bucketed by, between the *empty* and *full* buckets.
///
/// The number of heaps and the donation thresholds are given at
/// construction with a [`Config`].
///
/// # Usage
///
/// ```rust
/// use std::alloc::System;
/// use hoardalloc::{Config, Hoard};
///
/// let hoard: Hoard<System> = Hoard::with_config(System, Config::new().with_heap_count(4));
/// let ptr = hoard.allocate(100);
/// assert!(!ptr.is_null());
/// assert_eq!(unsafe { hoard.usable_size(ptr) }, 128);
/// unsafe { hoard.deallocate(ptr) };
/// ```
pub struct Hoard<A, SB = U16384, FK = U5>
where
    A: GlobalAlloc,
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    backing: A,
    config: Config,
    thread_key: fn() -> usize,
    table: Once<HeapTable<SB, FK>>,
}

#[cfg(feature = "std")]
impl<A> Hoard<A>
where
    A: GlobalAlloc,
{
    /// Create a new allocator with the default geometry and configuration,
    /// wrapping the given allocator.
    pub const fn new(backing: A) -> Self {
        Self::with_config(backing, Config::new())
    }
}

impl<A, SB, FK> Hoard<A, SB, FK>
where
    A: GlobalAlloc,
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    /// Create a new allocator with the given configuration, picking heaps
    /// by the identity of the calling thread.
    #[cfg(feature = "std")]
    pub const fn with_config(backing: A, config: Config) -> Self {
        Self::with_thread_key(backing, config, super::thread::current_key)
    }

    /// Create a new allocator using `thread_key` to identify the calling
    /// thread. Threads with equal keys share a heap.
    ///
    /// The heaps themselves are built on first use, or by [`Hoard::init`].
    pub const fn with_thread_key(backing: A, config: Config, thread_key: fn() -> usize) -> Self {
        let () = Superblock::<SB, FK>::GEOMETRY;
        Hoard {
            backing,
            config,
            thread_key,
            table: Once::new(),
        }
    }

    /// Build the heaps now rather than on the first allocation.
    pub fn init(&self) -> Result<(), HoardError> {
        if self.table.is_completed() {
            return Ok(());
        }
        self.table()?;
        debug!(
            "initialized {} heaps with {} byte superblocks",
            self.config.heap_count(),
            SB::to_usize()
        );
        Ok(())
    }

    fn table(&self) -> Result<&HeapTable<SB, FK>, HoardError> {
        self.table.try_call_once(|| {
            self.config.validate()?;
            HeapTable::create(&self.backing, self.config.heap_count())
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of heaps, the global heap included.
    pub fn heap_count(&self) -> usize {
        self.config.heap_count() + 1
    }

    /// Counters of the heap at `index`; index `0` is the global heap.
    pub fn stats(&self, index: usize) -> Option<HeapStats> {
        let table = self.table.get()?;
        table.get(index).map(|heap| heap.lock().stats())
    }

    /// Counters summed over all heaps.
    pub fn total_stats(&self) -> HeapStats {
        match self.table.get() {
            Some(table) => table
                .as_slice()
                .iter()
                .map(|heap| heap.lock().stats())
                .fold(HeapStats::default(), |acc, stats| acc + stats),
            None => HeapStats::default(),
        }
    }

    /// Whether `size` bytes are served directly by the backing allocator.
    #[inline]
    fn is_big(size: usize) -> bool {
        size > SB::to_usize() / 2
    }

    /// Size class serving `size` bytes: `ceil(log2(size))`, at least the
    /// one of [`MIN_BLOCK_SIZE`].
    #[inline]
    fn size_kind(size: usize) -> usize {
        ceil_log2(max(size, MIN_BLOCK_SIZE))
    }

    fn current_heap<'t>(&self, table: &'t HeapTable<SB, FK>) -> &'t Heap<SB, FK> {
        let index = heap_index((self.thread_key)(), self.config.heap_count());
        // `heap_index` is always in `1..=heap_count`
        &table.as_slice()[index]
    }

    /// Allocate `size` bytes, or return a null pointer if the backing
    /// allocator is exhausted.
    ///
    /// Returned pointers are aligned to a machine word.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.allocate_aligned(size, BLOCK_ALIGN)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        match self.try_allocate(size, align) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                warn!("failed to allocate {} bytes: {}", size, e);
                ptr::null_mut()
            }
        }
    }

    fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, HoardError> {
        if Self::is_big(size) || align > BLOCK_ALIGN {
            return self.allocate_big(size, align);
        }

        let table = self.table()?;
        let size_kind = Self::size_kind(size);
        let heap = self.current_heap(table);

        let (block, refill) = {
            let mut local = heap.lock();
            if let Some(block) = local.allocate(size_kind) {
                return Ok(block);
            }
            let refill = self.refill(&mut local, table.global(), size_kind)?;
            let block = local.allocate(size_kind);
            debug_assert!(block.is_some(), "allocation must succeed after a refill");
            (block, refill)
        };

        trace!("{:?} a superblock of {} byte blocks", refill, 1usize << size_kind);
        block.ok_or(HoardError::OutOfMemory { size })
    }

    /// Give `local` a non-full superblock of `size_kind`: one from the
    /// global heap if there is any, a fresh one otherwise.
    fn refill(
        &self,
        local: &mut LockedHeap<'_, SB, FK>,
        global: &Heap<SB, FK>,
        size_kind: usize,
    ) -> Result<Refill, HoardError> {
        {
            // The superblock keeps the global heap as its owner until
            // `acquire_superblock` runs, so both locks are held until then.
            let mut global = global.lock();
            if let Some(sb) = global.release_superblock(size_kind) {
                local.acquire_superblock(sb);
                return Ok(Refill::Stolen);
            }
        }

        let sb = unsafe { Superblock::create(&self.backing, size_kind, local.heap())? };
        local.acquire_superblock(sb);
        Ok(Refill::Created)
    }

    /// Release a pointer obtained from [`Hoard::allocate`].
    ///
    /// # Safety
    /// `ptr` must be null, or have been returned by this allocator and not
    /// have been released since.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        match Superblock::<SB, FK>::owner_of(block) {
            Some(sb) => self.deallocate_small(sb, block),
            None => self.deallocate_big(block),
        }
    }

    unsafe fn deallocate_small(&self, sb: NonNull<Superblock<SB, FK>>, block: NonNull<u8>) {
        // The superblock may be moved to another heap between reading its
        // owner and locking it: check again once locked, until they agree.
        let mut owner = sb.as_ref().owner();
        let mut locked = (*owner).lock();
        loop {
            let current = sb.as_ref().owner();
            if current == owner {
                break;
            }
            drop(locked);
            owner = current;
            locked = (*owner).lock();
        }

        locked.free(block);

        // Blocks can only have been served if the table exists.
        let Some(table) = self.table.get() else {
            return;
        };
        let global = table.global();
        if locked.is(global) {
            return;
        }

        let stats = locked.stats();
        if !self.config.should_release(stats.used, stats.allocated, SB::to_usize()) {
            return;
        }

        let donated = {
            let mut global = global.lock();
            match locked.release_any_superblock() {
                Some(sb) => {
                    global.acquire_superblock(sb);
                    true
                }
                None => false,
            }
        };
        drop(locked);

        if donated {
            trace!(
                "donated a superblock to the global heap ({}/{} bytes used)",
                stats.used,
                stats.allocated
            );
        }
    }

    /// Offset of the user pointer from the start of a big object.
    #[inline]
    fn big_offset(align: usize) -> usize {
        align_up(size_of::<BigHeader<SB, FK>>(), align)
    }

    fn allocate_big(&self, size: usize, align: usize) -> Result<NonNull<u8>, HoardError> {
        let align = max(align, BLOCK_ALIGN);
        let offset = Self::big_offset(align);
        let total = offset.checked_add(size).ok_or(HoardError::InvalidLayout)?;
        let layout = Layout::from_size_align(total, align).map_err(|_| HoardError::InvalidLayout)?;

        unsafe {
            let base = NonNull::new(self.backing.alloc(layout))
                .ok_or(HoardError::OutOfMemory { size: total })?;
            let block = NonNull::new_unchecked(base.as_ptr().add(offset));
            ptr::write(
                Self::big_header(block),
                BigHeader {
                    size,
                    align,
                    tag: BlockHeader { owner: None },
                },
            );
            Ok(block)
        }
    }

    #[inline]
    unsafe fn big_header(block: NonNull<u8>) -> *mut BigHeader<SB, FK> {
        block.as_ptr().sub(size_of::<BigHeader<SB, FK>>()) as *mut BigHeader<SB, FK>
    }

    unsafe fn deallocate_big(&self, block: NonNull<u8>) {
        let header = ptr::read(Self::big_header(block));
        let offset = Self::big_offset(header.align);
        let layout = Layout::from_size_align_unchecked(offset + header.size, header.align);
        self.backing.dealloc(block.as_ptr().sub(offset), layout);
    }

    /// Number of bytes usable at `ptr`: the size of its block, or the
    /// requested size for big objects.
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        let Some(block) = NonNull::new(ptr as *mut u8) else {
            return 0;
        };
        match Superblock::<SB, FK>::owner_of(block) {
            Some(sb) => sb.as_ref().block_size(),
            None => (*Self::big_header(block)).size,
        }
    }
}

unsafe impl<A, SB, FK> GlobalAlloc for Hoard<A, SB, FK>
where
    A: GlobalAlloc,
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr)
    }
}

impl<A, SB, FK> Drop for Hoard<A, SB, FK>
where
    A: GlobalAlloc,
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    fn drop(&mut self) {
        if let Some(table) = self.table.get_mut() {
            let released = unsafe { table.release(&self.backing) };
            debug!("released {} superblocks to the backing allocator", released);
        }
    }
}
