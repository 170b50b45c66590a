// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size slabs of equally sized blocks.
//!
//! A superblock is a single allocation obtained from the backing allocator,
//! laid out as follows:
//!
//! ```text
//! +------------+-----------------+--------+---------+--------+---------+-----
//! | Superblock | next: [u16; n]  | header | block 0 | header | block 1 | ...
//! +------------+-----------------+--------+---------+--------+---------+-----
//! ```
//!
//! The `next` array is the intrusive free list, indexed by slot number.
//! Every block is preceded by a [`BlockHeader`] pointing back at the
//! superblock, so that a bare pointer can be routed to its owner in `O(1)`.

use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::align_of;
use core::mem::size_of;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering;

use typenum::NonZero;
use typenum::PowerOfTwo;
use typenum::Unsigned;

use super::heap::Heap;
use super::utils::align_up;
use super::HoardError;

/// Smallest block handed out by a superblock.
///
/// Keeping every block a multiple of this keeps every block header, and
/// therefore every returned pointer, aligned to a machine word.
pub const MIN_BLOCK_SIZE: usize = 8;

/// `log2` of [`MIN_BLOCK_SIZE`].
pub const MIN_SIZE_KIND: usize = 3;

/// Alignment guaranteed for blocks served from a superblock.
pub const BLOCK_ALIGN: usize = align_of::<usize>();

/// End-of-list marker in the free list.
const NIL: u16 = u16::MAX;

/// The hidden word stored right before every block.
///
/// A `None` owner marks a block that was not carved out of a superblock,
/// i.e. a big object served by the backing allocator directly.
#[repr(transparent)]
pub(crate) struct BlockHeader<SB, FK> {
    pub(crate) owner: Option<NonNull<Superblock<SB, FK>>>,
}

impl<SB, FK> BlockHeader<SB, FK> {
    pub(crate) const SIZE: usize = size_of::<Self>();

    /// Get the header stored in front of `block`.
    ///
    /// # Safety
    /// `block` must have been returned by the allocator and still be live.
    pub(crate) unsafe fn of(block: NonNull<u8>) -> *mut Self {
        block.as_ptr().sub(Self::SIZE) as *mut Self
    }
}

/// A slab of `SB` bytes split into blocks of `1 << size_kind` bytes.
///
/// The mutable state lives in `Cell`s: a superblock is only ever touched
/// through raw pointers while the lock of its owning heap is held. The
/// `owner` field is the single exception, as it is read without any lock
/// by `free` to find out which heap to lock.
#[repr(C)]
pub(crate) struct Superblock<SB, FK> {
    owner: AtomicPtr<Heap<SB, FK>>,
    size_kind: usize,
    capacity: u16,
    free_list: NonNull<u16>,
    slots: NonNull<u8>,
    free_head: Cell<u16>,
    used: Cell<usize>,
    pub(crate) next: Cell<Option<NonNull<Superblock<SB, FK>>>>,
    pub(crate) prev: Cell<Option<NonNull<Superblock<SB, FK>>>>,
    layout: Layout,
    __geometry: PhantomData<(SB, FK)>,
}

impl<SB, FK> Superblock<SB, FK>
where
    SB: Unsigned + PowerOfTwo,
    FK: Unsigned + NonZero,
{
    /// Fails to compile for superblocks too small to hold two blocks, or
    /// holding more blocks than the `u16` free list can index.
    pub(crate) const GEOMETRY: () = assert!(
        SB::USIZE >= 2 * MIN_BLOCK_SIZE && SB::USIZE / MIN_BLOCK_SIZE < NIL as usize,
        "superblock size out of range"
    );

    /// Number of fullness buckets: empty, `FK` quantiles, and full.
    pub(crate) const FULLNESS_KINDS: usize = FK::USIZE + 2;

    /// Backing layout of a superblock serving blocks of `1 << size_kind`.
    fn layout_for(size_kind: usize) -> Result<(Layout, usize), HoardError> {
        let capacity = SB::USIZE >> size_kind;
        let stride = BlockHeader::<SB, FK>::SIZE + (1 << size_kind);
        let slots = Self::slots_offset(capacity);
        let size = stride
            .checked_mul(capacity)
            .and_then(|s| s.checked_add(slots))
            .ok_or(HoardError::InvalidLayout)?;
        let align = align_of::<Self>().max(align_of::<BlockHeader<SB, FK>>());
        Layout::from_size_align(size, align)
            .map(|layout| (layout, capacity))
            .map_err(|_| HoardError::InvalidLayout)
    }

    fn slots_offset(capacity: usize) -> usize {
        align_up(
            size_of::<Self>() + capacity * size_of::<u16>(),
            align_of::<BlockHeader<SB, FK>>(),
        )
    }

    /// Reserve a new superblock from `backing`, owned by `owner`, with every
    /// block free and linked in slot order.
    ///
    /// # Safety
    /// `owner` must outlive the superblock.
    pub(crate) unsafe fn create<A: GlobalAlloc>(
        backing: &A,
        size_kind: usize,
        owner: *const Heap<SB, FK>,
    ) -> Result<NonNull<Self>, HoardError> {
        let () = Self::GEOMETRY;
        debug_assert!(size_kind >= MIN_SIZE_KIND && (1 << size_kind) <= SB::USIZE / 2);
        let (layout, capacity) = Self::layout_for(size_kind)?;
        let base = NonNull::new(backing.alloc(layout))
            .ok_or(HoardError::OutOfMemory { size: layout.size() })?;

        let sb = base.cast::<Self>();
        let free_list = NonNull::new_unchecked(base.as_ptr().add(size_of::<Self>())).cast();
        let slots = NonNull::new_unchecked(base.as_ptr().add(Self::slots_offset(capacity)));
        ptr::write(
            sb.as_ptr(),
            Superblock {
                owner: AtomicPtr::new(owner as *mut _),
                size_kind,
                capacity: capacity as u16,
                free_list,
                slots,
                free_head: Cell::new(0),
                used: Cell::new(0),
                next: Cell::new(None),
                prev: Cell::new(None),
                layout,
                __geometry: PhantomData,
            },
        );

        let this = sb.as_ref();
        for slot in 0..capacity {
            let next = if slot + 1 == capacity { NIL } else { slot as u16 + 1 };
            this.free_list().add(slot).write(next);
            ptr::write(
                BlockHeader::<SB, FK>::of(this.block_at(slot)),
                BlockHeader { owner: Some(sb) },
            );
        }

        Ok(sb)
    }

    /// Give the memory of `sb` back to `backing`.
    ///
    /// # Safety
    /// `sb` must not be referenced by any heap anymore, and none of its
    /// blocks may be used afterwards.
    pub(crate) unsafe fn destroy<A: GlobalAlloc>(sb: NonNull<Self>, backing: &A) {
        let layout = sb.as_ref().layout;
        backing.dealloc(sb.as_ptr() as *mut u8, layout);
    }

    /// Find the superblock a live block was carved from.
    ///
    /// # Safety
    /// `block` must have been returned by the allocator and still be live.
    pub(crate) unsafe fn owner_of(block: NonNull<u8>) -> Option<NonNull<Self>> {
        (*BlockHeader::<SB, FK>::of(block)).owner
    }

    #[inline]
    fn free_list(&self) -> *mut u16 {
        self.free_list.as_ptr()
    }

    #[inline]
    fn slots(&self) -> *mut u8 {
        self.slots.as_ptr()
    }

    #[inline]
    fn stride(&self) -> usize {
        BlockHeader::<SB, FK>::SIZE + self.block_size()
    }

    /// Address of the block in slot `slot`.
    #[inline]
    fn block_at(&self, slot: usize) -> NonNull<u8> {
        debug_assert!(slot < self.capacity as usize);
        unsafe {
            let block = self
                .slots()
                .add(slot * self.stride() + BlockHeader::<SB, FK>::SIZE);
            NonNull::new_unchecked(block)
        }
    }

    pub(crate) fn size_kind(&self) -> usize {
        self.size_kind
    }

    pub(crate) fn block_size(&self) -> usize {
        1 << self.size_kind
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes currently handed out.
    pub(crate) fn used(&self) -> usize {
        self.used.get()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.used.get() == SB::USIZE
    }

    /// Bucket of this superblock: `0` when empty, `FK + 1` when full,
    /// `1 + FK * used / SB` in between.
    pub(crate) fn fullness_kind(&self) -> usize {
        match self.used.get() {
            0 => 0,
            used => 1 + FK::USIZE * used / SB::USIZE,
        }
    }

    /// The heap currently owning this superblock.
    pub(crate) fn owner(&self) -> *mut Heap<SB, FK> {
        self.owner.load(Ordering::Acquire)
    }

    /// Must only be called with the lock of the new owner held, and of the
    /// previous owner if there was one.
    pub(crate) fn set_owner(&self, heap: *const Heap<SB, FK>) {
        self.owner.store(heap as *mut _, Ordering::Release);
    }

    /// Pop a block off the free list.
    ///
    /// Panics if the superblock is full: callers must only pick superblocks
    /// from non-full buckets.
    pub(crate) fn get_block(&self) -> NonNull<u8> {
        assert!(!self.is_full(), "allocating from a full superblock");
        let slot = self.free_head.get();
        debug_assert!(slot != NIL);
        unsafe {
            self.free_head.set(self.free_list().add(slot as usize).read());
        }
        self.used.set(self.used.get() + self.block_size());
        self.block_at(slot as usize)
    }

    /// Push `block` back onto the free list.
    ///
    /// # Safety
    /// `block` must be a live block of this superblock.
    pub(crate) unsafe fn free_block(&self, block: NonNull<u8>) {
        let offset = block.as_ptr() as usize
            - self.slots() as usize
            - BlockHeader::<SB, FK>::SIZE;
        debug_assert_eq!(offset % self.stride(), 0, "{:p} is not a block start", block);
        let slot = offset / self.stride();
        assert!(slot < self.capacity(), "{:p} is outside of its superblock", block);
        debug_assert!(self.used.get() >= self.block_size());

        self.free_list().add(slot).write(self.free_head.get());
        self.free_head.set(slot as u16);
        self.used.set(self.used.get() - self.block_size());
    }
}
