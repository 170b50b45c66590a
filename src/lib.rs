// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

//! A multithreaded allocator recycling fixed-size slabs between per-thread
//! heaps.
//!
//! Designed to wrap a general purpose allocator, only using it to obtain
//! large slabs of memory, while keeping lock contention between threads low
//! and bounding the memory a single thread can hoard.
//!
//! # Introduction
//!
//! A single-lock allocator serialises every thread of a program on the same
//! mutex. Giving every thread its own heap removes the contention, but
//! memory freed by one thread can then never be reused by another. The
//! [`Hoard`] allocator sits in between: threads allocate from their own
//! heap, and hand memory back to a shared *global heap* once they use too
//! little of what they hold.
//!
//! # Algorithm
//!
//! The [`Hoard`] wraps another underlying allocator, and only uses it to
//! allocate *superblocks*, constant-size slabs split into blocks of a
//! single power-of-two size class. Superblocks have a default size of
//! `16kB`, but the geometry can be defined at compile time using numerics
//! from the [`typenum`] crate.
//!
//! Every heap keeps, for every size class, its superblocks in buckets of
//! fullness: one for empty superblocks, one for full ones, and a few
//! quantiles in between.
//!
//! ## Allocation
//!
//! When a request is made to allocate memory, the allocator picks the heap
//! of the calling thread (by hashing its identity) and allocates from the
//! fullest superblock of the right size class that still has room. If
//! there is none, a superblock is stolen from the global heap, or, if the
//! global heap has none either, a new superblock is allocated.
//!
//! Allocation of very large objects (more than half a superblock) is done
//! using the underlying allocator directly.
//!
//! ## Deallocation
//!
//! Every block is preceded by a hidden pointer to its superblock, which
//! itself knows the heap currently owning it. The block is released to its
//! superblock under the lock of that heap, whichever thread frees it. If
//! the heap is then using less than a fraction of the memory it holds, one
//! of its emptiest superblocks is donated to the global heap.
//!
//! ## Synchronisation
//!
//! Each heap is protected by a *spinning mutex* from the [`spin`] crate.
//! Locks are always taken in the same order, a thread heap before the
//! global heap, and never two thread heaps at once. The owner of a
//! superblock is the only state read without a lock: it is an atomic
//! pointer, re-checked once the heap it designates has been locked.
//!
//! # Usage
//!
//! The provided [`Hoard`] wraps any object implementing [`GlobalAlloc`].
//! For instance, to use [`Hoard`] over the system allocator:
//! ```rust,no_run
//! use std::alloc::System;
//! use hoardalloc::Hoard;
//!
//! #[global_allocator]
//! static GLOBAL: Hoard<System> = Hoard::new(System);
//! # fn main() {}
//! ```
//!
//! The number of heaps and the donation thresholds can be changed with a
//! [`Config`], and the superblock geometry with type parameters:
//! ```rust,no_run
//! use std::alloc::System;
//! use hoardalloc::{Config, Hoard};
//! use typenum::consts::{U4, U65536};
//!
//! const CONFIG: Config = Config::new().with_heap_count(32).with_reserve(2);
//!
//! #[global_allocator]
//! static GLOBAL: Hoard<System, U65536, U4> = Hoard::with_config(System, CONFIG);
//! # fn main() {}
//! ```
//!
//! Without the `std` feature, the function identifying the calling thread
//! must be given with [`Hoard::with_thread_key`].
//!
//! Log records are emitted through the [`log`] crate; a logger allocating
//! through this allocator is fine, as no record is emitted with a heap
//! locked.
//!
//! [`spin`]: https://docs.rs/spin/
//! [`typenum`]: https://docs.rs/typenum/
//! [`log`]: https://docs.rs/log/
//! [`GlobalAlloc`]: https://doc.rust-lang.org/std/alloc/trait.GlobalAlloc.html

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;
extern crate spin;
extern crate thiserror;
extern crate typenum;

mod alloc;
mod config;
mod error;
mod heap;
mod superblock;
mod thread;
mod utils;

// Public reexport of the generic allocator.
pub use alloc::Hoard;
pub use config::Config;
pub use error::HoardError;
pub use heap::HeapStats;
pub use superblock::BLOCK_ALIGN;
pub use superblock::MIN_BLOCK_SIZE;
#[cfg(feature = "std")]
pub use thread::current_key;
