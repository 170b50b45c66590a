// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Errors raised while serving a request or building the allocator.
///
/// None of these escape through [`GlobalAlloc`](core::alloc::GlobalAlloc):
/// the allocation entry points turn them into a null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HoardError {
    /// The backing allocator could not provide the requested memory.
    #[error("backing allocator could not provide {size} bytes")]
    OutOfMemory { size: usize },
    /// The [`Config`](crate::Config) given at construction is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The request cannot be expressed as a [`Layout`](core::alloc::Layout).
    #[error("requested layout overflows the address space")]
    InvalidLayout,
}
