// Copyright (c) 2018-2019 Martin Larralde (martin.larralde@ens-paris-saclay.fr)
//
// Licensed under MIT license (the COPYING file). This file may not be
// copied, modified, or distributed except according to those terms.

use super::HoardError;

/// Construction-time policy of a [`Hoard`](crate::Hoard).
///
/// The superblock geometry is chosen at compile time through type
/// parameters; everything here only decides how many heaps exist and when
/// a thread heap hands memory back to the global heap.
///
/// A thread heap donates one superblock to the global heap whenever, after
/// a free, both
///
/// * `used < allocated - reserve * superblock_size`, and
/// * `den * used < num * allocated`
///
/// hold, where `num / den` is the empty fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    heap_count: usize,
    reserve_superblocks: usize,
    empty_numerator: usize,
    empty_denominator: usize,
}

impl Config {
    /// Number of thread heaps when none is given: twice a typical core count.
    pub const DEFAULT_HEAP_COUNT: usize = 16;

    /// Create the default configuration: 16 heaps, one superblock of
    /// reserve, and a `3/4` empty fraction.
    pub const fn new() -> Self {
        Config {
            heap_count: Self::DEFAULT_HEAP_COUNT,
            reserve_superblocks: 1,
            empty_numerator: 3,
            empty_denominator: 4,
        }
    }

    /// Set the number of per-thread heaps (the global heap comes on top).
    pub const fn with_heap_count(mut self, heap_count: usize) -> Self {
        self.heap_count = heap_count;
        self
    }

    /// Set how many superblocks worth of free space a thread heap may keep.
    pub const fn with_reserve(mut self, superblocks: usize) -> Self {
        self.reserve_superblocks = superblocks;
        self
    }

    /// Set the utilisation fraction `num / den` under which a thread heap
    /// is considered emptiable.
    pub const fn with_empty_fraction(mut self, num: usize, den: usize) -> Self {
        self.empty_numerator = num;
        self.empty_denominator = den;
        self
    }

    pub const fn heap_count(&self) -> usize {
        self.heap_count
    }

    pub const fn reserve(&self) -> usize {
        self.reserve_superblocks
    }

    pub const fn empty_fraction(&self) -> (usize, usize) {
        (self.empty_numerator, self.empty_denominator)
    }

    /// Check the configuration can drive an allocator.
    pub fn validate(&self) -> Result<(), HoardError> {
        if self.heap_count == 0 {
            return Err(HoardError::InvalidConfig("at least one thread heap is required"));
        }
        if self.empty_denominator == 0 || self.empty_numerator == 0 {
            return Err(HoardError::InvalidConfig("empty fraction must be positive"));
        }
        if self.empty_numerator > self.empty_denominator {
            return Err(HoardError::InvalidConfig("empty fraction must not exceed 1"));
        }
        Ok(())
    }

    /// Whether a thread heap with these counters should donate a superblock.
    pub(crate) fn should_release(&self, used: usize, allocated: usize, superblock_size: usize) -> bool {
        let reserve = self.reserve_superblocks.saturating_mul(superblock_size);
        used < allocated.saturating_sub(reserve)
            && used.saturating_mul(self.empty_denominator)
                < allocated.saturating_mul(self.empty_numerator)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.heap_count(), 16);
        assert_eq!(config.reserve(), 1);
        assert_eq!(config.empty_fraction(), (3, 4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_degenerate() {
        assert!(Config::new().with_heap_count(0).validate().is_err());
        assert!(Config::new().with_empty_fraction(1, 0).validate().is_err());
        assert!(Config::new().with_empty_fraction(0, 4).validate().is_err());
        assert_eq!(
            Config::new().with_empty_fraction(5, 4).validate(),
            Err(HoardError::InvalidConfig("empty fraction must not exceed 1"))
        );
    }

    #[test]
    fn release_needs_both_margins() {
        let config = Config::new();
        let sb = 16384;
        // a single superblock is always kept in reserve
        assert!(!config.should_release(0, sb, sb));
        // enough slack but still three quarters full
        assert!(!config.should_release(6 * sb + sb / 2, 8 * sb, sb));
        // both conditions met
        assert!(config.should_release(sb, 4 * sb, sb));
    }

    #[test]
    fn release_without_reserve() {
        let config = Config::new().with_reserve(0);
        assert!(config.should_release(384, 16384, 16384));
        assert!(!config.should_release(12288, 16384, 16384));
        assert!(!config.should_release(0, 0, 16384));
    }
}
