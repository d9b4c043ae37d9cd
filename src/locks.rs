//! Split-K accumulation protocol.
//!
//! When the reduction dimension is split across independent blocks, partial
//! sums for one output tile are combined under a per-tile spinlock, and an
//! arrival counter elects the block that performs the final write-back. The
//! device kernel implements this in its epilogue; this module is the explicit
//! host-side model of the same protocol, used to size and initialize the
//! device lock buffer and to make the protocol itself testable.

use std::sync::atomic::{AtomicI32, Ordering};

/// Words per tile: one spinlock, one arrival counter.
const WORDS_PER_TILE: usize = 2;

/// Host model of the device lock buffer.
///
/// Layout matches the device side: `2 * grid0 * grid1` i32 words, tile
/// `(g0, g1)` owning the pair at `2 * (g1 * grid0 + g0)`. All words start at
/// zero, and the protocol leaves them at zero again after the last
/// contributor, so the buffer needs no host-side reset between launches that
/// run to completion.
pub struct LockTable {
    grid0: usize,
    words: Vec<AtomicI32>,
}

/// Number of i32 words the device lock buffer must hold for the given
/// conservative grid bounds.
pub fn lock_words(max_grid: (usize, usize)) -> usize {
    WORDS_PER_TILE * max_grid.0 * max_grid.1
}

impl LockTable {
    /// Zero-initialized table covering a `grid0 x grid1` tile grid.
    pub fn new(grid0: usize, grid1: usize) -> Self {
        let words = (0..WORDS_PER_TILE * grid0 * grid1)
            .map(|_| AtomicI32::new(0))
            .collect();
        LockTable { grid0, words }
    }

    /// The lock/counter pair for one output tile.
    pub fn tile(&self, g0: usize, g1: usize) -> TileLock<'_> {
        let base = WORDS_PER_TILE * (g1 * self.grid0 + g0);
        TileLock {
            lock: &self.words[base],
            count: &self.words[base + 1],
        }
    }
}

/// One output tile's lock/counter pair.
pub struct TileLock<'a> {
    lock: &'a AtomicI32,
    count: &'a AtomicI32,
}

impl TileLock<'_> {
    /// Add one block's contribution under the tile lock.
    ///
    /// `f` runs while the lock is held and receives the number of blocks that
    /// contributed before this one; the first contributor (`0`) overwrites
    /// the tile, later ones accumulate. Returns `true` for exactly one of
    /// `expected` contributors: the last to arrive, which performs the
    /// visible write-back. The counter is reset on that final arrival.
    pub fn contribute(&self, expected: i32, f: impl FnOnce(i32)) -> bool {
        while self
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let arrived = self.count.load(Ordering::Relaxed);
        f(arrived);
        let last = arrived + 1 == expected;
        self.count
            .store(if last { 0 } else { arrived + 1 }, Ordering::Relaxed);
        self.lock.store(0, Ordering::Release);
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_lock_words() {
        assert_eq!(lock_words((256, 256)), 2 * 256 * 256);
    }

    #[test]
    fn test_single_contributor_is_last() {
        let table = LockTable::new(4, 4);
        let mut ran = false;
        let last = table.tile(2, 1).contribute(1, |arrived| {
            assert_eq!(arrived, 0);
            ran = true;
        });
        assert!(ran && last);
    }

    #[test]
    fn test_exactly_one_last_writer_across_threads() {
        let table = LockTable::new(2, 2);
        let winners = Mutex::new(0usize);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if table.tile(1, 1).contribute(8, |_| {}) {
                        *winners.lock().unwrap() += 1;
                    }
                });
            }
        });
        assert_eq!(*winners.lock().unwrap(), 1);
        // counter reset for the next launch
        let last = table.tile(1, 1).contribute(1, |arrived| assert_eq!(arrived, 0));
        assert!(last);
    }
}
