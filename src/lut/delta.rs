//! Address-delta table construction.
//!
//! For each reduction step the kernel advances its operand pointer by a
//! precomputed delta instead of recomputing the unrolled-matrix address. The
//! delta for step `k` is `addr(k + TK) - addr(k)`, which is periodic in
//! `k mod luts` because the lookup period is a multiple of the reduction
//! sub-period.

use super::{walk_offset, PhaseGeometry};
use crate::shape::OperandWalk;

/// How the delta table is laid out and indexed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaMode {
    /// The TK-step progression is uniform across phases; a single table of
    /// `fs` identical entries suffices and is shared by the whole launch.
    Constant,
    /// Phase-dependent deltas; one entry per lookup phase (`luts` entries).
    Lookup,
}

/// Precomputed address deltas for one operand's reduction walk.
///
/// Read-only after construction; mirrored verbatim into device memory by the
/// driver layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressDeltaTable {
    geom: PhaseGeometry,
    mode: DeltaMode,
    /// Initial address of each in-flight lane (the kernel derives the same
    /// values from its lane index at start-up)
    start: Vec<i64>,
    deltas: Vec<i32>,
}

impl AddressDeltaTable {
    /// Build the delta table for one operand.
    ///
    /// The mode choice is deterministic: constant-delta mode whenever the
    /// sub-period divides the tile depth (the per-phase deltas then all
    /// collapse to the same channel advance), lookup mode otherwise.
    pub fn build(geom: PhaseGeometry, dims: [usize; 3], walk: &OperandWalk, flip: bool) -> Self {
        let mode = if geom.tk % geom.fs == 0 {
            DeltaMode::Constant
        } else {
            DeltaMode::Lookup
        };
        let period = match mode {
            DeltaMode::Constant => geom.fs,
            DeltaMode::Lookup => geom.luts,
        };
        let addr = |k: usize| walk_offset(k, geom.fs, dims, walk, flip);
        let deltas: Vec<i32> = (0..period)
            .map(|i| (addr(i + geom.tk) - addr(i)) as i32)
            .collect();
        if mode == DeltaMode::Constant {
            // uniformity is what justified the collapsed table
            debug_assert!(deltas.windows(2).all(|w| w[0] == w[1]));
        }
        let start: Vec<i64> = (0..geom.tk).map(addr).collect();
        AddressDeltaTable {
            geom,
            mode,
            start,
            deltas,
        }
    }

    /// Phase geometry the table was built with
    pub fn geometry(&self) -> PhaseGeometry {
        self.geom
    }

    /// Recorded mode (selects the matching kernel code path)
    pub fn mode(&self) -> DeltaMode {
        self.mode
    }

    /// Table entries, in device order
    pub fn as_slice(&self) -> &[i32] {
        &self.deltas
    }

    /// Initial lane offsets
    pub fn lane_starts(&self) -> &[i64] {
        &self.start
    }

    /// Delta applied after processing step `k`
    #[inline]
    pub fn step(&self, k: usize) -> i64 {
        self.deltas[k % self.deltas.len()] as i64
    }

    /// Absolute walk offset of step `k`, reconstructed the way the kernel
    /// does: seed the lane pointer, then accumulate one delta per iteration.
    pub fn offset_at(&self, k: usize) -> i64 {
        let lane = k % self.geom.tk;
        let mut addr = self.start[lane];
        let mut step = lane;
        while step < k {
            addr += self.step(step);
            step += self.geom.tk;
        }
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lut::walk_offset;

    fn walk() -> OperandWalk {
        OperandWalk {
            chan: 125,
            tap: [25, 5, 1],
        }
    }

    #[test]
    fn test_lookup_mode_for_indivisible_tile() {
        let geom = PhaseGeometry::new(8, 27);
        let t = AddressDeltaTable::build(geom, [3, 3, 3], &walk(), false);
        assert_eq!(t.mode(), DeltaMode::Lookup);
        assert_eq!(t.as_slice().len(), 27);
    }

    #[test]
    fn test_constant_mode_when_period_divides() {
        // 1x2x2 filter: fs = 4 divides tk = 8
        let geom = PhaseGeometry::new(8, 4);
        let t = AddressDeltaTable::build(geom, [1, 2, 2], &walk(), false);
        assert_eq!(t.mode(), DeltaMode::Constant);
        assert_eq!(t.as_slice().len(), 4);
        // every entry is the uniform two-channel advance
        assert!(t.as_slice().iter().all(|&d| d == 250));
    }

    #[test]
    fn test_pointwise_filter_is_constant() {
        let geom = PhaseGeometry::new(8, 1);
        let t = AddressDeltaTable::build(geom, [1, 1, 1], &walk(), false);
        assert_eq!(t.mode(), DeltaMode::Constant);
        assert_eq!(t.as_slice(), &[8 * 125]);
    }

    #[test]
    fn test_replay_matches_direct_addresses() {
        let geom = PhaseGeometry::new(8, 27);
        let dims = [3, 3, 3];
        for flip in [false, true] {
            let t = AddressDeltaTable::build(geom, dims, &walk(), flip);
            for k in 0..4 * 27 {
                assert_eq!(
                    t.offset_at(k),
                    walk_offset(k, 27, dims, &walk(), flip),
                    "k={} flip={}",
                    k,
                    flip
                );
            }
        }
    }

    #[test]
    fn test_idempotent_construction() {
        let geom = PhaseGeometry::new(8, 27);
        let a = AddressDeltaTable::build(geom, [3, 3, 3], &walk(), true);
        let b = AddressDeltaTable::build(geom, [3, 3, 3], &walk(), true);
        assert_eq!(a, b);
    }
}
