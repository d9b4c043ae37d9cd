//! Lookup-table construction for the implicit-GEMM reduction walk.
//!
//! The generated kernel never materializes the unrolled (im2col) matrix.
//! Instead it advances per-lane pointers by precomputed address deltas
//! ([`delta::AddressDeltaTable`]) and zeroes out-of-bounds lanes through
//! boundary bitmasks ([`mask::BoundaryMaskTable`]). Both tables are cyclic
//! over the same phase period, which this module defines.

pub mod delta;
pub mod mask;

pub use delta::{AddressDeltaTable, DeltaMode};
pub use mask::BoundaryMaskTable;

use crate::shape::OperandWalk;

/// Largest supported reduction tile depth; one mask word holds one bit per
/// in-flight lane.
pub const MAX_TK: usize = 32;

/// Cyclic phase geometry shared by the delta and mask tables of one
/// operation.
///
/// `luts` is the lookup period: the smallest multiple of the reduction
/// sub-period `fs` that is at least `tk`, so that each of the `tk` in-flight
/// lanes owns a distinct table entry and the table stays valid under
/// `k mod luts` indexing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhaseGeometry {
    /// Reduction tile depth (steps per kernel iteration)
    pub tk: usize,
    /// Reduction sub-period (`Fs`)
    pub fs: usize,
    /// Lookup period (`Luts`)
    pub luts: usize,
}

impl PhaseGeometry {
    /// Derive the lookup period from the tile depth and sub-period.
    pub fn new(tk: usize, fs: usize) -> Self {
        assert!(tk >= 1 && tk <= MAX_TK, "reduction tile depth {} out of range", tk);
        assert!(fs >= 1, "reduction sub-period must be positive");
        let luts = tk.div_ceil(fs) * fs;
        PhaseGeometry { tk, fs, luts }
    }

    /// Pointer advance per phase for cyclic table walks.
    ///
    /// A lane sitting at phase `i` reads phase `(i + tk) mod luts` on the
    /// next iteration; storing the signed difference lets the kernel advance
    /// its table pointers (and the increment pointer itself) with one add,
    /// no modulo.
    pub fn phase_increments(&self) -> Vec<i32> {
        (0..self.luts)
            .map(|i| (((i + self.tk) % self.luts) as i64 - i as i64) as i32)
            .collect()
    }
}

/// Split a linear reduction index into its channel and tap coordinates.
///
/// For Fprop/Bprop the channel is the input channel and the taps are filter
/// coordinates; for Wgrad the channel is the batch index and the taps are
/// output-pixel coordinates.
#[inline]
pub(crate) fn unpack(k: usize, fs: usize, dims: [usize; 3]) -> (usize, [usize; 3]) {
    let chan = k / fs;
    let f = k % fs;
    let t = f / (dims[1] * dims[2]);
    let r = (f / dims[2]) % dims[1];
    let s = f % dims[2];
    (chan, [t, r, s])
}

/// Address of reduction step `k` relative to the operand's tile base.
///
/// `flip` mirrors the tap coordinates before applying the walk strides
/// (Bprop filter reversal); the walk strides already carry any
/// stride/upsample factors.
#[inline]
pub(crate) fn walk_offset(
    k: usize,
    fs: usize,
    dims: [usize; 3],
    walk: &OperandWalk,
    flip: bool,
) -> i64 {
    let (chan, taps) = unpack(k, fs, dims);
    let mut addr = chan as i64 * walk.chan;
    for i in 0..3 {
        let t = if flip { dims[i] - 1 - taps[i] } else { taps[i] };
        addr += t as i64 * walk.tap[i];
    }
    addr
}
