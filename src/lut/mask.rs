//! Boundary-validity bitmask construction.
//!
//! One mask word per (lookup phase, group) pair, one bit per in-flight
//! reduction lane. A set bit means the lane reads inside the zero-padded
//! input volume; the kernel turns the word into a load predicate, so padding
//! costs no branches. The table head keeps a `luts`-entry all-zero block as
//! the fully-out-of-bounds fallback.
//!
//! The group axis differs by direction. For Fprop/Bprop it enumerates
//! border-distance classes (`2*pad + 1` per axis): validity of a filter tap
//! only depends on how close the output pixel's window sits to each border.
//! For Wgrad the walk itself moves over output pixels and the group
//! enumerates filter taps directly.

use super::{unpack, PhaseGeometry};

/// Which decode rule the table was built for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MaskKind {
    /// Groups are border-distance classes, `2*pad+1` per axis
    BorderClass,
    /// Groups are filter taps
    FilterTap,
}

/// Precomputed boundary masks for one operation.
///
/// Same lifecycle as the delta tables: built once per spec and tile
/// configuration, read-only afterwards, mirrored verbatim to the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundaryMaskTable {
    geom: PhaseGeometry,
    kind: MaskKind,
    group_dims: [usize; 3],
    masks: Vec<u32>,
}

impl BoundaryMaskTable {
    /// Build masks for the Fprop/Bprop walk.
    ///
    /// Bit `j` of the word at (phase `i`, class `g`) is set iff tap
    /// `(t, r, s)` of step `i + j` satisfies, on every axis,
    /// `upsample*t + g >= pad && upsample*t + g < footprint + pad`. Given a
    /// footprint that fits the input, this reproduces the direct bounds
    /// check for every output pixel whose border class is `g`.
    pub fn build_xprop(
        geom: PhaseGeometry,
        filter: [usize; 3],
        upsample: [usize; 3],
        pad: [usize; 3],
    ) -> Self {
        let group_dims = [2 * pad[0] + 1, 2 * pad[1] + 1, 2 * pad[2] + 1];
        let footprint = [
            upsample[0] * (filter[0] - 1) + 1,
            upsample[1] * (filter[1] - 1) + 1,
            upsample[2] * (filter[2] - 1) + 1,
        ];
        let fs = filter[0] * filter[1] * filter[2];
        Self::build(geom, MaskKind::BorderClass, group_dims, |group, step| {
            let (_, taps) = unpack(step, fs, filter);
            (0..3).all(|i| {
                let p = upsample[i] * taps[i] + group[i];
                p >= pad[i] && p < footprint[i] + pad[i]
            })
        })
    }

    /// Build masks for the Wgrad walk.
    ///
    /// Bit `j` of the word at (phase `i`, tap `(t, r, s)`) is set iff the
    /// output pixel of step `i + j` reads in-bounds input at that tap:
    /// `0 <= o*stride + t*upsample - pad < input` on every axis.
    pub fn build_wgrad(
        geom: PhaseGeometry,
        out: [usize; 3],
        filter: [usize; 3],
        stride: [usize; 3],
        upsample: [usize; 3],
        pad: [usize; 3],
        input: [usize; 3],
    ) -> Self {
        let fs = out[0] * out[1] * out[2];
        Self::build(geom, MaskKind::FilterTap, filter, |taps, step| {
            let (_, o) = unpack(step, fs, out);
            (0..3).all(|i| {
                let pos = (o[i] * stride[i] + taps[i] * upsample[i]) as i64 - pad[i] as i64;
                pos >= 0 && pos < input[i] as i64
            })
        })
    }

    fn build(
        geom: PhaseGeometry,
        kind: MaskKind,
        group_dims: [usize; 3],
        in_bounds: impl Fn([usize; 3], usize) -> bool,
    ) -> Self {
        let groups = group_dims[0] * group_dims[1] * group_dims[2];
        let mut masks = vec![0u32; geom.luts * (1 + groups)];
        for g0 in 0..group_dims[0] {
            for g1 in 0..group_dims[1] {
                for g2 in 0..group_dims[2] {
                    let flat = (g0 * group_dims[1] + g1) * group_dims[2] + g2;
                    for i in 0..geom.luts {
                        let mut word = 0u32;
                        for j in 0..geom.tk {
                            if in_bounds([g0, g1, g2], i + j) {
                                word |= 1 << j;
                            }
                        }
                        masks[geom.luts * (1 + flat) + i] = word;
                    }
                }
            }
        }
        BoundaryMaskTable {
            geom,
            kind,
            group_dims,
            masks,
        }
    }

    /// Phase geometry the table was built with
    pub fn geometry(&self) -> PhaseGeometry {
        self.geom
    }

    /// Decode rule of the group axis
    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    /// Extent of the group axis per spatial axis
    pub fn group_dims(&self) -> [usize; 3] {
        self.group_dims
    }

    /// Table entries, in device order
    pub fn as_slice(&self) -> &[u32] {
        &self.masks
    }

    /// Mask word for one (phase, group) pair
    #[inline]
    pub fn word(&self, phase: usize, group: [usize; 3]) -> u32 {
        let flat = (group[0] * self.group_dims[1] + group[1]) * self.group_dims[2] + group[2];
        self.masks[self.geom.luts * (1 + flat) + phase % self.geom.luts]
    }

    /// Border-distance class of an output pixel on one axis (Fprop/Bprop
    /// decode; the emitted kernel computes the same expression).
    ///
    /// `start` is the first tap position, `out*stride - pad`.
    #[inline]
    pub fn border_class(start: i64, footprint: usize, input: usize, pad: usize) -> usize {
        let class = pad as i64 + start.min(0) + (start + footprint as i64 - input as i64).max(0);
        debug_assert!(class >= 0 && class <= 2 * pad as i64);
        class as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct bounds check for one output position and tap, Fprop semantics.
    fn direct_in_bounds(o: usize, t: usize, stride: usize, pad: usize, up: usize, input: usize) -> bool {
        let pos = (o * stride + t * up) as i64 - pad as i64;
        pos >= 0 && pos < input as i64
    }

    #[test]
    fn test_xprop_masks_match_direct_check() {
        // 1-D geometry embedded on the w axis: input 7, filter 3, pad 1
        let (input, filter, stride, pad, up) = (7usize, 3usize, 1usize, 1usize, 1usize);
        let geom = PhaseGeometry::new(3, 3);
        let t = BoundaryMaskTable::build_xprop(geom, [1, 1, filter], [1, 1, up], [0, 0, pad]);
        let footprint = up * (filter - 1) + 1;
        let out = (input + 2 * pad - footprint) / stride + 1;
        for o in 0..out {
            let start = (o * stride) as i64 - pad as i64;
            let class = BoundaryMaskTable::border_class(start, footprint, input, pad);
            let word = t.word(0, [0, 0, class]);
            for tap in 0..filter {
                let expect = direct_in_bounds(o, tap, stride, pad, up, input);
                assert_eq!(
                    word & (1 << tap) != 0,
                    expect,
                    "o={} tap={} class={}",
                    o,
                    tap,
                    class
                );
            }
        }
    }

    #[test]
    fn test_xprop_masks_with_dilation_and_stride() {
        let (input, filter, stride, pad, up) = (9usize, 3usize, 2usize, 2usize, 2usize);
        let geom = PhaseGeometry::new(3, 3);
        let t = BoundaryMaskTable::build_xprop(geom, [1, 1, filter], [1, 1, up], [0, 0, pad]);
        let footprint = up * (filter - 1) + 1;
        let out = (input + 2 * pad - footprint) / stride + 1;
        for o in 0..out {
            let start = (o * stride) as i64 - pad as i64;
            let class = BoundaryMaskTable::border_class(start, footprint, input, pad);
            let word = t.word(0, [0, 0, class]);
            for tap in 0..filter {
                assert_eq!(
                    word & (1 << tap) != 0,
                    direct_in_bounds(o, tap, stride, pad, up, input),
                    "o={} tap={}",
                    o,
                    tap
                );
            }
        }
    }

    #[test]
    fn test_head_block_is_zero() {
        let geom = PhaseGeometry::new(8, 27);
        let t = BoundaryMaskTable::build_xprop(geom, [3, 3, 3], [1, 1, 1], [1, 1, 1]);
        assert!(t.as_slice()[..geom.luts].iter().all(|&w| w == 0));
        assert_eq!(t.as_slice().len(), geom.luts * (1 + 27));
    }

    #[test]
    fn test_wgrad_masks_match_direct_check() {
        // input 5, filter 3, stride 1, pad 1 -> out 5
        let geom = PhaseGeometry::new(8, 25);
        let t = BoundaryMaskTable::build_wgrad(
            geom,
            [1, 5, 5],
            [1, 3, 3],
            [1, 1, 1],
            [1, 1, 1],
            [0, 1, 1],
            [1, 5, 5],
        );
        assert_eq!(t.kind(), MaskKind::FilterTap);
        for phase in 0..geom.luts {
            for th in 0..3 {
                for tw in 0..3 {
                    let word = t.word(phase, [0, th, tw]);
                    for j in 0..geom.tk {
                        let step = phase + j;
                        let oh = (step % 25) / 5;
                        let ow = step % 5;
                        let ok_h = (oh + th) as i64 - 1 >= 0 && (oh + th) as i64 - 1 < 5;
                        let ok_w = (ow + tw) as i64 - 1 >= 0 && (ow + tw) as i64 - 1 < 5;
                        assert_eq!(word & (1 << j) != 0, ok_h && ok_w);
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_padding_means_all_valid() {
        let geom = PhaseGeometry::new(8, 27);
        let t = BoundaryMaskTable::build_xprop(geom, [3, 3, 3], [1, 1, 1], [0, 0, 0]);
        // single border class, every lane valid
        assert_eq!(t.group_dims(), [1, 1, 1]);
        for i in 0..geom.luts {
            assert_eq!(t.word(i, [0, 0, 0]), (1u32 << geom.tk) - 1);
        }
    }
}
