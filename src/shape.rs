//! Shape mapping: convolution geometry to an equivalent GEMM.
//!
//! Derives the output spatial extents, the (M, N, K) dimensions of the
//! implicit matrix multiplication, and packed row-major layouts for the three
//! operands. Which tensor plays the GEMM output role was already resolved by
//! [`ConvSpec`] construction; this module only does index arithmetic.

use crate::error::{Error, Result};
use crate::spec::{ConvSpec, Direction};

/// Derived GEMM-equivalent dimensions.
///
/// Invariant: `m * n * k` equals the multiply-accumulate count of the direct
/// convolution described by the spec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GemmMapping {
    /// GEMM M extent
    pub m: usize,
    /// GEMM N extent
    pub n: usize,
    /// GEMM reduction extent
    pub k: usize,
    /// Reduction sub-period: filter footprint for Fprop/Bprop, output-pixel
    /// count for Wgrad (the original's `Fs_`)
    pub fs: usize,
    /// Output spatial extents (CD, CH, CW)
    pub out: [usize; 3],
}

/// Shape and leading dimensions of one operand, packed row-major.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Per-axis extents
    pub shape: [usize; 5],
    /// Leading dimension (address stride) per axis, in elements
    pub ld: [i64; 5],
}

impl MemoryLayout {
    fn packed(shape: [usize; 5]) -> Self {
        let mut ld = [1i64; 5];
        for i in (0..4).rev() {
            ld[i] = ld[i + 1] * shape[i + 1] as i64;
        }
        MemoryLayout { shape, ld }
    }

    /// Total element count
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True when the operand holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address steps taken while walking one operand along the reduction axis.
///
/// `chan` is the step per reduction-channel unit (input channel for
/// Fprop/Bprop, batch for Wgrad); `tap` is the step per tap unit on each
/// spatial axis, with stride/upsample factors already folded in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OperandWalk {
    /// Address step per reduction-channel unit
    pub chan: i64,
    /// Address step per tap unit, one per spatial axis
    pub tap: [i64; 3],
}

/// Memory layouts for A, B, C plus the reduction-walk strides.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layouts {
    /// Operand A layout
    pub a: MemoryLayout,
    /// Operand B layout
    pub b: MemoryLayout,
    /// Operand C layout
    pub c: MemoryLayout,
    /// Reduction walk over A
    pub a_walk: OperandWalk,
    /// Reduction walk over B
    pub b_walk: OperandWalk,
    /// Address step of B per GEMM-N unit
    pub b_outer: i64,
}

/// Output extent for one spatial axis.
///
/// `floor((input + 2*pad - upsample*(filter-1) - 1) / stride) + 1`, with the
/// dilated filter footprint also required to fit inside the (unpadded) input
/// so that boundary masks stay exact.
pub fn output_extent(
    axis: &'static str,
    input: usize,
    filter: usize,
    stride: usize,
    pad: usize,
    upsample: usize,
) -> Result<usize> {
    let footprint = upsample * (filter - 1) + 1;
    if input + 2 * pad < footprint {
        return Err(Error::EmptyOutput {
            axis,
            input,
            filter,
            stride,
            pad,
            upsample,
        });
    }
    if footprint > input {
        return Err(Error::FilterExceedsInput {
            axis,
            footprint,
            input,
        });
    }
    Ok((input + 2 * pad - footprint) / stride + 1)
}

/// Derive the GEMM mapping and operand layouts for a spec.
pub fn map(spec: &ConvSpec) -> Result<(GemmMapping, Layouts)> {
    const AXES: [&str; 3] = ["d", "h", "w"];
    let input = spec.input();
    let filter = spec.filter();
    let stride = spec.stride();
    let pad = spec.pad();
    let upsample = spec.upsample();

    let mut out = [0usize; 3];
    for i in 0..3 {
        out[i] = output_extent(AXES[i], input[i], filter[i], stride[i], pad[i], upsample[i])?;
    }

    let out_pixels = out[0] * out[1] * out[2];
    let filter_taps = filter[0] * filter[1] * filter[2];
    let nb = spec.nb();
    let ach = spec.a_channels();
    let cch = spec.c_channels();

    let a = MemoryLayout::packed([nb, ach, input[0], input[1], input[2]]);

    let (gemm, b, c, a_walk, b_walk, b_outer) = match spec.direction() {
        Direction::Fprop | Direction::Bprop => {
            let gemm = GemmMapping {
                m: nb * out_pixels,
                n: cch,
                k: ach * filter_taps,
                fs: filter_taps,
                out,
            };
            // B is the filter tensor; Bprop walks its channel axis from the
            // other end (the trailing axis becomes the reduction channel).
            let b = if spec.direction() == Direction::Fprop {
                MemoryLayout::packed([ach, filter[0], filter[1], filter[2], cch])
            } else {
                MemoryLayout::packed([cch, filter[0], filter[1], filter[2], ach])
            };
            let c = MemoryLayout::packed([nb, cch, out[0], out[1], out[2]]);
            let a_walk = OperandWalk {
                chan: a.ld[1],
                tap: [
                    upsample[0] as i64 * a.ld[2],
                    upsample[1] as i64 * a.ld[3],
                    upsample[2] as i64 * a.ld[4],
                ],
            };
            let (b_chan, b_out) = if spec.direction() == Direction::Fprop {
                (b.ld[0], b.ld[4])
            } else {
                (b.ld[4], b.ld[0])
            };
            let b_walk = OperandWalk {
                chan: b_chan,
                tap: [b.ld[1], b.ld[2], b.ld[3]],
            };
            (gemm, b, c, a_walk, b_walk, b_out)
        }
        Direction::Wgrad => {
            let gemm = GemmMapping {
                m: ach,
                n: filter_taps * spec.nf(),
                k: nb * out_pixels,
                fs: out_pixels,
                out,
            };
            let b = MemoryLayout::packed([nb, spec.nf(), out[0], out[1], out[2]]);
            let c = MemoryLayout::packed([ach, filter[0], filter[1], filter[2], spec.nf()]);
            let a_walk = OperandWalk {
                chan: a.ld[0],
                tap: [
                    stride[0] as i64 * a.ld[2],
                    stride[1] as i64 * a.ld[3],
                    stride[2] as i64 * a.ld[4],
                ],
            };
            let b_walk = OperandWalk {
                chan: b.ld[0],
                tap: [b.ld[2], b.ld[3], b.ld[4]],
            };
            (gemm, b, c, a_walk, b_walk, b.ld[1])
        }
    };

    Ok((
        gemm,
        Layouts {
            a,
            b,
            c,
            a_walk,
            b_walk,
            b_outer,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ConvParams;

    fn spec(params: ConvParams) -> ConvSpec {
        ConvSpec::new(params).unwrap()
    }

    /// Count valid output positions by brute force.
    fn brute_extent(input: usize, filter: usize, stride: usize, pad: usize, up: usize) -> usize {
        let footprint = (up * (filter - 1) + 1) as i64;
        let mut count = 0usize;
        let mut o = 0i64;
        loop {
            let start = o * stride as i64 - pad as i64;
            if start + footprint > input as i64 + pad as i64 {
                break;
            }
            count += 1;
            o += 1;
        }
        count
    }

    #[test]
    fn test_output_extent_grid() {
        for stride in [1usize, 2, 3] {
            for pad in [0usize, 1, 2] {
                for filter in [1usize, 3, 5] {
                    for up in [1usize, 2] {
                        let input = 11;
                        if up * (filter - 1) + 1 > input {
                            continue;
                        }
                        let got = output_extent("w", input, filter, stride, pad, up).unwrap();
                        assert_eq!(
                            got,
                            brute_extent(input, filter, stride, pad, up),
                            "input={} filter={} stride={} pad={} up={}",
                            input,
                            filter,
                            stride,
                            pad,
                            up
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_empty_output_rejected() {
        let err = output_extent("d", 3, 5, 1, 0, 1).unwrap_err();
        assert!(matches!(err, Error::EmptyOutput { .. }));
    }

    #[test]
    fn test_filter_exceeding_input_rejected() {
        let err = output_extent("h", 3, 5, 1, 2, 1).unwrap_err();
        assert!(matches!(err, Error::FilterExceedsInput { .. }));
        // dilation can push the footprint past the input too
        let err = output_extent("h", 5, 3, 1, 4, 3).unwrap_err();
        assert!(matches!(err, Error::FilterExceedsInput { .. }));
    }

    #[test]
    fn test_fprop_mac_invariant() {
        let s = spec(ConvParams {
            nb: 2,
            nc: 3,
            a_extents: (5, 7, 9),
            filter: (3, 3, 3),
            nf: 4,
            pad: (1, 1, 1),
            ..ConvParams::default()
        });
        let (g, _) = map(&s).unwrap();
        let direct_macs = 2 * 4 * (5 * 7 * 9) * 3 * 27; // nb*nf*out*nc*taps (pad=1 keeps extents)
        assert_eq!(g.m * g.n * g.k, direct_macs);
        assert_eq!(g.out, [5, 7, 9]);
    }

    #[test]
    fn test_wgrad_folds_batch_into_k() {
        let s = spec(ConvParams {
            nb: 2,
            nc: 3,
            a_extents: (1, 5, 5),
            filter: (1, 3, 3),
            nf: 4,
            direction: Direction::Wgrad,
            ..ConvParams::default()
        });
        let (g, _) = map(&s).unwrap();
        assert_eq!(g.m, 3);
        assert_eq!(g.n, 9 * 4);
        assert_eq!(g.k, 2 * 3 * 3); // nb * out pixels
        assert_eq!(g.fs, 9);
    }

    #[test]
    fn test_packed_layouts() {
        let s = spec(ConvParams {
            nb: 2,
            nc: 3,
            a_extents: (1, 5, 5),
            filter: (1, 3, 3),
            nf: 4,
            ..ConvParams::default()
        });
        let (_, l) = map(&s).unwrap();
        assert_eq!(l.a.shape, [2, 3, 1, 5, 5]);
        assert_eq!(l.a.ld, [75, 25, 25, 5, 1]);
        assert_eq!(l.b.shape, [3, 1, 3, 3, 4]);
        assert_eq!(l.b_outer, 1);
        assert_eq!(l.b_walk.chan, l.b.ld[0]);
    }

    #[test]
    fn test_bprop_walks_filter_from_other_end() {
        let s = spec(ConvParams {
            nb: 1,
            nc: 3,
            a_extents: (1, 5, 5),
            filter: (1, 3, 3),
            nf: 4,
            direction: Direction::Bprop,
            ..ConvParams::default()
        });
        let (_, l) = map(&s).unwrap();
        // physical filter is [nc, taps.., nf]; the reduction channel is nf
        assert_eq!(l.b.shape, [3, 1, 3, 3, 4]);
        assert_eq!(l.b_walk.chan, 1);
        assert_eq!(l.b_outer, l.b.ld[0]);
    }
}
