//! Convolution instance description.
//!
//! [`ConvSpec`] is the immutable description of one convolution: geometry,
//! per-axis stride/pad/upsample factors, operand element types and direction.
//! Direction-dependent axis roles (which tensor is the GEMM output, whether
//! the filter taps are flipped, which way operand B is walked) are resolved
//! once at construction so that downstream table builders never branch on the
//! direction for addressing decisions.

use crate::dtype::DType;
use crate::error::{Error, Result};

/// Convolution direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Forward activation: C = conv(A = activation, B = filter)
    Fprop,
    /// Gradient w.r.t. the input: C = conv(A = output gradient, B = flipped
    /// filter), with stride and upsample roles swapped
    Bprop,
    /// Gradient w.r.t. the filter: C = correlation of A = activation with
    /// B = output gradient; batch and output-spatial axes fold into the GEMM
    /// reduction dimension
    Wgrad,
}

/// Raw convolution parameters, as supplied by the caller.
///
/// Extents follow the forward-convolution naming regardless of direction:
/// `(ad, ah, aw)` are the spatial extents of operand A, `(bd, bh, bw)` the
/// filter extents. `upsample` is the filter dilation factor per axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConvParams {
    /// Batch size
    pub nb: usize,
    /// Input channels
    pub nc: usize,
    /// Spatial extents of operand A (depth, height, width)
    pub a_extents: (usize, usize, usize),
    /// Filter extents (depth, height, width)
    pub filter: (usize, usize, usize),
    /// Output channels
    pub nf: usize,
    /// Per-axis stride
    pub stride: (usize, usize, usize),
    /// Per-axis zero padding
    pub pad: (usize, usize, usize),
    /// Per-axis upsample (filter dilation) factor
    pub upsample: (usize, usize, usize),
    /// Element type of operand A
    pub a_dtype: DType,
    /// Element type of operand B
    pub b_dtype: DType,
    /// Convolution direction
    pub direction: Direction,
    /// Whether a per-output-channel bias is added
    pub bias: bool,
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 1, 1),
            filter: (1, 1, 1),
            nf: 1,
            stride: (1, 1, 1),
            pad: (0, 0, 0),
            upsample: (1, 1, 1),
            a_dtype: DType::F32,
            b_dtype: DType::F32,
            direction: Direction::Fprop,
            bias: false,
        }
    }
}

/// Validated, direction-normalized convolution description.
///
/// Frozen after construction: every derived quantity downstream (shapes,
/// delta tables, masks, kernel text) is a pure function of this value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvSpec {
    params: ConvParams,
    // normalized axis roles
    a_channels: usize,
    c_channels: usize,
    stride: [usize; 3],
    pad: [usize; 3],
    upsample: [usize; 3],
    flip: bool,
    b_trans: bool,
}

fn require_positive(name: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::InvalidParameter { name, value });
    }
    Ok(())
}

impl ConvSpec {
    /// Validate raw parameters and resolve direction-dependent axis roles.
    pub fn new(params: ConvParams) -> Result<Self> {
        require_positive("nb", params.nb)?;
        require_positive("nc", params.nc)?;
        require_positive("nf", params.nf)?;
        require_positive("ad", params.a_extents.0)?;
        require_positive("ah", params.a_extents.1)?;
        require_positive("aw", params.a_extents.2)?;
        require_positive("bd", params.filter.0)?;
        require_positive("bh", params.filter.1)?;
        require_positive("bw", params.filter.2)?;
        require_positive("stride_d", params.stride.0)?;
        require_positive("stride_h", params.stride.1)?;
        require_positive("stride_w", params.stride.2)?;
        require_positive("upsample_d", params.upsample.0)?;
        require_positive("upsample_h", params.upsample.1)?;
        require_positive("upsample_w", params.upsample.2)?;

        // bias is a per-output-channel term of the forward output; it has no
        // counterpart in the filter gradient
        if params.bias && params.direction == Direction::Wgrad {
            return Err(Error::InvalidParameter {
                name: "bias",
                value: 1,
            });
        }

        if params.a_dtype != params.b_dtype {
            return Err(Error::UnsupportedDTypePair {
                a: params.a_dtype,
                b: params.b_dtype,
            });
        }

        let stride = [params.stride.0, params.stride.1, params.stride.2];
        let upsample = [params.upsample.0, params.upsample.1, params.upsample.2];
        let pad = [params.pad.0, params.pad.1, params.pad.2];

        // Bprop reverses the filter and swaps the stride/upsample roles; the
        // operand channel roles swap with it. Wgrad keeps forward addressing
        // but emits the filter gradient.
        let (a_channels, c_channels, stride, upsample, flip, b_trans) = match params.direction {
            Direction::Fprop => (params.nc, params.nf, stride, upsample, false, true),
            Direction::Bprop => (params.nf, params.nc, upsample, stride, true, true),
            Direction::Wgrad => (params.nc, params.nf, stride, upsample, false, false),
        };

        Ok(ConvSpec {
            params,
            a_channels,
            c_channels,
            stride,
            pad,
            upsample,
            flip,
            b_trans,
        })
    }

    /// The raw parameters this spec was built from
    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// Convolution direction
    pub fn direction(&self) -> Direction {
        self.params.direction
    }

    /// Batch size
    pub fn nb(&self) -> usize {
        self.params.nb
    }

    /// Channel count of the reduction (inner) axis of operand A
    pub fn a_channels(&self) -> usize {
        self.a_channels
    }

    /// Channel count of the GEMM output axis
    pub fn c_channels(&self) -> usize {
        self.c_channels
    }

    /// Output-channel count as supplied (unswapped)
    pub fn nf(&self) -> usize {
        self.params.nf
    }

    /// Input-channel count as supplied (unswapped)
    pub fn nc(&self) -> usize {
        self.params.nc
    }

    /// Spatial extents of operand A
    pub fn input(&self) -> [usize; 3] {
        [
            self.params.a_extents.0,
            self.params.a_extents.1,
            self.params.a_extents.2,
        ]
    }

    /// Filter spatial extents
    pub fn filter(&self) -> [usize; 3] {
        [self.params.filter.0, self.params.filter.1, self.params.filter.2]
    }

    /// Direction-normalized stride per axis
    pub fn stride(&self) -> [usize; 3] {
        self.stride
    }

    /// Zero padding per axis
    pub fn pad(&self) -> [usize; 3] {
        self.pad
    }

    /// Direction-normalized upsample (filter dilation) per axis
    pub fn upsample(&self) -> [usize; 3] {
        self.upsample
    }

    /// Dilated filter footprint per axis: `upsample * (filter - 1) + 1`
    pub fn footprint(&self) -> [usize; 3] {
        let f = self.filter();
        let u = self.upsample;
        [
            u[0] * (f[0] - 1) + 1,
            u[1] * (f[1] - 1) + 1,
            u[2] * (f[2] - 1) + 1,
        ]
    }

    /// Whether the filter taps are mirrored when addressing operand B
    pub fn flip(&self) -> bool {
        self.flip
    }

    /// Whether operand B is walked through a transposed (filter-tensor)
    /// layout, as opposed to the gradient-tensor walk used by Wgrad
    pub fn b_trans(&self) -> bool {
        self.b_trans
    }

    /// Whether a bias term is added to the output
    pub fn bias(&self) -> bool {
        self.params.bias
    }

    /// Element type of operand A
    pub fn a_dtype(&self) -> DType {
        self.params.a_dtype
    }

    /// Element type of operand B
    pub fn b_dtype(&self) -> DType {
        self.params.b_dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConvParams {
        ConvParams {
            nb: 2,
            nc: 3,
            a_extents: (5, 5, 5),
            filter: (3, 3, 3),
            nf: 4,
            stride: (2, 1, 1),
            upsample: (1, 1, 2),
            pad: (1, 0, 2),
            ..ConvParams::default()
        }
    }

    #[test]
    fn test_fprop_roles() {
        let spec = ConvSpec::new(base()).unwrap();
        assert_eq!(spec.a_channels(), 3);
        assert_eq!(spec.c_channels(), 4);
        assert_eq!(spec.stride(), [2, 1, 1]);
        assert_eq!(spec.upsample(), [1, 1, 2]);
        assert!(!spec.flip());
        assert!(spec.b_trans());
    }

    #[test]
    fn test_bprop_swaps_roles() {
        let spec = ConvSpec::new(ConvParams {
            direction: Direction::Bprop,
            ..base()
        })
        .unwrap();
        // channel roles and stride/upsample roles both swap
        assert_eq!(spec.a_channels(), 4);
        assert_eq!(spec.c_channels(), 3);
        assert_eq!(spec.stride(), [1, 1, 2]);
        assert_eq!(spec.upsample(), [2, 1, 1]);
        assert!(spec.flip());
        assert!(spec.b_trans());
    }

    #[test]
    fn test_wgrad_roles() {
        let spec = ConvSpec::new(ConvParams {
            direction: Direction::Wgrad,
            ..base()
        })
        .unwrap();
        assert_eq!(spec.a_channels(), 3);
        assert!(!spec.flip());
        assert!(!spec.b_trans());
    }

    #[test]
    fn test_zero_stride_rejected() {
        let err = ConvSpec::new(ConvParams {
            stride: (0, 1, 1),
            ..base()
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "stride_d", .. }));
    }

    #[test]
    fn test_bias_with_wgrad_rejected() {
        let err = ConvSpec::new(ConvParams {
            direction: Direction::Wgrad,
            bias: true,
            ..base()
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "bias", .. }));
    }

    #[test]
    fn test_dtype_pairing_rejected() {
        let err = ConvSpec::new(ConvParams {
            a_dtype: DType::F32,
            b_dtype: DType::F64,
            ..base()
        })
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDTypePair { .. }));
    }

    #[test]
    fn test_footprint() {
        let spec = ConvSpec::new(base()).unwrap();
        assert_eq!(spec.footprint(), [3, 3, 5]);
    }
}
