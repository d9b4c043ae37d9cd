//! Host reference evaluator.
//!
//! Computes the exact result the generated kernel must reproduce, directly
//! from the convolution parameters; it shares no address arithmetic with the
//! delta or mask tables, so a disagreement localizes a lowering bug.
//! Accumulation is in `f64` with a fixed traversal order, so results are
//! bit-identical across runs (and across the optional batch parallelism,
//! which only splits independent outputs).

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::dtype::Element;
use crate::error::Result;
use crate::shape::{self, GemmMapping, Layouts};
use crate::spec::{ConvSpec, Direction};

/// Evaluate one convolution on the host, dispatching on the direction.
///
/// Buffer lengths must match the spec's packed layouts; `bias` is required
/// exactly when the spec declares one. Length mismatches are caller defects
/// and fail fast.
pub fn cpu_ref<I: Element, O: Element>(
    c: &mut [O],
    a: &[I],
    b: &[I],
    bias: Option<&[I]>,
    spec: &ConvSpec,
) -> Result<()> {
    let (gemm, l) = shape::map(spec)?;
    assert_eq!(a.len(), l.a.len(), "operand A length mismatch");
    assert_eq!(b.len(), l.b.len(), "operand B length mismatch");
    assert_eq!(c.len(), l.c.len(), "output length mismatch");
    assert_eq!(
        bias.is_some(),
        spec.bias(),
        "bias buffer must be supplied exactly when the spec declares one"
    );
    if let Some(bias) = bias {
        assert_eq!(bias.len(), spec.c_channels(), "bias length mismatch");
    }

    match spec.direction() {
        Direction::Fprop | Direction::Bprop => cpu_xprop(c, a, b, bias, spec, &gemm, &l),
        Direction::Wgrad => cpu_wgrad(c, a, b, spec, &gemm, &l),
    }
    Ok(())
}

/// Forward convolution / data gradient.
///
/// The direction-normalized spec already carries the Bprop role swaps
/// (channels, stride vs upsample, filter flip), so one loop nest serves both.
fn cpu_xprop<I: Element, O: Element>(
    c: &mut [O],
    a: &[I],
    b: &[I],
    bias: Option<&[I]>,
    spec: &ConvSpec,
    gemm: &GemmMapping,
    l: &Layouts,
) {
    let batch_a = l.a.ld[0] as usize;
    let batch_c = l.c.ld[0] as usize;

    #[cfg(feature = "rayon")]
    {
        c.par_chunks_mut(batch_c)
            .zip(a.par_chunks(batch_a))
            .for_each(|(cb, ab)| xprop_batch(cb, ab, b, bias, spec, gemm, l));
    }
    #[cfg(not(feature = "rayon"))]
    {
        c.chunks_mut(batch_c)
            .zip(a.chunks(batch_a))
            .for_each(|(cb, ab)| xprop_batch(cb, ab, b, bias, spec, gemm, l));
    }
}

fn xprop_batch<I: Element, O: Element>(
    cb: &mut [O],
    ab: &[I],
    b: &[I],
    bias: Option<&[I]>,
    spec: &ConvSpec,
    gemm: &GemmMapping,
    l: &Layouts,
) {
    let input = spec.input();
    let filter = spec.filter();
    let stride = spec.stride();
    let pad = spec.pad();
    let upsample = spec.upsample();
    let flip = spec.flip();
    let out = gemm.out;

    for co in 0..spec.c_channels() {
        for od in 0..out[0] {
            for oh in 0..out[1] {
                for ow in 0..out[2] {
                    let mut acc = 0f64;
                    for ci in 0..spec.a_channels() {
                        for t in 0..filter[0] {
                            for r in 0..filter[1] {
                                for s in 0..filter[2] {
                                    let pos = [
                                        (od * stride[0] + t * upsample[0]) as i64 - pad[0] as i64,
                                        (oh * stride[1] + r * upsample[1]) as i64 - pad[1] as i64,
                                        (ow * stride[2] + s * upsample[2]) as i64 - pad[2] as i64,
                                    ];
                                    if pos.iter().zip(input.iter()).any(|(&p, &n)| {
                                        p < 0 || p >= n as i64
                                    }) {
                                        continue;
                                    }
                                    let ai = ci as i64 * l.a.ld[1]
                                        + pos[0] * l.a.ld[2]
                                        + pos[1] * l.a.ld[3]
                                        + pos[2] * l.a.ld[4];
                                    let taps = if flip {
                                        [filter[0] - 1 - t, filter[1] - 1 - r, filter[2] - 1 - s]
                                    } else {
                                        [t, r, s]
                                    };
                                    let bi = ci as i64 * l.b_walk.chan
                                        + taps[0] as i64 * l.b_walk.tap[0]
                                        + taps[1] as i64 * l.b_walk.tap[1]
                                        + taps[2] as i64 * l.b_walk.tap[2]
                                        + co as i64 * l.b_outer;
                                    acc += ab[ai as usize].to_f64() * b[bi as usize].to_f64();
                                }
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[co].to_f64();
                    }
                    let ci_out = co as i64 * l.c.ld[1]
                        + od as i64 * l.c.ld[2]
                        + oh as i64 * l.c.ld[3]
                        + ow as i64 * l.c.ld[4];
                    cb[ci_out as usize] = O::from_f64(acc);
                }
            }
        }
    }
}

/// Filter gradient: correlate the activation with the output gradient,
/// reducing over batch and output pixels.
fn cpu_wgrad<I: Element, O: Element>(
    c: &mut [O],
    a: &[I],
    b: &[I],
    spec: &ConvSpec,
    gemm: &GemmMapping,
    l: &Layouts,
) {
    let chan_c = l.c.ld[0] as usize;

    #[cfg(feature = "rayon")]
    {
        c.par_chunks_mut(chan_c)
            .enumerate()
            .for_each(|(ci, cc)| wgrad_channel(cc, ci, a, b, spec, gemm, l));
    }
    #[cfg(not(feature = "rayon"))]
    {
        c.chunks_mut(chan_c)
            .enumerate()
            .for_each(|(ci, cc)| wgrad_channel(cc, ci, a, b, spec, gemm, l));
    }
}

fn wgrad_channel<I: Element, O: Element>(
    cc: &mut [O],
    ci: usize,
    a: &[I],
    b: &[I],
    spec: &ConvSpec,
    gemm: &GemmMapping,
    l: &Layouts,
) {
    let input = spec.input();
    let filter = spec.filter();
    let stride = spec.stride();
    let pad = spec.pad();
    let upsample = spec.upsample();
    let out = gemm.out;
    let nf = spec.nf();

    for t in 0..filter[0] {
        for r in 0..filter[1] {
            for s in 0..filter[2] {
                for f in 0..nf {
                    let mut acc = 0f64;
                    for ib in 0..spec.nb() {
                        for od in 0..out[0] {
                            for oh in 0..out[1] {
                                for ow in 0..out[2] {
                                    let pos = [
                                        (od * stride[0] + t * upsample[0]) as i64 - pad[0] as i64,
                                        (oh * stride[1] + r * upsample[1]) as i64 - pad[1] as i64,
                                        (ow * stride[2] + s * upsample[2]) as i64 - pad[2] as i64,
                                    ];
                                    if pos.iter().zip(input.iter()).any(|(&p, &n)| {
                                        p < 0 || p >= n as i64
                                    }) {
                                        continue;
                                    }
                                    let ai = ib as i64 * l.a.ld[0]
                                        + ci as i64 * l.a.ld[1]
                                        + pos[0] * l.a.ld[2]
                                        + pos[1] * l.a.ld[3]
                                        + pos[2] * l.a.ld[4];
                                    let bi = ib as i64 * l.b.ld[0]
                                        + f as i64 * l.b.ld[1]
                                        + od as i64 * l.b.ld[2]
                                        + oh as i64 * l.b.ld[3]
                                        + ow as i64 * l.b.ld[4];
                                    acc += a[ai as usize].to_f64() * b[bi as usize].to_f64();
                                }
                            }
                        }
                    }
                    let off = ((t * filter[1] + r) * filter[2] + s) * nf + f;
                    cc[off] = O::from_f64(acc);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ConvParams, ConvSpec};

    #[test]
    fn test_identity_filter_passes_input_through() {
        // 1x1x1 filter of value 1: output equals input
        let spec = ConvSpec::new(ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 3, 3),
            filter: (1, 1, 1),
            nf: 1,
            ..ConvParams::default()
        })
        .unwrap();
        let a: Vec<f32> = (0..9).map(|i| i as f32).collect();
        let b = vec![1.0f32];
        let mut c = vec![0.0f32; 9];
        cpu_ref(&mut c, &a, &b, None, &spec).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_bias_shifts_every_output() {
        let spec = ConvSpec::new(ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 3, 3),
            filter: (1, 1, 1),
            nf: 2,
            bias: true,
            ..ConvParams::default()
        })
        .unwrap();
        let a = vec![1.0f32; 9];
        let b = vec![1.0f32, 0.0];
        let bias = vec![0.5f32, -1.0];
        let mut c = vec![0.0f32; 18];
        cpu_ref(&mut c, &a, &b, Some(&bias), &spec).unwrap();
        assert!(c[..9].iter().all(|&v| v == 1.5));
        assert!(c[9..].iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_hand_computed_2d_window() {
        // single 3x3 window, no padding: plain dot product
        let spec = ConvSpec::new(ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 3, 3),
            filter: (1, 3, 3),
            nf: 1,
            ..ConvParams::default()
        })
        .unwrap();
        let a: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        let b: Vec<f32> = vec![1.0, 0.0, -1.0, 2.0, 1.0, -2.0, 1.0, 0.0, -1.0];
        let mut c = vec![0.0f32; 1];
        cpu_ref(&mut c, &a, &b, None, &spec).unwrap();
        // 1-3 + 8+5-12 + 7-9
        assert_eq!(c[0], -3.0);
    }

    #[test]
    fn test_wgrad_identity_geometry() {
        // out = in when filter is 1x1x1; gradient is the plain inner product
        let spec = ConvSpec::new(ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 2, 2),
            filter: (1, 1, 1),
            nf: 1,
            direction: Direction::Wgrad,
            ..ConvParams::default()
        })
        .unwrap();
        let a = vec![1.0f32, 2.0, 3.0, 4.0];
        let b = vec![0.5f32, 1.0, -1.0, 2.0];
        let mut c = vec![0.0f32; 1];
        cpu_ref(&mut c, &a, &b, None, &spec).unwrap();
        assert_eq!(c[0], 0.5 + 2.0 - 3.0 + 8.0);
    }

    #[test]
    #[should_panic]
    fn test_length_mismatch_fails_fast() {
        let spec = ConvSpec::new(ConvParams {
            nb: 1,
            nc: 1,
            a_extents: (1, 3, 3),
            filter: (1, 1, 1),
            nf: 1,
            ..ConvParams::default()
        })
        .unwrap();
        let a = vec![0.0f32; 4]; // should be 9
        let b = vec![1.0f32];
        let mut c = vec![0.0f32; 9];
        let _ = cpu_ref(&mut c, &a, &b, None, &spec);
    }
}
