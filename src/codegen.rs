//! Kernel source generation.
//!
//! Emits the implicit-GEMM convolution kernel as Triton-dialect C text. The
//! output is a pure function of the lowered operation: same spec and tile
//! configuration, same bytes. Geometry that is fixed at lowering time
//! (strides, leading dimensions, table periods) is baked into the text as
//! literals; extents that the driver may want to rebind stay runtime scalar
//! arguments, in the exact order [`crate::launch::LaunchPlan`] binds them.
//!
//! Pointer movement follows the table layout: per-lane operand pointers
//! advance by the loaded address deltas, and in lookup mode the table
//! pointers themselves advance through the phase-increment region appended
//! to the A-delta image.

use std::fmt::Write;

use crate::dtype::DType;
use crate::lut::DeltaMode;
use crate::op::ConvOp;
use crate::spec::Direction;

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Fprop => "fprop",
        Direction::Bprop => "bprop",
        Direction::Wgrad => "wgrad",
    }
}

fn qualifier(constant: bool) -> &'static str {
    if constant {
        "__constant__"
    } else {
        "read_only restrict"
    }
}

/// Render the kernel for one lowered operation.
pub(crate) fn kernel_source(op: &ConvOp) -> String {
    let spec = op.spec();
    let gemm = op.gemm();
    let l = op.layouts();
    let t = op.tiles();
    let g = op.geometry();
    let lookup = op.a_deltas().mode() == DeltaMode::Lookup;

    let a_ty = spec.a_dtype().kernel_name();
    let b_ty = spec.b_dtype().kernel_name();
    let c_ty = a_ty;
    let acc_ty = if spec.a_dtype() == DType::F64 {
        "fp64"
    } else {
        "fp32"
    };
    let split = t.split_k > 1;
    let plen = op.a_deltas().as_slice().len();
    let luts = g.luts;
    let fs = g.fs;
    let filter = spec.filter();
    let stride = spec.stride();
    let pad = spec.pad();
    let upsample = spec.upsample();
    let foot = spec.footprint();
    let grid0 = gemm.m.div_ceil(t.tm);

    let mut s = String::new();
    let _ = writeln!(
        s,
        "// {} implicit-GEMM convolution, {} x {}",
        direction_name(spec.direction()),
        a_ty,
        b_ty
    );
    let _ = writeln!(s, "const tunable int32 TM = {};", t.tm);
    let _ = writeln!(s, "const tunable int32 TN = {};", t.tn);
    let _ = writeln!(s, "const tunable int32 TK = {};", t.tk);
    let _ = writeln!(s, "const tunable int32 GZ = {};", t.split_k);
    s.push('\n');

    // argument list, in plan binding order
    let mut args: Vec<String> = vec![
        format!("read_only restrict {} *A", a_ty),
        format!("read_only restrict {} *B", b_ty),
        format!("{} *C", c_ty),
    ];
    if spec.bias() {
        args.push(format!("read_only restrict {} *bias", c_ty));
    }
    args.push(format!("{} int32 *a_delta", qualifier(op.is_a_deltas_cst())));
    args.push(format!("{} int32 *b_delta", qualifier(op.is_b_deltas_cst())));
    args.push(format!("{} int32 *masks", qualifier(op.is_mask_cst())));
    if split {
        args.push("int32 *locks".to_string());
    }
    for (name, _) in crate::launch::scalar_args(spec, gemm) {
        args.push(format!("int32 {}", name));
    }
    let _ = writeln!(s, "void conv({})", args.join(",\n          "));
    s.push_str("{\n");

    // ranges and accumulator
    s.push_str("  int32 rxa[TM] = get_global_range[TM](0);\n");
    s.push_str("  int32 rbn[TN] = get_global_range[TN](1);\n");
    s.push_str("  int32 rks[TK] = 0 ... TK;\n");
    let _ = writeln!(s, "  {} acc[TM, TN] = 0;", acc_ty);
    if split {
        s.push_str("  int32 pidz = get_program_id(2);\n");
        s.push_str("  int32 kspan = K / GZ + ((pidz == GZ - 1) ? K % GZ : 0);\n");
        s.push_str("  int32 rka[TK] = rks + pidz * (K / GZ);\n");
        let _ = writeln!(s, "  int32 phase = (pidz * (K / GZ)) % {};", luts);
    } else {
        s.push_str("  int32 kspan = K;\n");
        s.push_str("  int32 rka[TK] = rks;\n");
        s.push_str("  int32 phase = 0;\n");
    }

    match spec.direction() {
        Direction::Fprop | Direction::Bprop => {
            emit_xprop_setup(&mut s, op, lookup, plen, luts, fs, filter, stride, pad, foot)
        }
        Direction::Wgrad => emit_wgrad_setup(&mut s, op, lookup, plen, luts, fs, upsample, pad),
    }

    // main reduction loop
    let wgrad = spec.direction() == Direction::Wgrad;
    s.push_str("  for(int32 k = kspan; k > 0; k = k - TK){\n");
    if lookup {
        s.push_str("    int32 xm[TM] = *pm;\n");
    }
    s.push_str(
        "    bool checka[TM, TK] = (((xm[:, newaxis] >> rks[newaxis, :]) & 1) > 0) \
         && (rks[newaxis, :] < k);\n",
    );
    if wgrad {
        s.push_str(
            "    bool checkb[TK, TN] = (rks[:, newaxis] < k) \
             && (rbn < N)[newaxis, :];\n",
        );
    } else {
        s.push_str(
            "    bool checkb[TN, TK] = (rbn < N)[:, newaxis] \
             && (rks[newaxis, :] < k);\n",
        );
    }
    let _ = writeln!(s, "    {} a[TM, TK] = checka ? *pa : 0;", a_ty);
    if wgrad {
        let _ = writeln!(s, "    {} b[TK, TN] = checkb ? *pb : 0;", b_ty);
        s.push_str("    acc = dot(a, b, acc);\n");
    } else {
        let _ = writeln!(s, "    {} b[TN, TK] = checkb ? *pb : 0;", b_ty);
        s.push_str("    acc = dot(a, trans(b), acc);\n");
    }
    if lookup {
        s.push_str("    int32 da[TK] = *pda;\n");
        s.push_str("    int32 db[TK] = *pdb;\n");
        s.push_str("    int32 di[TK] = *pincd;\n");
        s.push_str("    int32 dm[TM] = *pincm;\n");
    }
    s.push_str("    pa = pa + da[newaxis, :];\n");
    if wgrad {
        s.push_str("    pb = pb + db[:, newaxis];\n");
    } else {
        s.push_str("    pb = pb + db[newaxis, :];\n");
    }
    if lookup {
        s.push_str("    pda = pda + di;\n");
        s.push_str("    pdb = pdb + di;\n");
        s.push_str("    pincd = pincd + di;\n");
        s.push_str("    pm = pm + dm;\n");
        s.push_str("    pincm = pincm + dm;\n");
    }
    s.push_str("  }\n");

    // write back
    let _ = writeln!(s, "  {} c[TM, TN] = acc;", c_ty);
    if wgrad {
        let _ = writeln!(
            s,
            "  {} *pc[TM, TN] = C + rxa[:, newaxis] * {} + rbn[newaxis, :];",
            c_ty, l.c.ld[0]
        );
        s.push_str("  bool checkc[TM, TN] = (rxa < M)[:, newaxis] && (rbn < N)[newaxis, :];\n");
    } else {
        let _ = writeln!(
            s,
            "  int32 offc0[TM] = rcb * {} + rcd * {} + rch * {} + rcw * {};",
            l.c.ld[0], l.c.ld[2], l.c.ld[3], l.c.ld[4]
        );
        let _ = writeln!(
            s,
            "  {} *pc[TM, TN] = C + offc0[:, newaxis] + rbn[newaxis, :] * {};",
            c_ty, l.c.ld[1]
        );
        s.push_str("  bool checkc[TM, TN] = (rxa < M)[:, newaxis] && (rbn < N)[newaxis, :];\n");
    }
    let bias_add = if spec.bias() {
        format!(
            "  {} bv[TN] = (rbn < N) ? *(bias + rbn) : 0;\n  c = c + bv[newaxis, :];\n",
            c_ty
        )
    } else {
        String::new()
    };
    if split {
        s.push_str("  int32 pid0 = get_program_id(0);\n");
        s.push_str("  int32 pid1 = get_program_id(1);\n");
        let _ = writeln!(s, "  int32 *plock = locks + (pid1 * {} + pid0) * 2;", grid0);
        s.push_str("  int32 *pcount = plock + 1;\n");
        s.push_str("  while(__atomic_cas(plock, 0, 1));\n");
        s.push_str("  int32 count = *pcount;\n");
        s.push_str("  if(count == 0){\n");
        for line in bias_add.lines() {
            let _ = writeln!(s, "    {}", line.trim_start());
        }
        s.push_str("    @checkc *pc = c;\n");
        s.push_str("  } else {\n");
        s.push_str("    @checkc *pc = c + *pc;\n");
        s.push_str("  }\n");
        s.push_str("  *pcount = (count + 1 == GZ) ? 0 : count + 1;\n");
        s.push_str("  __atomic_exchg(plock, 0);\n");
    } else {
        s.push_str(&bias_add);
        s.push_str("  @checkc *pc = c;\n");
    }
    s.push_str("}\n");
    s
}

#[allow(clippy::too_many_arguments)]
fn emit_xprop_setup(
    s: &mut String,
    op: &ConvOp,
    lookup: bool,
    plen: usize,
    luts: usize,
    fs: usize,
    filter: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
    foot: [usize; 3],
) {
    let spec = op.spec();
    let l = op.layouts();
    let groups = op.masks().group_dims();

    // output coordinates of the M range
    s.push_str("  int32 rcw[TM] = rxa % CW;\n");
    s.push_str("  int32 rcx[TM] = rxa / CW;\n");
    s.push_str("  int32 rch[TM] = rcx % CH;\n");
    s.push_str("  int32 rcy[TM] = rcx / CH;\n");
    s.push_str("  int32 rcd[TM] = rcy % CD;\n");
    s.push_str("  int32 rcb[TM] = rcy / CD;\n");
    // window start inside the padded input
    let _ = writeln!(s, "  int32 rad[TM] = rcd * {} - {};", stride[0], pad[0]);
    let _ = writeln!(s, "  int32 rah[TM] = rch * {} - {};", stride[1], pad[1]);
    let _ = writeln!(s, "  int32 raw[TM] = rcw * {} - {};", stride[2], pad[2]);
    let _ = writeln!(
        s,
        "  int32 ra0[TM] = rcb * {} + rad * {} + rah * {} + raw * {};",
        l.a.ld[0], l.a.ld[2], l.a.ld[3], l.a.ld[4]
    );
    // reduction lane seeds
    let _ = writeln!(s, "  int32 rac[TK] = rka / {};", fs);
    let _ = writeln!(s, "  int32 raf[TK] = rka % {};", fs);
    let _ = writeln!(s, "  int32 rat[TK] = raf / {};", filter[1] * filter[2]);
    let _ = writeln!(
        s,
        "  int32 rar[TK] = (raf / {}) % {};",
        filter[2], filter[1]
    );
    let _ = writeln!(s, "  int32 ras[TK] = raf % {};", filter[2]);
    let _ = writeln!(
        s,
        "  int32 ra1[TK] = rac * {} + rat * {} + rar * {} + ras * {};",
        l.a_walk.chan, l.a_walk.tap[0], l.a_walk.tap[1], l.a_walk.tap[2]
    );
    // filter taps, mirrored for the gradient walk
    let taps = if spec.flip() {
        [
            format!("({} - rat)", filter[0] - 1),
            format!("({} - rar)", filter[1] - 1),
            format!("({} - ras)", filter[2] - 1),
        ]
    } else {
        ["rat".to_string(), "rar".to_string(), "ras".to_string()]
    };
    let _ = writeln!(
        s,
        "  int32 rb1[TK] = rac * {} + {} * {} + {} * {} + {} * {};",
        l.b_walk.chan,
        taps[0],
        l.b_walk.tap[0],
        taps[1],
        l.b_walk.tap[1],
        taps[2],
        l.b_walk.tap[2]
    );
    let _ = writeln!(
        s,
        "  {} *pa[TM, TK] = A + ra0[:, newaxis] + ra1[newaxis, :];",
        spec.a_dtype().kernel_name()
    );
    let _ = writeln!(
        s,
        "  {} *pb[TN, TK] = B + rbn[:, newaxis] * {} + rb1[newaxis, :];",
        spec.b_dtype().kernel_name(),
        l.b_outer
    );
    // border-distance classes select the mask row
    let _ = writeln!(
        s,
        "  int32 maskd[TM] = {} + min(rad, 0) + max(rad + {} - AD, 0);",
        pad[0], foot[0]
    );
    let _ = writeln!(
        s,
        "  int32 maskh[TM] = {} + min(rah, 0) + max(rah + {} - AH, 0);",
        pad[1], foot[1]
    );
    let _ = writeln!(
        s,
        "  int32 maskw[TM] = {} + min(raw, 0) + max(raw + {} - AW, 0);",
        pad[2], foot[2]
    );
    let _ = writeln!(
        s,
        "  int32 rmask[TM] = {} + {} * ((maskd * {} + maskh) * {} + maskw);",
        luts, luts, groups[1], groups[2]
    );
    // rows past M take the all-zero head block of the mask table
    s.push_str("  rmask = (rxa < M) ? rmask : 0;\n");
    let _ = writeln!(
        s,
        "  {} int32 *pm[TM] = masks + rmask + phase;",
        qualifier(op.is_mask_cst())
    );
    emit_table_pointers(s, op, lookup, plen, luts, fs);
}

#[allow(clippy::too_many_arguments)]
fn emit_wgrad_setup(
    s: &mut String,
    op: &ConvOp,
    lookup: bool,
    plen: usize,
    luts: usize,
    fs: usize,
    upsample: [usize; 3],
    pad: [usize; 3],
) {
    let spec = op.spec();
    let l = op.layouts();
    let gemm = op.gemm();
    let filter = spec.filter();
    let out = gemm.out;
    let nf = spec.nf();

    // one filter tap per N tile
    s.push_str("  int32 pid1 = get_program_id(1);\n");
    let _ = writeln!(s, "  int32 tflat = pid1 * TN / {};", nf);
    let _ = writeln!(s, "  int32 rtd = tflat / {};", filter[1] * filter[2]);
    let _ = writeln!(
        s,
        "  int32 rtr = (tflat / {}) % {};",
        filter[2], filter[1]
    );
    let _ = writeln!(s, "  int32 rts = tflat % {};", filter[2]);
    let _ = writeln!(s, "  int32 rcf[TN] = rbn % {};", nf);
    // reduction lanes walk (batch, output pixel)
    let _ = writeln!(s, "  int32 rac[TK] = rka / {};", fs);
    let _ = writeln!(s, "  int32 raf[TK] = rka % {};", fs);
    let _ = writeln!(s, "  int32 rat[TK] = raf / {};", out[1] * out[2]);
    let _ = writeln!(s, "  int32 rar[TK] = (raf / {}) % {};", out[2], out[1]);
    let _ = writeln!(s, "  int32 ras[TK] = raf % {};", out[2]);
    let _ = writeln!(
        s,
        "  int32 ra1[TK] = rac * {} + rat * {} + rar * {} + ras * {};",
        l.a_walk.chan, l.a_walk.tap[0], l.a_walk.tap[1], l.a_walk.tap[2]
    );
    let pad_off = pad[0] as i64 * l.a.ld[2] + pad[1] as i64 * l.a.ld[3] + pad[2] as i64 * l.a.ld[4];
    let _ = writeln!(
        s,
        "  int32 abase = rtd * {} + rtr * {} + rts * {} - {};",
        upsample[0] as i64 * l.a.ld[2],
        upsample[1] as i64 * l.a.ld[3],
        upsample[2] as i64 * l.a.ld[4],
        pad_off
    );
    let _ = writeln!(
        s,
        "  {} *pa[TM, TK] = A + abase + rxa[:, newaxis] * {} + ra1[newaxis, :];",
        spec.a_dtype().kernel_name(),
        l.a.ld[1]
    );
    let _ = writeln!(
        s,
        "  int32 rb1[TK] = rac * {} + rat * {} + rar * {} + ras * {};",
        l.b_walk.chan, l.b_walk.tap[0], l.b_walk.tap[1], l.b_walk.tap[2]
    );
    let _ = writeln!(
        s,
        "  {} *pb[TK, TN] = B + rb1[:, newaxis] + rcf[newaxis, :] * {};",
        spec.b_dtype().kernel_name(),
        l.b_outer
    );
    // mask row for this tap; rows past M take the all-zero head block
    let _ = writeln!(s, "  int32 rmask[TM] = {} + {} * tflat;", luts, luts);
    s.push_str("  rmask = (rxa < M) ? rmask : 0;\n");
    let _ = writeln!(
        s,
        "  {} int32 *pm[TM] = masks + rmask + phase;",
        qualifier(op.is_mask_cst())
    );
    emit_table_pointers(s, op, lookup, plen, luts, fs);
}

fn emit_table_pointers(
    s: &mut String,
    op: &ConvOp,
    lookup: bool,
    plen: usize,
    luts: usize,
    fs: usize,
) {
    if lookup {
        let _ = writeln!(
            s,
            "  {} int32 *pda[TK] = a_delta + rka % {};",
            qualifier(op.is_a_deltas_cst()),
            luts
        );
        let _ = writeln!(
            s,
            "  {} int32 *pdb[TK] = b_delta + rka % {};",
            qualifier(op.is_b_deltas_cst()),
            luts
        );
        let _ = writeln!(
            s,
            "  {} int32 *pincd[TK] = a_delta + {} + rka % {};",
            qualifier(op.is_a_deltas_cst()),
            plen,
            luts
        );
        let _ = writeln!(
            s,
            "  {} int32 *pincm[TM] = a_delta + {} + phase;",
            qualifier(op.is_a_deltas_cst()),
            plen
        );
    } else {
        // uniform advance, loaded once; the mask row is static as well
        let _ = writeln!(s, "  int32 da[TK] = *(a_delta + rka % {});", fs);
        let _ = writeln!(s, "  int32 db[TK] = *(b_delta + rka % {});", fs);
        s.push_str("  int32 xm[TM] = *pm;\n");
    }
}
