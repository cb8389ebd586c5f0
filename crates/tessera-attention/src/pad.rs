//! Padding adapter between row-major `[seq, head_dim]` operands and the
//! tiled kernel's padded, transposed layout.

use tessera_core::{AttentionProblem, Shape};
use tessera_kernels::{KernelSet, Scratch, TILE};

use crate::tiled::{flash_tiled, TiledProblem};

/// Buffers are assumed validated by the caller.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sdpa_padded(
    kernels: &KernelSet,
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
    scratch: &mut Scratch,
) {
    let (seq, kv, dim) = (problem.seq_len, problem.kv_len, problem.head_dim);
    let padded = Shape::from([seq, kv, dim]).padded_to(TILE);
    let (sp, kp, dp) = (padded.dims()[0], padded.dims()[1], padded.dims()[2]);
    let offset = problem.causal.then(|| problem.causal_offset());

    // Padded key columns must be excluded explicitly; padded head dims are
    // zero in both operands and contribute nothing.
    let synth_mask = mask.is_some() || kp != kv;
    let mask_len = if synth_mask { sp * kp } else { 0 };
    let [qt, kt, vp, op, mp] = scratch.carve([dp * sp, dp * kp, kp * dp, sp * dp, mask_len]);

    for i in 0..seq {
        for (d, &x) in q[i * dim..(i + 1) * dim].iter().enumerate() {
            qt[d * sp + i] = x;
        }
    }
    for j in 0..kv {
        for (d, &x) in k[j * dim..(j + 1) * dim].iter().enumerate() {
            kt[d * kp + j] = x;
        }
        vp[j * dp..j * dp + dim].copy_from_slice(&v[j * dim..(j + 1) * dim]);
    }

    if synth_mask {
        for (i, row) in mp.chunks_exact_mut(kp).enumerate() {
            for (j, m) in row.iter_mut().enumerate() {
                let hidden = j >= kv || offset.is_some_and(|off| j > i + off);
                *m = if hidden {
                    f32::NEG_INFINITY
                } else if i < seq {
                    mask.map_or(0.0, |mk| mk[i * kv + j])
                } else {
                    0.0
                };
            }
        }
    }

    let tp = TiledProblem { sp, kp, dp, scale: problem.scale, causal_offset: offset };
    flash_tiled(kernels.tile_backend(), &tp, qt, kt, vp, synth_mask.then_some(&*mp), op);

    for i in 0..seq {
        out[i * dim..(i + 1) * dim].copy_from_slice(&op[i * dp..i * dp + dim]);
    }
}
