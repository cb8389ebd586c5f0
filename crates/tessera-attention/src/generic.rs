//! Generic tier: full score matrix, vectorized inner loops.

use tessera_core::AttentionProblem;
use tessera_kernels::{KernelSet, Scratch};

/// Buffers are assumed validated by the caller.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sdpa_generic(
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
    let [scores] = scratch.carve([seq * kv]);

    for (i, row) in scores.chunks_exact_mut(kv).enumerate() {
        let last = problem.last_visible(i);
        let q_row = &q[i * dim..(i + 1) * dim];

        for (j, s) in row.iter_mut().enumerate() {
            *s = if j > last {
                f32::NEG_INFINITY
            } else {
                (kernels.dot)(q_row, &k[j * dim..(j + 1) * dim]) * problem.scale
            };
        }
        if let Some(m) = mask {
            for (s, &m) in row.iter_mut().zip(&m[i * kv..(i + 1) * kv]) {
                *s += m;
            }
        }
        (kernels.softmax)(row);

        let out_row = &mut out[i * dim..(i + 1) * dim];
        out_row.fill(0.0);
        for (j, &p) in row[..=last].iter().enumerate() {
            if p != 0.0 {
                (kernels.axpy)(p, &v[j * dim..(j + 1) * dim], out_row);
            }
        }
    }
}
