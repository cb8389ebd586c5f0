//! Reference attention with `f64` accumulation.

use tessera_core::{ensure_len, AttentionProblem, Result};

/// Normalised probabilities of query row `i` into `row` (`kv_len` entries).
fn row_weights(
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    mask: Option<&[f32]>,
    i: usize,
    row: &mut [f64],
) {
    let (kv, dim) = (problem.kv_len, problem.head_dim);
    let last = problem.last_visible(i);
    let q_row = &q[i * dim..(i + 1) * dim];

    let mut max = f64::NEG_INFINITY;
    for (j, s) in row.iter_mut().enumerate() {
        if j > last {
            *s = f64::NEG_INFINITY;
            continue;
        }
        let k_row = &k[j * dim..(j + 1) * dim];
        let dot: f64 = q_row.iter().zip(k_row).map(|(&a, &b)| a as f64 * b as f64).sum();
        *s = dot * problem.scale as f64;
        if let Some(m) = mask {
            *s += m[i * kv + j] as f64;
        }
        max = max.max(*s);
    }

    let mut sum = 0.0f64;
    for s in row.iter_mut() {
        *s = if *s == f64::NEG_INFINITY { 0.0 } else { (*s - max).exp() };
        sum += *s;
    }
    for s in row.iter_mut() {
        *s /= sum;
    }
}

/// Scalar tier. Buffers are assumed validated by the caller.
pub(crate) fn sdpa_scalar(
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    let (seq, kv, dim) = (problem.seq_len, problem.kv_len, problem.head_dim);
    let mut weights = vec![0.0f64; kv];
    let mut acc = vec![0.0f64; dim];

    for i in 0..seq {
        row_weights(problem, q, k, mask, i, &mut weights);
        acc.fill(0.0);
        for (j, &p) in weights.iter().enumerate() {
            if p == 0.0 {
                continue;
            }
            for (a, &x) in acc.iter_mut().zip(&v[j * dim..(j + 1) * dim]) {
                *a += p * x as f64;
            }
        }
        for (o, &a) in out[i * dim..(i + 1) * dim].iter_mut().zip(&acc) {
            *o = a as f32;
        }
    }
}

/// The `[seq_len, kv_len]` attention probabilities `softmax(Q·Kᵀ·scale + mask)`.
///
/// Debugging helper; always computed by the scalar path.
pub fn attention_weights(
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    mask: Option<&[f32]>,
) -> Result<Vec<f32>> {
    problem.validate()?;
    if problem.is_empty() {
        return Ok(Vec::new());
    }
    ensure_len("q", q.len(), problem.q_len())?;
    ensure_len("k", k.len(), problem.kv_elems())?;
    if let Some(m) = mask {
        ensure_len("mask", m.len(), problem.mask_len())?;
    }

    let kv = problem.kv_len;
    let mut row = vec![0.0f64; kv];
    let mut out = Vec::with_capacity(problem.mask_len());
    for i in 0..problem.seq_len {
        row_weights(problem, q, k, mask, i, &mut row);
        out.extend(row.iter().map(|&p| p as f32));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_keys_average_values() {
        // Identical keys give uniform weights, so every output row is the mean of V.
        let p = AttentionProblem::new(2, 3, 2, 1.0, false);
        let q = [1.0, 2.0, -1.0, 0.5];
        let k = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let v = [0.0, 3.0, 3.0, 6.0, 6.0, 9.0];
        let mut out = [0.0; 4];
        sdpa_scalar(&p, &q, &k, &v, None, &mut out);
        for (o, e) in out.iter().zip([3.0, 6.0, 3.0, 6.0]) {
            assert!((o - e).abs() < 1e-6, "{o} vs {e}");
        }
    }

    #[test]
    fn test_weights_with_mask() {
        let p = AttentionProblem::new(1, 3, 1, 1.0, false);
        let mask = [0.0, f32::NEG_INFINITY, 0.0];
        let w = attention_weights(&p, &[0.0], &[1.0, 2.0, 3.0], Some(&mask)).unwrap();
        assert_eq!(w[1], 0.0);
        assert!((w[0] - 0.5).abs() < 1e-7);
        assert!((w[2] - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_causal_prefix_weights() {
        // seq 2 over kv 3: row 0 sees keys 0..=1, row 1 sees all.
        let p = AttentionProblem::new(2, 3, 1, 1.0, true);
        let w = attention_weights(&p, &[0.0, 0.0], &[0.0; 3], None).unwrap();
        assert_eq!(w[2], 0.0);
        assert!((w[0] - 0.5).abs() < 1e-7);
        assert!((w[3] - 1.0 / 3.0).abs() < 1e-7);
    }

    #[test]
    fn test_weights_empty_and_short() {
        let p = AttentionProblem::new(0, 3, 2, 1.0, false);
        assert!(attention_weights(&p, &[], &[], None).unwrap().is_empty());
        let p = AttentionProblem::new(2, 2, 2, 1.0, false);
        assert!(attention_weights(&p, &[0.0; 3], &[0.0; 4], None).is_err());
    }
}
