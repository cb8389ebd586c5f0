//! Dense projection `X·Wᵀ + b` and the fused query/key/value projection.
//!
//! Every output element is `dot(x_row, w_row) + b[j]` computed by the same
//! `KernelSet::dot`, so the stacked and split QKV strategies agree bit for bit.

use rayon::prelude::*;
use serde::Serialize;
use tessera_core::{ensure_len, Result, TesseraError};

use crate::dispatch::KernelSet;
use crate::scratch::Scratch;

/// Minimum rows before we use rayon parallelism.
const PAR_ROW_THRESHOLD: usize = 16;

/// Split projections pay off when Q is at least this many times wider
/// than K/V (grouped-query attention).
const SPLIT_ASYMMETRY: usize = 4;

/// Default element budget below which asymmetric projections are split.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1 << 22;

/// `out[rows, out_features] = x[rows, in_features] · w[out_features, in_features]ᵀ + bias`
#[allow(clippy::too_many_arguments)]
pub fn linear(
    kernels: &KernelSet,
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    out: &mut [f32],
    rows: usize,
    in_features: usize,
    out_features: usize,
) -> Result<()> {
    if rows == 0 || out_features == 0 {
        return Ok(());
    }
    ensure_len("x", x.len(), rows * in_features)?;
    ensure_len("w", w.len(), out_features * in_features)?;
    ensure_len("out", out.len(), rows * out_features)?;
    if let Some(b) = bias {
        ensure_len("bias", b.len(), out_features)?;
    }

    let dot = kernels.dot;
    let compute_row = |row: usize, out_row: &mut [f32]| {
        let x_row = &x[row * in_features..(row + 1) * in_features];
        for (j, o) in out_row.iter_mut().enumerate() {
            let acc = dot(x_row, &w[j * in_features..(j + 1) * in_features]);
            *o = match bias {
                Some(b) => acc + b[j],
                None => acc,
            };
        }
    };

    let out = &mut out[..rows * out_features];
    if rows >= PAR_ROW_THRESHOLD {
        out.par_chunks_mut(out_features)
            .enumerate()
            .for_each(|(row, out_row)| compute_row(row, out_row));
    } else {
        for (row, out_row) in out.chunks_mut(out_features).enumerate() {
            compute_row(row, out_row);
        }
    }
    Ok(())
}

/// How [`QkvProjection::project`] evaluates the three projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QkvStrategy {
    /// One matmul against the stacked weight, then scatter with bias.
    Stacked,
    /// Three independent projections straight into the outputs.
    Split,
}

/// Optional per-segment biases.
#[derive(Debug, Clone, Copy, Default)]
pub struct QkvBias<'a> {
    pub q: Option<&'a [f32]>,
    pub k: Option<&'a [f32]>,
    pub v: Option<&'a [f32]>,
}

/// Geometry of a fused QKV projection whose weight stacks
/// `[q_dim + 2·kv_dim, in_features]` rows as Q, then K, then V.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvProjection {
    pub in_features: usize,
    pub q_dim: usize,
    pub kv_dim: usize,
    /// Tunable element budget for the split strategy.
    pub split_threshold: usize,
}

impl QkvProjection {
    pub fn new(in_features: usize, q_dim: usize, kv_dim: usize) -> Self {
        Self { in_features, q_dim, kv_dim, split_threshold: DEFAULT_SPLIT_THRESHOLD }
    }

    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Rows of the stacked weight.
    pub fn total_out(&self) -> usize {
        self.q_dim + 2 * self.kv_dim
    }

    /// Pick a strategy for `rows` input rows.
    pub fn strategy(&self, rows: usize) -> QkvStrategy {
        let asymmetric = self.q_dim >= SPLIT_ASYMMETRY * self.kv_dim;
        let work = rows * self.total_out() * self.in_features;
        if asymmetric && work < self.split_threshold {
            QkvStrategy::Split
        } else {
            QkvStrategy::Stacked
        }
    }

    /// Project `x[rows, in_features]` into `q[rows, q_dim]`,
    /// `k[rows, kv_dim]`, `v[rows, kv_dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn project(
        &self,
        kernels: &KernelSet,
        x: &[f32],
        w: &[f32],
        bias: QkvBias<'_>,
        q: &mut [f32],
        k: &mut [f32],
        v: &mut [f32],
        rows: usize,
        scratch: &mut Scratch,
    ) -> Result<QkvStrategy> {
        let strategy = self.strategy(rows);
        tracing::debug!(
            ?strategy,
            rows,
            q_dim = self.q_dim,
            kv_dim = self.kv_dim,
            "qkv projection"
        );
        self.project_with(strategy, kernels, x, w, bias, q, k, v, rows, scratch)?;
        Ok(strategy)
    }

    /// Same as [`QkvProjection::project`] with the strategy fixed by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn project_with(
        &self,
        strategy: QkvStrategy,
        kernels: &KernelSet,
        x: &[f32],
        w: &[f32],
        bias: QkvBias<'_>,
        q: &mut [f32],
        k: &mut [f32],
        v: &mut [f32],
        rows: usize,
        scratch: &mut Scratch,
    ) -> Result<()> {
        if self.in_features == 0 && self.total_out() > 0 {
            return Err(TesseraError::InvalidShape("qkv projection with 0 input features".into()));
        }
        if rows == 0 || self.total_out() == 0 {
            return Ok(());
        }
        let (d_in, qd, kvd) = (self.in_features, self.q_dim, self.kv_dim);
        ensure_len("x", x.len(), rows * d_in)?;
        ensure_len("w", w.len(), self.total_out() * d_in)?;
        ensure_len("q", q.len(), rows * qd)?;
        ensure_len("k", k.len(), rows * kvd)?;
        ensure_len("v", v.len(), rows * kvd)?;
        let biases = [("q_bias", bias.q, qd), ("k_bias", bias.k, kvd), ("v_bias", bias.v, kvd)];
        for (name, b, n) in biases {
            if let Some(b) = b {
                ensure_len(name, b.len(), n)?;
            }
        }

        let w_q = &w[..qd * d_in];
        let w_k = &w[qd * d_in..(qd + kvd) * d_in];
        let w_v = &w[(qd + kvd) * d_in..(qd + 2 * kvd) * d_in];

        match strategy {
            QkvStrategy::Split => {
                linear(kernels, x, w_q, bias.q, q, rows, d_in, qd)?;
                linear(kernels, x, w_k, bias.k, k, rows, d_in, kvd)?;
                linear(kernels, x, w_v, bias.v, v, rows, d_in, kvd)?;
            }
            QkvStrategy::Stacked => {
                let total = self.total_out();
                let [fused] = scratch.carve([rows * total]);
                linear(kernels, x, w, None, fused, rows, d_in, total)?;
                for (r, fused_row) in fused.chunks_exact(total).enumerate() {
                    scatter_segment(&fused_row[..qd], bias.q, &mut q[r * qd..(r + 1) * qd]);
                    let k_row = &mut k[r * kvd..(r + 1) * kvd];
                    scatter_segment(&fused_row[qd..qd + kvd], bias.k, k_row);
                    scatter_segment(&fused_row[qd + kvd..], bias.v, &mut v[r * kvd..(r + 1) * kvd]);
                }
            }
        }
        Ok(())
    }
}

fn scatter_segment(src: &[f32], bias: Option<&[f32]>, dst: &mut [f32]) {
    match bias {
        Some(b) => {
            for ((d, s), b) in dst.iter_mut().zip(src).zip(b) {
                *d = s + b;
            }
        }
        None => dst.copy_from_slice(src),
    }
}
