//! Row softmax and layer normalization on raw slices.
//!
//! The single-row kernels are installed into the `KernelSet`; the `*_rows`
//! entry points apply the selected kernel to every row of a matrix.

use tessera_core::{ensure_len, Result, TesseraError};

use crate::dispatch::KernelSet;
use crate::vecmath::{max_portable, sum_portable};

/// Numerically stable softmax of one row (in place), reference version.
///
/// Entries equal to `-inf` come out as exactly 0. A row with no finite
/// entry is a precondition violation.
pub fn softmax_scalar(row: &mut [f32]) {
    let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }

    let inv_sum = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv_sum;
    }
}

/// Softmax with the max / sum reductions split across vector lanes.
pub fn softmax_vectorized(row: &mut [f32]) {
    let max_val = max_portable(row);
    for v in row.iter_mut() {
        *v = (*v - max_val).exp();
    }
    let inv_sum = 1.0 / sum_portable(row);
    for v in row.iter_mut() {
        *v *= inv_sum;
    }
}

/// Layer norm of one row: `(x - mean) / sqrt(var + eps) * gamma + beta`.
///
/// Welford's single-pass mean / variance.
pub fn layer_norm_scalar(x: &[f32], gamma: &[f32], beta: &[f32], eps: f32, out: &mut [f32]) {
    let mut mean = 0.0f32;
    let mut m2 = 0.0f32;
    for (i, &v) in x.iter().enumerate() {
        let delta = v - mean;
        mean += delta / (i + 1) as f32;
        m2 += delta * (v - mean);
    }
    let var = m2 / x.len() as f32;
    let inv_std = 1.0 / (var + eps).sqrt();

    for i in 0..x.len() {
        out[i] = (x[i] - mean) * inv_std * gamma[i] + beta[i];
    }
}

/// Two-pass layer norm with lane-split reductions.
pub fn layer_norm_vectorized(x: &[f32], gamma: &[f32], beta: &[f32], eps: f32, out: &mut [f32]) {
    let n = x.len() as f32;
    let mean = sum_portable(x) / n;
    for (o, &v) in out.iter_mut().zip(x) {
        *o = v - mean;
    }
    let var = crate::vecmath::dot_portable(&out[..x.len()], &out[..x.len()]) / n;
    let inv_std = 1.0 / (var + eps).sqrt();
    for i in 0..x.len() {
        out[i] = out[i] * inv_std * gamma[i] + beta[i];
    }
}

/// Softmax over every `dim`-wide row of `data` (in place).
pub fn softmax_rows(kernels: &KernelSet, data: &mut [f32], dim: usize) -> Result<()> {
    if dim == 0 || data.is_empty() {
        return Ok(());
    }
    if data.len() % dim != 0 {
        return Err(TesseraError::InvalidShape(format!(
            "softmax input of {} elements is not a whole number of rows of {}",
            data.len(),
            dim
        )));
    }
    for row in data.chunks_exact_mut(dim) {
        (kernels.softmax)(row);
    }
    Ok(())
}

/// Layer norm over every `dim`-wide row of `x` into `out`.
pub fn layer_norm_rows(
    kernels: &KernelSet,
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
    out: &mut [f32],
    dim: usize,
) -> Result<()> {
    if dim == 0 || x.is_empty() {
        return Ok(());
    }
    if x.len() % dim != 0 {
        return Err(TesseraError::InvalidShape(format!(
            "layer norm input of {} elements is not a whole number of rows of {}",
            x.len(),
            dim
        )));
    }
    ensure_len("gamma", gamma.len(), dim)?;
    ensure_len("beta", beta.len(), dim)?;
    ensure_len("out", out.len(), x.len())?;

    for (xr, or) in x.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
        (kernels.layer_norm)(xr, &gamma[..dim], &beta[..dim], eps, or);
    }
    Ok(())
}
