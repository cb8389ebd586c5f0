//! Elementwise vector primitives on raw `f32` slices.
//!
//! Each primitive has a portable version written so the compiler can
//! auto-vectorize it (eight independent partial accumulators) plus explicit
//! AVX2+FMA and NEON versions. The `KernelSet` picks one per process; the
//! hardware versions are only reachable through it.

/// Lanes in the portable accumulators.
const LANES: usize = 8;

/// `Σ a[i]·b[i]` over the common prefix of `a` and `b`.
pub fn dot_portable(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);
    let mut acc = [0.0f32; LANES];
    let mut ca = a.chunks_exact(LANES);
    let mut cb = b.chunks_exact(LANES);
    for (xa, xb) in (&mut ca).zip(&mut cb) {
        for l in 0..LANES {
            acc[l] += xa[l] * xb[l];
        }
    }
    let mut tail = 0.0f32;
    for (x, y) in ca.remainder().iter().zip(cb.remainder()) {
        tail += x * y;
    }
    acc.iter().sum::<f32>() + tail
}

/// `y += alpha·x`
pub fn axpy_portable(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// `y *= alpha`
pub fn scale_portable(alpha: f32, y: &mut [f32]) {
    for v in y.iter_mut() {
        *v *= alpha;
    }
}

/// Maximum element; `-inf` for an empty slice.
pub fn max_portable(x: &[f32]) -> f32 {
    let mut acc = [f32::NEG_INFINITY; LANES];
    let mut chunks = x.chunks_exact(LANES);
    for c in &mut chunks {
        for l in 0..LANES {
            acc[l] = acc[l].max(c[l]);
        }
    }
    let m = chunks.remainder().iter().copied().fold(f32::NEG_INFINITY, f32::max);
    acc.iter().copied().fold(m, f32::max)
}

pub fn sum_portable(x: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let mut chunks = x.chunks_exact(LANES);
    for c in &mut chunks {
        for l in 0..LANES {
            acc[l] += c[l];
        }
    }
    acc.iter().sum::<f32>() + chunks.remainder().iter().sum::<f32>()
}

/// `y += x`
pub fn add_assign(y: &mut [f32], x: &[f32]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += xi;
    }
}

// ============================================================================
// AVX2 + FMA
// ============================================================================

/// AVX2 dot product. Only handed out by the `KernelSet` when AVX2 and FMA
/// were detected.
#[cfg(target_arch = "x86_64")]
pub(crate) fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    // Safety: resolve_kernels only installs this after detecting avx2+fma.
    unsafe { dot_avx2_inner(a, b) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_avx2_inner(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len().min(b.len());
    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();
    let mut i = 0;
    while i + 16 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        acc1 =
            _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i + 8)), _mm256_loadu_ps(pb.add(i + 8)), acc1);
        i += 16;
    }
    if i + 8 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        i += 8;
    }
    let mut sum = hsum_avx(_mm256_add_ps(acc0, acc1));
    while i < n {
        sum += *pa.add(i) * *pb.add(i);
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum_avx(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps(v, 1);
    let s = _mm_add_ps(lo, hi);
    let s = _mm_add_ps(s, _mm_movehl_ps(s, s));
    let s = _mm_add_ss(s, _mm_shuffle_ps(s, s, 0x55));
    _mm_cvtss_f32(s)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn axpy_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    // Safety: installed only after detecting avx2+fma.
    unsafe { axpy_avx2_inner(alpha, x, y) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_avx2_inner(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = x.len().min(y.len());
    let px = x.as_ptr();
    let py = y.as_mut_ptr();
    let va = _mm256_set1_ps(alpha);
    let mut i = 0;
    while i + 8 <= n {
        let r = _mm256_fmadd_ps(va, _mm256_loadu_ps(px.add(i)), _mm256_loadu_ps(py.add(i)));
        _mm256_storeu_ps(py.add(i), r);
        i += 8;
    }
    while i < n {
        *py.add(i) += alpha * *px.add(i);
        i += 1;
    }
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn scale_avx2(alpha: f32, y: &mut [f32]) {
    // Safety: installed only after detecting avx2.
    unsafe { scale_avx2_inner(alpha, y) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn scale_avx2_inner(alpha: f32, y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = y.len();
    let py = y.as_mut_ptr();
    let va = _mm256_set1_ps(alpha);
    let mut i = 0;
    while i + 8 <= n {
        _mm256_storeu_ps(py.add(i), _mm256_mul_ps(va, _mm256_loadu_ps(py.add(i))));
        i += 8;
    }
    while i < n {
        *py.add(i) *= alpha;
        i += 1;
    }
}

// ============================================================================
// NEON
// ============================================================================

#[cfg(target_arch = "aarch64")]
pub(crate) fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    // Safety: installed only after detecting neon.
    unsafe { dot_neon_inner(a, b) }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon_inner(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len().min(b.len());
    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut acc0 = vdupq_n_f32(0.0);
    let mut acc1 = vdupq_n_f32(0.0);
    let mut i = 0;
    while i + 8 <= n {
        acc0 = vfmaq_f32(acc0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
        acc1 = vfmaq_f32(acc1, vld1q_f32(pa.add(i + 4)), vld1q_f32(pb.add(i + 4)));
        i += 8;
    }
    let mut sum = vaddvq_f32(vaddq_f32(acc0, acc1));
    while i < n {
        sum += *pa.add(i) * *pb.add(i);
        i += 1;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn axpy_neon(alpha: f32, x: &[f32], y: &mut [f32]) {
    // Safety: installed only after detecting neon.
    unsafe { axpy_neon_inner(alpha, x, y) }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn axpy_neon_inner(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::aarch64::*;

    let n = x.len().min(y.len());
    let px = x.as_ptr();
    let py = y.as_mut_ptr();
    let va = vdupq_n_f32(alpha);
    let mut i = 0;
    while i + 4 <= n {
        vst1q_f32(py.add(i), vfmaq_f32(vld1q_f32(py.add(i)), va, vld1q_f32(px.add(i))));
        i += 4;
    }
    while i < n {
        *py.add(i) += alpha * *px.add(i);
        i += 1;
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn scale_neon(alpha: f32, y: &mut [f32]) {
    // Safety: installed only after detecting neon.
    unsafe { scale_neon_inner(alpha, y) }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn scale_neon_inner(alpha: f32, y: &mut [f32]) {
    use std::arch::aarch64::*;

    let n = y.len();
    let py = y.as_mut_ptr();
    let mut i = 0;
    while i + 4 <= n {
        vst1q_f32(py.add(i), vmulq_n_f32(vld1q_f32(py.add(i)), alpha));
        i += 4;
    }
    while i < n {
        *py.add(i) *= alpha;
        i += 1;
    }
}
