//! Tiled tier: 8×8 outer-product tiles with online softmax.
//!
//! Operates on padded, pre-transposed operands:
//! `Qᵀ[dp, sp]`, `Kᵀ[dp, kp]`, `V[kp, dp]`, output `O[sp, dp]`, where every
//! extent is a multiple of `TILE`. Score tiles never leave registers (or an
//! 8×8 stack array); the running max `m` and sum `l` of each query row
//! rescale the partial output as new key tiles arrive.

use tessera_kernels::{TileBackend, TILE};

const TT: usize = TILE * TILE;

/// Geometry of one padded tiled problem.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TiledProblem {
    pub sp: usize,
    pub kp: usize,
    pub dp: usize,
    pub scale: f32,
    /// `Some(offset)` for causal: row `i` sees keys `j <= i + offset`.
    pub causal_offset: Option<usize>,
}

/// Register-tile micro-kernels.
///
/// # Safety
/// Implementations may require CPU features; callers must only use an
/// implementation the running CPU supports. Index ranges are checked once
/// by [`flash_tiled`].
trait TileOps {
    /// `s[r, c] = Σ_d qt[d, i0 + r] · kt[d, j0 + c]`
    unsafe fn score_tile(
        qt: &[f32],
        kt: &[f32],
        p: &TiledProblem,
        i0: usize,
        j0: usize,
        s: &mut [f32; TT],
    );

    /// `acc[r, :] += Σ_c pt[r, c] · v[j0 + c, :]` for the `TILE` rows of `acc`.
    unsafe fn accumulate_pv(
        pt: &[f32; TT],
        v: &[f32],
        p: &TiledProblem,
        j0: usize,
        acc: &mut [f32],
    );
}

struct Portable;

impl TileOps for Portable {
    unsafe fn score_tile(
        qt: &[f32],
        kt: &[f32],
        p: &TiledProblem,
        i0: usize,
        j0: usize,
        s: &mut [f32; TT],
    ) {
        *s = [0.0; TT];
        for d in 0..p.dp {
            let q = &qt[d * p.sp + i0..d * p.sp + i0 + TILE];
            let k = &kt[d * p.kp + j0..d * p.kp + j0 + TILE];
            for (r, &qv) in q.iter().enumerate() {
                for (c, &kv) in k.iter().enumerate() {
                    s[r * TILE + c] += qv * kv;
                }
            }
        }
    }

    unsafe fn accumulate_pv(
        pt: &[f32; TT],
        v: &[f32],
        p: &TiledProblem,
        j0: usize,
        acc: &mut [f32],
    ) {
        for c in 0..TILE {
            let v_row = &v[(j0 + c) * p.dp..(j0 + c + 1) * p.dp];
            for r in 0..TILE {
                let w = pt[r * TILE + c];
                if w == 0.0 {
                    continue;
                }
                for (a, &x) in acc[r * p.dp..(r + 1) * p.dp].iter_mut().zip(v_row) {
                    *a += w * x;
                }
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
struct Avx2Fma;

#[cfg(target_arch = "x86_64")]
impl TileOps for Avx2Fma {
    #[target_feature(enable = "avx2,fma")]
    unsafe fn score_tile(
        qt: &[f32],
        kt: &[f32],
        p: &TiledProblem,
        i0: usize,
        j0: usize,
        s: &mut [f32; TT],
    ) {
        use std::arch::x86_64::*;

        // One accumulator per query row of the tile.
        let mut acc = [_mm256_setzero_ps(); TILE];
        for d in 0..p.dp {
            let k_vec = _mm256_loadu_ps(kt.as_ptr().add(d * p.kp + j0));
            let q_ptr = qt.as_ptr().add(d * p.sp + i0);
            for (r, a) in acc.iter_mut().enumerate() {
                *a = _mm256_fmadd_ps(_mm256_set1_ps(*q_ptr.add(r)), k_vec, *a);
            }
        }
        for (r, a) in acc.iter().enumerate() {
            _mm256_storeu_ps(s.as_mut_ptr().add(r * TILE), *a);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn accumulate_pv(
        pt: &[f32; TT],
        v: &[f32],
        p: &TiledProblem,
        j0: usize,
        acc: &mut [f32],
    ) {
        use std::arch::x86_64::*;

        for dc in (0..p.dp).step_by(TILE) {
            let mut rows = [_mm256_setzero_ps(); TILE];
            for (r, row) in rows.iter_mut().enumerate() {
                *row = _mm256_loadu_ps(acc.as_ptr().add(r * p.dp + dc));
            }
            for c in 0..TILE {
                let v_vec = _mm256_loadu_ps(v.as_ptr().add((j0 + c) * p.dp + dc));
                for (r, row) in rows.iter_mut().enumerate() {
                    *row = _mm256_fmadd_ps(_mm256_set1_ps(pt[r * TILE + c]), v_vec, *row);
                }
            }
            for (r, row) in rows.iter().enumerate() {
                _mm256_storeu_ps(acc.as_mut_ptr().add(r * p.dp + dc), *row);
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
struct Neon;

#[cfg(target_arch = "aarch64")]
impl TileOps for Neon {
    #[target_feature(enable = "neon")]
    unsafe fn score_tile(
        qt: &[f32],
        kt: &[f32],
        p: &TiledProblem,
        i0: usize,
        j0: usize,
        s: &mut [f32; TT],
    ) {
        use std::arch::aarch64::*;

        // Each tile row is two 4-lane halves.
        let mut lo = [vdupq_n_f32(0.0); TILE];
        let mut hi = [vdupq_n_f32(0.0); TILE];
        for d in 0..p.dp {
            let k_ptr = kt.as_ptr().add(d * p.kp + j0);
            let (k_lo, k_hi) = (vld1q_f32(k_ptr), vld1q_f32(k_ptr.add(4)));
            let q_ptr = qt.as_ptr().add(d * p.sp + i0);
            for r in 0..TILE {
                let qv = vdupq_n_f32(*q_ptr.add(r));
                lo[r] = vfmaq_f32(lo[r], qv, k_lo);
                hi[r] = vfmaq_f32(hi[r], qv, k_hi);
            }
        }
        for r in 0..TILE {
            vst1q_f32(s.as_mut_ptr().add(r * TILE), lo[r]);
            vst1q_f32(s.as_mut_ptr().add(r * TILE + 4), hi[r]);
        }
    }

    #[target_feature(enable = "neon")]
    unsafe fn accumulate_pv(
        pt: &[f32; TT],
        v: &[f32],
        p: &TiledProblem,
        j0: usize,
        acc: &mut [f32],
    ) {
        use std::arch::aarch64::*;

        for dc in (0..p.dp).step_by(4) {
            for r in 0..TILE {
                let a_ptr = acc.as_mut_ptr().add(r * p.dp + dc);
                let mut a = vld1q_f32(a_ptr);
                for c in 0..TILE {
                    let v_vec = vld1q_f32(v.as_ptr().add((j0 + c) * p.dp + dc));
                    a = vfmaq_f32(a, vdupq_n_f32(pt[r * TILE + c]), v_vec);
                }
                vst1q_f32(a_ptr, a);
            }
        }
    }
}

/// Run the tiled kernel with the micro-kernels of `backend`.
///
/// `mask`, when present, is a combined additive `[sp, kp]` mask. Panics if
/// any buffer is shorter than the geometry requires.
pub(crate) fn flash_tiled(
    backend: TileBackend,
    p: &TiledProblem,
    qt: &[f32],
    kt: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    assert!(
        p.sp % TILE == 0 && p.kp % TILE == 0 && p.dp % TILE == 0,
        "tiled extents must be multiples of {TILE}"
    );
    assert!(qt.len() >= p.dp * p.sp, "qt too short");
    assert!(kt.len() >= p.dp * p.kp, "kt too short");
    assert!(v.len() >= p.kp * p.dp, "v too short");
    assert!(out.len() >= p.sp * p.dp, "out too short");
    if let Some(m) = mask {
        assert!(m.len() >= p.sp * p.kp, "mask too short");
    }

    match backend {
        // Safety: the backend is only resolved when AVX2 and FMA were detected.
        #[cfg(target_arch = "x86_64")]
        TileBackend::Avx2Fma => unsafe { flash_avx2(p, qt, kt, v, mask, out) },
        // Safety: the backend is only resolved when NEON was detected.
        #[cfg(target_arch = "aarch64")]
        TileBackend::Neon => unsafe { flash_neon(p, qt, kt, v, mask, out) },
        // Safety: no CPU features required.
        _ => unsafe { flash::<Portable>(p, qt, kt, v, mask, out) },
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn flash_avx2(
    p: &TiledProblem,
    qt: &[f32],
    kt: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    flash::<Avx2Fma>(p, qt, kt, v, mask, out)
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn flash_neon(
    p: &TiledProblem,
    qt: &[f32],
    kt: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    flash::<Neon>(p, qt, kt, v, mask, out)
}

#[inline(always)]
unsafe fn flash<O: TileOps>(
    p: &TiledProblem,
    qt: &[f32],
    kt: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    let mut tile = [0.0f32; TT];

    for i0 in (0..p.sp).step_by(TILE) {
        let acc = &mut out[i0 * p.dp..(i0 + TILE) * p.dp];
        acc.fill(0.0);
        let mut m = [f32::NEG_INFINITY; TILE];
        let mut l = [0.0f32; TILE];

        // Key tiles wholly above the diagonal are never visited.
        let j_end = match p.causal_offset {
            Some(off) => (i0 + TILE + off).min(p.kp),
            None => p.kp,
        };

        for j0 in (0..j_end).step_by(TILE) {
            O::score_tile(qt, kt, p, i0, j0, &mut tile);

            for r in 0..TILE {
                let i = i0 + r;
                let row = &mut tile[r * TILE..(r + 1) * TILE];
                let mut tile_max = f32::NEG_INFINITY;
                for (c, s) in row.iter_mut().enumerate() {
                    let j = j0 + c;
                    *s = match p.causal_offset {
                        Some(off) if j > i + off => f32::NEG_INFINITY,
                        _ => *s * p.scale + mask.map_or(0.0, |mk| mk[i * p.kp + j]),
                    };
                    tile_max = tile_max.max(*s);
                }

                let m_new = m[r].max(tile_max);
                if m_new == f32::NEG_INFINITY {
                    row.fill(0.0);
                    continue;
                }
                let correction = (m[r] - m_new).exp();
                let mut row_sum = 0.0f32;
                for s in row.iter_mut() {
                    *s = (*s - m_new).exp();
                    row_sum += *s;
                }
                l[r] = l[r] * correction + row_sum;
                m[r] = m_new;
                if correction != 1.0 {
                    for a in &mut acc[r * p.dp..(r + 1) * p.dp] {
                        *a *= correction;
                    }
                }
            }

            O::accumulate_pv(&tile, v, p, j0, acc);
        }

        for (r, &sum) in l.iter().enumerate() {
            if sum > 0.0 {
                let inv = 1.0 / sum;
                for a in &mut acc[r * p.dp..(r + 1) * p.dp] {
                    *a *= inv;
                }
            }
        }
    }
}
