//! Multi-head and grouped-query attention over strided `(batch, head)` blocks.
//!
//! Every `(batch, head)` pair is an independent single-head problem. Query
//! head `h` reads key/value head `h / (num_heads / num_kv_heads)`. Heads
//! whose rows are packed (`seq` stride == `head_dim`) are passed to the
//! kernels in place; any other layout is gathered into scratch and the
//! result scattered back. The output uses the query strides.

use parking_lot::Mutex;
use serde::Serialize;
use tessera_core::{ensure_len, HeadStrides, MaskView, MultiHeadDesc, Result, TesseraError};
use tessera_kernels::{KernelSet, ScratchPool, SdpaTier, WorkerPool};

use crate::sdpa::sdpa;

/// Below this many multiply-adds (`pairs · seq · kv · dim`) heads run on
/// the calling thread.
pub const PARALLEL_WORK_THRESHOLD: usize = 1 << 15;

/// Everything a multi-head call borrows from its owner.
#[derive(Clone, Copy)]
pub struct AttentionContext<'a> {
    pub kernels: &'a KernelSet,
    /// `None` runs every head on the calling thread.
    pub pool: Option<&'a WorkerPool>,
    pub scratch: &'a ScratchPool,
}

/// What a multi-head call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    /// Tier chosen for every head; `None` when there was nothing to do.
    pub tier: Option<SdpaTier>,
    pub pairs: usize,
    pub parallel: bool,
    /// Some operand was gathered through scratch.
    pub gathered: bool,
}

/// Output pointer shared by the workers.
///
/// Each `(batch, head)` owns a disjoint set of rows (checked by
/// `non_overlapping`), so concurrent writes never alias.
#[derive(Clone, Copy)]
struct SharedOut {
    ptr: *mut f32,
    len: usize,
}

unsafe impl Send for SharedOut {}
unsafe impl Sync for SharedOut {}

impl SharedOut {
    /// # Safety
    /// `start..start + len` must lie inside the buffer and no other live
    /// slice may overlap it.
    unsafe fn slice(&self, start: usize, len: usize) -> &mut [f32] {
        debug_assert!(start + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(start), len)
    }
}

/// `out[b, h] = sdpa(q[b, h], k[b, kv(h)], v[b, kv(h)], mask[b, h])` for every pair.
#[allow(clippy::too_many_arguments)]
pub fn multi_head_sdpa(
    ctx: &AttentionContext<'_>,
    desc: &MultiHeadDesc,
    q: &[f32],
    q_strides: HeadStrides,
    k: &[f32],
    v: &[f32],
    kv_strides: HeadStrides,
    mask: Option<MaskView<'_>>,
    out: &mut [f32],
    scale: f32,
    causal: bool,
) -> Result<Dispatch> {
    desc.validate()?;
    let problem = desc.problem(scale, causal);
    if desc.is_empty() {
        return Ok(Dispatch { tier: None, pairs: 0, parallel: false, gathered: false });
    }
    problem.validate()?;

    let (batch, heads, kv_heads) = (desc.batch, desc.num_heads, desc.num_kv_heads);
    let (seq, kv, dim) = (desc.seq_len, desc.kv_len, desc.head_dim);
    ensure_len("q", q.len(), q_strides.required_len(batch, heads, seq, dim))?;
    ensure_len("k", k.len(), kv_strides.required_len(batch, kv_heads, kv, dim))?;
    ensure_len("v", v.len(), kv_strides.required_len(batch, kv_heads, kv, dim))?;
    ensure_len("out", out.len(), q_strides.required_len(batch, heads, seq, dim))?;
    if let Some(m) = &mask {
        m.validate(desc)?;
    }
    if !non_overlapping(&q_strides, batch, heads, seq, dim) {
        return Err(TesseraError::InvalidShape(format!(
            "output strides {q_strides:?} overlap for [{batch}, {heads}, {seq}, {dim}]"
        )));
    }

    let q_packed = q_strides.rows_contiguous(dim) || seq == 1;
    let kv_packed = kv_strides.rows_contiguous(dim) || kv == 1;
    let pairs = desc.pairs();
    let parallel = ctx.pool.is_some()
        && pairs >= 2
        && pairs * seq * kv * dim >= PARALLEL_WORK_THRESHOLD;
    let dispatch = Dispatch {
        tier: Some(ctx.kernels.select_sdpa(&problem)),
        pairs,
        parallel,
        gathered: !(q_packed && kv_packed),
    };

    let shared = SharedOut { ptr: out.as_mut_ptr(), len: out.len() };
    let first_err: Mutex<Option<TesseraError>> = Mutex::new(None);

    let run_pair = |idx: usize| {
        let (b, h) = (idx / heads, idx % heads);
        let kvh = desc.kv_head(h);
        let q_off = q_strides.offset(b, h);
        let kv_off = kv_strides.offset(b, kvh);
        let mask_block = mask.map(|m| m.block(b, h, seq, kv));

        let mut staging = ctx.scratch.checkout();
        let mut work = ctx.scratch.checkout();
        let [q_buf, k_buf, v_buf, o_buf] = staging.carve([
            if q_packed { 0 } else { seq * dim },
            if kv_packed { 0 } else { kv * dim },
            if kv_packed { 0 } else { kv * dim },
            if q_packed { 0 } else { seq * dim },
        ]);

        let q_head: &[f32] = if q_packed {
            &q[q_off..q_off + seq * dim]
        } else {
            gather(q, q_off, q_strides.seq, seq, dim, q_buf);
            &*q_buf
        };
        let (k_head, v_head): (&[f32], &[f32]) = if kv_packed {
            (&k[kv_off..kv_off + kv * dim], &v[kv_off..kv_off + kv * dim])
        } else {
            gather(k, kv_off, kv_strides.seq, kv, dim, k_buf);
            gather(v, kv_off, kv_strides.seq, kv, dim, v_buf);
            (&*k_buf, &*v_buf)
        };

        let result = if q_packed {
            // Safety: the rows of (b, h) are disjoint from every other pair's.
            let out_head = unsafe { shared.slice(q_off, seq * dim) };
            sdpa(ctx.kernels, &problem, q_head, k_head, v_head, mask_block, out_head, &mut work)
        } else {
            let r =
                sdpa(ctx.kernels, &problem, q_head, k_head, v_head, mask_block, o_buf, &mut work);
            for i in 0..seq {
                // Safety: as above, row by row.
                let row = unsafe { shared.slice(q_off + i * q_strides.seq, dim) };
                row.copy_from_slice(&o_buf[i * dim..(i + 1) * dim]);
            }
            r
        };
        if let Err(e) = result {
            first_err.lock().get_or_insert(e);
        }
    };

    match ctx.pool {
        Some(pool) if parallel => pool.parallel_for(pairs, run_pair),
        _ => (0..pairs).for_each(run_pair),
    }

    if let Some(e) = first_err.into_inner() {
        return Err(e);
    }
    tracing::trace!(?dispatch, "multi-head attention");
    Ok(dispatch)
}

fn gather(src: &[f32], offset: usize, row_stride: usize, rows: usize, dim: usize, dst: &mut [f32]) {
    for (r, d) in dst.chunks_exact_mut(dim).take(rows).enumerate() {
        let s = offset + r * row_stride;
        d.copy_from_slice(&src[s..s + dim]);
    }
}

/// Whether `(batch, head, seq, dim)` addressed through `strides` hits every
/// element at most once.
fn non_overlapping(
    strides: &HeadStrides,
    batch: usize,
    heads: usize,
    seq: usize,
    dim: usize,
) -> bool {
    let mut axes = [(strides.seq, seq), (strides.head, heads), (strides.batch, batch)];
    axes.sort_unstable();
    let mut span = dim;
    for (stride, extent) in axes {
        if extent <= 1 {
            continue;
        }
        if stride < span {
            return false;
        }
        span = stride * (extent - 1) + span;
    }
    true
}
