//! Single-head entry points.

use tessera_core::{ensure_len, AttentionProblem, Result};
use tessera_kernels::{KernelSet, Scratch, SdpaTier};

use crate::generic::sdpa_generic;
use crate::pad::sdpa_padded;
use crate::scalar::sdpa_scalar;

/// `out = softmax(Q·Kᵀ·scale + mask)·V` for one head, on the tier the
/// kernel set prefers for `problem`.
///
/// `q`, `out` are `[seq_len, head_dim]`, `k`, `v` are `[kv_len, head_dim]`,
/// `mask` is `[seq_len, kv_len]`, all row-major. Problems with an empty
/// axis return immediately without touching any buffer.
#[allow(clippy::too_many_arguments)]
pub fn sdpa(
    kernels: &KernelSet,
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
    scratch: &mut Scratch,
) -> Result<SdpaTier> {
    let tier = kernels.select_sdpa(problem);
    run_tier(tier, kernels, problem, q, k, v, mask, out, scratch)
}

/// Like [`sdpa`] but with the tier chosen by the caller.
///
/// A tier whose predicate rejects `problem` falls back to the next
/// applicable one in `Tiled > Generic > Scalar` order; the tier actually
/// run is returned. `Tiled` uses the kernel set's tile backend, which is the
/// portable micro-kernel for [`KernelSet::reference`].
#[allow(clippy::too_many_arguments)]
pub fn run_tier(
    tier: SdpaTier,
    kernels: &KernelSet,
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &mut [f32],
    scratch: &mut Scratch,
) -> Result<SdpaTier> {
    if problem.is_empty() {
        return Ok(tier);
    }
    problem.validate()?;
    check_buffers(problem, q, k, v, mask, out)?;

    let tier = applicable_fallback(tier, problem);
    tracing::trace!(
        %tier,
        seq = problem.seq_len,
        kv = problem.kv_len,
        dim = problem.head_dim,
        causal = problem.causal,
        "sdpa dispatch"
    );
    match tier {
        SdpaTier::Scalar => sdpa_scalar(problem, q, k, v, mask, out),
        SdpaTier::Generic => sdpa_generic(kernels, problem, q, k, v, mask, out, scratch),
        SdpaTier::Tiled => sdpa_padded(kernels, problem, q, k, v, mask, out, scratch),
    }
    Ok(tier)
}

fn applicable_fallback(tier: SdpaTier, problem: &AttentionProblem) -> SdpaTier {
    let chain: &[SdpaTier] = match tier {
        SdpaTier::Tiled => &[SdpaTier::Tiled, SdpaTier::Generic],
        SdpaTier::Generic => &[SdpaTier::Generic],
        SdpaTier::Scalar => &[],
    };
    let chosen =
        chain.iter().copied().find(|t| t.applicable(problem)).unwrap_or(SdpaTier::Scalar);
    if chosen != tier {
        tracing::debug!(
            requested = %tier,
            used = %chosen,
            "sdpa tier not applicable, falling back"
        );
    }
    chosen
}

fn check_buffers(
    problem: &AttentionProblem,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: Option<&[f32]>,
    out: &[f32],
) -> Result<()> {
    ensure_len("q", q.len(), problem.q_len())?;
    ensure_len("k", k.len(), problem.kv_elems())?;
    ensure_len("v", v.len(), problem.kv_elems())?;
    ensure_len("out", out.len(), problem.q_len())?;
    if let Some(m) = mask {
        ensure_len("mask", m.len(), problem.mask_len())?;
    }
    Ok(())
}
