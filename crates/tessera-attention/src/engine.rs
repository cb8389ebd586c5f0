//! `AttentionEngine`: resolved kernels, a worker pool and scratch arenas
//! behind one handle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_core::{
    AttentionProblem, HeadStrides, MaskView, MultiHeadDesc, Result, TensorView, TensorViewMut,
    TesseraError,
};
use tessera_kernels::dense::DEFAULT_SPLIT_THRESHOLD;
use tessera_kernels::{
    resolve_kernels, Capabilities, KernelConfig, KernelSet, PoolConfig, QkvBias, QkvProjection,
    QkvStrategy, ScratchPool, SdpaTier, WorkerPool,
};

use crate::multi_head::{multi_head_sdpa, AttentionContext, Dispatch};
use crate::sdpa::sdpa;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kernels: KernelConfig,
    pub pool: PoolConfig,
    /// Scratch arenas created up front; the pool grows on demand.
    pub scratch_slots: usize,
    /// Work budget below which asymmetric QKV projections are split.
    pub qkv_split_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kernels: KernelConfig::default(),
            pool: PoolConfig::default(),
            scratch_slots: 8,
            qkv_split_threshold: DEFAULT_SPLIT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Defaults with the `TESSERA_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self { kernels: KernelConfig::from_env(), pool: PoolConfig::from_env(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.scratch_slots > 4096 {
            return Err(TesseraError::InvalidConfig(format!(
                "scratch_slots must be at most 4096, got {}",
                self.scratch_slots
            )));
        }
        Ok(())
    }
}

pub struct AttentionEngine {
    kernels: KernelSet,
    pool: Arc<WorkerPool>,
    scratch: ScratchPool,
    qkv_split_threshold: usize,
}

impl AttentionEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let kernels = resolve_kernels(Capabilities::detect(), &config.kernels);
        let pool = Arc::new(WorkerPool::new(&config.pool)?);
        Ok(Self::with_parts(kernels, pool, config.scratch_slots, config.qkv_split_threshold))
    }

    pub fn from_env() -> Result<Self> {
        Self::new(&EngineConfig::from_env())
    }

    /// Assemble an engine from already-built parts, e.g. to share one pool.
    pub fn with_parts(
        kernels: KernelSet,
        pool: Arc<WorkerPool>,
        scratch_slots: usize,
        qkv_split_threshold: usize,
    ) -> Self {
        Self { kernels, pool, scratch: ScratchPool::new(scratch_slots), qkv_split_threshold }
    }

    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn context(&self) -> AttentionContext<'_> {
        AttentionContext { kernels: &self.kernels, pool: Some(&self.pool), scratch: &self.scratch }
    }

    /// Single-head attention over shaped views.
    ///
    /// `q`/`out` must be `[seq_len, head_dim]`, `k`/`v` `[kv_len, head_dim]`
    /// and `mask` `[seq_len, kv_len]`; leading axes fold into rows.
    pub fn attend(
        &self,
        q: TensorView<'_>,
        k: TensorView<'_>,
        v: TensorView<'_>,
        mask: Option<TensorView<'_>>,
        mut out: TensorViewMut<'_>,
        scale: f32,
        causal: bool,
    ) -> Result<SdpaTier> {
        let (seq, dim) = q.matrix_dims()?;
        let (kv, k_dim) = k.matrix_dims()?;
        expect_dims("k", (kv, k_dim), (kv, dim))?;
        expect_dims("v", v.matrix_dims()?, (kv, dim))?;
        expect_dims("out", out.matrix_dims()?, (seq, dim))?;
        if let Some(m) = &mask {
            expect_dims("mask", m.matrix_dims()?, (seq, kv))?;
        }

        let problem = AttentionProblem::new(seq, kv, dim, scale, causal);
        let mut scratch = self.scratch.checkout();
        sdpa(
            &self.kernels,
            &problem,
            q.as_slice(),
            k.as_slice(),
            v.as_slice(),
            mask.map(|m| m.as_slice()),
            out.as_mut_slice(),
            &mut scratch,
        )
    }

    /// Multi-head / grouped-query attention; see [`multi_head_sdpa`].
    #[allow(clippy::too_many_arguments)]
    pub fn multi_head(
        &self,
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
        let ctx = self.context();
        multi_head_sdpa(&ctx, desc, q, q_strides, k, v, kv_strides, mask, out, scale, causal)
    }

    /// Fused QKV projection with this engine's split threshold.
    #[allow(clippy::too_many_arguments)]
    pub fn project_qkv(
        &self,
        projection: QkvProjection,
        x: &[f32],
        w: &[f32],
        bias: QkvBias<'_>,
        q: &mut [f32],
        k: &mut [f32],
        v: &mut [f32],
        rows: usize,
    ) -> Result<QkvStrategy> {
        let projection = projection.with_split_threshold(self.qkv_split_threshold);
        let mut scratch = self.scratch.checkout();
        projection.project(&self.kernels, x, w, bias, q, k, v, rows, &mut scratch)
    }

    /// Stop the workers; later calls run on the calling thread.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl std::fmt::Debug for AttentionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionEngine")
            .field("kernels", &self.kernels)
            .field("pool", &self.pool)
            .field("qkv_split_threshold", &self.qkv_split_threshold)
            .finish()
    }
}

fn expect_dims(name: &str, got: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if got != expected {
        return Err(TesseraError::InvalidShape(format!(
            "{name}: expected [{}, {}], got [{}, {}]",
            expected.0, expected.1, got.0, got.1
        )));
    }
    Ok(())
}
