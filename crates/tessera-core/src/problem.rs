//! Attention problem descriptors.

use serde::{Deserialize, Serialize};

use crate::{ensure_len, Result, TesseraError};

/// One attention head: `softmax(Q·Kᵀ·scale + mask)·V`.
///
/// `Q` is `[seq_len, head_dim]`, `K`/`V` are `[kv_len, head_dim]`.
/// The scale is always supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionProblem {
    pub seq_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
    pub scale: f32,
    pub causal: bool,
}

impl AttentionProblem {
    pub fn new(seq_len: usize, kv_len: usize, head_dim: usize, scale: f32, causal: bool) -> Self {
        Self { seq_len, kv_len, head_dim, scale, causal }
    }

    /// Any axis of extent 0; such problems are no-ops.
    pub fn is_empty(&self) -> bool {
        self.seq_len == 0 || self.kv_len == 0 || self.head_dim == 0
    }

    /// Query row `i` may see key `j` iff `j <= i + causal_offset()`.
    ///
    /// Only meaningful for causal problems, where `kv_len >= seq_len`.
    pub fn causal_offset(&self) -> usize {
        self.kv_len.saturating_sub(self.seq_len)
    }

    /// Last key index visible from query row `i` (inclusive).
    pub fn last_visible(&self, i: usize) -> usize {
        if self.causal {
            (i + self.causal_offset()).min(self.kv_len - 1)
        } else {
            self.kv_len - 1
        }
    }

    pub fn q_len(&self) -> usize {
        self.seq_len * self.head_dim
    }

    pub fn kv_elems(&self) -> usize {
        self.kv_len * self.head_dim
    }

    pub fn mask_len(&self) -> usize {
        self.seq_len * self.kv_len
    }

    /// Score elements the problem touches; used as a work estimate.
    pub fn score_elems(&self) -> usize {
        self.seq_len * self.kv_len
    }

    pub fn validate(&self) -> Result<()> {
        if self.causal && self.kv_len < self.seq_len {
            return Err(TesseraError::CausalPrefix {
                seq_len: self.seq_len,
                kv_len: self.kv_len,
            });
        }
        if !self.scale.is_finite() {
            return Err(TesseraError::InvalidShape(format!(
                "attention scale must be finite, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Batch × head geometry for multi-head and grouped-query attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiHeadDesc {
    pub batch: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub seq_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

impl MultiHeadDesc {
    pub fn validate(&self) -> Result<()> {
        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(TesseraError::HeadMismatch {
                num_heads: self.num_heads,
                num_kv_heads: self.num_kv_heads,
            });
        }
        Ok(())
    }

    /// Query heads sharing one key/value head.
    pub fn heads_per_kv_head(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Key/value head serving query head `head`.
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.heads_per_kv_head()
    }

    pub fn is_empty(&self) -> bool {
        self.batch == 0
            || self.num_heads == 0
            || self.seq_len == 0
            || self.kv_len == 0
            || self.head_dim == 0
    }

    /// Number of independent `(batch, head)` pairs.
    pub fn pairs(&self) -> usize {
        self.batch * self.num_heads
    }

    pub fn problem(&self, scale: f32, causal: bool) -> AttentionProblem {
        AttentionProblem::new(self.seq_len, self.kv_len, self.head_dim, scale, causal)
    }

    /// Contiguous heads-major (`[batch, heads, seq, dim]`) strides for Q.
    pub fn q_bhsd(&self) -> HeadStrides {
        HeadStrides::bhsd(self.num_heads, self.seq_len, self.head_dim)
    }

    /// Contiguous heads-major strides for K and V.
    pub fn kv_bhsd(&self) -> HeadStrides {
        HeadStrides::bhsd(self.num_kv_heads, self.kv_len, self.head_dim)
    }
}

/// Element strides of a `(batch, head, seq)` indexed tensor whose
/// innermost `head_dim` axis is always unit-stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadStrides {
    pub batch: usize,
    pub head: usize,
    pub seq: usize,
}

impl HeadStrides {
    pub fn new(batch: usize, head: usize, seq: usize) -> Self {
        Self { batch, head, seq }
    }

    /// `[batch, heads, seq, dim]` contiguous.
    pub fn bhsd(heads: usize, seq: usize, dim: usize) -> Self {
        Self { batch: heads * seq * dim, head: seq * dim, seq: dim }
    }

    /// `[batch, seq, heads, dim]` contiguous.
    pub fn bshd(heads: usize, seq: usize, dim: usize) -> Self {
        Self { batch: seq * heads * dim, head: dim, seq: heads * dim }
    }

    /// Element offset of row 0 of `(b, h)`.
    pub fn offset(&self, b: usize, h: usize) -> usize {
        b * self.batch + h * self.head
    }

    /// Rows of one head are packed back to back, so a head is a plain slice.
    pub fn rows_contiguous(&self, head_dim: usize) -> bool {
        self.seq == head_dim
    }

    /// Minimum buffer length addressed by these strides.
    pub fn required_len(&self, batch: usize, heads: usize, seq: usize, dim: usize) -> usize {
        if batch == 0 || heads == 0 || seq == 0 || dim == 0 {
            return 0;
        }
        (batch - 1) * self.batch + (heads - 1) * self.head + (seq - 1) * self.seq + dim
    }
}

/// Additive `[seq_len, kv_len]` mask blocks addressed per `(batch, head)`.
///
/// A stride of 0 broadcasts the block across that axis.
#[derive(Debug, Clone, Copy)]
pub struct MaskView<'a> {
    pub data: &'a [f32],
    pub batch_stride: usize,
    pub head_stride: usize,
}

impl<'a> MaskView<'a> {
    /// One mask shared by every batch entry and head.
    pub fn shared(data: &'a [f32]) -> Self {
        Self { data, batch_stride: 0, head_stride: 0 }
    }

    pub fn new(data: &'a [f32], batch_stride: usize, head_stride: usize) -> Self {
        Self { data, batch_stride, head_stride }
    }

    /// The `[seq_len, kv_len]` block for `(b, h)`.
    pub fn block(&self, b: usize, h: usize, seq_len: usize, kv_len: usize) -> &'a [f32] {
        let start = b * self.batch_stride + h * self.head_stride;
        &self.data[start..start + seq_len * kv_len]
    }

    pub fn validate(&self, desc: &MultiHeadDesc) -> Result<()> {
        if desc.is_empty() {
            return Ok(());
        }
        let needed = (desc.batch - 1) * self.batch_stride
            + (desc.num_heads - 1) * self.head_stride
            + desc.seq_len * desc.kv_len;
        ensure_len("mask", self.data.len(), needed)
    }
}
