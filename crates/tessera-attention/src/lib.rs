//! # tessera-attention
//!
//! Scaled dot-product attention on row-major `f32` slices.
//!
//! Three single-head tiers share one contract:
//! - `scalar`: `f64` accumulation, the numerical reference
//! - `generic`: materialised score matrix through the dispatched vector kernels
//! - `tiled`: 8×8 outer-product tiles with online softmax, fed by the padding adapter
//!
//! `multi_head` fans single-head problems out over `(batch, head)` pairs with
//! grouped-query sharing, and `AttentionEngine` bundles kernels, workers and
//! scratch behind one handle.

pub mod engine;
mod generic;
pub mod mask;
pub mod multi_head;
mod pad;
pub mod scalar;
pub mod sdpa;
mod tiled;

pub use engine::{AttentionEngine, EngineConfig};
pub use multi_head::{multi_head_sdpa, AttentionContext, Dispatch};
pub use scalar::attention_weights;
pub use sdpa::{run_tier, sdpa};

pub use tessera_core::{AttentionProblem, HeadStrides, MaskView, MultiHeadDesc, TesseraError};
pub use tessera_kernels::{KernelSet, SdpaTier};
