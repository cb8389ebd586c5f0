//! # tessera-kernels
//!
//! CPU kernel plumbing for tessera.
//!
//! Provides:
//! - One-time SIMD capability probing (AVX2, FMA, AVX-512, NEON)
//! - Explicit kernel resolution into an immutable `KernelSet`
//! - Vectorized dot / axpy / scale primitives, row softmax and layer norm
//! - Dense projection `X·Wᵀ + b` and the fused QKV projection
//! - Per-worker scratch arenas and the persistent `WorkerPool`

pub mod config;
pub mod dense;
pub mod dispatch;
pub mod norm;
pub mod pool;
pub mod scratch;
pub mod simd;
pub mod vecmath;

pub use config::{KernelConfig, PoolConfig};
pub use dense::{linear, QkvBias, QkvProjection, QkvStrategy};
pub use dispatch::{resolve_kernels, KernelSet, SdpaTier, TileBackend, TILE};
pub use pool::WorkerPool;
pub use scratch::{Scratch, ScratchGuard, ScratchPool};
pub use simd::Capabilities;
