//! Kernel resolution.
//!
//! `resolve_kernels` turns detected capabilities into an immutable
//! `KernelSet`: one handle per operation, starting from the portable
//! reference and overwritten by each better tier the hardware supports.
//! Callers build it once and pass it by reference; nothing here is global.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;
use tessera_core::AttentionProblem;

use crate::config::KernelConfig;
use crate::simd::Capabilities;
use crate::{norm, vecmath};

/// Tile edge of the outer-product attention kernel for `f32`
/// (one 256-bit register row).
pub const TILE: usize = 8;

/// Narrowest head the generic tier accepts; below this the scalar tier wins.
pub const GENERIC_MIN_HEAD_DIM: usize = 4;

/// Widest head the tiled tier accepts.
pub const TILED_MAX_HEAD_DIM: usize = 256;

/// Unwinding through `#[target_feature]` frames is not trusted on
/// Windows on ARM, so the tile kernels stay off there.
pub const TILED_PLATFORM_SUPPORTED: bool =
    !cfg!(all(target_os = "windows", target_arch = "aarch64"));

pub type DotFn = fn(&[f32], &[f32]) -> f32;
pub type AxpyFn = fn(f32, &[f32], &mut [f32]);
pub type ScaleFn = fn(f32, &mut [f32]);
pub type SoftmaxFn = fn(&mut [f32]);
pub type LayerNormFn = fn(&[f32], &[f32], &[f32], f32, &mut [f32]);

/// Implementations of single-head attention, least to most specialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SdpaTier {
    /// `f64` accumulation, any shape.
    Scalar,
    /// Materialised score matrix, vectorized inner loops.
    Generic,
    /// Outer-product tiles with online softmax, fed through padding.
    Tiled,
}

impl SdpaTier {
    pub fn name(&self) -> &'static str {
        match self {
            SdpaTier::Scalar => "scalar",
            SdpaTier::Generic => "generic",
            SdpaTier::Tiled => "tiled",
        }
    }

    /// Whether this tier may run `problem`. Hardware availability is
    /// decided separately, when the tier is put into a `KernelSet`.
    pub fn applicable(&self, problem: &AttentionProblem) -> bool {
        match self {
            SdpaTier::Scalar => true,
            SdpaTier::Generic => problem.head_dim >= GENERIC_MIN_HEAD_DIM,
            SdpaTier::Tiled => {
                problem.head_dim <= TILED_MAX_HEAD_DIM && problem.score_elems() >= TILE * TILE
            }
        }
    }
}

impl fmt::Display for SdpaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register-tile micro-kernel family used by the tiled tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TileBackend {
    Portable,
    Avx2Fma,
    Neon,
}

/// The resolved implementation of every dispatched operation.
#[derive(Clone)]
pub struct KernelSet {
    caps: Capabilities,
    sdpa: SmallVec<[SdpaTier; 3]>,
    causal_sdpa: SmallVec<[SdpaTier; 3]>,
    tile_backend: TileBackend,
    vector_tier: &'static str,
    pub dot: DotFn,
    pub axpy: AxpyFn,
    pub scale: ScaleFn,
    pub softmax: SoftmaxFn,
    pub layer_norm: LayerNormFn,
}

impl KernelSet {
    /// Portable reference kernels; what every handle starts out as.
    pub fn reference() -> Self {
        Self {
            caps: Capabilities::none(),
            sdpa: SmallVec::from_slice(&[SdpaTier::Scalar]),
            causal_sdpa: SmallVec::from_slice(&[SdpaTier::Scalar]),
            tile_backend: TileBackend::Portable,
            vector_tier: "portable",
            dot: vecmath::dot_portable,
            axpy: vecmath::axpy_portable,
            scale: vecmath::scale_portable,
            softmax: norm::softmax_scalar,
            layer_norm: norm::layer_norm_scalar,
        }
    }

    /// Replace the attention preference list, most preferred first.
    ///
    /// `Scalar` is appended if missing so selection always succeeds.
    pub fn with_sdpa_preference(mut self, tiers: &[SdpaTier]) -> Self {
        let mut list: SmallVec<[SdpaTier; 3]> = SmallVec::from_slice(tiers);
        if !list.contains(&SdpaTier::Scalar) {
            list.push(SdpaTier::Scalar);
        }
        self.sdpa = list.clone();
        self.causal_sdpa = list;
        self
    }

    /// First tier in preference order whose predicate accepts `problem`.
    pub fn select_sdpa(&self, problem: &AttentionProblem) -> SdpaTier {
        self.preference(problem.causal)
            .iter()
            .copied()
            .find(|tier| tier.applicable(problem))
            .unwrap_or(SdpaTier::Scalar)
    }

    pub fn preference(&self, causal: bool) -> &[SdpaTier] {
        if causal {
            &self.causal_sdpa
        } else {
            &self.sdpa
        }
    }

    pub fn tile_backend(&self) -> TileBackend {
        self.tile_backend
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Names of the non-causal SDPA tiers, most preferred first.
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.sdpa.iter().map(|t| t.name()).collect()
    }

    pub fn describe(&self) -> String {
        let tiers = self.tier_names();
        format!(
            "simd={} vector={} sdpa=[{}] tile={:?}",
            self.caps.best_tier(),
            self.vector_tier,
            tiers.join(" > "),
            self.tile_backend
        )
    }
}

impl fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSet")
            .field("caps", &self.caps)
            .field("sdpa", &self.sdpa.as_slice())
            .field("causal_sdpa", &self.causal_sdpa.as_slice())
            .field("tile_backend", &self.tile_backend)
            .field("vector_tier", &self.vector_tier)
            .finish()
    }
}

/// Build the kernel set for `caps` under `config`.
///
/// `caps` is clamped to [`Capabilities::detect`], so flags the running CPU
/// lacks are ignored and only portable kernels replace them.
pub fn resolve_kernels(caps: &Capabilities, config: &KernelConfig) -> KernelSet {
    let caps = caps.effective(config);
    let mut set = KernelSet::reference();
    set.caps = caps;

    // Generic attention and lane-split reductions need no special hardware.
    set.sdpa.insert(0, SdpaTier::Generic);
    set.causal_sdpa.insert(0, SdpaTier::Generic);
    set.softmax = norm::softmax_vectorized;
    set.layer_norm = norm::layer_norm_vectorized;

    #[cfg(target_arch = "x86_64")]
    {
        if caps.avx2_fma() {
            set.dot = vecmath::dot_avx2;
            set.axpy = vecmath::axpy_avx2;
            set.scale = vecmath::scale_avx2;
            set.vector_tier = "avx2+fma";
            set.tile_backend = TileBackend::Avx2Fma;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if caps.neon {
            set.dot = vecmath::dot_neon;
            set.axpy = vecmath::axpy_neon;
            set.scale = vecmath::scale_neon;
            set.vector_tier = "neon";
            set.tile_backend = TileBackend::Neon;
        }
    }

    if caps.has_tile_units() && config.allow_tiled && TILED_PLATFORM_SUPPORTED {
        set.sdpa.insert(0, SdpaTier::Tiled);
        set.causal_sdpa.insert(0, SdpaTier::Tiled);
    } else if caps.has_tile_units() {
        tracing::debug!("tiled attention disabled by config or platform gate");
    }

    tracing::info!("resolved kernels: {}", set.describe());
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(seq: usize, kv: usize, dim: usize) -> AttentionProblem {
        AttentionProblem::new(seq, kv, dim, 1.0 / (dim as f32).sqrt(), false)
    }

    #[test]
    fn test_reference_is_scalar_only() {
        let set = KernelSet::reference();
        assert_eq!(set.preference(false), &[SdpaTier::Scalar]);
        assert_eq!(set.select_sdpa(&problem(64, 64, 64)), SdpaTier::Scalar);
    }

    #[test]
    fn test_force_scalar_drops_hardware_tiers() {
        let caps = Capabilities { avx2: true, fma: true, ..Capabilities::none() };
        let config = KernelConfig { force_scalar: true, ..KernelConfig::default() };
        let set = resolve_kernels(&caps, &config);
        assert_eq!(set.preference(false), &[SdpaTier::Generic, SdpaTier::Scalar]);
        assert_eq!(set.tile_backend(), TileBackend::Portable);
        assert!(!set.capabilities().has_simd());
    }

    #[test]
    fn test_forged_capabilities_are_clamped_to_detected() {
        let forged = Capabilities { avx2: true, avx512f: true, fma: true, neon: true };
        let set = resolve_kernels(&forged, &KernelConfig::default());
        let detected = Capabilities::detect();
        assert_eq!(set.capabilities(), detected);

        let expected_backend = if cfg!(target_arch = "x86_64") && detected.avx2_fma() {
            TileBackend::Avx2Fma
        } else if cfg!(target_arch = "aarch64") && detected.neon {
            TileBackend::Neon
        } else {
            TileBackend::Portable
        };
        assert_eq!(set.tile_backend(), expected_backend);
        if !detected.has_tile_units() {
            assert!(!set.preference(false).contains(&SdpaTier::Tiled));
        }
    }

    #[test]
    fn test_allow_tiled_false() {
        let config = KernelConfig { force_scalar: false, allow_tiled: false };
        let set = resolve_kernels(Capabilities::detect(), &config);
        assert!(!set.preference(true).contains(&SdpaTier::Tiled));
    }

    #[test]
    fn test_tile_hardware_prefers_tiled() {
        let set = resolve_kernels(Capabilities::detect(), &KernelConfig::default());
        let expect_tiled = Capabilities::detect().has_tile_units() && TILED_PLATFORM_SUPPORTED;
        assert_eq!(set.preference(false).first() == Some(&SdpaTier::Tiled), expect_tiled);
        assert_eq!(set.preference(false).last(), Some(&SdpaTier::Scalar));
    }

    #[test]
    fn test_applicability_falls_back() {
        let set = KernelSet::reference()
            .with_sdpa_preference(&[SdpaTier::Tiled, SdpaTier::Generic]);
        assert_eq!(set.preference(false), &[SdpaTier::Tiled, SdpaTier::Generic, SdpaTier::Scalar]);

        assert_eq!(set.select_sdpa(&problem(16, 16, 64)), SdpaTier::Tiled);
        // Too few score elements for a tile.
        assert_eq!(set.select_sdpa(&problem(2, 3, 64)), SdpaTier::Generic);
        // Head too wide for the tile accumulators.
        assert_eq!(set.select_sdpa(&problem(16, 16, 512)), SdpaTier::Generic);
        // Head too narrow for vector lanes.
        assert_eq!(set.select_sdpa(&problem(2, 3, 2)), SdpaTier::Scalar);
    }

    #[test]
    fn test_describe_names_tiers() {
        let set = KernelSet::reference().with_sdpa_preference(&[SdpaTier::Generic]);
        let text = set.describe();
        assert!(text.contains("generic > scalar"), "{text}");
        assert_eq!(SdpaTier::Tiled.to_string(), "tiled");
    }
}
