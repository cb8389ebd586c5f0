//! Runtime SIMD capability detection.
//!
//! Detects AVX2, FMA, AVX-512 and ARM NEON once per process.

use std::sync::OnceLock;

use serde::Serialize;

use crate::config::KernelConfig;

/// SIMD capabilities of the running CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
    pub neon: bool,
}

static DETECTED: OnceLock<Capabilities> = OnceLock::new();

impl Capabilities {
    /// Detect capabilities for the current CPU. Cached after the first call.
    pub fn detect() -> &'static Capabilities {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                Capabilities {
                    avx2: is_x86_feature_detected!("avx2"),
                    avx512f: is_x86_feature_detected!("avx512f"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                Capabilities {
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: std::arch::is_aarch64_feature_detected!("neon"),
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                Capabilities::none()
            }
        })
    }

    /// No hardware tiers at all.
    pub const fn none() -> Capabilities {
        Capabilities { avx2: false, avx512f: false, fma: false, neon: false }
    }

    /// Features present in both `self` and `other`.
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            avx2: self.avx2 && other.avx2,
            avx512f: self.avx512f && other.avx512f,
            fma: self.fma && other.fma,
            neon: self.neon && other.neon,
        }
    }

    /// `self` with the configured switches applied, clamped to what the
    /// running CPU was detected to support. Flags can only remove features.
    pub fn effective(&self, config: &KernelConfig) -> Capabilities {
        if config.force_scalar {
            Capabilities::none()
        } else {
            self.intersect(Capabilities::detect())
        }
    }

    /// 256-bit FMA lanes usable for the vector primitives and tile kernels.
    pub fn avx2_fma(&self) -> bool {
        self.avx2 && self.fma
    }

    /// Hardware able to run the outer-product tile kernels.
    pub fn has_tile_units(&self) -> bool {
        self.avx2_fma() || self.neon
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx512f {
            "AVX-512"
        } else if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }

    pub fn has_simd(&self) -> bool {
        self.avx2 || self.avx512f || self.neon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_cached() {
        let cap = Capabilities::detect();
        let cap2 = Capabilities::detect();
        assert!(std::ptr::eq(cap, cap2));
    }

    #[test]
    fn test_best_tier() {
        let scalar = Capabilities::none();
        assert_eq!(scalar.best_tier(), "scalar");
        assert!(!scalar.has_simd());
        assert!(!scalar.has_tile_units());

        let avx2 = Capabilities { avx2: true, fma: true, ..Capabilities::none() };
        assert_eq!(avx2.best_tier(), "AVX2");
        assert!(avx2.has_tile_units());

        // AVX2 without FMA cannot run the fused tile kernels.
        let no_fma = Capabilities { avx2: true, ..Capabilities::none() };
        assert!(!no_fma.has_tile_units());
    }

    #[test]
    fn test_force_scalar_masks_everything() {
        let cap = Capabilities { avx2: true, avx512f: true, fma: true, neon: false };
        let config = KernelConfig { force_scalar: true, ..KernelConfig::default() };
        assert_eq!(cap.effective(&config), Capabilities::none());
        assert_eq!(cap.effective(&KernelConfig::default()), cap.intersect(Capabilities::detect()));
    }

    #[test]
    fn test_effective_never_adds_features() {
        let forged = Capabilities { avx2: true, avx512f: true, fma: true, neon: true };
        let detected = *Capabilities::detect();
        let eff = forged.effective(&KernelConfig::default());
        assert_eq!(eff, detected);
        assert_eq!(Capabilities::none().effective(&KernelConfig::default()), Capabilities::none());
        assert_eq!(detected.effective(&KernelConfig::default()), detected);
    }
}
