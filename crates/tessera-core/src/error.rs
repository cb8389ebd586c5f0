//! Error type shared by all tessera crates.

/// Errors surfaced by public entry points.
///
/// Degenerate (zero-sized) problems and tier inapplicability are never
/// errors: the former are no-ops and the latter fall back to a lower tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TesseraError {
    #[error("buffer '{name}' too small: need {needed} elements, got {got}")]
    BufferTooSmall {
        name: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("num_heads ({num_heads}) is not a multiple of num_kv_heads ({num_kv_heads})")]
    HeadMismatch {
        num_heads: usize,
        num_kv_heads: usize,
    },

    #[error("causal attention needs kv_len >= seq_len (seq_len={seq_len}, kv_len={kv_len})")]
    CausalPrefix { seq_len: usize, kv_len: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}
