//! # tessera-core
//!
//! Shared vocabulary for the tessera kernel crates.
//!
//! Provides:
//! - `Shape` with stack storage for the common ≤4-d case
//! - Borrowed, row-major tensor views over flat `f32` buffers
//! - Attention problem, multi-head descriptor and stride descriptors
//! - The `TesseraError` type used by every public entry point

pub mod error;
pub mod problem;
pub mod shape;
pub mod view;

pub use error::TesseraError;
pub use problem::{AttentionProblem, HeadStrides, MaskView, MultiHeadDesc};
pub use shape::Shape;
pub use view::{TensorView, TensorViewMut};

pub type Result<T> = std::result::Result<T, TesseraError>;

/// Fail with `BufferTooSmall` unless `got >= needed`.
pub fn ensure_len(name: &'static str, got: usize, needed: usize) -> Result<()> {
    if got < needed {
        return Err(TesseraError::BufferTooSmall { name, needed, got });
    }
    Ok(())
}
