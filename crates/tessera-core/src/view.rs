//! Borrowed row-major views over flat `f32` buffers.

use crate::{ensure_len, Result, Shape, TesseraError};

/// Read-only view: a buffer plus the shape it is interpreted with.
///
/// The buffer may be longer than the shape needs; only the prefix is read.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    data: &'a [f32],
    shape: Shape,
}

impl<'a> TensorView<'a> {
    pub fn new(data: &'a [f32], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        ensure_len("view", data.len(), shape.numel())?;
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The logical elements (`shape.numel()` of them).
    pub fn as_slice(&self) -> &'a [f32] {
        &self.data[..self.shape.numel()]
    }

    /// Interpret as a matrix `[rows, cols]`, folding leading axes into rows.
    pub fn matrix_dims(&self) -> Result<(usize, usize)> {
        matrix_dims(&self.shape)
    }
}

/// Mutable counterpart of [`TensorView`].
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    data: &'a mut [f32],
    shape: Shape,
}

impl<'a> TensorViewMut<'a> {
    pub fn new(data: &'a mut [f32], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        ensure_len("view", data.len(), shape.numel())?;
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.shape.numel()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        let n = self.shape.numel();
        &mut self.data[..n]
    }

    pub fn matrix_dims(&self) -> Result<(usize, usize)> {
        matrix_dims(&self.shape)
    }
}

fn matrix_dims(shape: &Shape) -> Result<(usize, usize)> {
    match shape.dims() {
        [] => Err(TesseraError::InvalidShape("rank-0 view has no rows".into())),
        [cols] => Ok((1, *cols)),
        [lead @ .., cols] => Ok((lead.iter().product(), *cols)),
    }
}
