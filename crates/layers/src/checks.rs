//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the expected rank.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.dims().len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    let dims = tensor.dims();
    match dims {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name} expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|candidate| candidate == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks that both tensors share a dtype.
pub fn expect_same_dtype(
    left_name: &str,
    left: &Tensor,
    right_name: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_name} dtype {:?} does not match {right_name} dtype {:?}",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Ensures the tensor is laid out contiguously.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{name} must be contiguous")))
    }
}
