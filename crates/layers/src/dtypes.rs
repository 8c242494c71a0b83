//! Precision and dtype policy utilities used throughout the layers crate.
//!
//! Parameters and every tensor crossing a block boundary live in `bf16`;
//! matmuls and activations promote to `f32`, and reductions (norm statistics,
//! loss accumulation) always run in `f32`. This module exposes
//! [`PrecisionPolicy`] so the boundary coercion happens through one function
//! (`cast_to_storage`) at well-defined seams instead of ad hoc casts at call
//! sites.

use candle_core::{DType, Result, Tensor};

/// Epsilon values used for comparisons at different stages of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for tensors stored in module parameters or block boundaries.
    pub storage: f32,
    /// Tolerance for intermediate matmul/activation results.
    pub compute: f32,
    /// Tolerance for statistics computed during reductions.
    pub reduction: f32,
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = DType::F32;
        Self::new(storage, compute, reduction)
    }

    /// The block-boundary policy: bf16 storage, f32 interiors.
    pub fn block_boundary() -> Self {
        Self::from_parameter_dtype(DType::BF16)
    }

    /// Returns the dtype used to store parameters and boundary tensors.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
            reduction: epsilon_for(self.reduction),
        }
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    ///
    /// This is the single boundary-coercion seam: block entry/exit, the
    /// post-block re-coercion in the stack loop, and the final norm all go
    /// through here.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Upcasts a tensor to `f32` for loss computation.
    ///
    /// Cross entropy over a large vocabulary must not run in reduced
    /// precision, whatever the storage dtype is.
    pub fn cast_for_loss(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, DType::F32)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}
