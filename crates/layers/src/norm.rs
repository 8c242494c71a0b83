//! Root-mean-square normalisation with optional fused residual handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Normalisation happens
//! along the last axis while preserving the original layout; statistics are
//! promoted to [`PrecisionPolicy::reduction`] before the output is cast back.
//!
//! The fused entry point combines the residual addition with the
//! normalisation in one reduction-precision pass and hands back both the
//! normalised tensor and the updated residual, so the caller skips a separate
//! elementwise add and its temporary. Both paths are numerically equivalent
//! within the dtype tolerance.

use candle_core::{DType, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Whether normalisation and residual addition are fused into one pass.
///
/// Fixed at construction time; both variants satisfy the same contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormFusion {
    /// `forward_fused` performs add + normalise in a single pass.
    Fused,
    /// The residual addition is an explicit separate step.
    Separate,
}

impl NormFusion {
    /// Maps the configuration flag onto the fusion variant.
    pub fn from_flag(fused: bool) -> Self {
        if fused {
            NormFusion::Fused
        } else {
            NormFusion::Separate
        }
    }
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to the RMS computation.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration using defaults aligned with decoder blocks.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
        }
    }
}

/// RMS norm with a learnable scale, shared by every block and the stack tail.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    /// Constructs an RMS norm from an existing scale parameter.
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in(
            "norm.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("norm.weight", &weight)?;
        Ok(Self { config, weight })
    }

    /// Builds an RMS norm with the scale initialised to ones.
    pub fn ones(
        config: NormConfig,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        Self::new(weight, config)
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Applies the normalisation to a hidden state tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;
        let compute = policy.cast_for_reduction(hidden)?;
        let normalized = self.normalize(&compute)?;
        policy.cast_to_storage(&normalized)
    }

    /// Fused residual + normalisation step.
    ///
    /// Computes `residual' = hidden + residual` once in reduction precision,
    /// normalises `residual'`, and returns `(normed, residual')` with both
    /// tensors cast back to storage precision.
    pub fn forward_fused(
        &self,
        hidden: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Tensor)> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;
        checks::expect_shape("norm.residual", residual, hidden.dims())?;

        let hidden = policy.cast_for_reduction(hidden)?;
        let residual = policy.cast_for_reduction(residual)?;
        let combined = hidden.add(&residual)?;
        let normalized = self.normalize(&combined)?;
        Ok((
            policy.cast_to_storage(&normalized)?,
            policy.cast_to_storage(&combined)?,
        ))
    }

    fn normalize(&self, compute: &Tensor) -> Result<Tensor> {
        let hidden_size = self.config.hidden_size as f64;
        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;
        let weight = if self.weight.dtype() == normalized.dtype() {
            self.weight.clone()
        } else {
            self.weight.to_dtype(normalized.dtype())?
        };
        normalized.broadcast_mul(&weight)
    }
}
