//! Position-wise gated feed-forward blocks.
//!
//! The MLP operates on hidden states shaped `(batch, seq, hidden)` and
//! returns the same layout: `down(silu(gate(x)) * up(x))`. Gate and up
//! projections expand to the intermediate size, the down projection
//! contracts back to the model hidden size. The activation and the gating
//! product run in compute precision; the output is cast back to storage.
//! No cross-token state: the block is deterministic given its weights.

use candle_core::{Device, DType, Result, Tensor};
use candle_nn::ops;

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by gated feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedMlpConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
}

impl GatedMlpConfig {
    /// Creates a configuration with an explicit intermediate size.
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }

    /// Derives the intermediate size from an expansion ratio, rounded up to
    /// a multiple of 64 so the projection shapes stay kernel-friendly.
    pub fn with_hidden_ratio(hidden_size: usize, ratio: f64) -> Self {
        let raw = (hidden_size as f64 * ratio).ceil() as usize;
        let intermediate_size = raw.div_ceil(64) * 64;
        Self::new(hidden_size, intermediate_size)
    }
}

/// SwiGLU feed-forward block used inside every decoder layer.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    config: GatedMlpConfig,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GatedMlp {
    /// Builds the three projections using the supplied initialisers.
    ///
    /// The down projection takes its own initialiser so callers can apply
    /// residual-path rescaling to it alone.
    pub fn with_init(
        config: GatedMlpConfig,
        init: &LinearInit,
        down_init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size);
        Ok(Self {
            gate_proj: Linear::with_init(expand.clone(), init, device, dtype)?,
            up_proj: Linear::with_init(expand, init, device, dtype)?,
            down_proj: Linear::with_init(contract, down_init, device, dtype)?,
            config,
        })
    }

    /// Configuration metadata used during block assembly.
    pub fn config(&self) -> &GatedMlpConfig {
        &self.config
    }

    /// Returns the down projection for initialisation-policy adjustments.
    pub fn down_proj(&self) -> &Linear {
        &self.down_proj
    }

    /// Performs the forward pass through the MLP.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = self.gate_proj.forward(hidden, policy)?;
        let up = self.up_proj.forward(hidden, policy)?;

        let gate = policy.cast_for_matmul(&gate)?;
        let up = policy.cast_for_matmul(&up)?;
        let gated = ops::silu(&gate)?.mul(&up)?;
        let gated = policy.cast_to_storage(&gated)?;

        self.down_proj.forward(&gated, policy)
    }
}
