//! Weight-initialization policy for the stack.
//!
//! Linear and embedding weights draw from a zero-mean normal with the
//! configured standard deviation and biases start at zero. When prenorm
//! residual rescaling is enabled, the two output projections feeding the
//! residual path (the mixer's `o` projection and the MLP's `down`
//! projection) are instead sampled Kaiming-uniform and divided by
//! `sqrt(num_residuals_per_layer * depth)`. Mixer-specific parameters
//! (scale/offset vectors, fast-weight matrices, low-rank factors) follow
//! the fixed rules owned by the mixer crate.

use layers::LinearInit;

/// Residual branches per decoder layer (mixer + MLP).
const NUM_RESIDUALS_PER_LAYER: f64 = 2.0;

/// Immutable initialization policy derived from the model configuration.
#[derive(Debug, Clone)]
pub struct InitPolicy {
    std: f64,
    rescale_prenorm_residual: bool,
}

impl InitPolicy {
    /// Builds the policy from the configured standard deviation and flag.
    pub fn new(std: f64, rescale_prenorm_residual: bool) -> Self {
        Self {
            std,
            rescale_prenorm_residual,
        }
    }

    /// Initializer for ordinary projections and embedding tables.
    pub fn projection(&self) -> LinearInit {
        LinearInit::Normal { std: self.std }
    }

    /// Standard deviation used for embedding tables.
    pub fn embedding_std(&self) -> f64 {
        self.std
    }

    /// Initializer for output projections that feed the residual path.
    pub fn residual_output(&self, depth: usize) -> LinearInit {
        if self.rescale_prenorm_residual {
            let scale = 1.0 / (NUM_RESIDUALS_PER_LAYER * depth as f64).sqrt();
            LinearInit::scaled(
                LinearInit::KaimingUniform {
                    negative_slope: 5f64.sqrt(),
                },
                scale,
            )
        } else {
            self.projection()
        }
    }
}
