//! Sequence-mixing contract and the fast-weight window mixer.
//!
//! The decoder stack composes one sequence mixer per layer behind the
//! [`SequenceMixer`] trait. A mixer blends information across positions and
//! threads its per-layer decode state ([`LayerState`]) through every call;
//! everything persistent lives in that state, never inside the mixer, so a
//! forward segment can be replayed with identical inputs and produce
//! identical outputs.

pub mod fast_weight;
pub mod state;
pub mod window;

use candle_core::{Result, Tensor};

pub use fast_weight::{FastWeights, LowRankFastWeight, LrParameterization};
pub use state::{LayerState, StateCache};
pub use window::FastWeightMixer;

/// Geometry and update policy for one mixer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Number of windowed-attention heads.
    pub num_attn_heads: usize,
    /// Number of fast-weight heads.
    pub num_fw_heads: usize,
    /// Sliding attention window, in tokens.
    pub window_size: usize,
    /// Fast-weight update chunk, in tokens.
    pub chunk_size: usize,
    /// Fast-weight intermediate width as a multiple of the head dim.
    pub inter_multi: f64,
    /// How the learnable update-rate parameters map to rates.
    pub lr_parameterization: LrParameterization,
    /// Whether fast-weight updates carry a momentum accumulator.
    pub use_momentum: bool,
    /// Low-rank factorization rank for the initial fast weights (0 = full).
    pub low_rank: usize,
    /// Whether the qkv projection carries a bias.
    pub qkv_bias: bool,
}

impl MixerConfig {
    /// Validates the head/window geometry.
    pub fn validate(&self) -> Result<()> {
        use candle_core::bail;
        if self.hidden_size == 0 {
            bail!("mixer hidden_size must be greater than zero");
        }
        if self.num_attn_heads == 0 || self.hidden_size % self.num_attn_heads != 0 {
            bail!(
                "hidden_size ({}) must be divisible by num_attn_heads ({})",
                self.hidden_size,
                self.num_attn_heads
            );
        }
        if self.num_fw_heads == 0 || self.hidden_size % self.num_fw_heads != 0 {
            bail!(
                "hidden_size ({}) must be divisible by num_fw_heads ({})",
                self.hidden_size,
                self.num_fw_heads
            );
        }
        if self.window_size == 0 {
            bail!("window_size must be greater than zero");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.inter_multi <= 0.0 {
            bail!("inter_multi must be positive");
        }
        Ok(())
    }

    /// Per-head dimension of the attention branch.
    pub fn attn_head_dim(&self) -> usize {
        self.hidden_size / self.num_attn_heads
    }

    /// Per-head dimension of the fast-weight branch.
    pub fn fw_head_dim(&self) -> usize {
        self.hidden_size / self.num_fw_heads
    }

    /// Intermediate width of the fast-weight function.
    pub fn fw_inter_dim(&self) -> usize {
        ((self.fw_head_dim() as f64 * self.inter_multi).round() as usize).max(1)
    }
}

/// Result of one mixer call.
pub struct MixerOutput {
    /// Mixed hidden states, `(batch, seq, hidden)` in the caller's storage dtype.
    pub hidden: Tensor,
    /// Attention probabilities when requested, `(batch, heads, q, k)`.
    pub attentions: Option<Tensor>,
    /// Updated decode state; `None` when caching was not requested.
    pub state: Option<LayerState>,
}

/// Per-layer stateful sequence-mixing mechanism.
///
/// Implementations must be pure given their inputs: invoking `forward` twice
/// with identical arguments yields identical outputs, and nothing persists
/// inside the mixer beyond the returned state. An absent or empty state
/// means start-of-session.
pub trait SequenceMixer: Send + Sync {
    /// Static geometry for the layer.
    fn config(&self) -> &MixerConfig;

    /// Mixes one span of hidden states.
    fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        state: Option<LayerState>,
        use_cache: bool,
        want_attentions: bool,
    ) -> Result<MixerOutput>;
}
