//! One decoder block: sequence mixer + gated MLP with two norms and two
//! residual connections.
//!
//! Every tensor entering or leaving the block is coerced to the boundary
//! storage dtype; the block itself performs no shape validation beyond what
//! that coercion implies, and it keeps no hidden state between calls — all
//! persistence lives in the decode state passed through to the mixer.

use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    mlp::GatedMlp,
    norm::{NormConfig, NormFusion, RmsNorm},
};
use mixer::{FastWeightMixer, LayerState, SequenceMixer};

use crate::{config::ModelConfig, init::InitPolicy};

/// Result of one block forward pass.
pub struct BlockOutput {
    /// Updated hidden states in the boundary dtype.
    pub hidden: Tensor,
    /// Mixer attention weights when requested and supported.
    pub attentions: Option<Tensor>,
    /// Updated per-layer decode state.
    pub state: Option<LayerState>,
}

/// Decoder block in the pre-norm residual layout.
pub struct Block {
    norm_mixer: RmsNorm,
    mixer: Arc<dyn SequenceMixer>,
    norm_mlp: RmsNorm,
    mlp: GatedMlp,
    fusion: NormFusion,
    policy: PrecisionPolicy,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("fusion", &self.fusion)
            .field("hidden_size", &self.mixer.config().hidden_size)
            .finish()
    }
}

impl Block {
    /// Constructs one block from the shared [`ModelConfig`].
    pub fn new(_index: usize, config: &ModelConfig) -> Result<Self> {
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
        let init = InitPolicy::new(config.initializer_range, config.rescale_prenorm_residual);
        let proj_init = init.projection();
        let out_init = init.residual_output(config.num_hidden_layers);

        let mut norm_config = NormConfig::new(config.hidden_size);
        norm_config.epsilon = config.norm_eps;
        let norm_mixer = RmsNorm::ones(norm_config.clone(), config.dtype, &config.device)?;
        let norm_mlp = RmsNorm::ones(norm_config, config.dtype, &config.device)?;

        let mixer = FastWeightMixer::new(
            config.mixer_config(),
            &proj_init,
            &out_init,
            &config.device,
            config.dtype,
        )?;
        let mlp = GatedMlp::with_init(
            config.mlp_config(),
            &proj_init,
            &out_init,
            &config.device,
            config.dtype,
        )?;

        Ok(Self {
            norm_mixer,
            mixer: Arc::new(mixer),
            norm_mlp,
            mlp,
            fusion: NormFusion::from_flag(config.fuse_norm),
            policy,
        })
    }

    /// Forward pass: norm, mix, combine, norm, feed-forward, combine.
    ///
    /// Collaborator failures propagate unchanged.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        state: Option<LayerState>,
        use_cache: bool,
        want_attentions: bool,
    ) -> Result<BlockOutput> {
        let hidden = self.policy.cast_to_storage(hidden)?;
        let residual = hidden.clone();

        let normed = self.norm_mixer.forward(&hidden, &self.policy)?;
        let mixed = self.mixer.forward(
            &normed,
            attention_mask,
            state,
            use_cache,
            want_attentions,
        )?;

        let (normed_mlp, residual) = match self.fusion {
            NormFusion::Fused => {
                self.norm_mlp
                    .forward_fused(&mixed.hidden, &residual, &self.policy)?
            }
            NormFusion::Separate => {
                let combined = self.residual_add(&mixed.hidden, &residual)?;
                (self.norm_mlp.forward(&combined, &self.policy)?, combined)
            }
        };

        let mlp_out = self.mlp.forward(&normed_mlp, &self.policy)?;
        let output = self.residual_add(&mlp_out, &residual)?;
        let output = self.policy.cast_to_storage(&output)?;

        Ok(BlockOutput {
            hidden: output,
            attentions: mixed.attentions,
            state: mixed.state,
        })
    }

    fn residual_add(&self, branch: &Tensor, residual: &Tensor) -> Result<Tensor> {
        let branch = self.policy.cast_for_matmul(branch)?;
        let residual = self.policy.cast_for_matmul(residual)?;
        self.policy.cast_to_storage(&branch.add(&residual)?)
    }

    #[cfg(test)]
    fn with_fusion(&self, fusion: NormFusion) -> Self {
        Self {
            norm_mixer: self.norm_mixer.clone(),
            mixer: Arc::clone(&self.mixer),
            norm_mlp: self.norm_mlp.clone(),
            mlp: self.mlp.clone(),
            fusion,
            policy: self.policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn test_config(dtype: DType) -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attn_heads: 2,
            num_fw_heads: 2,
            window_size: 8,
            chunk_size: 2,
            inter_multi: 2.0,
            hidden_ratio: 4.0,
            fuse_norm: true,
            dtype,
            ..ModelConfig::default()
        }
    }

    fn sample_hidden(dtype: DType) -> Result<Tensor> {
        let data = (0..2 * 5 * 8)
            .map(|i| ((i * 31 % 17) as f32 - 8.0) * 0.1)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (2, 5, 8), &Device::Cpu)?.to_dtype(dtype)
    }

    #[test]
    fn output_respects_boundary_dtype() -> Result<()> {
        let config = test_config(DType::BF16);
        let block = Block::new(0, &config)?;
        let hidden = sample_hidden(DType::F32)?;

        let out = block.forward(&hidden, None, None, false, false)?;
        assert_eq!(out.hidden.dtype(), DType::BF16);
        assert_eq!(out.hidden.dims(), &[2, 5, 8]);
        Ok(())
    }

    #[test]
    fn fused_and_separate_norm_agree() -> Result<()> {
        let config = test_config(DType::F32);
        let block = Block::new(0, &config)?;
        let separate = block.with_fusion(NormFusion::Separate);
        let hidden = sample_hidden(DType::F32)?;

        let fused_out = block.forward(&hidden, None, None, false, false)?;
        let separate_out = separate.forward(&hidden, None, None, false, false)?;
        let diff = fused_out
            .hidden
            .sub(&separate_out.hidden)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn block_threads_state_without_retaining_it() -> Result<()> {
        let config = test_config(DType::F32);
        let block = Block::new(0, &config)?;
        let hidden = sample_hidden(DType::F32)?;

        let first = block.forward(&hidden, None, None, true, false)?;
        let state = first.state.expect("cache requested");
        assert_eq!(state.seen_tokens(), 5);

        // A second call with no state starts over: the block kept nothing.
        let fresh = block.forward(&hidden, None, None, true, false)?;
        assert_eq!(fresh.state.expect("cache requested").seen_tokens(), 5);
        Ok(())
    }
}
