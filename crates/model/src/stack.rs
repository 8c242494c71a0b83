//! The decoder stack: embedding, ordered blocks, final norm.
//!
//! The stack owns the decode-state collection across layers and steps and
//! the gradient-recompute policy. Layers execute strictly in configured
//! order; the state for layer `k` is written back at index `k` before layer
//! `k + 1` runs. After every block the hidden states are defensively
//! re-coerced to the boundary dtype, since autodiff or replay machinery may
//! have escaped it inside the block.

use std::sync::Once;

use candle_core::{Error, Result, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    embedding::{TokenEmbedding, TokenEmbeddingConfig},
    norm::{NormConfig, RmsNorm},
};
use mixer::StateCache;

use crate::{
    block::Block,
    config::ModelConfig,
    init::InitPolicy,
    output::StackOutput,
    recompute::{RecomputeLedger, SegmentRecord},
};

static ATTENTION_NOTICE: Once = Once::new();
static RECOMPUTE_NOTICE: Once = Once::new();

/// Inputs for one stack forward pass.
///
/// Exactly one of `input_ids` / `input_embeds` must be supplied.
#[derive(Debug, Default)]
pub struct StackRequest<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub input_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub state: Option<StateCache>,
    pub use_cache: bool,
    pub want_hidden_states: bool,
    pub want_attentions: bool,
    pub training: bool,
}

/// Decoder-only stack assembled from the shared crates.
pub struct Stack {
    config: ModelConfig,
    embedding: TokenEmbedding,
    blocks: Vec<Block>,
    final_norm: RmsNorm,
    policy: PrecisionPolicy,
}

impl Stack {
    /// Builds the stack and its component blocks according to `config`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
        let init = InitPolicy::new(config.initializer_range, config.rescale_prenorm_residual);

        let embedding = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: config.vocab_size,
                hidden_dim: config.hidden_size,
                dtype: config.dtype,
                device: config.device.clone(),
            },
            init.embedding_std(),
        )?;

        let mut norm_config = NormConfig::new(config.hidden_size);
        norm_config.epsilon = config.norm_eps;
        let final_norm = RmsNorm::ones(norm_config, config.dtype, &config.device)?;

        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for layer in 0..config.num_hidden_layers {
            blocks.push(Block::new(layer, &config)?);
        }

        Ok(Self {
            config,
            embedding,
            blocks,
            final_norm,
            policy,
        })
    }

    /// Returns the stack configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The shared token embedding table.
    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Runs the full layer stack.
    pub fn forward(&self, request: StackRequest<'_>) -> Result<StackOutput> {
        let mut hidden = self.resolve_inputs(&request)?;

        // Attention output is unsupported here; the request downgrades to a
        // one-time notice and blocks always run without it.
        if request.want_attentions {
            ATTENTION_NOTICE.call_once(|| {
                log::warn!(
                    "attention weight output is not supported by this stack; \
                     disabling the request"
                );
            });
        }

        let use_cache = request.use_cache;
        let mut recompute_active = self.config.gradient_recompute && request.training;
        if recompute_active && use_cache {
            RECOMPUTE_NOTICE.call_once(|| {
                log::warn!(
                    "decode-state caching and gradient recompute were both requested; \
                     caching takes precedence and recompute is disabled for this call"
                );
            });
            recompute_active = false;
        }

        let mut cache = if use_cache {
            let cache = request
                .state
                .unwrap_or_else(|| StateCache::empty(self.num_layers()));
            if cache.num_layers() != self.num_layers() {
                return Err(Error::Msg(format!(
                    "state cache depth {} does not match stack depth {}",
                    cache.num_layers(),
                    self.num_layers()
                )));
            }
            Some(cache)
        } else {
            None
        };

        let mut snapshots = request.want_hidden_states.then(Vec::new);
        let mut ledger = recompute_active.then(RecomputeLedger::new);

        for (layer, block) in self.blocks.iter().enumerate() {
            if let Some(snapshots) = snapshots.as_mut() {
                snapshots.push(hidden.clone());
            }

            let layer_state = match cache.as_mut() {
                Some(cache) => cache.take(layer)?,
                None => None,
            };

            let block_input = if recompute_active {
                hidden.detach()
            } else {
                hidden.clone()
            };
            let out = block.forward(
                &block_input,
                request.attention_mask,
                layer_state,
                use_cache,
                false,
            )?;
            hidden = self.policy.cast_to_storage(&out.hidden)?;

            if let Some(cache) = cache.as_mut() {
                cache.put(layer, out.state)?;
            }
            if let Some(ledger) = ledger.as_mut() {
                ledger.push(SegmentRecord::new(layer, block_input, hidden.clone()));
            }
        }

        let normalized = self.final_norm.forward(&hidden, &self.policy)?;
        let last_hidden_state = self.policy.cast_to_storage(&normalized)?;

        if let Some(snapshots) = snapshots.as_mut() {
            snapshots.push(last_hidden_state.clone());
        }

        Ok(StackOutput {
            last_hidden_state,
            state: cache,
            hidden_states: snapshots,
            attentions: None,
            recompute: ledger,
        })
    }

    /// Re-executes one recorded block segment from its true input.
    ///
    /// Replay runs without caching, so the mixer contract guarantees the
    /// result matches the recorded output exactly.
    pub fn replay_segment(
        &self,
        record: &SegmentRecord,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let block = self.blocks.get(record.layer()).ok_or_else(|| {
            Error::Msg(format!(
                "segment layer {} out of range for stack depth {}",
                record.layer(),
                self.blocks.len()
            ))
        })?;
        let out = block.forward(record.input(), attention_mask, None, false, false)?;
        self.policy.cast_to_storage(&out.hidden)
    }

    fn resolve_inputs(&self, request: &StackRequest<'_>) -> Result<Tensor> {
        let hidden = match (request.input_ids, request.input_embeds) {
            (Some(_), Some(_)) => {
                return Err(Error::Msg(
                    "cannot specify both input_ids and input_embeds at the same time".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Msg(
                    "either input_ids or input_embeds must be specified".into(),
                ))
            }
            (Some(ids), None) => self.embedding.forward(ids)?,
            (None, Some(embeds)) => embeds.clone(),
        };
        self.policy.cast_to_storage(&hidden)
    }
}
