//! Causal-LM head: vocabulary projection and the loss strategies.
//!
//! The head wraps the stack with either a fresh projection or a readout
//! tied to the embedding table, picks one loss strategy per forward call
//! (the selection never changes mid-call), and enforces the invariant that
//! logits are never materialized while the linear-fused path is active.

use candle_core::{Error, Result, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig},
};
use mixer::StateCache;

use crate::{
    config::ModelConfig,
    init::InitPolicy,
    loss::{shift_labels, CrossEntropy, LossStrategy},
    output::CausalLmOutput,
    stack::{Stack, StackRequest},
};

/// Inputs for one causal-LM forward pass.
#[derive(Debug, Default)]
pub struct CausalLmRequest<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub input_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub state: Option<StateCache>,
    /// Labels for next-token prediction, `(batch, seq)`.
    pub labels: Option<&'a Tensor>,
    /// `None` resolves to caching outside training and none inside it.
    pub use_cache: Option<bool>,
    pub want_hidden_states: bool,
    pub want_attentions: bool,
    /// Number of trailing positions to project to logits; `0` keeps all.
    pub logits_to_keep: usize,
    pub training: bool,
}

enum LmHead {
    /// Readout through the transposed embedding table.
    Tied,
    /// Dedicated bias-free projection.
    Projection(Linear),
}

/// Decoder stack plus vocabulary head and loss strategies.
pub struct CausalLM {
    stack: Stack,
    head: LmHead,
    criterion: CrossEntropy,
    policy: PrecisionPolicy,
    fuse_cross_entropy: bool,
}

impl CausalLM {
    /// Builds the stack and head from `config`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
        let init = InitPolicy::new(config.initializer_range, config.rescale_prenorm_residual);
        let fuse_cross_entropy = config.fuse_cross_entropy;

        let head = if config.tie_word_embeddings {
            LmHead::Tied
        } else {
            LmHead::Projection(Linear::with_init(
                LinearConfig::new(config.hidden_size, config.vocab_size),
                &init.projection(),
                &config.device,
                config.dtype,
            )?)
        };

        let stack = Stack::new(config)?;
        Ok(Self {
            stack,
            head,
            criterion: CrossEntropy::new(),
            policy,
            fuse_cross_entropy,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        self.stack.config()
    }

    /// The underlying decoder stack.
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Full forward pass: stack, projection, and optionally the loss.
    pub fn forward(&self, request: CausalLmRequest<'_>) -> Result<CausalLmOutput> {
        let training = request.training;
        let use_cache = request.use_cache.unwrap_or(!training);
        let strategy = LossStrategy::select(self.fuse_cross_entropy, training);

        let stack_out = self.stack.forward(StackRequest {
            input_ids: request.input_ids,
            input_embeds: request.input_embeds,
            attention_mask: request.attention_mask,
            state: request.state,
            use_cache,
            want_hidden_states: request.want_hidden_states,
            want_attentions: request.want_attentions,
            training,
        })?;

        let hidden = &stack_out.last_hidden_state;
        let logits = if strategy.skips_logits() {
            None
        } else {
            let kept = self.keep_trailing(hidden, request.logits_to_keep)?;
            Some(self.project(&kept)?)
        };

        let loss = match request.labels {
            None => None,
            Some(labels) => {
                let shifted = shift_labels(labels)?;
                Some(match strategy {
                    LossStrategy::FusedLinear => {
                        let hidden = self.policy.cast_for_loss(hidden)?;
                        let weight = self.policy.cast_for_loss(&self.head_weight())?;
                        let bias = match self.head_bias() {
                            Some(bias) => Some(self.policy.cast_for_loss(&bias)?),
                            None => None,
                        };
                        self.criterion
                            .fused_linear(&hidden, &weight, bias.as_ref(), &shifted)?
                    }
                    LossStrategy::FusedSoftmax | LossStrategy::Standard => {
                        let logits = logits.as_ref().ok_or_else(|| {
                            Error::Msg("loss requested but logits were not produced".into())
                        })?;
                        if request.logits_to_keep != 0 {
                            return Err(Error::Msg(
                                "labels require the full logits range; set logits_to_keep to 0"
                                    .into(),
                            ));
                        }
                        let logits = self.policy.cast_for_loss(logits)?;
                        match strategy {
                            LossStrategy::FusedSoftmax => {
                                self.criterion.fused_softmax(&logits, &shifted)?
                            }
                            _ => self.criterion.standard(&logits, &shifted)?,
                        }
                    }
                })
            }
        };

        Ok(CausalLmOutput {
            loss,
            logits,
            state: stack_out.state,
            hidden_states: stack_out.hidden_states,
            attentions: stack_out.attentions,
        })
    }

    fn keep_trailing(&self, hidden: &Tensor, logits_to_keep: usize) -> Result<Tensor> {
        if logits_to_keep == 0 {
            return Ok(hidden.clone());
        }
        let seq = hidden.dims()[1];
        if logits_to_keep > seq {
            return Err(Error::Msg(format!(
                "logits_to_keep ({logits_to_keep}) exceeds sequence length ({seq})"
            )));
        }
        hidden.narrow(1, seq - logits_to_keep, logits_to_keep)
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.head {
            LmHead::Tied => self.stack.embedding().linear_out(hidden),
            LmHead::Projection(linear) => linear.forward(hidden, &self.policy),
        }
    }

    fn head_weight(&self) -> Tensor {
        match &self.head {
            LmHead::Tied => self.stack.embedding().weight(),
            LmHead::Projection(linear) => linear.weight(),
        }
    }

    fn head_bias(&self) -> Option<Tensor> {
        match &self.head {
            LmHead::Tied => None,
            LmHead::Projection(linear) => linear.bias(),
        }
    }
}
