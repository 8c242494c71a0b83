//! Generation-step input preparation.
//!
//! Cache continuation is disabled by policy here: every generation step
//! recomputes from the full context. The last-token trim guard is kept so
//! enabling continuation later is a one-line change.

use candle_core::{Error, Result, Tensor};
use mixer::StateCache;

use crate::head::CausalLM;

/// Whether generation continues from cached decode state. Disabled:
/// prepared inputs always request a full-context recompute.
const CACHE_CONTINUATION_ENABLED: bool = false;

/// Model-call arguments for the next generation step.
#[derive(Debug)]
pub struct GenerationInputs {
    pub input_ids: Option<Tensor>,
    pub input_embeds: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub use_cache: bool,
    pub logits_to_keep: usize,
}

impl CausalLM {
    /// Prepares the next step's model-call arguments.
    ///
    /// Embeddings are only consumed on the first step of a session; after
    /// that the token ids drive the call. Never returns an empty input set.
    pub fn prepare_inputs(
        &self,
        input_ids: &Tensor,
        state: Option<&StateCache>,
        attention_mask: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        logits_to_keep: usize,
    ) -> Result<GenerationInputs> {
        let use_cache = CACHE_CONTINUATION_ENABLED;
        let (_, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(Error::Msg(
                "prepare_inputs requires at least one token".into(),
            ));
        }

        let continuing = state.map(|cache| !cache.is_empty()).unwrap_or(false);

        // Only the newest token is needed once a non-empty cached sequence
        // is being continued.
        let input_ids = if continuing && use_cache {
            input_ids.narrow(1, seq - 1, 1)?
        } else {
            input_ids.clone()
        };

        if let Some(embeds) = input_embeds {
            if !continuing {
                if embeds.dims().len() != 3 || embeds.dims()[1] == 0 {
                    return Err(Error::Msg(
                        "input embeddings must be (batch, seq, hidden) with seq > 0".into(),
                    ));
                }
                return Ok(GenerationInputs {
                    input_ids: None,
                    input_embeds: Some(embeds.clone()),
                    attention_mask: attention_mask.cloned(),
                    use_cache,
                    logits_to_keep,
                });
            }
        }

        Ok(GenerationInputs {
            input_ids: Some(input_ids.contiguous()?),
            input_embeds: None,
            attention_mask: attention_mask.cloned(),
            use_cache,
            logits_to_keep,
        })
    }
}
