//! Windowed-attention + fast-weight reference mixer.
//!
//! Two branches share one qkv projection: a sliding-window causal attention
//! over the cached key/value history, and a chunked fast-weight path that
//! applies the current per-head SwiGLU fast function to the chunk's queries
//! and then updates the weights from the chunk's keys and values
//! (apply-then-update). Branch outputs are summed and merged through the
//! output projection. All state flows through [`LayerState`]; invoking the
//! mixer twice with identical inputs yields identical outputs.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops;

use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

use crate::{
    fast_weight::FastWeights,
    state::{FastWeightState, LayerState},
    MixerConfig, MixerOutput, SequenceMixer,
};

const MASKED_SCORE: f32 = -1e9;
const MOMENTUM_BETA: f64 = 0.9;
const NORM_EPS: f64 = 1e-6;

/// Reference [`SequenceMixer`]: sliding-window attention plus per-head fast
/// weights updated in large chunks.
pub struct FastWeightMixer {
    config: MixerConfig,
    policy: PrecisionPolicy,
    qkv_proj: Linear,
    o_proj: Linear,
    qk_scale: Tensor,
    qk_offset: Tensor,
    fast: FastWeights,
}

impl FastWeightMixer {
    /// Builds the mixer, sampling projections with `proj_init` and the
    /// output projection with `out_init` (so callers can rescale the
    /// residual path). Scale starts at ones, offset at zeros.
    pub fn new(
        config: MixerConfig,
        proj_init: &LinearInit,
        out_init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let mut qkv_config = LinearConfig::new(hidden, 3 * hidden);
        if config.qkv_bias {
            qkv_config = qkv_config.with_bias();
        }
        let qkv_proj = Linear::with_init(qkv_config, proj_init, device, dtype)?;
        let o_proj = Linear::with_init(
            LinearConfig::new(hidden, hidden),
            out_init,
            device,
            dtype,
        )?;

        let qk_scale = Tensor::ones(hidden, DType::F32, device)?;
        let qk_offset = Tensor::zeros(hidden, DType::F32, device)?;
        let fast = FastWeights::init(
            config.num_fw_heads,
            config.fw_head_dim(),
            config.fw_inter_dim(),
            config.low_rank,
            device,
        )?;

        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            config,
            qkv_proj,
            o_proj,
            qk_scale,
            qk_offset,
            fast,
        })
    }

    /// The output projection, exposed for initialisation-policy adjustments.
    pub fn o_proj(&self) -> &Linear {
        &self.o_proj
    }

    fn split_heads(&self, tensor: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, hidden) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, heads, hidden / heads))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, _, seq, _) = tensor.dims4()?;
        tensor
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, self.config.hidden_size))
    }

    fn window_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        attention_mask: Option<&Tensor>,
        cached: Option<&(Tensor, Tensor)>,
        seen: usize,
    ) -> Result<(Tensor, Tensor, (Tensor, Tensor))> {
        let q_heads = self.split_heads(q, self.config.num_attn_heads)?;
        let k_heads = self.split_heads(k, self.config.num_attn_heads)?;
        let v_heads = self.split_heads(v, self.config.num_attn_heads)?;

        let (keys, values, cache_len) = match cached {
            Some((cached_k, cached_v)) => {
                let cache_len = cached_k.dims()[2];
                (
                    Tensor::cat(&[cached_k, &k_heads], 2)?,
                    Tensor::cat(&[cached_v, &v_heads], 2)?,
                    cache_len,
                )
            }
            None => (k_heads.clone(), v_heads.clone(), 0),
        };

        let q_len = q_heads.dims()[2];
        let k_len = keys.dims()[2];
        let scale = 1.0 / (self.config.attn_head_dim() as f64).sqrt();

        let mut scores = q_heads
            .matmul(&keys.transpose(2, 3)?)?
            .affine(scale, 0.0)?;
        let bias = window_bias(seen, cache_len, q_len, k_len, self.config.window_size, q.device())?;
        scores = scores.broadcast_add(&bias)?;
        if let Some(mask) = attention_mask {
            if cache_len == 0 {
                scores = scores.broadcast_add(&padding_bias(mask, k_len)?)?;
            }
        }

        let probs = ops::softmax(&scores, D::Minus1)?;
        let context = probs.matmul(&values)?;
        let merged = self.merge_heads(&context)?;

        let keep = k_len.min(self.config.window_size);
        let trimmed = (
            keys.narrow(2, k_len - keep, keep)?,
            values.narrow(2, k_len - keep, keep)?,
        );
        Ok((merged, probs, trimmed))
    }

    fn fast_weight_pass(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        state: &mut FastWeightState,
    ) -> Result<Tensor> {
        let scale_qk = |tensor: &Tensor| -> Result<Tensor> {
            tensor
                .broadcast_mul(&self.qk_scale)?
                .broadcast_add(&self.qk_offset)
        };

        let heads = self.config.num_fw_heads;
        let q_heads = l2_normalize(&self.split_heads(&scale_qk(q)?, heads)?)?;
        let k_heads = l2_normalize(&self.split_heads(&scale_qk(k)?, heads)?)?;
        let v_heads = self.split_heads(v, heads)?;

        let (rate0, rate1, rate2) = self.fast.rates(self.config.lr_parameterization)?;

        let seq = q_heads.dims()[2];
        let chunk = self.config.chunk_size;
        let mut outputs = Vec::with_capacity(seq.div_ceil(chunk));
        let mut offset = 0;
        while offset < seq {
            let len = chunk.min(seq - offset);
            let q_chunk = q_heads.narrow(2, offset, len)?;
            let k_chunk = k_heads.narrow(2, offset, len)?;
            let v_chunk = v_heads.narrow(2, offset, len)?;

            outputs.push(apply_fast_function(state, &q_chunk)?);
            update_fast_weights(
                state,
                &k_chunk,
                &v_chunk,
                (&rate0, &rate1, &rate2),
                self.config.use_momentum,
            )?;
            offset += len;
        }

        self.merge_heads(&Tensor::cat(&outputs, 2)?)
    }
}

impl SequenceMixer for FastWeightMixer {
    fn config(&self) -> &MixerConfig {
        &self.config
    }

    fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        state: Option<LayerState>,
        use_cache: bool,
        want_attentions: bool,
    ) -> Result<MixerOutput> {
        let state = state.unwrap_or_else(LayerState::empty);
        let seen = state.seen;
        let (batch, seq, _) = hidden.dims3()?;

        let qkv = self.qkv_proj.forward(hidden, &self.policy)?;
        let qkv = self.policy.cast_for_matmul(&qkv)?;
        let hidden_size = self.config.hidden_size;
        let q = qkv.narrow(2, 0, hidden_size)?;
        let k = qkv.narrow(2, hidden_size, hidden_size)?;
        let v = qkv.narrow(2, 2 * hidden_size, hidden_size)?;

        let (attn_out, probs, window) =
            self.window_attention(&q, &k, &v, attention_mask, state.window.as_ref(), seen)?;

        let mut fast_state = match state.fast {
            Some(existing) => existing,
            None => {
                log::debug!("materializing fast-weight start state for batch {batch}");
                self.fast.start_state(batch, self.config.use_momentum)?
            }
        };
        let fw_out = self.fast_weight_pass(&q, &k, &v, &mut fast_state)?;

        let combined = attn_out.add(&fw_out)?;
        let combined = self.policy.cast_to_storage(&combined)?;
        let output = self.o_proj.forward(&combined, &self.policy)?;

        let next_state = use_cache.then(|| LayerState {
            window: Some(window),
            fast: Some(fast_state),
            seen: seen + seq,
        });

        Ok(MixerOutput {
            hidden: output,
            attentions: want_attentions.then_some(probs),
            state: next_state,
        })
    }
}

/// SwiGLU fast function: `f(x) = (silu(w0 x) * (w2 x)) w1`.
fn apply_fast_function(state: &FastWeightState, x: &Tensor) -> Result<Tensor> {
    let gate_pre = x.matmul(&state.w0.transpose(2, 3)?)?;
    let up = x.matmul(&state.w2.transpose(2, 3)?)?;
    let inner = ops::silu(&gate_pre)?.mul(&up)?;
    inner.matmul(&state.w1.transpose(2, 3)?)
}

/// One gradient-descent step of the fast weights on the chunk's
/// reconstruction objective `-<v, f(k)>`, averaged over the chunk.
fn update_fast_weights(
    state: &mut FastWeightState,
    keys: &Tensor,
    values: &Tensor,
    rates: (&Tensor, &Tensor, &Tensor),
    use_momentum: bool,
) -> Result<()> {
    let chunk_len = keys.dims()[2] as f64;

    let gate_pre = keys.matmul(&state.w0.transpose(2, 3)?)?;
    let gate = ops::silu(&gate_pre)?;
    let up = keys.matmul(&state.w2.transpose(2, 3)?)?;
    let inner = gate.mul(&up)?;

    // dL/d f(k) = -v, scaled by the chunk mean.
    let d_out = values.affine(-1.0 / chunk_len, 0.0)?;
    let d_w1 = d_out.transpose(2, 3)?.matmul(&inner)?;
    let d_inner = d_out.matmul(&state.w1)?;

    let d_up = d_inner.mul(&gate)?;
    let d_gate_pre = d_inner.mul(&up)?.mul(&silu_derivative(&gate_pre)?)?;
    let d_w2 = d_up.transpose(2, 3)?.matmul(keys)?;
    let d_w0 = d_gate_pre.transpose(2, 3)?.matmul(keys)?;

    let (rate0, rate1, rate2) = rates;
    if use_momentum {
        let (m0, m1, m2) = match state.momentum.take() {
            Some(momentum) => momentum,
            None => (
                state.w0.zeros_like()?,
                state.w1.zeros_like()?,
                state.w2.zeros_like()?,
            ),
        };
        let m0 = m0.affine(MOMENTUM_BETA, 0.0)?.add(&d_w0)?;
        let m1 = m1.affine(MOMENTUM_BETA, 0.0)?.add(&d_w1)?;
        let m2 = m2.affine(MOMENTUM_BETA, 0.0)?.add(&d_w2)?;
        state.w0 = state.w0.sub(&m0.broadcast_mul(rate0)?)?;
        state.w1 = state.w1.sub(&m1.broadcast_mul(rate1)?)?;
        state.w2 = state.w2.sub(&m2.broadcast_mul(rate2)?)?;
        state.momentum = Some((m0, m1, m2));
    } else {
        state.w0 = state.w0.sub(&d_w0.broadcast_mul(rate0)?)?;
        state.w1 = state.w1.sub(&d_w1.broadcast_mul(rate1)?)?;
        state.w2 = state.w2.sub(&d_w2.broadcast_mul(rate2)?)?;
    }
    Ok(())
}

fn silu_derivative(z: &Tensor) -> Result<Tensor> {
    let sig = ops::sigmoid(z)?;
    let one_minus = sig.affine(-1.0, 1.0)?;
    let inner = z.mul(&one_minus)?.affine(1.0, 1.0)?;
    sig.mul(&inner)
}

fn l2_normalize(tensor: &Tensor) -> Result<Tensor> {
    let norm = (tensor.sqr()?.sum_keepdim(D::Minus1)? + NORM_EPS)?.sqrt()?;
    tensor.broadcast_div(&norm)
}

/// Additive causal window bias for scores `(batch, heads, q_len, k_len)`.
///
/// Key column `j` covers the cached history for `j < cache_len` and the
/// current span otherwise; query row `i` sits at global position `seen + i`.
/// A key is visible when it is not in the future and lies within the window.
fn window_bias(
    seen: usize,
    cache_len: usize,
    q_len: usize,
    k_len: usize,
    window: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut bias = Vec::with_capacity(q_len * k_len);
    for i in 0..q_len {
        let q_pos = seen + i;
        for j in 0..k_len {
            let k_pos = if j < cache_len {
                seen - cache_len + j
            } else {
                seen + (j - cache_len)
            };
            let visible = k_pos <= q_pos && q_pos - k_pos < window;
            bias.push(if visible { 0.0f32 } else { MASKED_SCORE });
        }
    }
    Tensor::from_vec(bias, (1, 1, q_len, k_len), device)
}

/// Additive padding bias from a `(batch, k_len)` keep-mask of ones/zeros.
fn padding_bias(mask: &Tensor, k_len: usize) -> Result<Tensor> {
    let (batch, mask_len) = mask.dims2()?;
    if mask_len != k_len {
        candle_core::bail!(
            "attention mask length {} does not match key length {}",
            mask_len,
            k_len
        );
    }
    mask.to_dtype(DType::F32)?
        .affine(-(MASKED_SCORE as f64), MASKED_SCORE as f64)?
        .reshape((batch, 1, 1, k_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LrParameterization;

    fn test_config() -> MixerConfig {
        MixerConfig {
            hidden_size: 8,
            num_attn_heads: 2,
            num_fw_heads: 2,
            window_size: 16,
            chunk_size: 2,
            inter_multi: 2.0,
            lr_parameterization: LrParameterization::Softplus,
            use_momentum: false,
            low_rank: 0,
            qkv_bias: false,
        }
    }

    fn build_mixer(config: MixerConfig) -> Result<FastWeightMixer> {
        let init = LinearInit::Normal { std: 0.05 };
        FastWeightMixer::new(config, &init, &init, &Device::Cpu, DType::F32)
    }

    fn sample_hidden(batch: usize, seq: usize, hidden: usize) -> Result<Tensor> {
        let total = batch * seq * hidden;
        let data = (0..total)
            .map(|i| ((i * 37 % 19) as f32 - 9.0) * 0.1)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (batch, seq, hidden), &Device::Cpu)
    }

    #[test]
    fn empty_state_starts_a_session() -> Result<()> {
        let mixer = build_mixer(test_config())?;
        let hidden = sample_hidden(1, 5, 8)?;
        let out = mixer.forward(&hidden, None, None, true, false)?;
        assert_eq!(out.hidden.dims(), &[1, 5, 8]);
        let state = out.state.expect("cache requested");
        assert_eq!(state.seen_tokens(), 5);
        assert_eq!(state.window_len(), 5);
        Ok(())
    }

    #[test]
    fn no_cache_returns_no_state() -> Result<()> {
        let mixer = build_mixer(test_config())?;
        let hidden = sample_hidden(1, 3, 8)?;
        let out = mixer.forward(&hidden, None, None, false, false)?;
        assert!(out.state.is_none());
        Ok(())
    }

    #[test]
    fn replay_with_identical_inputs_is_identical() -> Result<()> {
        let mixer = build_mixer(test_config())?;
        let hidden = sample_hidden(2, 4, 8)?;
        let first = mixer.forward(&hidden, None, None, false, false)?;
        let second = mixer.forward(&hidden, None, None, false, false)?;
        let diff = first
            .hidden
            .sub(&second.hidden)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn cached_continuation_matches_full_pass() -> Result<()> {
        let mixer = build_mixer(test_config())?;
        let hidden = sample_hidden(1, 4, 8)?;

        let full = mixer.forward(&hidden, None, None, false, false)?;

        let first_half = hidden.narrow(1, 0, 2)?;
        let second_half = hidden.narrow(1, 2, 2)?;
        let step_one = mixer.forward(&first_half, None, None, true, false)?;
        let step_two = mixer.forward(&second_half, None, step_one.state, true, false)?;

        let full_tail = full.hidden.narrow(1, 2, 2)?;
        let diff = full_tail
            .sub(&step_two.hidden)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-4, "diff {diff}");

        let state = step_two.state.expect("cache requested");
        assert_eq!(state.seen_tokens(), 4);
        Ok(())
    }

    #[test]
    fn window_trims_cached_history() -> Result<()> {
        let mut config = test_config();
        config.window_size = 3;
        let mixer = build_mixer(config)?;
        let hidden = sample_hidden(1, 6, 8)?;
        let out = mixer.forward(&hidden, None, None, true, false)?;
        let state = out.state.expect("cache requested");
        assert_eq!(state.window_len(), 3);
        assert_eq!(state.seen_tokens(), 6);
        Ok(())
    }

    #[test]
    fn attentions_come_back_when_requested() -> Result<()> {
        let mixer = build_mixer(test_config())?;
        let hidden = sample_hidden(1, 4, 8)?;
        let out = mixer.forward(&hidden, None, None, false, true)?;
        let probs = out.attentions.expect("attentions requested");
        assert_eq!(probs.dims(), &[1, 2, 4, 4]);
        Ok(())
    }

    #[test]
    fn momentum_state_is_threaded_through() -> Result<()> {
        let mut config = test_config();
        config.use_momentum = true;
        let mixer = build_mixer(config)?;
        let hidden = sample_hidden(1, 4, 8)?;
        let out = mixer.forward(&hidden, None, None, true, false)?;
        let state = out.state.expect("cache requested");
        let fast = state.fast.as_ref().expect("fast weights materialized");
        assert!(fast.momentum.is_some());
        Ok(())
    }
}
