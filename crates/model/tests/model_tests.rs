use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use mixer::StateCache;
use model::{CausalLM, CausalLmRequest, ModelConfig, Stack, StackRequest};

fn build_config(dtype: DType) -> ModelConfig {
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
        fuse_cross_entropy: false,
        dtype,
        ..ModelConfig::default()
    }
}

fn ones_ids(batch: usize, seq: usize) -> Result<Tensor> {
    Ok(Tensor::from_vec(
        vec![1u32; batch * seq],
        (batch, seq),
        &Device::Cpu,
    )?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = CausalLM::new(build_config(DType::F32))?;
    let token_ids = Tensor::from_slice(&[0u32, 1, 2, 3, 4, 5], (2, 3), &Device::Cpu)?;

    let out = model.forward(CausalLmRequest {
        input_ids: Some(&token_ids),
        use_cache: Some(false),
        ..Default::default()
    })?;

    let logits = out.logits.expect("standard mode materializes logits");
    assert_eq!(logits.dims(), &[2, 3, 16]);
    assert!(out.loss.is_none());
    Ok(())
}

#[test]
fn boundary_dtype_is_enforced_for_bf16_models() -> Result<()> {
    let stack = Stack::new(build_config(DType::BF16))?;
    let ids = ones_ids(1, 4)?;
    let out = stack.forward(StackRequest {
        input_ids: Some(&ids),
        want_hidden_states: true,
        ..Default::default()
    })?;
    assert_eq!(out.last_hidden_state.dtype(), DType::BF16);
    for snapshot in out.hidden_states.expect("snapshots requested") {
        assert_eq!(snapshot.dtype(), DType::BF16);
    }
    Ok(())
}

#[test]
fn supplying_both_or_neither_inputs_fails_at_the_boundary() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 3)?;
    let embeds = Tensor::zeros((1, 3, 8), DType::F32, &Device::Cpu)?;

    let both = stack.forward(StackRequest {
        input_ids: Some(&ids),
        input_embeds: Some(&embeds),
        ..Default::default()
    });
    assert!(both.is_err());

    let neither = stack.forward(StackRequest::default());
    assert!(neither.is_err());
    Ok(())
}

#[test]
fn embeddings_are_accepted_in_place_of_ids() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let embeds = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;
    let out = stack.forward(StackRequest {
        input_embeds: Some(&embeds),
        ..Default::default()
    })?;
    assert_eq!(out.last_hidden_state.dims(), &[1, 3, 8]);
    Ok(())
}

#[test]
fn state_collection_length_always_equals_depth() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 4)?;

    let first = stack.forward(StackRequest {
        input_ids: Some(&ids),
        use_cache: true,
        ..Default::default()
    })?;
    let state = first.state.expect("cache requested");
    assert_eq!(state.num_layers(), 2);
    assert_eq!(state.seen_tokens(), 4);

    let second = stack.forward(StackRequest {
        input_ids: Some(&ids),
        state: Some(state),
        use_cache: true,
        ..Default::default()
    })?;
    let state = second.state.expect("cache requested");
    assert_eq!(state.num_layers(), 2);
    assert_eq!(state.seen_tokens(), 8);
    Ok(())
}

#[test]
fn mismatched_state_depth_is_rejected() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 2)?;
    let result = stack.forward(StackRequest {
        input_ids: Some(&ids),
        state: Some(StateCache::empty(5)),
        use_cache: true,
        ..Default::default()
    });
    assert!(result.is_err());
    Ok(())
}

#[test]
fn cache_and_recompute_conflict_resolves_to_caching() -> Result<()> {
    let mut config = build_config(DType::F32);
    config.gradient_recompute = true;
    let stack = Stack::new(config)?;
    let ids = ones_ids(1, 4)?;

    let conflicted = stack.forward(StackRequest {
        input_ids: Some(&ids),
        use_cache: true,
        training: true,
        ..Default::default()
    })?;
    // Recompute was discarded: no ledger, cache present.
    assert!(conflicted.recompute.is_none());
    let state = conflicted.state.expect("caching won the conflict");
    assert_eq!(state.num_layers(), 2);

    let cache_only = stack.forward(StackRequest {
        input_ids: Some(&ids),
        use_cache: true,
        training: false,
        ..Default::default()
    })?;
    assert_eq!(
        max_diff(&conflicted.last_hidden_state, &cache_only.last_hidden_state)?,
        0.0
    );
    Ok(())
}

#[test]
fn recompute_replay_reproduces_segments_exactly() -> Result<()> {
    let mut config = build_config(DType::F32);
    config.gradient_recompute = true;
    let stack = Stack::new(config)?;
    let ids = ones_ids(1, 4)?;

    let out = stack.forward(StackRequest {
        input_ids: Some(&ids),
        training: true,
        ..Default::default()
    })?;
    let ledger = out.recompute.expect("recompute active");
    assert_eq!(ledger.len(), 2);

    for record in ledger.iter() {
        let replayed = stack.replay_segment(record, None)?;
        assert_eq!(max_diff(&replayed, record.output())?, 0.0);
    }

    // Detached segments do not change the forward values themselves.
    let plain = stack.forward(StackRequest {
        input_ids: Some(&ids),
        training: false,
        ..Default::default()
    })?;
    assert_eq!(max_diff(&out.last_hidden_state, &plain.last_hidden_state)?, 0.0);
    Ok(())
}

#[test]
fn hidden_state_snapshots_come_back_in_layer_order() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 3)?;
    let out = stack.forward(StackRequest {
        input_ids: Some(&ids),
        want_hidden_states: true,
        ..Default::default()
    })?;
    // Two pre-block snapshots plus the post-norm final state.
    let snapshots = out.hidden_states.expect("snapshots requested");
    assert_eq!(snapshots.len(), 3);
    assert_eq!(max_diff(&snapshots[2], &out.last_hidden_state)?, 0.0);
    Ok(())
}

#[test]
fn attention_requests_are_downgraded_not_fatal() -> Result<()> {
    let stack = Stack::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 3)?;
    let out = stack.forward(StackRequest {
        input_ids: Some(&ids),
        want_attentions: true,
        ..Default::default()
    })?;
    assert!(out.attentions.is_none());
    Ok(())
}

#[test]
fn end_to_end_standard_loss_scenario() -> Result<()> {
    let model = CausalLM::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 5)?;

    let out = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        labels: Some(&ids),
        use_cache: Some(false),
        ..Default::default()
    })?;

    let logits = out.logits.expect("standard mode materializes logits");
    assert_eq!(logits.dims(), &[1, 5, 16]);

    let loss = out.loss.expect("labels supplied");
    let value = loss.to_vec0::<f32>()?;
    assert!(value.is_finite() && value >= 0.0, "loss {value}");
    Ok(())
}

#[test]
fn logits_to_keep_bounds_the_projection() -> Result<()> {
    let model = CausalLM::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 5)?;

    let out = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        logits_to_keep: 1,
        use_cache: Some(false),
        ..Default::default()
    })?;
    let kept = out.logits.expect("standard mode materializes logits");
    assert_eq!(kept.dims(), &[1, 1, 16]);

    let full = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        use_cache: Some(false),
        ..Default::default()
    })?;
    let full_logits = full.logits.expect("standard mode materializes logits");
    let last = full_logits.narrow(1, 4, 1)?;
    assert_eq!(max_diff(&kept, &last)?, 0.0);
    Ok(())
}

#[test]
fn fused_linear_training_never_materializes_logits() -> Result<()> {
    let mut config = build_config(DType::F32);
    config.fuse_cross_entropy = true;
    let model = CausalLM::new(config)?;
    let ids = ones_ids(1, 5)?;

    let out = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        labels: Some(&ids),
        training: true,
        ..Default::default()
    })?;

    assert!(out.logits.is_none());
    let loss = out.loss.expect("labels supplied").to_vec0::<f32>()?;
    assert!(loss.is_finite() && loss >= 0.0);
    Ok(())
}

#[test]
fn fused_and_standard_losses_agree_on_the_same_model() -> Result<()> {
    // fuse_cross_entropy off: inference-mode forward gives the standard
    // loss; the same hidden states fed through the fused selection must
    // produce the same value. Exercised by toggling only the mode flag on
    // one fused-configured model: training -> linear-fused, inference ->
    // softmax-fused; both paths see identical weights and labels.
    let mut config = build_config(DType::F32);
    config.fuse_cross_entropy = true;
    let model = CausalLM::new(config)?;
    let ids = Tensor::from_slice(&[3u32, 7, 1, 12, 9], (1, 5), &Device::Cpu)?;

    let fused_linear = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        labels: Some(&ids),
        training: true,
        ..Default::default()
    })?;
    let fused_softmax = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        labels: Some(&ids),
        training: false,
        use_cache: Some(false),
        ..Default::default()
    })?;

    let linear_loss = fused_linear.loss.expect("labels supplied").to_vec0::<f32>()?;
    let softmax_loss = fused_softmax.loss.expect("labels supplied").to_vec0::<f32>()?;
    assert!(
        (linear_loss - softmax_loss).abs() < 1e-4,
        "{linear_loss} vs {softmax_loss}"
    );
    Ok(())
}

#[test]
fn prepare_inputs_never_returns_an_empty_set() -> Result<()> {
    let model = CausalLM::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 5)?;

    let prepared = model.prepare_inputs(&ids, None, None, None, 1)?;
    let prepared_ids = prepared.input_ids.expect("ids path");
    assert_eq!(prepared_ids.dims(), &[1, 5]);
    assert!(prepared.input_embeds.is_none());
    assert_eq!(prepared.logits_to_keep, 1);
    // Cache continuation is disabled by policy: full-context recompute.
    assert!(!prepared.use_cache);

    let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu);
    if let Ok(empty) = empty {
        assert!(model.prepare_inputs(&empty, None, None, None, 0).is_err());
    }
    Ok(())
}

#[test]
fn prepare_inputs_uses_embeddings_only_on_the_first_step() -> Result<()> {
    let model = CausalLM::new(build_config(DType::F32))?;
    let ids = ones_ids(1, 3)?;
    let embeds = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;

    let first = model.prepare_inputs(&ids, None, None, Some(&embeds), 0)?;
    assert!(first.input_ids.is_none());
    assert!(first.input_embeds.is_some());

    // A progressed session switches back to token ids.
    let stack = Stack::new(build_config(DType::F32))?;
    let progressed = stack
        .forward(StackRequest {
            input_ids: Some(&ids),
            use_cache: true,
            ..Default::default()
        })?
        .state
        .expect("cache requested");
    let later = model.prepare_inputs(&ids, Some(&progressed), None, Some(&embeds), 0)?;
    assert!(later.input_ids.is_some());
    assert!(later.input_embeds.is_none());
    Ok(())
}

#[test]
fn config_round_trips_through_a_toml_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.toml");
    std::fs::write(
        &path,
        r#"
vocab_size = 16
hidden_size = 8
num_hidden_layers = 2
num_attn_heads = 2
num_fw_heads = 2
window_size = 8
chunk_size = 2
fuse_cross_entropy = false
lr_parameterization = "sigmoid"
dtype = "f32"
"#,
    )?;

    let config = ModelConfig::from_path(&path)?;
    assert_eq!(config.vocab_size, 16);
    assert_eq!(config.hidden_size, 8);
    assert_eq!(config.dtype, DType::F32);
    assert!(!config.fuse_cross_entropy);

    // The loaded configuration drives a working model.
    let model = CausalLM::new(config)?;
    let ids = ones_ids(1, 3)?;
    let out = model.forward(CausalLmRequest {
        input_ids: Some(&ids),
        use_cache: Some(false),
        ..Default::default()
    })?;
    assert_eq!(out.logits.expect("logits").dims(), &[1, 3, 16]);
    Ok(())
}

#[test]
fn invalid_geometry_is_rejected_up_front() {
    let mut config = build_config(DType::F32);
    config.num_attn_heads = 3; // 8 % 3 != 0
    assert!(Stack::new(config).is_err());
}
