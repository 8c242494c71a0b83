//! Model configuration: geometry, policies, and file loading.
//!
//! The configuration is created once at model construction and never mutated
//! afterwards. Policy flags (`fuse_norm`, `fuse_cross_entropy`,
//! `gradient_recompute`) select tagged variants at construction or call
//! boundaries; nothing re-inspects them mid-call.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Error, Result};
use mixer::{LrParameterization, MixerConfig};
use serde::Deserialize;
use thiserror::Error as ThisError;

use layers::GatedMlpConfig;

/// High-level configuration for assembling the decoder stack and head.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attn_heads: usize,
    pub num_fw_heads: usize,
    pub window_size: usize,
    pub chunk_size: usize,
    /// Fast-weight intermediate width as a multiple of the fast head dim.
    pub inter_multi: f64,
    /// MLP expansion ratio; ignored when `intermediate_size` is set.
    pub hidden_ratio: f64,
    pub intermediate_size: Option<usize>,
    pub norm_eps: f64,
    pub fuse_norm: bool,
    pub fuse_cross_entropy: bool,
    pub gradient_recompute: bool,
    pub use_momentum: bool,
    /// Low-rank factorization rank for initial fast weights (0 = full rank).
    pub fw_low_rank: usize,
    pub lr_parameterization: LrParameterization,
    pub qkv_bias: bool,
    pub tie_word_embeddings: bool,
    pub initializer_range: f64,
    pub rescale_prenorm_residual: bool,
    pub dtype: DType,
    pub device: Device,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32_000,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attn_heads: 12,
            num_fw_heads: 4,
            window_size: 2048,
            chunk_size: 2048,
            inter_multi: 1.0,
            hidden_ratio: 4.0,
            intermediate_size: None,
            norm_eps: 1e-6,
            fuse_norm: true,
            fuse_cross_entropy: true,
            gradient_recompute: false,
            use_momentum: false,
            fw_low_rank: 0,
            lr_parameterization: LrParameterization::Softplus,
            qkv_bias: false,
            tie_word_embeddings: false,
            initializer_range: 0.02,
            rescale_prenorm_residual: true,
            dtype: DType::BF16,
            device: Device::Cpu,
        }
    }
}

impl ModelConfig {
    /// Validates structural invariants before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_hidden_layers == 0 {
            return Err(Error::Msg(
                "num_hidden_layers must be greater than zero".into(),
            ));
        }
        if self.hidden_ratio <= 0.0 {
            return Err(Error::Msg("hidden_ratio must be positive".into()));
        }
        if self.initializer_range <= 0.0 {
            return Err(Error::Msg("initializer_range must be positive".into()));
        }
        if !matches!(self.dtype, DType::BF16 | DType::F16 | DType::F32) {
            return Err(Error::Msg(format!(
                "unsupported parameter dtype {:?}",
                self.dtype
            )));
        }
        self.mixer_config().validate()
    }

    /// Mixer geometry shared by every layer.
    pub fn mixer_config(&self) -> MixerConfig {
        MixerConfig {
            hidden_size: self.hidden_size,
            num_attn_heads: self.num_attn_heads,
            num_fw_heads: self.num_fw_heads,
            window_size: self.window_size,
            chunk_size: self.chunk_size,
            inter_multi: self.inter_multi,
            lr_parameterization: self.lr_parameterization,
            use_momentum: self.use_momentum,
            low_rank: self.fw_low_rank,
            qkv_bias: self.qkv_bias,
        }
    }

    /// MLP geometry shared by every layer.
    pub fn mlp_config(&self) -> GatedMlpConfig {
        match self.intermediate_size {
            Some(size) => GatedMlpConfig::new(self.hidden_size, size),
            None => GatedMlpConfig::with_hidden_ratio(self.hidden_size, self.hidden_ratio),
        }
    }

    /// Loads a configuration from a TOML or JSON file.
    ///
    /// Absent fields fall back to the defaults; device and dtype come from
    /// the `dtype` string field (`"bf16"`, `"f16"`, `"f32"`).
    pub fn from_path(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let file: ModelConfigFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| ConfigError::Format(err.to_string()))?,
            Some("toml") | Some("tml") | None => {
                toml::from_str(&contents).map_err(|err| ConfigError::Format(err.to_string()))?
            }
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };

        let config = file.into_config()?;
        config
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        Ok(config)
    }
}

/// Errors raised while loading a configuration file.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Format(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfigFile {
    vocab_size: Option<usize>,
    hidden_size: Option<usize>,
    num_hidden_layers: Option<usize>,
    num_attn_heads: Option<usize>,
    num_fw_heads: Option<usize>,
    window_size: Option<usize>,
    chunk_size: Option<usize>,
    inter_multi: Option<f64>,
    hidden_ratio: Option<f64>,
    intermediate_size: Option<usize>,
    norm_eps: Option<f64>,
    fuse_norm: Option<bool>,
    fuse_cross_entropy: Option<bool>,
    gradient_recompute: Option<bool>,
    use_momentum: Option<bool>,
    fw_low_rank: Option<usize>,
    lr_parameterization: Option<String>,
    qkv_bias: Option<bool>,
    tie_word_embeddings: Option<bool>,
    initializer_range: Option<f64>,
    rescale_prenorm_residual: Option<bool>,
    dtype: Option<String>,
}

impl ModelConfigFile {
    fn into_config(self) -> std::result::Result<ModelConfig, ConfigError> {
        let defaults = ModelConfig::default();
        let lr_parameterization = match self.lr_parameterization.as_deref() {
            None => defaults.lr_parameterization,
            Some("softplus") => LrParameterization::Softplus,
            Some("sigmoid") => LrParameterization::Sigmoid,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unknown lr parameterization '{other}'"
                )))
            }
        };
        let dtype = match self.dtype.as_deref() {
            None => defaults.dtype,
            Some("bf16") => DType::BF16,
            Some("f16") => DType::F16,
            Some("f32") => DType::F32,
            Some(other) => {
                return Err(ConfigError::Format(format!("unknown dtype '{other}'")))
            }
        };

        Ok(ModelConfig {
            vocab_size: self.vocab_size.unwrap_or(defaults.vocab_size),
            hidden_size: self.hidden_size.unwrap_or(defaults.hidden_size),
            num_hidden_layers: self
                .num_hidden_layers
                .unwrap_or(defaults.num_hidden_layers),
            num_attn_heads: self.num_attn_heads.unwrap_or(defaults.num_attn_heads),
            num_fw_heads: self.num_fw_heads.unwrap_or(defaults.num_fw_heads),
            window_size: self.window_size.unwrap_or(defaults.window_size),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            inter_multi: self.inter_multi.unwrap_or(defaults.inter_multi),
            hidden_ratio: self.hidden_ratio.unwrap_or(defaults.hidden_ratio),
            intermediate_size: self.intermediate_size.or(defaults.intermediate_size),
            norm_eps: self.norm_eps.unwrap_or(defaults.norm_eps),
            fuse_norm: self.fuse_norm.unwrap_or(defaults.fuse_norm),
            fuse_cross_entropy: self
                .fuse_cross_entropy
                .unwrap_or(defaults.fuse_cross_entropy),
            gradient_recompute: self
                .gradient_recompute
                .unwrap_or(defaults.gradient_recompute),
            use_momentum: self.use_momentum.unwrap_or(defaults.use_momentum),
            fw_low_rank: self.fw_low_rank.unwrap_or(defaults.fw_low_rank),
            lr_parameterization,
            qkv_bias: self.qkv_bias.unwrap_or(defaults.qkv_bias),
            tie_word_embeddings: self
                .tie_word_embeddings
                .unwrap_or(defaults.tie_word_embeddings),
            initializer_range: self
                .initializer_range
                .unwrap_or(defaults.initializer_range),
            rescale_prenorm_residual: self
                .rescale_prenorm_residual
                .unwrap_or(defaults.rescale_prenorm_residual),
            dtype,
            device: Device::Cpu,
        })
    }
}
