//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return
//! tensors with `(batch, seq, out_dim)`; two-dimensional inputs are also
//! accepted for flattened loss paths. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for matmuls and back to the storage dtype on
//! the way out. Initialisation policies cover the zero-mean normal draw used
//! by embedding and projection weights plus the scaled Kaiming variant used
//! for residual-path stabilisation in deep stacks.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a bias-free projection layer.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    /// Enables the bias vector.
    pub fn with_bias(mut self) -> Self {
        self.bias = true;
        self
    }
}

/// Supported weight initialisation policies for projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Zero-mean normal draw with the given standard deviation.
    Normal { std: f64 },
    /// Kaiming/He uniform initialisation (defaults to ReLU gain).
    KaimingUniform { negative_slope: f64 },
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    /// Samples a weight tensor of the given `(out, in)` shape.
    pub fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (_, in_dim) = shape;
        let fan_in = in_dim as f64;
        let weight_f32 = match self {
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                let sampled = base.sample(shape, device, DType::F32)?;
                let scale_tensor = Tensor::full(*scale as f32, (), device)?;
                sampled.broadcast_mul(&scale_tensor)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Arc<Mutex<Tensor>>,
    bias: Option<Arc<Mutex<Tensor>>>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Arc::new(Mutex::new(weight)),
            bias: bias.map(|b| Arc::new(Mutex::new(b))),
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    ///
    /// Bias vectors always start at zero.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Creates a new `Linear` that shares the weight storage with `source`.
    pub fn tied(config: LinearConfig, source: &Linear) -> Result<Self> {
        if config.input_dim != source.config.input_dim
            || config.output_dim != source.config.output_dim
        {
            return Err(Error::Msg(
                "tied linear requires matching input/output dimensions".into(),
            ));
        }
        if config.bias != source.config.bias {
            return Err(Error::Msg(
                "tied linears must agree on bias usage to share storage".into(),
            ));
        }
        Ok(Self {
            config,
            weight: source.weight.clone(),
            bias: source.bias.as_ref().map(Arc::clone),
        })
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.lock().unwrap().clone()
    }

    /// Returns a clone of the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.as_ref().map(|bias| bias.lock().unwrap().clone())
    }

    /// Copies `value` into the shared weight storage.
    pub fn copy_weight_from(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        let mut weight = self.weight.lock().unwrap();
        let cast = value.to_dtype(weight.dtype())?;
        *weight = cast;
        Ok(())
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("linear.weight", weight)?;
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        let dims = hidden.dims();
        match dims {
            [_, _, hidden_dim] | [_, hidden_dim] => {
                if *hidden_dim != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "linear expected last dim {} but received {}",
                        self.config.input_dim, hidden_dim
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Err(Error::Msg(
                "linear expects input shaped [B, T, H_in] or [T, H_in]".into(),
            )),
        }
    }

    /// Applies the linear projection, promoting to the compute dtype when needed.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = {
            let guard = self.weight.lock().unwrap();
            policy.cast_for_matmul(&guard)?
        };
        let weight_t = weight.t()?;
        let dims = input.dims();

        let mut output = match dims {
            [batch, seq, _] => {
                let flat = input.reshape((*batch * *seq, self.config.input_dim))?;
                let proj = flat.matmul(&weight_t)?;
                proj.reshape((*batch, *seq, self.config.output_dim))?
            }
            [rows, _] => input
                .matmul(&weight_t)?
                .reshape((*rows, self.config.output_dim))?,
            _ => unreachable!("validated above"),
        };

        if let Some(bias) = &self.bias {
            let bias = {
                let guard = bias.lock().unwrap();
                policy.cast_for_matmul(&guard)?
            };
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}
