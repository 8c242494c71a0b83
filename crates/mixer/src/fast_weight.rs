//! Fast-weight parameter containers and their initialization rules.
//!
//! Each layer carries a SwiGLU-shaped fast-weight function per head:
//! `f(x) = (silu(w0 x) * (w2 x)) w1`. The parameters here are the *initial*
//! weights; at session start they are broadcast into the per-sequence
//! [`FastWeightState`](crate::state::FastWeightState) and updated online
//! from there. Parameters and state stay in `f32`.

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::ops;

use crate::state::FastWeightState;

/// Initial value for update-rate parameters; both parameterizations map it
/// to a rate of roughly 1e-2.
const LR_PARAM_INIT: f32 = -4.6;

/// How learnable update-rate parameters are mapped to positive rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrParameterization {
    /// `softplus(p)`.
    Softplus,
    /// `sigmoid(p)`.
    Sigmoid,
}

impl LrParameterization {
    /// Maps raw parameters to positive rates.
    pub fn rate(&self, param: &Tensor) -> Result<Tensor> {
        match self {
            LrParameterization::Softplus => param.exp()?.affine(1.0, 1.0)?.log(),
            LrParameterization::Sigmoid => ops::sigmoid(param),
        }
    }
}

/// Low-rank factorization of an initial fast-weight matrix.
///
/// `materialize()` produces the full `(heads, out_dim, in_dim)` matrix at
/// session start; the factor pair owns its initializer.
#[derive(Debug, Clone)]
pub struct LowRankFastWeight {
    left: Tensor,
    right: Tensor,
}

impl LowRankFastWeight {
    /// Samples both factors from `N(0, 1/sqrt(rank))`.
    pub fn init(
        heads: usize,
        out_dim: usize,
        in_dim: usize,
        rank: usize,
        device: &Device,
    ) -> Result<Self> {
        if rank == 0 {
            bail!("low-rank fast weight requires rank > 0");
        }
        let std = 1.0 / (rank as f32).sqrt();
        Ok(Self {
            left: Tensor::randn(0f32, std, (heads, out_dim, rank), device)?,
            right: Tensor::randn(0f32, std, (heads, rank, in_dim), device)?,
        })
    }

    /// Expands the factor pair to the full matrix.
    pub fn materialize(&self) -> Result<Tensor> {
        self.left.matmul(&self.right)
    }
}

enum InitialWeight {
    Full(Tensor),
    LowRank(LowRankFastWeight),
}

impl InitialWeight {
    fn materialize(&self) -> Result<Tensor> {
        match self {
            InitialWeight::Full(tensor) => Ok(tensor.clone()),
            InitialWeight::LowRank(pair) => pair.materialize(),
        }
    }
}

/// Per-layer fast-weight parameters: the three SwiGLU matrices and the
/// per-head update-rate parameters.
pub struct FastWeights {
    num_heads: usize,
    head_dim: usize,
    inter_dim: usize,
    w0: InitialWeight,
    w1: Tensor,
    w2: InitialWeight,
    lr_param: Tensor,
}

impl FastWeights {
    /// Initializes the fast-weight parameters.
    ///
    /// Unfactored `w0`/`w2` draw from `N(0, 1/sqrt(head_dim))` (their
    /// fan-in); `w1` draws from `N(0, 1/sqrt(inter_dim))`. With `rank > 0`
    /// the `w0`/`w2` initialization is delegated to [`LowRankFastWeight`].
    pub fn init(
        num_heads: usize,
        head_dim: usize,
        inter_dim: usize,
        rank: usize,
        device: &Device,
    ) -> Result<Self> {
        let make = |out_dim: usize, in_dim: usize| -> Result<InitialWeight> {
            if rank > 0 {
                Ok(InitialWeight::LowRank(LowRankFastWeight::init(
                    num_heads, out_dim, in_dim, rank, device,
                )?))
            } else {
                let std = 1.0 / (in_dim as f32).sqrt();
                Ok(InitialWeight::Full(Tensor::randn(
                    0f32,
                    std,
                    (num_heads, out_dim, in_dim),
                    device,
                )?))
            }
        };

        let w0 = make(inter_dim, head_dim)?;
        let w2 = make(inter_dim, head_dim)?;
        let w1_std = 1.0 / (inter_dim as f32).sqrt();
        let w1 = Tensor::randn(0f32, w1_std, (num_heads, head_dim, inter_dim), device)?;
        let lr_param = Tensor::full(LR_PARAM_INIT, (num_heads, 3), device)?;

        Ok(Self {
            num_heads,
            head_dim,
            inter_dim,
            w0,
            w1,
            w2,
            lr_param,
        })
    }

    /// Number of fast-weight heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head input/output dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Intermediate width of the fast-weight function.
    pub fn inter_dim(&self) -> usize {
        self.inter_dim
    }

    /// Materializes the session-start state for a batch, broadcasting the
    /// initial matrices to one copy per sequence.
    pub fn start_state(&self, batch: usize, with_momentum: bool) -> Result<FastWeightState> {
        let expand = |weight: &Tensor| -> Result<Tensor> {
            let dims = weight.dims();
            weight
                .unsqueeze(0)?
                .expand((batch, dims[0], dims[1], dims[2]))?
                .contiguous()
        };

        let w0 = expand(&self.w0.materialize()?)?;
        let w1 = expand(&self.w1)?;
        let w2 = expand(&self.w2.materialize()?)?;
        let momentum = if with_momentum {
            Some((w0.zeros_like()?, w1.zeros_like()?, w2.zeros_like()?))
        } else {
            None
        };

        Ok(FastWeightState {
            w0,
            w1,
            w2,
            momentum,
        })
    }

    /// Per-head update rates for `(w0, w1, w2)`, shaped `(1, heads, 1, 1)`
    /// for broadcasting against the state matrices.
    pub fn rates(
        &self,
        parameterization: LrParameterization,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let rates = parameterization.rate(&self.lr_param)?;
        let pick = |idx: usize| -> Result<Tensor> {
            rates
                .narrow(1, idx, 1)?
                .reshape((1, self.num_heads, 1, 1))
        };
        Ok((pick(0)?, pick(1)?, pick(2)?))
    }
}

impl std::fmt::Debug for FastWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastWeights")
            .field("num_heads", &self.num_heads)
            .field("head_dim", &self.head_dim)
            .field("inter_dim", &self.inter_dim)
            .finish()
    }
}
