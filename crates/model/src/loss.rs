//! Shifted-label cross entropy over a large vocabulary, in three flavours.
//!
//! All three strategies implement the same mathematical loss and must agree
//! within floating tolerance; they differ in how much intermediate memory
//! they materialize. Loss inputs are always upcast to `f32` first —
//! cross entropy over a wide vocabulary is precision-sensitive and never
//! runs in the reduced boundary format.
//!
//! * `Standard` — full `log_softmax` over the flattened `(position, vocab)`
//!   pairs, gather, masked mean.
//! * `FusedSoftmax` — logits are still materialized, but the per-row loss is
//!   `logsumexp(row) - row[target]`, skipping the `(N, V)` log-probability
//!   intermediate.
//! * `FusedLinear` — the vocabulary projection is folded into the loss:
//!   hidden states are projected one row-chunk at a time, so full
//!   `(N, V)` logits never exist in memory. Training mode only.

use candle_core::{DType, Error, Result, Tensor, D};
use candle_nn::ops;

/// Sentinel marking positions excluded from the loss.
///
/// Targets are `u32`, so the excluded value sits beyond any vocabulary.
pub const IGNORE_INDEX: u32 = u32::MAX;

/// Rows projected per chunk by the linear-fused path.
const FUSED_LINEAR_CHUNK_ROWS: usize = 1024;

/// Loss strategy selected once per forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossStrategy {
    Standard,
    FusedSoftmax,
    FusedLinear,
}

impl LossStrategy {
    /// Selection rule: the linear-fused path requires training mode; the
    /// softmax-fused path covers fused inference; otherwise standard.
    pub fn select(fuse_cross_entropy: bool, training: bool) -> Self {
        if fuse_cross_entropy && training {
            LossStrategy::FusedLinear
        } else if fuse_cross_entropy {
            LossStrategy::FusedSoftmax
        } else {
            LossStrategy::Standard
        }
    }

    /// Whether this strategy consumes hidden states directly, never
    /// materializing logits.
    pub fn skips_logits(&self) -> bool {
        matches!(self, LossStrategy::FusedLinear)
    }
}

/// Shifts labels left by one position for next-token prediction.
///
/// For a row of length `L`, `out[i] = labels[i + 1]` for `i < L - 1` and
/// `out[L - 1] = IGNORE_INDEX`; the final position is never wrapped to the
/// start of the sequence.
pub fn shift_labels(labels: &Tensor) -> Result<Tensor> {
    let (batch, seq) = labels.dims2()?;
    if seq == 0 {
        return Err(Error::Msg("labels must have non-zero length".into()));
    }
    let labels = to_u32(labels)?;
    let fill = Tensor::full(IGNORE_INDEX, (batch, 1), labels.device())?;
    if seq == 1 {
        return Ok(fill);
    }
    let tail = labels.narrow(1, 1, seq - 1)?;
    Tensor::cat(&[&tail, &fill], 1)
}

/// The cross-entropy kernel shared by all three strategies.
#[derive(Debug, Clone)]
pub struct CrossEntropy {
    chunk_rows: usize,
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self {
            chunk_rows: FUSED_LINEAR_CHUNK_ROWS,
        }
    }
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the linear-fused row chunk (exercised by tests).
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Standard path: flattened log-softmax cross entropy with the ignore
    /// sentinel masked out of the mean.
    pub fn standard(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (logits, labels) = flatten_pair(logits, labels)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let (mask, total) = valid_mask(&labels)?;
        let nll = gather_neg(&log_probs, &labels, &mask)?;
        masked_mean(&nll, &mask, total)
    }

    /// Softmax-fused path: per-row `logsumexp - target`, no log-probability
    /// intermediate.
    pub fn fused_softmax(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (logits, labels) = flatten_pair(logits, labels)?;
        let (mask, total) = valid_mask(&labels)?;
        let nll = fused_row_loss(&logits, &labels, &mask)?;
        masked_mean(&nll, &mask, total)
    }

    /// Linear-fused path: consumes `f32` hidden states `(batch, seq, hidden)`
    /// (or already flattened `(rows, hidden)`), the `f32` projection weight
    /// `(vocab, hidden)`, and shifted labels. Full logits are never
    /// materialized; rows are projected chunk by chunk.
    pub fn fused_linear(
        &self,
        hidden: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        labels: &Tensor,
    ) -> Result<Tensor> {
        let hidden = flatten_rows(hidden)?;
        let (rows, hidden_dim) = hidden.dims2()?;
        let labels = to_u32(labels)?.reshape((rows,))?;
        if weight.dims().len() != 2 || weight.dims()[1] != hidden_dim {
            return Err(Error::Msg(format!(
                "projection weight expected (vocab, {hidden_dim}), got {:?}",
                weight.dims()
            )));
        }
        if hidden.dtype() != DType::F32 || weight.dtype() != DType::F32 {
            return Err(Error::Msg(
                "linear-fused loss requires f32 hidden states and weight".into(),
            ));
        }

        let weight_t = weight.t()?;
        let (mask, total) = valid_mask(&labels)?;

        let mut loss_sum: Option<Tensor> = None;
        let mut offset = 0;
        while offset < rows {
            let len = self.chunk_rows.min(rows - offset);
            let hidden_chunk = hidden.narrow(0, offset, len)?;
            let labels_chunk = labels.narrow(0, offset, len)?;
            let mask_chunk = mask.narrow(0, offset, len)?;

            let mut logits_chunk = hidden_chunk.matmul(&weight_t)?;
            if let Some(bias) = bias {
                logits_chunk = logits_chunk.broadcast_add(bias)?;
            }
            let nll = fused_row_loss(&logits_chunk, &labels_chunk, &mask_chunk)?;
            let chunk_sum = nll.mul(&mask_chunk)?.sum_all()?;
            loss_sum = Some(match loss_sum {
                Some(acc) => acc.add(&chunk_sum)?,
                None => chunk_sum,
            });
            offset += len;
        }

        let loss_sum =
            loss_sum.ok_or_else(|| Error::Msg("no tokens available for loss".into()))?;
        if total == 0 {
            return Err(Error::Msg(
                "no valid tokens remain after label shifting".into(),
            ));
        }
        loss_sum.affine(1.0 / total as f64, 0.0)
    }
}

/// Per-row `logsumexp(logits) - logits[target]`, with ignored rows clamped
/// to a safe gather index.
fn fused_row_loss(logits: &Tensor, labels: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let lse = logsumexp(logits)?;
    let safe = labels.mul(&mask.to_dtype(DType::U32)?)?;
    let target = logits.gather(&safe.unsqueeze(1)?, 1)?.squeeze(1)?;
    lse.sub(&target)
}

fn gather_neg(log_probs: &Tensor, labels: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let safe = labels.mul(&mask.to_dtype(DType::U32)?)?;
    log_probs
        .gather(&safe.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()
}

/// Numerically stable `log(sum(exp(row)))` per row.
fn logsumexp(logits: &Tensor) -> Result<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?;
    let shifted = logits.broadcast_sub(&max)?;
    let summed = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    summed.add(&max)?.squeeze(1)
}

/// Flattens logits/labels to `(rows, vocab)` / `(rows,)` and upcasts logits
/// to `f32`.
fn flatten_pair(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let dims = logits.dims();
    let vocab = *dims
        .last()
        .ok_or_else(|| Error::Msg("logits tensor missing vocabulary dimension".into()))?;
    let rows: usize = dims[..dims.len() - 1].iter().product();
    if rows == 0 || vocab == 0 {
        return Err(Error::Msg("no tokens available for loss".into()));
    }
    let labels = to_u32(labels)?.reshape((rows,))?;
    let logits = logits.reshape((rows, vocab))?.to_dtype(DType::F32)?;
    Ok((logits, labels))
}

fn flatten_rows(hidden: &Tensor) -> Result<Tensor> {
    match hidden.dims() {
        [batch, seq, dim] => hidden.reshape((batch * seq, *dim)),
        [_, _] => Ok(hidden.clone()),
        dims => Err(Error::Msg(format!(
            "hidden states expected rank 2 or 3, got {:?}",
            dims
        ))),
    }
}

fn to_u32(labels: &Tensor) -> Result<Tensor> {
    match labels.dtype() {
        DType::U32 => Ok(labels.clone()),
        DType::I64 | DType::U8 => labels.to_dtype(DType::U32),
        dtype => Err(Error::Msg(format!(
            "unsupported label dtype {:?} for cross entropy",
            dtype
        ))),
    }
}

/// `f32` keep-mask over non-ignored rows plus the count of valid rows.
fn valid_mask(labels: &Tensor) -> Result<(Tensor, usize)> {
    let mask = labels.ne(IGNORE_INDEX)?.to_dtype(DType::F32)?;
    let total = mask.sum_all()?.to_vec0::<f32>()?.round() as usize;
    Ok((mask, total))
}

fn masked_mean(nll: &Tensor, mask: &Tensor, total: usize) -> Result<Tensor> {
    if total == 0 {
        return Err(Error::Msg(
            "no valid tokens remain after label shifting".into(),
        ));
    }
    let weighted = nll.mul(mask)?;
    weighted.sum_all()?.affine(1.0 / total as f64, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample_logits(rows: usize, vocab: usize) -> Result<Tensor> {
        let data = (0..rows * vocab)
            .map(|i| ((i * 13 % 23) as f32 - 11.0) * 0.3)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (rows, vocab), &Device::Cpu)
    }

    #[test]
    fn shift_moves_every_label_left_and_ignores_the_tail() -> Result<()> {
        let labels = Tensor::from_slice(&[1u32, 2, 3, 4, 5], (1, 5), &Device::Cpu)?;
        let shifted = shift_labels(&labels)?;
        let values = shifted.to_vec2::<u32>()?;
        assert_eq!(values[0][..4], [2, 3, 4, 5]);
        assert_eq!(values[0][4], IGNORE_INDEX);
        Ok(())
    }

    #[test]
    fn shift_of_single_position_row_is_fully_ignored() -> Result<()> {
        let labels = Tensor::from_slice(&[9u32], (1, 1), &Device::Cpu)?;
        let shifted = shift_labels(&labels)?;
        assert_eq!(shifted.to_vec2::<u32>()?[0], [IGNORE_INDEX]);
        Ok(())
    }

    #[test]
    fn strategy_selection_is_fixed_by_config_and_mode() {
        assert_eq!(LossStrategy::select(true, true), LossStrategy::FusedLinear);
        assert_eq!(LossStrategy::select(true, false), LossStrategy::FusedSoftmax);
        assert_eq!(LossStrategy::select(false, true), LossStrategy::Standard);
        assert_eq!(LossStrategy::select(false, false), LossStrategy::Standard);
        assert!(LossStrategy::FusedLinear.skips_logits());
        assert!(!LossStrategy::FusedSoftmax.skips_logits());
    }

    #[test]
    fn standard_and_fused_softmax_agree() -> Result<()> {
        let logits = sample_logits(6, 16)?;
        let labels = Tensor::from_slice(
            &[3u32, 0, 15, IGNORE_INDEX, 7, IGNORE_INDEX],
            (6,),
            &Device::Cpu,
        )?;
        let criterion = CrossEntropy::new();
        let standard = criterion.standard(&logits, &labels)?.to_vec0::<f32>()?;
        let fused = criterion
            .fused_softmax(&logits, &labels)?
            .to_vec0::<f32>()?;
        assert!((standard - fused).abs() < 1e-5, "{standard} vs {fused}");
        assert!(standard.is_finite() && standard >= 0.0);
        Ok(())
    }

    #[test]
    fn linear_fused_matches_standard_on_identical_inputs() -> Result<()> {
        let device = Device::Cpu;
        let hidden = Tensor::from_vec(
            (0..5 * 4)
                .map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.2)
                .collect::<Vec<_>>(),
            (5, 4),
            &device,
        )?;
        let weight = Tensor::from_vec(
            (0..16 * 4)
                .map(|i| ((i * 3 % 13) as f32 - 6.0) * 0.1)
                .collect::<Vec<_>>(),
            (16, 4),
            &device,
        )?;
        let labels = Tensor::from_slice(&[2u32, 9, IGNORE_INDEX, 0, 14], (5,), &device)?;

        // Chunk smaller than the row count so accumulation is exercised.
        let criterion = CrossEntropy::new().with_chunk_rows(2);
        let fused = criterion
            .fused_linear(&hidden, &weight, None, &labels)?
            .to_vec0::<f32>()?;

        let logits = hidden.matmul(&weight.t()?)?;
        let standard = criterion.standard(&logits, &labels)?.to_vec0::<f32>()?;
        assert!((fused - standard).abs() < 1e-5, "{fused} vs {standard}");
        Ok(())
    }

    #[test]
    fn fully_ignored_labels_are_rejected() -> Result<()> {
        let logits = sample_logits(2, 8)?;
        let labels = Tensor::from_slice(&[IGNORE_INDEX, IGNORE_INDEX], (2,), &Device::Cpu)?;
        let criterion = CrossEntropy::new();
        assert!(criterion.standard(&logits, &labels).is_err());
        assert!(criterion.fused_softmax(&logits, &labels).is_err());
        Ok(())
    }

    #[test]
    fn ignored_positions_do_not_contribute() -> Result<()> {
        let logits = sample_logits(3, 8)?;
        let labels_full = Tensor::from_slice(&[1u32, 2, IGNORE_INDEX], (3,), &Device::Cpu)?;
        let labels_pair = Tensor::from_slice(&[1u32, 2], (2,), &Device::Cpu)?;
        let logits_pair = logits.narrow(0, 0, 2)?;

        let criterion = CrossEntropy::new();
        let with_ignored = criterion
            .standard(&logits, &labels_full)?
            .to_vec0::<f32>()?;
        let without = criterion
            .standard(&logits_pair, &labels_pair)?
            .to_vec0::<f32>()?;
        assert!((with_ignored - without).abs() < 1e-6);
        Ok(())
    }
}
