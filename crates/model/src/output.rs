//! Output records handed back by the stack and the head.
//!
//! Records are freshly constructed per call and never alias their inputs
//! beyond deliberately passed-through decode state.

use candle_core::Tensor;
use mixer::StateCache;

use crate::recompute::RecomputeLedger;

/// Result of a stack forward pass.
#[derive(Debug)]
pub struct StackOutput {
    /// Final hidden states, `(batch, seq, hidden)` in the boundary dtype.
    pub last_hidden_state: Tensor,
    /// Updated decode state; present only when caching was requested.
    pub state: Option<StateCache>,
    /// Pre-block snapshots in layer order, plus the post-norm final state.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Per-layer attention weights; always `None` in this configuration.
    pub attentions: Option<Vec<Tensor>>,
    /// Per-segment replay records; present only when recompute was active.
    pub recompute: Option<RecomputeLedger>,
}

/// Result of a causal-LM forward pass.
#[derive(Debug)]
pub struct CausalLmOutput {
    /// Scalar loss; present when labels were supplied.
    pub loss: Option<Tensor>,
    /// Vocabulary logits; absent when the linear-fused loss path is active.
    pub logits: Option<Tensor>,
    /// Updated decode state; present only when caching was requested.
    pub state: Option<StateCache>,
    /// Hidden-state snapshots forwarded from the stack.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Per-layer attention weights; always `None` in this configuration.
    pub attentions: Option<Vec<Tensor>>,
}
