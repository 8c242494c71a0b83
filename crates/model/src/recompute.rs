//! Gradient-recompute bookkeeping for the stack.
//!
//! When the recompute policy is active during a training pass, each block's
//! forward segment runs on a detached copy of its true input, so no
//! activation graph is retained between segments. The ledger records those
//! inputs (and the produced outputs) per segment; during the backward pass
//! the owning stack re-executes a segment from its recorded input and must
//! reproduce the stored output bit for bit — the mixer contract guarantees
//! that replay with identical inputs has no hidden side effects.

use candle_core::Tensor;

/// One recomputable block segment: the layer it belongs to, the detached
/// true input, and the output produced during the forward pass.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    layer: usize,
    input: Tensor,
    output: Tensor,
}

impl SegmentRecord {
    /// Records a segment. Inputs must already be detached by the caller.
    pub fn new(layer: usize, input: Tensor, output: Tensor) -> Self {
        Self {
            layer,
            input,
            output,
        }
    }

    /// Index of the block this segment replays through.
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// The segment's true input.
    pub fn input(&self) -> &Tensor {
        &self.input
    }

    /// The output produced during the forward pass.
    pub fn output(&self) -> &Tensor {
        &self.output
    }
}

/// Ordered collection of segment records for one forward pass.
#[derive(Debug, Default)]
pub struct RecomputeLedger {
    segments: Vec<SegmentRecord>,
}

impl RecomputeLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment record in layer order.
    pub fn push(&mut self, record: SegmentRecord) {
        self.segments.push(record);
    }

    /// Number of recorded segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether any segment was recorded.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterates segments in the order they executed.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.segments.iter()
    }

    /// Borrows one segment record.
    pub fn get(&self, index: usize) -> Option<&SegmentRecord> {
        self.segments.get(index)
    }
}
