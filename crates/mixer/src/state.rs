//! Per-layer decode state and the layer-indexed state collection.
//!
//! The stack owns one [`StateCache`] per generation session; each entry is
//! the opaque state of the mixer at that layer position. Entries are indexed
//! by layer, created empty at session start, and written back in layer order
//! on every call. The collection never reorders, drops, or duplicates
//! entries: its length always equals the configured depth.

use candle_core::{Error, Result, Tensor};

/// Fast-weight matrices carried across decode steps, one set per head.
///
/// All tensors are `(batch, heads, ..)` in `f32`; updates happen in full
/// precision regardless of the block-boundary storage format.
#[derive(Debug, Clone)]
pub struct FastWeightState {
    pub(crate) w0: Tensor,
    pub(crate) w1: Tensor,
    pub(crate) w2: Tensor,
    pub(crate) momentum: Option<(Tensor, Tensor, Tensor)>,
}

/// Opaque per-layer decode state: windowed key/value history plus the
/// current fast weights.
#[derive(Debug, Clone, Default)]
pub struct LayerState {
    pub(crate) window: Option<(Tensor, Tensor)>,
    pub(crate) fast: Option<FastWeightState>,
    pub(crate) seen: usize,
}

impl LayerState {
    /// Start-of-session state: no history, fast weights not yet materialized.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the state has observed any tokens.
    pub fn is_empty(&self) -> bool {
        self.seen == 0
    }

    /// Number of tokens this layer has processed in the session.
    pub fn seen_tokens(&self) -> usize {
        self.seen
    }

    /// Length of the cached attention window.
    pub fn window_len(&self) -> usize {
        self.window
            .as_ref()
            .map(|(keys, _)| keys.dims()[2])
            .unwrap_or(0)
    }
}

/// Fixed-length, layer-indexed collection of decode states.
#[derive(Debug, Clone)]
pub struct StateCache {
    layers: Vec<Option<LayerState>>,
}

impl StateCache {
    /// Creates a collection with one empty entry per layer.
    pub fn empty(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| Some(LayerState::empty())).collect(),
        }
    }

    /// Number of layer slots; always equals the configured depth.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer has observed any tokens yet.
    pub fn is_empty(&self) -> bool {
        self.layers
            .iter()
            .all(|entry| entry.as_ref().map(LayerState::is_empty).unwrap_or(true))
    }

    /// Tokens seen by the first layer; every layer advances in lockstep.
    pub fn seen_tokens(&self) -> usize {
        self.layers
            .first()
            .and_then(|entry| entry.as_ref())
            .map(LayerState::seen_tokens)
            .unwrap_or(0)
    }

    /// Removes and returns the state for `layer`, leaving the slot in place.
    pub fn take(&mut self, layer: usize) -> Result<Option<LayerState>> {
        let slot = self.slot_mut(layer)?;
        Ok(slot.take())
    }

    /// Writes the state for `layer` back into its slot.
    pub fn put(&mut self, layer: usize, state: Option<LayerState>) -> Result<()> {
        let slot = self.slot_mut(layer)?;
        *slot = state;
        Ok(())
    }

    /// Borrows the state for `layer` without moving it.
    pub fn get(&self, layer: usize) -> Result<Option<&LayerState>> {
        self.layers
            .get(layer)
            .map(Option::as_ref)
            .ok_or_else(|| out_of_range(layer, self.layers.len()))
    }

    fn slot_mut(&mut self, layer: usize) -> Result<&mut Option<LayerState>> {
        let len = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or_else(|| out_of_range(layer, len))
    }
}

fn out_of_range(layer: usize, len: usize) -> Error {
    Error::Msg(format!(
        "layer index {layer} out of range for state cache of depth {len}"
    ))
}
