//! Activation cache for source-run snapshots
//!
//! Filled during the source phase of a patching run and read back during
//! the sweep. One cache belongs to exactly one engine invocation.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use crate::hooks::HookPoint;

/// Sub-index of a cached activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The whole `[seq, width]` activation
    Whole,
    /// One position's `[width]` row
    Position(usize),
    /// One head's `[seq, head_dim]` slice
    Head(usize),
    /// Value feeding the k-th connection
    Connection(usize),
}

/// Snapshots keyed by `(hook point, slot)`
#[derive(Debug, Default)]
pub struct ActivationCache {
    entries: HashMap<(HookPoint, Slot), Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache sized for `n` entries
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(n),
        }
    }

    /// Store a snapshot. Capturing the same key twice keeps the latest value.
    pub fn capture(&mut self, point: HookPoint, slot: Slot, tensor: Tensor) {
        self.entries.insert((point, slot), tensor);
    }

    /// Read a snapshot captured earlier in the run
    pub fn fetch(&self, point: HookPoint, slot: Slot) -> Result<&Tensor> {
        self.entries
            .get(&(point, slot))
            .ok_or_else(|| anyhow::anyhow!("{point} {slot:?} not in cache"))
    }

    pub fn contains(&self, point: HookPoint, slot: Slot) -> bool {
        self.entries.contains_key(&(point, slot))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Row `position` of a `[seq, width]` activation
pub fn position_slice(activation: &Tensor, position: usize) -> Result<Tensor> {
    let seq_len = activation.dim(0)?;
    anyhow::ensure!(
        position < seq_len,
        "Position {position} out of range (seq_len={seq_len})"
    );
    Ok(activation.i(position)?)
}

/// Head `head` of a `[seq, n_heads * head_dim]` activation, shape `[seq, head_dim]`
pub fn head_slice(activation: &Tensor, head: usize, n_heads: usize) -> Result<Tensor> {
    let (seq_len, width) = activation.dims2()?;
    anyhow::ensure!(head < n_heads, "Head {head} out of range (n_heads={n_heads})");
    anyhow::ensure!(
        width % n_heads == 0,
        "Width {width} not divisible by {n_heads} heads"
    );
    let per_head = activation.reshape((seq_len, n_heads, width / n_heads))?;
    Ok(per_head.i((.., head, ..))?.contiguous()?)
}
