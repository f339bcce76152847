//! Causal attention masks
//!
//! A patching sweep runs hundreds of passes over the same destination
//! prompt, so each model keeps its masks cached by `(seq_len, dtype)`.
//! Cached tensors are handed out as shallow clones.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Per-model cache of causal masks
#[derive(Debug, Default)]
pub struct MaskCache {
    masks: Mutex<HashMap<(usize, DType), Tensor>>,
}

impl MaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Causal mask of shape `[1, 1, seq_len, seq_len]`
    ///
    /// `0.0` where position `j <= i` may be attended, `-inf` elsewhere:
    /// ```text
    /// [[[[0, -inf, -inf],
    ///    [0,    0, -inf],
    ///    [0,    0,    0]]]]
    /// ```
    pub fn causal(&self, seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let key = (seq_len, dtype);
        if let Some(cached) = self.lock().get(&key) {
            return Ok(cached.clone());
        }

        let mask = create_causal_mask(seq_len, device, dtype)?;
        self.lock().insert(key, mask.clone());
        Ok(mask)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(usize, DType), Tensor>> {
        self.masks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build an uncached causal mask
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}
