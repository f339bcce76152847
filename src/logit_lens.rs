//! Logit Lens: what each layer would predict
//!
//! Projects the residual stream after every layer through the final norm
//! and unembedding. The grid view reports the top prediction per layer and
//! position; the line view tracks chosen target tokens at one position.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};

use crate::error::PatchError;
use crate::hooks::{HookPoint, HookSpec};
use crate::jobs::Progress;
use crate::metric::check_ids;
use crate::model::PatchModel;
use crate::schema::{GridCell, GridLensResponse, GridRow, Line, LineLensResponse, LinePoint, Token};

/// Row-wise softmax of `[seq, vocab]` logits
pub fn softmax_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    Ok(probs.to_vec2()?)
}

/// Index and value of the largest probability
pub fn argmax(probs: &[f32]) -> Option<(u32, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, p)| (i as u32, p))
}

/// Ids sorted by descending probability
pub fn sorted_distribution(probs: &[f32]) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = probs
        .iter()
        .copied()
        .enumerate()
        .map(|(i, p)| (i as u32, p))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
}

pub struct LogitLens<'m> {
    model: &'m PatchModel,
}

impl<'m> LogitLens<'m> {
    pub fn new(model: &'m PatchModel) -> Self {
        Self { model }
    }

    /// Per-layer `[seq, vocab]` probabilities; the last layer uses the final logits
    fn layer_probs(&self, input_ids: &[u32], include_last_lens: bool) -> Result<Vec<Vec<Vec<f32>>>> {
        let n_layers = self.model.n_layers();
        let lens_layers = if include_last_lens {
            n_layers
        } else {
            n_layers.saturating_sub(1)
        };

        let mut hooks = HookSpec::new();
        for layer in 0..lens_layers {
            hooks.capture(HookPoint::Lens(layer));
        }
        let output = self.model.trace(input_ids, &hooks)?;

        let mut layers = Vec::with_capacity(n_layers);
        for layer in 0..lens_layers {
            layers.push(softmax_rows(output.require(&HookPoint::Lens(layer))?)?);
        }
        if !include_last_lens {
            layers.push(softmax_rows(&output.logits)?);
        }
        Ok(layers)
    }

    /// Top prediction and its probability for every `(position, layer)`
    pub fn grid(&self, prompt: &str, progress: &dyn Progress) -> Result<GridLensResponse> {
        let input_ids = self.model.encode(prompt).context("encoding lens prompt")?;
        let input_strs = self.model.batch_decode(&input_ids)?;

        progress.status("Decoding layers");
        let layers = self.layer_probs(&input_ids, false)?;
        progress.checkpoint()?;

        let mut rows = Vec::with_capacity(input_ids.len());
        for (seq_idx, input_str) in input_strs.iter().enumerate() {
            let mut data = Vec::with_capacity(layers.len());
            for (layer_idx, probs) in layers.iter().enumerate() {
                let (pred_id, prob) = argmax(&probs[seq_idx])
                    .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
                data.push(GridCell {
                    x: layer_idx,
                    y: prob,
                    label: self.model.decode(&[pred_id])?,
                });
            }
            // The position suffix keeps repeated tokens apart
            rows.push(GridRow {
                id: format!("{input_str}-{seq_idx}"),
                data,
            });
        }

        Ok(GridLensResponse { rows })
    }

    /// Probability of each target id at `token.idx`, across layers
    pub fn line(&self, prompt: &str, token: &Token, progress: &dyn Progress) -> Result<LineLensResponse> {
        anyhow::ensure!(
            !token.target_ids.is_empty(),
            PatchError::validation("token has no target ids to track")
        );
        check_ids(self.model.vocab_size(), &token.target_ids)?;

        let input_ids = self.model.encode(prompt).context("encoding lens prompt")?;
        if token.idx >= input_ids.len() {
            return Err(PatchError::validation(format!(
                "token index {} out of range for a prompt of {} tokens",
                token.idx,
                input_ids.len()
            ))
            .into());
        }

        progress.status("Decoding layers");
        let layers = self.layer_probs(&input_ids, true)?;
        progress.checkpoint()?;

        let names = self.model.batch_decode(&token.target_ids)?;
        let lines = names
            .iter()
            .zip(&token.target_ids)
            .map(|(name, &target)| Line {
                id: name.replace(' ', "_"),
                data: layers
                    .iter()
                    .enumerate()
                    .map(|(layer_idx, probs)| LinePoint {
                        x: layer_idx,
                        y: probs[token.idx][target as usize],
                    })
                    .collect(),
            })
            .collect();

        Ok(LineLensResponse { lines })
    }
}
