//! Causal effect metrics over final-position logits

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::error::PatchError;

/// Default stabilizer for [`normalized_effect`]
pub const EPS: f32 = 1e-6;

/// How far a patched run moved from the destination baseline toward the source
///
/// `0` means indistinguishable from the destination, `1` means the source
/// behaviour is fully recovered. When source and destination already
/// agree and the patch changes nothing the run reproduces the source
/// exactly, so the effect is reported as `1`.
pub fn normalized_effect(source_diff: f32, dest_diff: f32, patched_diff: f32, eps: f32) -> f32 {
    let baseline_gap = source_diff - dest_diff;
    let moved = patched_diff - dest_diff;
    if baseline_gap.abs() < eps && moved.abs() < eps {
        return 1.0;
    }
    moved / (baseline_gap + eps)
}

/// `logits[correct] - logits[incorrect]` for a `[vocab]` logit vector
pub fn logit_diff(logits: &Tensor, correct_id: u32, incorrect_id: u32) -> Result<f32> {
    let values = to_vec(logits)?;
    let correct = lookup(&values, correct_id)?;
    let incorrect = lookup(&values, incorrect_id)?;
    Ok(correct - incorrect)
}

/// `softmax(logits)[correct]` for a `[vocab]` logit vector
pub fn raw_probability(logits: &Tensor, correct_id: u32) -> Result<f32> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    lookup(&to_vec(&probs)?, correct_id)
}

/// Check token ids against the vocabulary before running any pass
pub fn check_ids(vocab_size: usize, ids: &[u32]) -> Result<(), PatchError> {
    match ids.iter().find(|&&id| id as usize >= vocab_size) {
        Some(id) => Err(PatchError::validation(format!(
            "token id {id} is outside the vocabulary ({vocab_size} entries)"
        ))),
        None => Ok(()),
    }
}

fn to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    Ok(logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

fn lookup(values: &[f32], id: u32) -> Result<f32> {
    values
        .get(id as usize)
        .copied()
        .ok_or_else(|| PatchError::validation(format!("token id {id} is outside the vocabulary")).into())
}
