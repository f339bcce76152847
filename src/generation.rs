//! Text generation and next-token prediction
//!
//! Generation recomputes the full forward pass for every new token. The
//! service generates short continuations for inspection, so there is no
//! KV cache to keep in sync with hooks.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::Rng;
use tracing::debug;

use crate::error::PatchError;
use crate::hooks::HookSpec;
use crate::jobs::Progress;
use crate::logit_lens::{softmax_rows, sorted_distribution};
use crate::model::PatchModel;
use crate::schema::{GenerationRequest, GenerationResponse, Prediction, Token};

/// Upper bound on `maxNewTokens` per request
pub const MAX_NEW_TOKENS: usize = 256;

pub struct Generator<'m> {
    model: &'m PatchModel,
}

impl<'m> Generator<'m> {
    pub fn new(model: &'m PatchModel) -> Self {
        Self { model }
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
        progress: &dyn Progress,
    ) -> Result<GenerationResponse> {
        if request.max_new_tokens == 0 || request.max_new_tokens > MAX_NEW_TOKENS {
            return Err(PatchError::validation(format!(
                "maxNewTokens must be between 1 and {MAX_NEW_TOKENS}"
            ))
            .into());
        }

        let mut ids = self
            .model
            .encode(&request.prompt)
            .context("encoding generation prompt")?;
        let prompt_len = ids.len();

        let mut completion = Vec::with_capacity(request.max_new_tokens);
        let mut last_token_prediction = None;

        for step in 0..request.max_new_tokens {
            progress.checkpoint()?;
            let output = self.model.trace(&ids, &HookSpec::new())?;
            let logits = output.final_logits()?;

            if step == 0 {
                let probs = softmax_rows(&logits.unsqueeze(0)?)?;
                last_token_prediction = Some(self.prediction(prompt_len - 1, &probs[0])?);
            }

            let next = sample_token(&logits, request.temperature)?;
            // Completion positions count from the first new token
            completion.push(Token {
                idx: step,
                id: next,
                text: self.model.decode(&[next])?,
                target_ids: Vec::new(),
            });
            ids.push(next);
            debug!("Generated token {}/{}", step + 1, request.max_new_tokens);
        }
        progress.status(&format!("Generated {} tokens", completion.len()));

        let last_token_prediction =
            last_token_prediction.ok_or_else(|| anyhow::anyhow!("no tokens generated"))?;
        Ok(GenerationResponse {
            completion,
            last_token_prediction,
        })
    }

    /// Next-token distribution at `idx` (default: the last prompt token)
    pub fn predict(&self, prompt: &str, idx: Option<usize>, progress: &dyn Progress) -> Result<Prediction> {
        let ids = self.model.encode(prompt).context("encoding prediction prompt")?;
        let idx = idx.unwrap_or(ids.len() - 1);
        if idx >= ids.len() {
            return Err(PatchError::validation(format!(
                "token index {idx} out of range for a prompt of {} tokens",
                ids.len()
            ))
            .into());
        }

        progress.checkpoint()?;
        let output = self.model.trace(&ids, &HookSpec::new())?;
        let probs = softmax_rows(&output.logits)?;
        self.prediction(idx, &probs[idx])
    }

    /// Sorted distribution rounded to two decimals, zeros dropped
    fn prediction(&self, idx: usize, probs: &[f32]) -> Result<Prediction> {
        let kept: Vec<(u32, f32)> = sorted_distribution(probs)
            .into_iter()
            .map(|(id, p)| (id, (p * 100.0).round() / 100.0))
            .take_while(|&(_, p)| p > 0.0)
            .collect();

        let ids: Vec<u32> = kept.iter().map(|&(id, _)| id).collect();
        Ok(Prediction {
            idx,
            texts: self.model.batch_decode(&ids)?,
            probs: kept.iter().map(|&(_, p)| p).collect(),
            ids,
        })
    }
}

/// Sample the next token (temperature <= 0 means greedy)
fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature)
    }
}

/// Argmax sampling (greedy)
fn argmax(logits: &Tensor) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let (max_idx, _) = logits_vec
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;

    Ok(max_idx as u32)
}

/// Temperature-based sampling
fn sample_with_temperature(logits: &Tensor, temperature: f32) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    anyhow::ensure!(!logits_vec.is_empty(), "Empty logits");

    let scaled: Vec<f32> = logits_vec.iter().map(|x| x / temperature).collect();

    // Softmax
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rand::thread_rng().gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }

    // Rounding can leave cumsum just below 1
    Ok((exp_vals.len() - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Silent;
    use crate::toy::toy_model;
    use candle_core::Device;

    fn request(max_new_tokens: usize, temperature: f32) -> GenerationRequest {
        GenerationRequest {
            model: "toy".into(),
            prompt: "The cat sat".into(),
            max_new_tokens,
            temperature,
        }
    }

    #[test]
    fn test_greedy_sampling() {
        let logits = Tensor::new(&[0.1f32, 2.0, -1.0], &Device::Cpu).unwrap();
        assert_eq!(sample_token(&logits, 0.0).unwrap(), 1);
    }

    #[test]
    fn test_temperature_sampling_stays_in_vocab() {
        let logits = Tensor::new(&[0.1f32, 2.0, -1.0], &Device::Cpu).unwrap();
        for _ in 0..20 {
            assert!(sample_token(&logits, 1.5).unwrap() < 3);
        }
    }

    #[test]
    fn test_greedy_generation_is_deterministic() {
        let model = toy_model(2, 1).unwrap();
        let generator = Generator::new(&model);
        let a = generator.generate(&request(3, 0.0), &Silent).unwrap();
        let b = generator.generate(&request(3, 0.0), &Silent).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.completion.len(), 3);
        assert_eq!(a.completion[0].idx, 0);
        assert_eq!(a.completion[2].idx, 2);
        assert_eq!(a.last_token_prediction.idx, 2);
        // Greedy picks the most likely next token
        assert_eq!(a.completion[0].id, a.last_token_prediction.ids[0]);
    }

    #[test]
    fn test_prediction_is_sorted_and_rounded() {
        let model = toy_model(2, 1).unwrap();
        let prediction = Generator::new(&model).predict("The cat", None, &Silent).unwrap();
        assert_eq!(prediction.idx, 1);
        assert!(prediction.probs.windows(2).all(|w| w[0] >= w[1]));
        assert!(prediction.probs.iter().all(|&p| p > 0.0));
        assert_eq!(prediction.ids.len(), prediction.texts.len());
    }

    #[test]
    fn test_invalid_requests() {
        let model = toy_model(2, 1).unwrap();
        let generator = Generator::new(&model);
        assert!(generator.generate(&request(0, 0.0), &Silent).is_err());
        assert!(generator.predict("The cat", Some(5), &Silent).is_err());
    }
}
