//! Per-token likelihood of a prompt and its continuation
//!
//! One pass over `prompt ++ output`. Every token after the first is scored
//! against the distribution predicted at the position before it.

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::PatchError;
use crate::hooks::HookSpec;
use crate::jobs::Progress;
use crate::logit_lens::{softmax_rows, sorted_distribution};
use crate::model::PatchModel;
use crate::schema::{Alternative, PerplexRequest, PerplexResponse, TokenProbability};

pub struct TokenScorer<'m> {
    model: &'m PatchModel,
}

impl<'m> TokenScorer<'m> {
    pub fn new(model: &'m PatchModel) -> Self {
        Self { model }
    }

    pub fn score(
        &self,
        request: &PerplexRequest,
        progress: &dyn Progress,
    ) -> Result<PerplexResponse> {
        if request.top_k == 0 {
            return Err(PatchError::validation("top_k must be at least 1").into());
        }

        let prompt_ids = self
            .model
            .encode(&request.prompt)
            .context("encoding perplexity prompt")?;
        let output_ids = self
            .model
            .encode(&request.output)
            .context("encoding perplexity output")?;
        // Ids are joined rather than re-encoding the joined text, so output
        // positions line up with the separately tokenized output.
        let ids: Vec<u32> = prompt_ids.iter().chain(&output_ids).copied().collect();

        progress.checkpoint()?;
        let traced = self.model.trace(&ids, &HookSpec::new())?;
        let probs = softmax_rows(&traced.logits)?;
        let vocab_size = probs.first().map_or(0, Vec::len);
        let top_k = request.top_k.min(vocab_size);

        // The first prompt token has no context to be predicted from
        let mut scored = Vec::with_capacity(ids.len() - 1);
        for (pos, &id) in ids.iter().enumerate().skip(1) {
            scored.push(self.score_token(&probs[pos - 1], id, top_k)?);
        }
        let output_tokens = scored.split_off(prompt_ids.len() - 1);
        debug!(
            "Scored {} prompt and {} output tokens",
            scored.len(),
            output_tokens.len()
        );
        progress.status(&format!("Scored {} tokens", ids.len() - 1));

        Ok(PerplexResponse {
            prompt: request.prompt.clone(),
            vocab_size,
            model_name: self.model.name().to_string(),
            prompt_tokens: scored,
            output_tokens,
        })
    }

    fn score_token(&self, probs: &[f32], id: u32, top_k: usize) -> Result<TokenProbability> {
        let sorted = sorted_distribution(probs);
        let rank = sorted
            .iter()
            .position(|&(candidate, _)| candidate == id)
            .ok_or_else(|| {
                PatchError::validation(format!("token id {id} is outside the vocabulary"))
            })?;

        let top = &sorted[..top_k];
        let top_ids: Vec<u32> = top.iter().map(|&(candidate, _)| candidate).collect();
        let top_alternatives = self
            .model
            .batch_decode(&top_ids)?
            .into_iter()
            .zip(top)
            .map(|(token, &(_, probability))| Alternative { token, probability })
            .collect();

        Ok(TokenProbability {
            token: self.model.decode(&[id])?,
            probability: sorted[rank].1,
            rank: rank + 1,
            top_alternatives,
        })
    }
}
