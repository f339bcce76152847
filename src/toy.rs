//! Seeded toy model for demos and tests
//!
//! A tiny transformer with deterministic random weights and a word-level
//! tokenizer. Runs on CPU in milliseconds, so the whole patching and job
//! pipeline can be exercised without downloading a checkpoint.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{PatchModel, TokenCodec};
use crate::transformer::{LocalTransformer, TransformerConfig};

pub const TOY_HIDDEN: usize = 16;
pub const TOY_SEED: u64 = 42;

const TOY_VOCAB: &[&str] = &[
    "<unk>", "The", " cat", " dog", " sat", " on", " down", " the", " mat", " ran", " and",
    " Mary", " John", " went", " to", " store", " gave", " a", " drink", " When", "When",
];

/// Word-level tokenizer: each token is a word with its leading space
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vec<String>,
    ids: HashMap<String, u32>,
}

impl WordTokenizer {
    pub fn new(vocab: &[&str]) -> Self {
        let vocab: Vec<String> = vocab.iter().map(|w| (*w).to_string()).collect();
        let ids = vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Self { vocab, ids }
    }

    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    /// Id of `word`, if it is in the vocabulary
    pub fn token_id(&self, word: &str) -> Option<u32> {
        self.ids.get(word).copied()
    }
}

impl Default for WordTokenizer {
    fn default() -> Self {
        Self::new(TOY_VOCAB)
    }
}

impl TokenCodec for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut pieces: Vec<String> = Vec::new();
        for ch in text.chars() {
            match pieces.last_mut() {
                Some(last) if ch != ' ' => last.push(ch),
                _ => pieces.push(ch.to_string()),
            }
        }
        Ok(pieces
            .iter()
            .map(|p| self.ids.get(p.as_str()).copied().unwrap_or(0))
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.vocab
                    .get(id as usize)
                    .map(String::as_str)
                    .ok_or_else(|| anyhow::anyhow!("Decode error: id {id} not in vocabulary"))
            })
            .collect()
    }
}

pub fn toy_config(vocab_size: usize, n_layers: usize, n_heads: usize) -> TransformerConfig {
    TransformerConfig {
        hidden_size: TOY_HIDDEN,
        intermediate_size: TOY_HIDDEN * 2,
        num_attention_heads: n_heads,
        num_key_value_heads: n_heads,
        num_hidden_layers: n_layers,
        vocab_size,
        rope_theta: 10_000.0,
        rms_norm_eps: 1e-6,
        max_position_embeddings: 64,
        tie_word_embeddings: false,
        attention_bias: true,
    }
}

/// Transformer with uniform random weights drawn from a seeded RNG
pub fn toy_transformer(
    vocab_size: usize,
    n_layers: usize,
    n_heads: usize,
    seed: u64,
) -> Result<LocalTransformer> {
    let config = toy_config(vocab_size, n_layers, n_heads);
    config.validate()?;
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();

    let h = config.hidden_size;
    let inter = config.intermediate_size;
    let qkv = config.num_attention_heads * config.head_dim();

    let mut random = |name: String, rows: usize, cols: usize| -> Result<()> {
        let bound = 1.0 / (cols as f32).sqrt();
        let data: Vec<f32> = (0..rows * cols)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let shape: Vec<usize> = if cols == 1 { vec![rows] } else { vec![rows, cols] };
        tensors.insert(name, Tensor::from_vec(data, shape, &device)?);
        Ok(())
    };

    random("model.embed_tokens.weight".into(), vocab_size, h)?;
    random("lm_head.weight".into(), vocab_size, h)?;
    for i in 0..n_layers {
        let p = format!("model.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj"] {
            random(format!("{p}.self_attn.{proj}.weight"), qkv, h)?;
            random(format!("{p}.self_attn.{proj}.bias"), qkv, 1)?;
        }
        random(format!("{p}.self_attn.o_proj.weight"), h, qkv)?;
        random(format!("{p}.mlp.gate_proj.weight"), inter, h)?;
        random(format!("{p}.mlp.up_proj.weight"), inter, h)?;
        random(format!("{p}.mlp.down_proj.weight"), h, inter)?;
    }

    for i in 0..n_layers {
        for norm in ["input_layernorm", "post_attention_layernorm"] {
            tensors.insert(
                format!("model.layers.{i}.{norm}.weight"),
                Tensor::ones(h, DType::F32, &device)?,
            );
        }
    }
    tensors.insert("model.norm.weight".into(), Tensor::ones(h, DType::F32, &device)?);

    let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
    LocalTransformer::from_var_builder(vb, config, &device, DType::F32)
}

/// Toy [`PatchModel`] named "toy" over the built-in word vocabulary
pub fn toy_model(n_layers: usize, n_heads: usize) -> Result<PatchModel> {
    let tokenizer = WordTokenizer::default();
    let backend = toy_transformer(tokenizer.len(), n_layers, n_heads, TOY_SEED)?;
    Ok(PatchModel::new("toy", Box::new(backend), Box::new(tokenizer)))
}
