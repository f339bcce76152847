//! Local decoder-only transformer with hook points
//!
//! Pre-norm architecture with rotary embeddings, grouped-query attention
//! and a SwiGLU feed-forward block, matching the HuggingFace layout of
//! Qwen2 and LLaMA checkpoints. The forward pass runs layer by layer so
//! that every [`HookPoint`] can be read and overwritten.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::hooks::{HookPoint, HookSpec, TraceOutput};
use crate::masks::MaskCache;
use crate::model::PatchBackend;

/// Model configuration (matches HuggingFace config.json for Qwen2/LLaMA)
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TransformerConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
    /// Q/K/V projections carry a bias (Qwen2 yes, LLaMA no)
    #[serde(default = "default_attention_bias")]
    pub attention_bias: bool,
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_tie_word_embeddings() -> bool {
    true
}

fn default_attention_bias() -> bool {
    true
}

impl TransformerConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads == 0,
            "hidden_size {} not divisible by {} heads",
            self.hidden_size,
            self.num_attention_heads
        );
        anyhow::ensure!(
            self.num_key_value_heads > 0
                && self.num_attention_heads % self.num_key_value_heads == 0,
            "{} heads not divisible by {} kv heads",
            self.num_attention_heads,
            self.num_key_value_heads
        );
        anyhow::ensure!(self.head_dim() % 2 == 0, "rotary embeddings need an even head_dim");
        Ok(())
    }
}

/// Rotary Position Embeddings (RoPE)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [seq_len, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.i(..seq_len)?;
        let sin = self.sin.i(..seq_len)?;
        Ok((
            apply_rotary_emb(q, &cos, &sin)?,
            apply_rotary_emb(k, &cos, &sin)?,
        ))
    }
}

fn apply_rotary_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_b, _h, seq_len, head_dim) = x.dims4()?;
    let pairs = x.reshape(((), seq_len, head_dim / 2, 2))?;
    let x0 = pairs.i((.., .., .., 0))?;
    let x1 = pairs.i((.., .., .., 1))?;

    let cos = cos.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?;

    let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
    let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

    let out = Tensor::stack(&[&out0, &out1], D::Minus1)?;
    Ok(out.reshape(x.shape())?)
}

/// Run the hooks registered at `point` on a `[1, seq, width]` activation
fn hook(
    point: HookPoint,
    x: Tensor,
    hooks: &HookSpec,
    captures: &mut HashMap<HookPoint, Tensor>,
) -> Result<Tensor> {
    if !hooks.touches(&point) {
        return Ok(x);
    }
    let out = hooks.run_hook(point, x.squeeze(0)?, captures)?;
    Ok(out.unsqueeze(0)?)
}

/// Scratch state threaded through one traced pass
struct PassState<'a> {
    layer: usize,
    mask: &'a Tensor,
    hooks: &'a HookSpec,
    captures: &'a mut HashMap<HookPoint, Tensor>,
}

/// Multi-head attention with grouped query attention
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &TransformerConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let bias = config.attention_bias;
        let q_proj = linear_b(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            bias,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_b(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    /// Exposes the o_proj input as `HeadsIn` and the output as `AttnOut`
    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, pass: &mut PassState) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q.contiguous()?, &k.contiguous()?)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(pass.mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [b, heads, seq, head_dim] -> [b, seq, heads * head_dim]
        let z = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        let z = hook(HookPoint::HeadsIn(pass.layer), z, pass.hooks, pass.captures)?;

        let out = self.o_proj.forward(&z)?;
        hook(HookPoint::AttnOut(pass.layer), out, pass.hooks, pass.captures)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU feed-forward block
struct FeedForward {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &TransformerConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: FeedForward,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &TransformerConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: FeedForward::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, pass: &mut PassState) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let attn = self.self_attn.forward(&h, rotary, pass)?;
        let x = (residual + attn)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let mlp = self.mlp.forward(&h)?;
        let mlp = hook(HookPoint::MlpOut(pass.layer), mlp, pass.hooks, pass.captures)?;
        let out = (residual + mlp)?;

        hook(HookPoint::BlockOut(pass.layer), out, pass.hooks, pass.captures)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Transformer executed in-process on a candle device
pub struct LocalTransformer {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// Separate unembedding when weights are untied; otherwise logits are
    /// computed against `embed_tokens`
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    masks: MaskCache,
    config: TransformerConfig,
    device: Device,
    dtype: DType,
}

impl LocalTransformer {
    /// Download config and weights from HuggingFace and build the model
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading transformer from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: TransformerConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        // SAFETY: the files are memory-mapped read-only and not modified while the model lives
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_var_builder(vb, config, device, dtype)
    }

    /// Build the model from an existing variable builder (HuggingFace naming)
    pub fn from_var_builder(
        vb: VarBuilder,
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                debug!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!(
            "Model ready: {} layers, {} heads (vocab_size: {})",
            config.num_hidden_layers, config.num_attention_heads, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            masks: MaskCache::new(),
            config,
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Decode an intermediate residual: final norm, then unembedding
    pub fn logit_lens(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(hidden)?;
        self.project_to_vocab(&normed)
    }

    /// Project an already-normalized hidden state to vocabulary logits
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = if let Some(ref lm_head) = self.lm_head {
            lm_head.forward(hidden)?
        } else {
            hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?
        };
        Ok(logits)
    }
}

impl PatchBackend for LocalTransformer {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn n_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn trace(&self, input_ids: &[u32], hooks: &HookSpec) -> Result<TraceOutput> {
        let seq_len = input_ids.len();
        anyhow::ensure!(seq_len > 0, "cannot trace an empty sequence");
        anyhow::ensure!(
            seq_len <= self.config.max_position_embeddings,
            "sequence of {seq_len} tokens exceeds max_position_embeddings ({})",
            self.config.max_position_embeddings
        );
        if let Some(id) = input_ids
            .iter()
            .find(|&&id| id as usize >= self.config.vocab_size)
        {
            anyhow::bail!("token id {id} outside vocabulary of {}", self.config.vocab_size);
        }

        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let mask = self.masks.causal(seq_len, &self.device, self.dtype)?;
        let mut captures = HashMap::new();

        let mut hidden = self.embed_tokens.forward(&input)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut pass = PassState {
                layer: i,
                mask: &mask,
                hooks,
                captures: &mut captures,
            };
            hidden = layer.forward(&hidden, &self.rotary, &mut pass)?;

            let lens = HookPoint::Lens(i);
            if hooks.is_captured(&lens) {
                let decoded = self.logit_lens(&hidden)?.squeeze(0)?.to_dtype(DType::F32)?;
                captures.insert(lens, decoded);
            }

            if (i + 1) % 10 == 0 {
                debug!("Processed layer {}/{}", i + 1, self.layers.len());
            }
        }

        let normed = self.norm.forward(&hidden)?;
        let logits = self
            .project_to_vocab(&normed)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;

        Ok(TraceOutput { logits, captures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Patch;
    use crate::toy::{toy_config, toy_transformer};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "hidden_size": 16, "intermediate_size": 32, "num_attention_heads": 2,
            "num_key_value_heads": 1, "num_hidden_layers": 2, "vocab_size": 10
        }"#;
        let config: TransformerConfig = serde_json::from_str(json).unwrap();
        assert!(config.tie_word_embeddings);
        assert!(config.attention_bias);
        assert_eq!(config.head_dim(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_head_split() {
        let mut config = toy_config(10, 2, 2);
        config.num_attention_heads = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trace_shapes_and_captures() {
        let model = toy_transformer(12, 2, 2, 7).unwrap();
        let mut hooks = HookSpec::new();
        hooks
            .capture(HookPoint::AttnOut(0))
            .capture(HookPoint::HeadsIn(1))
            .capture(HookPoint::BlockOut(1))
            .capture(HookPoint::Lens(0));

        let out = model.trace(&[1, 2, 3], &hooks).unwrap();
        assert_eq!(out.logits.dims(), &[3, 12]);
        assert_eq!(out.require(&HookPoint::AttnOut(0)).unwrap().dims(), &[3, 16]);
        assert_eq!(out.require(&HookPoint::HeadsIn(1)).unwrap().dims(), &[3, 16]);
        assert_eq!(out.require(&HookPoint::Lens(0)).unwrap().dims(), &[3, 12]);
        assert!(out.get(&HookPoint::MlpOut(0)).is_none());
    }

    #[test]
    fn test_final_block_lens_matches_logits() {
        let model = toy_transformer(12, 2, 1, 3).unwrap();
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::Lens(1));
        let out = model.trace(&[4, 5], &hooks).unwrap();
        let lens = out.require(&HookPoint::Lens(1)).unwrap();
        assert!(max_abs_diff(lens, &out.logits) < 1e-5);
    }

    #[test]
    fn test_patching_identical_activation_is_noop() {
        let model = toy_transformer(12, 2, 1, 11).unwrap();
        let mut capture = HookSpec::new();
        capture.capture(HookPoint::BlockOut(0));
        let base = model.trace(&[1, 2, 3], &capture).unwrap();

        let mut patch = HookSpec::new();
        patch.patch(
            HookPoint::BlockOut(0),
            Patch::Replace(base.require(&HookPoint::BlockOut(0)).unwrap().clone()),
        );
        let patched = model.trace(&[1, 2, 3], &patch).unwrap();
        assert!(max_abs_diff(&base.logits, &patched.logits) < 1e-6);
    }

    #[test]
    fn test_patch_changes_downstream_logits() {
        let model = toy_transformer(12, 2, 1, 5).unwrap();
        let mut capture = HookSpec::new();
        capture.capture(HookPoint::BlockOut(0));
        let source = model.trace(&[1, 2, 3], &capture).unwrap();
        let dest = model.trace(&[1, 6, 3], &HookSpec::new()).unwrap();

        let mut patch = HookSpec::new();
        patch.patch(
            HookPoint::BlockOut(0),
            Patch::Replace(source.require(&HookPoint::BlockOut(0)).unwrap().clone()),
        );
        let patched = model.trace(&[1, 6, 3], &patch).unwrap();
        // Replacing the whole residual after layer 0 reproduces the source run
        assert!(max_abs_diff(&source.logits, &patched.logits) < 1e-5);
        assert!(max_abs_diff(&dest.logits, &patched.logits) > 1e-6);
    }

    #[test]
    fn test_trace_rejects_bad_input() {
        let model = toy_transformer(12, 1, 1, 1).unwrap();
        assert!(model.trace(&[], &HookSpec::new()).is_err());
        assert!(model.trace(&[99], &HookSpec::new()).is_err());
    }
}
