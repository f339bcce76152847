//! PatchModel wrapper around an execution backend and a tokenizer
//!
//! Backends only need to run one traced pass at a time; everything the
//! engine, lens and generation code needs is built on top of
//! [`PatchBackend::trace`].

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::info;

use crate::error::PatchError;
use crate::hooks::{HookSpec, TraceOutput};
use crate::transformer::LocalTransformer;

/// Model-execution collaborator
///
/// A backend runs one forward pass over a token sequence, applying the
/// patches in `hooks` and returning the requested captures together with
/// `[seq, vocab]` logits.
pub trait PatchBackend: Send + Sync {
    fn n_layers(&self) -> usize;

    fn n_heads(&self) -> usize;

    fn d_model(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Run one traced pass
    fn trace(&self, input_ids: &[u32], hooks: &HookSpec) -> Result<TraceOutput>;

    /// Short label for logs ("local", "remote")
    fn kind(&self) -> &'static str {
        "local"
    }
}

/// Tokenizer collaborator, used for labels and prompt encoding
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Decode each id on its own
    fn batch_decode(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter().map(|&id| self.decode(&[id])).collect()
    }
}

/// HuggingFace tokenizer behind the [`TokenCodec`] seam
pub struct HubTokenizer {
    inner: Tokenizer,
}

impl HubTokenizer {
    pub fn new(inner: Tokenizer) -> Self {
        Self { inner }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Ok(Self::new(inner))
    }
}

impl TokenCodec for HubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }
}

/// Public description of a served model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_model: usize,
    pub vocab_size: usize,
    pub backend: String,
}

/// A served model: execution backend plus tokenizer
pub struct PatchModel {
    name: String,
    backend: Box<dyn PatchBackend>,
    tokenizer: Box<dyn TokenCodec>,
}

impl std::fmt::Debug for PatchModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchModel")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("n_layers", &self.backend.n_layers())
            .finish_non_exhaustive()
    }
}

impl PatchModel {
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn PatchBackend>,
        tokenizer: Box<dyn TokenCodec>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            tokenizer,
        }
    }

    /// Load a model and tokenizer from HuggingFace and run it locally
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        let (device, dtype) = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let tokenizer = load_tokenizer(model_id)?;
        let backend = LocalTransformer::load(model_id, &device, dtype)?;

        Ok(Self::new(model_id, Box::new(backend), Box::new(tokenizer)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn PatchBackend {
        self.backend.as_ref()
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn n_heads(&self) -> usize {
        self.backend.n_heads()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            n_layers: self.n_layers(),
            n_heads: self.n_heads(),
            d_model: self.backend.d_model(),
            vocab_size: self.vocab_size(),
            backend: self.backend.kind().to_string(),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(text)?;
        if ids.is_empty() {
            let msg = format!("prompt '{text}' produced no tokens");
            return Err(PatchError::validation(msg).into());
        }
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids)
    }

    pub fn batch_decode(&self, ids: &[u32]) -> Result<Vec<String>> {
        self.tokenizer.batch_decode(ids)
    }

    pub fn trace(&self, input_ids: &[u32], hooks: &HookSpec) -> Result<TraceOutput> {
        self.backend.trace(input_ids, hooks)
    }
}

/// Pick CUDA with BF16 when available, CPU with F32 otherwise
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Fetch `tokenizer.json` for `model_id` from the HuggingFace hub
pub fn load_tokenizer(model_id: &str) -> Result<HubTokenizer> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    let tokenizer_path = repo
        .get("tokenizer.json")
        .context("Failed to download tokenizer.json")?;
    HubTokenizer::from_file(&tokenizer_path)
}
