//! Service configuration
//!
//! Loaded from a JSON file; every field has a serde default so an empty
//! object `{}` is a valid config serving the seeded toy model locally.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PatchError;
use crate::model::{load_tokenizer, select_device, PatchModel};
use crate::remote::{ModelDims, RemoteBackend};
use crate::toy::{toy_transformer, WordTokenizer, TOY_HIDDEN, TOY_SEED};
use crate::transformer::LocalTransformer;

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_stream_capacity() -> usize {
    64
}

fn default_abandoned_ttl_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_toy_layers() -> usize {
    2
}

fn default_toy_heads() -> usize {
    1
}

fn default_models() -> Vec<ModelConfig> {
    vec![ModelConfig::toy("toy")]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Pending events buffered per job stream
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
    /// Finished jobs nobody listened to are dropped after this long
    #[serde(default = "default_abandoned_ttl_secs")]
    pub abandoned_ttl_secs: u64,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            stream_capacity: default_stream_capacity(),
            abandoned_ttl_secs: default_abandoned_ttl_secs(),
            execution: ExecutionConfig::default(),
            models: default_models(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionConfig {
    Local {
        #[serde(default)]
        force_cpu: bool,
    },
    Remote(RemoteConfig),
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::Local { force_cpu: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    /// Falls back to `PATCHLENS_API_KEY`
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// HuggingFace hub checkpoint named by the model's `name`
    Hub,
    /// Seeded toy transformer over the built-in word vocabulary
    Toy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub source: ModelSource,
    /// Toy models: layer count. Remote hub models: required.
    #[serde(default)]
    pub n_layers: Option<usize>,
    #[serde(default)]
    pub n_heads: Option<usize>,
    /// Remote hub models only
    #[serde(default)]
    pub d_model: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

impl ModelConfig {
    pub fn toy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: ModelSource::Toy,
            n_layers: None,
            n_heads: None,
            d_model: None,
            vocab_size: None,
        }
    }

    fn toy_dims(&self) -> (usize, usize) {
        (
            self.n_layers.unwrap_or_else(default_toy_layers),
            self.n_heads.unwrap_or_else(default_toy_heads),
        )
    }

    fn required(&self, value: Option<usize>, field: &str) -> Result<usize, PatchError> {
        value.ok_or_else(|| {
            PatchError::Config(format!(
                "model '{}' needs '{field}' for remote execution",
                self.name
            ))
        })
    }

    /// Dimensions a remote backend reports for this model
    pub fn remote_dims(&self) -> Result<ModelDims, PatchError> {
        match self.source {
            ModelSource::Toy => {
                let (n_layers, n_heads) = self.toy_dims();
                Ok(ModelDims {
                    n_layers,
                    n_heads,
                    d_model: TOY_HIDDEN,
                    vocab_size: WordTokenizer::default().len(),
                })
            }
            ModelSource::Hub => Ok(ModelDims {
                n_layers: self.required(self.n_layers, "n_layers")?,
                n_heads: self.required(self.n_heads, "n_heads")?,
                d_model: self.required(self.d_model, "d_model")?,
                vocab_size: self.required(self.vocab_size, "vocab_size")?,
            }),
        }
    }

    /// Build the served model for this entry
    ///
    /// Remote execution needs a tokio runtime.
    pub fn build(&self, execution: &ExecutionConfig) -> Result<PatchModel> {
        match (execution, self.source) {
            (ExecutionConfig::Local { .. }, ModelSource::Toy) => {
                let (n_layers, n_heads) = self.toy_dims();
                let tokenizer = WordTokenizer::default();
                let backend = toy_transformer(tokenizer.len(), n_layers, n_heads, TOY_SEED)?;
                Ok(PatchModel::new(&self.name, Box::new(backend), Box::new(tokenizer)))
            }
            (ExecutionConfig::Local { force_cpu }, ModelSource::Hub) => {
                let (device, dtype) = select_device(*force_cpu);
                let tokenizer = load_tokenizer(&self.name)?;
                let backend = LocalTransformer::load(&self.name, &device, dtype)?;
                Ok(PatchModel::new(&self.name, Box::new(backend), Box::new(tokenizer)))
            }
            (ExecutionConfig::Remote(remote), source) => {
                let dims = self.remote_dims()?;
                let backend = RemoteBackend::new(&self.name, dims, remote)?;
                match source {
                    ModelSource::Toy => Ok(PatchModel::new(
                        &self.name,
                        Box::new(backend),
                        Box::new(WordTokenizer::default()),
                    )),
                    ModelSource::Hub => {
                        let tokenizer = load_tokenizer(&self.name)?;
                        Ok(PatchModel::new(&self.name, Box::new(backend), Box::new(tokenizer)))
                    }
                }
            }
        }
    }
}

impl ServiceConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PatchError> {
        if self.models.is_empty() {
            return Err(PatchError::Config("no models configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(PatchError::Config(format!(
                    "model '{}' configured twice",
                    model.name
                )));
            }
        }
        if self.stream_capacity == 0 {
            return Err(PatchError::Config("stream_capacity must be positive".into()));
        }
        Ok(())
    }

    /// `--cpu` forces CPU for local execution
    pub fn force_cpu(&mut self) {
        if let ExecutionConfig::Local { force_cpu } = &mut self.execution {
            *force_cpu = true;
        }
    }

    pub fn abandoned_ttl(&self) -> Duration {
        Duration::from_secs(self.abandoned_ttl_secs)
    }

    /// Build every configured model, keyed by name
    pub fn build_models(&self) -> Result<HashMap<String, Arc<PatchModel>>> {
        let mut models = HashMap::with_capacity(self.models.len());
        for entry in &self.models {
            info!("Preparing model {} ({:?})", entry.name, entry.source);
            let model = entry
                .build(&self.execution)
                .with_context(|| format!("Failed to build model {}", entry.name))?;
            models.insert(entry.name.clone(), Arc::new(model));
        }
        Ok(models)
    }
}
