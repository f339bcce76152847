//! Wire types for experiment requests and responses
//!
//! Field names are camelCase on the wire so existing clients can talk to
//! the service unchanged.

use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::hooks::HookPoint;

/// A prompt submitted by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub prompt: String,
}

/// Position descriptor inside a [`Connection`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub token_indices: Vec<usize>,
    /// Index of the connection in the client's UI; carried through untouched
    #[serde(default)]
    pub counter_index: usize,
}

impl Point {
    pub fn new(token_indices: Vec<usize>) -> Self {
        Self {
            token_indices,
            counter_index: 0,
        }
    }

    /// Last listed position of the span, used as the representative index
    pub fn last(&self) -> Option<usize> {
        self.token_indices.last().copied()
    }
}

/// Explicit causal edge: the source activation at `start` is written
/// into the destination at `end`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub start: Point,
    pub end: Point,
}

impl Connection {
    pub fn new(start: Vec<usize>, end: Vec<usize>) -> Self {
        Self {
            start: Point::new(start),
            end: Point::new(end),
        }
    }
}

/// Which per-layer unit a patch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Submodule {
    Attn,
    Mlp,
    Blocks,
    Heads,
}

impl Submodule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attn => "attn",
            Self::Mlp => "mlp",
            Self::Blocks => "blocks",
            Self::Heads => "heads",
        }
    }

    /// Hook point whose activation is read and overwritten at `layer`
    pub fn hook_point(&self, layer: usize) -> HookPoint {
        match self {
            Self::Attn => HookPoint::AttnOut(layer),
            Self::Mlp => HookPoint::MlpOut(layer),
            Self::Blocks => HookPoint::BlockOut(layer),
            Self::Heads => HookPoint::HeadsIn(layer),
        }
    }
}

impl std::fmt::Display for Submodule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub model: String,
    pub source: Completion,
    pub destination: Completion,
    #[serde(default)]
    pub edits: Vec<Connection>,
    pub submodule: Submodule,
    #[serde(default)]
    pub patch_tokens: bool,
    pub correct_id: u32,
    #[serde(default)]
    pub incorrect_id: Option<u32>,
}

impl PatchRequest {
    /// Checks that need no model or tokenizer
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.submodule == Submodule::Heads && self.patch_tokens {
            return Err(PatchError::validation(
                "submodule 'heads' cannot be combined with patchTokens",
            ));
        }
        if self.incorrect_id == Some(self.correct_id) {
            return Err(PatchError::validation(
                "correctId and incorrectId must differ",
            ));
        }
        for (i, edit) in self.edits.iter().enumerate() {
            if edit.start.token_indices.is_empty() || edit.end.token_indices.is_empty() {
                return Err(PatchError::validation(format!(
                    "connection {i} has an empty token span"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResponse {
    pub results: Vec<Vec<f32>>,
    pub row_labels: Vec<String>,
    pub col_labels: Vec<String>,
}

/// A position of interest and the ids tracked there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub idx: usize,
    pub id: u32,
    pub text: String,
    #[serde(default)]
    pub target_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLensRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub x: usize,
    pub y: f32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRow {
    pub id: String,
    pub data: Vec<GridCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLensResponse {
    pub rows: Vec<GridRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineLensRequest {
    pub model: String,
    pub prompt: String,
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinePoint {
    pub x: usize,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub data: Vec<LinePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineLensResponse {
    pub lines: Vec<Line>,
}

fn default_max_new_tokens() -> usize {
    1
}

fn default_temperature() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Sampling temperature; 0.0 means greedy decoding
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRequest {
    pub model: String,
    pub prompt: String,
    /// Token index to predict from; defaults to the last prompt token
    #[serde(default)]
    pub idx: Option<usize>,
}

/// Next-token distribution at one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub idx: usize,
    pub ids: Vec<u32>,
    pub probs: Vec<f32>,
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub completion: Vec<Token>,
    pub last_token_prediction: Prediction,
}

fn default_top_k() -> usize {
    3
}

/// Per-token likelihood of `prompt` followed by `output`
///
/// Field names are snake_case, as the perplexity client expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerplexRequest {
    pub model: String,
    pub prompt: String,
    pub output: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub token: String,
    pub probability: f32,
}

/// How likely the model found one token, given everything before it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbability {
    pub token: String,
    pub probability: f32,
    /// 1-based position of the token in the sorted next-token distribution
    pub rank: usize,
    pub top_alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerplexResponse {
    pub prompt: String,
    pub vocab_size: usize,
    pub model_name: String,
    pub prompt_tokens: Vec<TokenProbability>,
    pub output_tokens: Vec<TokenProbability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}
