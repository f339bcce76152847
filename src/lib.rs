// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // PatchModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! patchlens: activation patching and logit lens over HTTP
//!
//! Runs causal-intervention experiments on transformer language models:
//! activations from a source prompt are written into a destination pass,
//! layer by layer, and the effect on the destination's prediction is
//! reported as a grid. Work is submitted as jobs whose progress and
//! results are streamed back as server-sent events.
//!
//! ## Architecture
//!
//! - `hooks`: Hook points, patches and traced-pass outputs
//! - `transformer`: Decoder-only forward pass with patch/capture hooks
//! - `remote`: Backend that ships traced passes to a job-dispatch service
//! - `model`: PatchModel wrapper over a backend and a tokenizer
//! - `toy`: Seeded toy model and word tokenizer (no downloads)
//! - `masks`: Per-model causal mask cache
//! - `cache`: ActivationCache keyed by hook point and slot
//! - `alignment`: Token alignment between source and destination prompts
//! - `metric`: Normalized effect, logit difference and raw probability
//! - `patching`: PatchEngine and its sweep strategies
//! - `logit_lens`: Grid and line logit lens
//! - `generation`: Sampled completions and next-token prediction
//! - `perplexity`: Per-token probability and rank of a prompt and its continuation
//! - `jobs`: Job registry, bounded event streams and the background runner
//! - `server`: axum routes and SSE delivery
//! - `config`: JSON service configuration
//! - `error`: PatchError taxonomy and HTTP mapping

pub mod alignment;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod hooks;
pub mod jobs;
pub mod logit_lens;
pub mod masks;
pub mod metric;
pub mod model;
pub mod patching;
pub mod perplexity;
pub mod remote;
pub mod schema;
pub mod server;
pub mod toy;
pub mod transformer;

pub use alignment::{align, column_labels, Alignment, ColumnLabel};
pub use cache::{ActivationCache, Slot};
pub use config::{ExecutionConfig, ModelConfig, ModelSource, RemoteConfig, ServiceConfig};
pub use error::{ApiError, PatchError};
pub use generation::Generator;
pub use hooks::{HookPoint, HookSpec, Patch, TraceOutput};
pub use jobs::{JobId, JobListener, JobRegistry, JobRunner, Progress, ResultEvent, Silent};
pub use logit_lens::LogitLens;
pub use masks::{create_causal_mask, MaskCache};
pub use metric::{logit_diff, normalized_effect, raw_probability};
pub use model::{HubTokenizer, ModelInfo, PatchBackend, PatchModel, TokenCodec};
pub use patching::{PatchEngine, PatchPlan, SweepMode};
pub use perplexity::TokenScorer;
pub use remote::{ModelDims, RemoteBackend};
pub use schema::{
    Completion, Connection, GenerationRequest, GenerationResponse, GridLensRequest,
    GridLensResponse, LineLensRequest, LineLensResponse, PatchRequest, PatchResponse,
    PerplexRequest, PerplexResponse, Point, Prediction, PredictionRequest, Submodule, Token,
    TokenProbability,
};
pub use server::{build_router, AppState};
pub use toy::{toy_model, WordTokenizer};
pub use transformer::{LocalTransformer, TransformerConfig};
