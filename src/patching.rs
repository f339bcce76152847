//! Activation patching engine
//!
//! One experiment runs three phases, always in this order:
//!
//! 1. **cache source**: one traced pass over the source prompt capturing
//!    every activation the sweep will substitute
//! 2. **destination baseline**: one pass over the destination prompt to
//!    measure the unpatched logit difference (skipped when no
//!    `incorrectId` is given, since the raw probability needs no baseline)
//! 3. **sweep**: one destination pass per `(layer, cell)` with exactly one
//!    cached source value substituted
//!
//! What a "cell" is depends on the [`SweepMode`]; each mode is a
//! [`SweepStrategy`] that knows how to snapshot the source activation and
//! how to turn a snapshot back into a [`Patch`].

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::alignment::{align, column_labels, Alignment};
use crate::cache::{head_slice, position_slice, ActivationCache, Slot};
use crate::error::PatchError;
use crate::hooks::{HookPoint, HookSpec, Patch};
use crate::jobs::Progress;
use crate::metric::{check_ids, logit_diff, normalized_effect, raw_probability, EPS};
use crate::model::PatchModel;
use crate::schema::{Connection, PatchRequest, PatchResponse, Submodule};

/// How the sweep iterates over cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Whole submodule output per layer
    Components,
    /// One attention head per cell
    Heads,
    /// Every destination position, fed from the same source position
    Tokens,
    /// Aligned free positions plus one cell per connection
    TokensSync,
}

impl SweepMode {
    pub fn select(submodule: Submodule, patch_tokens: bool, has_connections: bool) -> Self {
        match (submodule, patch_tokens, has_connections) {
            (_, true, true) => Self::TokensSync,
            (_, true, false) => Self::Tokens,
            (Submodule::Heads, false, _) => Self::Heads,
            _ => Self::Components,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Components => "components",
            Self::Heads => "heads",
            Self::Tokens => "tokens",
            Self::TokensSync => "tokens-sync",
        }
    }
}

/// Per-mode handler for snapshotting and substituting activations
pub trait SweepStrategy: Send + Sync {
    /// Number of cells (grid columns) per layer
    fn n_cells(&self) -> usize;

    fn col_labels(&self) -> Vec<String>;

    /// Snapshot what the sweep needs from the source activation at `point`
    fn capture(&self, point: HookPoint, activation: &Tensor, cache: &mut ActivationCache)
        -> Result<()>;

    /// Patch that substitutes the cached source value for `cell`
    fn patch(&self, point: HookPoint, cell: usize, cache: &ActivationCache) -> Result<Patch>;
}

/// Whole-sequence replacement of one submodule output
struct ComponentSweep {
    label: String,
}

impl SweepStrategy for ComponentSweep {
    fn n_cells(&self) -> usize {
        1
    }

    fn col_labels(&self) -> Vec<String> {
        vec![self.label.clone()]
    }

    fn capture(
        &self,
        point: HookPoint,
        activation: &Tensor,
        cache: &mut ActivationCache,
    ) -> Result<()> {
        cache.capture(point, Slot::Whole, activation.clone());
        Ok(())
    }

    fn patch(&self, point: HookPoint, _cell: usize, cache: &ActivationCache) -> Result<Patch> {
        Ok(Patch::Replace(cache.fetch(point, Slot::Whole)?.clone()))
    }
}

/// Per-head slices of the attention output-projection input
struct HeadSweep {
    n_heads: usize,
}

impl SweepStrategy for HeadSweep {
    fn n_cells(&self) -> usize {
        self.n_heads
    }

    fn col_labels(&self) -> Vec<String> {
        (0..self.n_heads).map(|h| h.to_string()).collect()
    }

    fn capture(
        &self,
        point: HookPoint,
        activation: &Tensor,
        cache: &mut ActivationCache,
    ) -> Result<()> {
        for head in 0..self.n_heads {
            cache.capture(
                point,
                Slot::Head(head),
                head_slice(activation, head, self.n_heads)?,
            );
        }
        Ok(())
    }

    fn patch(&self, point: HookPoint, cell: usize, cache: &ActivationCache) -> Result<Patch> {
        Ok(Patch::Head {
            head: cell,
            n_heads: self.n_heads,
            value: cache.fetch(point, Slot::Head(cell))?.clone(),
        })
    }
}

/// Position i of the destination fed from position i of the source
struct TokenSweep {
    labels: Vec<String>,
}

impl SweepStrategy for TokenSweep {
    fn n_cells(&self) -> usize {
        self.labels.len()
    }

    fn col_labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn capture(
        &self,
        point: HookPoint,
        activation: &Tensor,
        cache: &mut ActivationCache,
    ) -> Result<()> {
        for pos in 0..self.labels.len() {
            cache.capture(point, Slot::Position(pos), position_slice(activation, pos)?);
        }
        Ok(())
    }

    fn patch(&self, point: HookPoint, cell: usize, cache: &ActivationCache) -> Result<Patch> {
        Ok(Patch::Position {
            position: cell,
            value: cache.fetch(point, Slot::Position(cell))?.clone(),
        })
    }
}

/// One column of a token-synchronised sweep
#[derive(Debug, Clone)]
struct SyncCell {
    label: String,
    /// Destination position written
    dest: usize,
    /// Source position read
    source: usize,
    slot: Slot,
}

/// Free positions paired by the aligner, plus one cell per connection
struct SyncSweep {
    cells: Vec<SyncCell>,
}

impl SyncSweep {
    fn new(alignment: &Alignment, connections: &[Connection], dest_tokens: &[String]) -> Result<Self> {
        let cells = column_labels(connections, dest_tokens)
            .into_iter()
            .map(|col| {
                let (source, slot) = match col.connection {
                    Some(k) => {
                        let source = connections[k]
                            .start
                            .last()
                            .ok_or_else(|| PatchError::validation("connection with empty start"))?;
                        (source, Slot::Connection(k))
                    }
                    None => {
                        let source = *alignment.dest_to_source.get(&col.index).ok_or_else(|| {
                            PatchError::validation(format!(
                                "destination token {} has no aligned source token",
                                col.index
                            ))
                        })?;
                        (source, Slot::Position(source))
                    }
                };
                Ok(SyncCell {
                    label: col.text,
                    dest: col.index,
                    source,
                    slot,
                })
            })
            .collect::<Result<Vec<_>, PatchError>>()?;
        Ok(Self { cells })
    }
}

impl SweepStrategy for SyncSweep {
    fn n_cells(&self) -> usize {
        self.cells.len()
    }

    fn col_labels(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.label.clone()).collect()
    }

    fn capture(
        &self,
        point: HookPoint,
        activation: &Tensor,
        cache: &mut ActivationCache,
    ) -> Result<()> {
        for cell in &self.cells {
            cache.capture(point, cell.slot, position_slice(activation, cell.source)?);
        }
        Ok(())
    }

    fn patch(&self, point: HookPoint, cell: usize, cache: &ActivationCache) -> Result<Patch> {
        let cell = &self.cells[cell];
        Ok(Patch::Position {
            position: cell.dest,
            value: cache.fetch(point, cell.slot)?.clone(),
        })
    }
}

/// A validated experiment, ready to run
pub struct PatchPlan {
    pub mode: SweepMode,
    pub submodule: Submodule,
    pub source_ids: Vec<u32>,
    pub dest_ids: Vec<u32>,
    pub correct_id: u32,
    pub incorrect_id: Option<u32>,
    sweep: Box<dyn SweepStrategy>,
}

impl PatchPlan {
    /// Grid shape `[layers, cells]` for a model with `n_layers`
    pub fn grid_shape(&self, n_layers: usize) -> [usize; 2] {
        [n_layers, self.sweep.n_cells()]
    }
}

impl std::fmt::Debug for PatchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPlan")
            .field("mode", &self.mode)
            .field("submodule", &self.submodule)
            .field("source_len", &self.source_ids.len())
            .field("dest_len", &self.dest_ids.len())
            .field("cells", &self.sweep.n_cells())
            .finish()
    }
}

/// Baseline logit differences used by the normalized metric
#[derive(Debug, Clone, Copy)]
struct Baseline {
    source_diff: f32,
    dest_diff: f32,
    incorrect_id: u32,
}

/// Runs patching experiments against one model
pub struct PatchEngine<'m> {
    model: &'m PatchModel,
}

impl<'m> PatchEngine<'m> {
    pub fn new(model: &'m PatchModel) -> Self {
        Self { model }
    }

    /// Validate and tokenize a request without running any pass
    pub fn prepare(&self, request: &PatchRequest) -> Result<PatchPlan> {
        request.validate()?;

        let mut ids = vec![request.correct_id];
        ids.extend(request.incorrect_id);
        check_ids(self.model.vocab_size(), &ids)?;

        let source_ids = self
            .model
            .encode(&request.source.prompt)
            .context("encoding source prompt")?;
        let dest_ids = self
            .model
            .encode(&request.destination.prompt)
            .context("encoding destination prompt")?;

        let mode = SweepMode::select(
            request.submodule,
            request.patch_tokens,
            !request.edits.is_empty(),
        );
        if mode != SweepMode::TokensSync && source_ids.len() != dest_ids.len() {
            return Err(PatchError::validation(format!(
                "source has {} tokens but destination has {}; {} patching needs equal lengths",
                source_ids.len(),
                dest_ids.len(),
                mode.as_str()
            ))
            .into());
        }

        let sweep: Box<dyn SweepStrategy> = match mode {
            SweepMode::Components => Box::new(ComponentSweep {
                label: request.submodule.as_str().to_string(),
            }),
            SweepMode::Heads => Box::new(HeadSweep {
                n_heads: self.model.n_heads(),
            }),
            SweepMode::Tokens => Box::new(TokenSweep {
                labels: self.model.batch_decode(&dest_ids)?,
            }),
            SweepMode::TokensSync => {
                let alignment = align(source_ids.len(), dest_ids.len(), &request.edits)?;
                let dest_tokens = self.model.batch_decode(&dest_ids)?;
                Box::new(SyncSweep::new(&alignment, &request.edits, &dest_tokens)?)
            }
        };

        Ok(PatchPlan {
            mode,
            submodule: request.submodule,
            source_ids,
            dest_ids,
            correct_id: request.correct_id,
            incorrect_id: request.incorrect_id,
            sweep,
        })
    }

    /// Prepare and execute in one go
    pub fn run(&self, request: &PatchRequest, progress: &dyn Progress) -> Result<PatchResponse> {
        let plan = self.prepare(request)?;
        self.execute(&plan, progress)
    }

    pub fn execute(&self, plan: &PatchPlan, progress: &dyn Progress) -> Result<PatchResponse> {
        let n_layers = self.model.n_layers();
        let n_cells = plan.sweep.n_cells();
        let points: Vec<HookPoint> = (0..n_layers)
            .map(|layer| plan.submodule.hook_point(layer))
            .collect();

        info!(
            "Patching {} ({} mode): {} layers x {} cells",
            self.model.name(),
            plan.mode.as_str(),
            n_layers,
            n_cells
        );

        // Phase 1: cache source
        progress.status("Caching source activations");
        let mut capture = HookSpec::new();
        for point in &points {
            capture.capture(*point);
        }
        let source = self.model.trace(&plan.source_ids, &capture)?;
        let mut cache = ActivationCache::with_capacity(n_layers * n_cells);
        for point in &points {
            plan.sweep.capture(*point, source.require(point)?, &mut cache)?;
        }
        debug!("Cached {} source activations", cache.len());

        // Phase 2: destination baseline
        let baseline = match plan.incorrect_id {
            Some(incorrect_id) => {
                progress.checkpoint()?;
                let source_diff = logit_diff(&source.final_logits()?, plan.correct_id, incorrect_id)?;
                let dest = self.model.trace(&plan.dest_ids, &HookSpec::new())?;
                let dest_diff = logit_diff(&dest.final_logits()?, plan.correct_id, incorrect_id)?;
                info!(
                    "Baseline logit diff: source {:.4}, destination {:.4}",
                    source_diff, dest_diff
                );
                Some(Baseline {
                    source_diff,
                    dest_diff,
                    incorrect_id,
                })
            }
            None => None,
        };
        drop(source);

        // Phase 3: sweep
        let mut results = vec![vec![0.0f32; n_cells]; n_layers];
        for (layer, point) in points.iter().enumerate() {
            progress.status(&format!("Patching layer {}/{}", layer + 1, n_layers));
            for (cell, slot) in results[layer].iter_mut().enumerate() {
                progress.checkpoint()?;
                let mut hooks = HookSpec::new();
                hooks.patch(*point, plan.sweep.patch(*point, cell, &cache)?);
                let patched = self.model.trace(&plan.dest_ids, &hooks)?;
                let logits = patched.final_logits()?;
                *slot = match baseline {
                    Some(b) => normalized_effect(
                        b.source_diff,
                        b.dest_diff,
                        logit_diff(&logits, plan.correct_id, b.incorrect_id)?,
                        EPS,
                    ),
                    None => raw_probability(&logits, plan.correct_id)?,
                };
            }
        }

        Ok(PatchResponse {
            results,
            row_labels: (0..n_layers).map(|l| l.to_string()).collect(),
            col_labels: plan.sweep.col_labels(),
        })
    }
}
