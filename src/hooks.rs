//! Hook points, patches and traced-pass outputs
//!
//! A [`HookSpec`] names the activations a single traced pass should
//! capture and the patches it should apply. Backends walk their layers,
//! and at every [`HookPoint`] it touches they first apply the
//! registered patches, then capture the (possibly patched) value.
//!
//! All hooked tensors are batch-free: `[seq, width]`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{IndexOp, Tensor};

use crate::error::PatchError;

/// Named activation site inside one layer
///
/// String forms follow the TransformerLens naming convention, which is
/// also what the remote execution backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    /// Attention block output, after the output projection
    AttnOut(usize),
    /// Feed-forward block output
    MlpOut(usize),
    /// Residual stream after the whole layer (hidden state only)
    BlockOut(usize),
    /// Input of the attention output projection, `num_heads * head_dim` wide
    HeadsIn(usize),
    /// `BlockOut` decoded through the final norm and unembedding (capture only)
    Lens(usize),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::BlockOut(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::HeadsIn(i) => write!(f, "blocks.{i}.attn.hook_z"),
            Self::Lens(i) => write!(f, "blocks.{i}.hook_lens"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = PatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let unknown = || PatchError::validation(format!("unknown hook point '{s}'"));
        let rest = s.strip_prefix("blocks.").ok_or_else(unknown)?;
        let (layer, suffix) = rest.split_once('.').ok_or_else(unknown)?;
        let layer: usize = layer.parse().map_err(|_| unknown())?;
        match suffix {
            "hook_attn_out" => Ok(Self::AttnOut(layer)),
            "hook_mlp_out" => Ok(Self::MlpOut(layer)),
            "hook_resid_post" => Ok(Self::BlockOut(layer)),
            "attn.hook_z" => Ok(Self::HeadsIn(layer)),
            "hook_lens" => Ok(Self::Lens(layer)),
            _ => Err(unknown()),
        }
    }
}

/// A substitution applied to an activation as it flows through the model
#[derive(Debug, Clone)]
pub enum Patch {
    /// Replace the whole `[seq, width]` activation
    Replace(Tensor),
    /// Overwrite one position's row with a `[width]` vector
    Position { position: usize, value: Tensor },
    /// Overwrite one head's `[seq, head_dim]` slice of a `[seq, heads * head_dim]` activation
    Head {
        head: usize,
        n_heads: usize,
        value: Tensor,
    },
}

impl Patch {
    /// Apply the patch, returning a tensor with the same shape as `tensor`
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        let (seq_len, width) = tensor.dims2()?;
        match self {
            Self::Replace(value) => {
                if value.dims() != tensor.dims() {
                    anyhow::bail!(
                        "replacement shape {:?} does not match activation {:?}",
                        value.dims(),
                        tensor.dims()
                    );
                }
                Ok(value.to_dtype(tensor.dtype())?)
            }
            Self::Position { position, value } => {
                anyhow::ensure!(
                    *position < seq_len,
                    "patch position {position} out of range for sequence of {seq_len}"
                );
                let row = value.reshape((1, width))?.to_dtype(tensor.dtype())?;
                splice(tensor, 0, *position, &row)
            }
            Self::Head {
                head,
                n_heads,
                value,
            } => {
                anyhow::ensure!(*head < *n_heads, "head {head} out of range ({n_heads} heads)");
                anyhow::ensure!(
                    width % n_heads == 0,
                    "width {width} not divisible by {n_heads} heads"
                );
                let head_dim = width / n_heads;
                let per_head = tensor.reshape((seq_len, *n_heads, head_dim))?;
                let slice = value
                    .reshape((seq_len, 1, head_dim))?
                    .to_dtype(tensor.dtype())?;
                let patched = splice(&per_head, 1, *head, &slice)?;
                Ok(patched.reshape((seq_len, width))?)
            }
        }
    }
}

/// Replace index `at` along `dim` with `value` (which has size 1 on `dim`)
fn splice(tensor: &Tensor, dim: usize, at: usize, value: &Tensor) -> Result<Tensor> {
    let len = tensor.dim(dim)?;
    let mut parts = Vec::with_capacity(3);
    if at > 0 {
        parts.push(tensor.narrow(dim, 0, at)?);
    }
    parts.push(value.clone());
    if at + 1 < len {
        parts.push(tensor.narrow(dim, at + 1, len - at - 1)?);
    }
    Ok(Tensor::cat(&parts, dim)?)
}

/// What one traced pass should capture and patch
///
/// An empty spec runs the plain forward pass with no extra clones.
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    patches: Vec<(HookPoint, Patch)>,
}

impl HookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&mut self, point: HookPoint) -> &mut Self {
        self.captures.insert(point);
        self
    }

    pub fn patch(&mut self, point: HookPoint, patch: Patch) -> &mut Self {
        self.patches.push((point, patch));
        self
    }

    pub fn is_captured(&self, point: &HookPoint) -> bool {
        self.captures.contains(point)
    }

    /// Patches registered at `point`, in registration order
    pub fn patches_at<'a>(&'a self, point: &'a HookPoint) -> impl Iterator<Item = &'a Patch> + 'a {
        self.patches
            .iter()
            .filter(move |(p, _)| p == point)
            .map(|(_, patch)| patch)
    }

    /// Whether the backend has to materialize the activation at `point`
    pub fn touches(&self, point: &HookPoint) -> bool {
        self.is_captured(point) || self.patches.iter().any(|(p, _)| p == point)
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.patches.is_empty()
    }

    pub fn captures(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures.iter()
    }

    pub fn patches(&self) -> &[(HookPoint, Patch)] {
        &self.patches
    }

    /// Apply patches registered at `point`, then record the value if captured
    pub fn run_hook(
        &self,
        point: HookPoint,
        activation: Tensor,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let mut out = activation;
        for patch in self.patches_at(&point) {
            out = patch
                .apply(&out)
                .with_context(|| format!("applying patch at {point}"))?;
        }
        if self.is_captured(&point) {
            captures.insert(point, out.clone());
        }
        Ok(out)
    }
}

/// Output of one traced pass: `[seq, vocab]` logits plus captured activations
#[derive(Debug)]
pub struct TraceOutput {
    pub logits: Tensor,
    pub captures: HashMap<HookPoint, Tensor>,
}

impl TraceOutput {
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            captures: HashMap::new(),
        }
    }

    pub fn get(&self, point: &HookPoint) -> Option<&Tensor> {
        self.captures.get(point)
    }

    pub fn require(&self, point: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(point)
            .ok_or_else(|| anyhow::anyhow!("{point} was not captured"))
    }

    /// Logits at the final position, `[vocab]`
    pub fn final_logits(&self) -> Result<Tensor> {
        let seq_len = self.logits.dim(0)?;
        anyhow::ensure!(seq_len > 0, "empty sequence has no final logits");
        Ok(self.logits.i(seq_len - 1)?)
    }
}
