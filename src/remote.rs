//! Remote execution backend
//!
//! Traced passes are shipped to a job-dispatch service as JSON: the
//! backend submits `{model, inputIds, captures, patches}` to
//! `POST {host}/trace`, then polls `GET {host}/trace/{jobId}` until the
//! job completes or fails. Tensors travel as `{shape, data}` in F32.
//!
//! [`PatchBackend::trace`] is synchronous and runs on the blocking pool,
//! so the backend keeps the runtime [`Handle`] it was built on and blocks
//! on it for the HTTP round trips.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::error::PatchError;
use crate::hooks::{HookPoint, HookSpec, Patch, TraceOutput};
use crate::model::PatchBackend;

/// Environment variable consulted when the config carries no API key
pub const API_KEY_ENV: &str = "PATCHLENS_API_KEY";

/// Model dimensions the remote side does not report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_model: usize,
    pub vocab_size: usize,
}

/// Dense F32 tensor on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl WireTensor {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        anyhow::ensure!(
            expected == self.data.len(),
            "tensor shape {:?} needs {} values, got {}",
            self.shape,
            expected,
            self.data.len()
        );
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WirePatch {
    Replace {
        hook: String,
        value: WireTensor,
    },
    Position {
        hook: String,
        position: usize,
        value: WireTensor,
    },
    #[serde(rename_all = "camelCase")]
    Head {
        hook: String,
        head: usize,
        n_heads: usize,
        value: WireTensor,
    },
}

impl WirePatch {
    fn new(point: &HookPoint, patch: &Patch) -> Result<Self> {
        let hook = point.to_string();
        Ok(match patch {
            Patch::Replace(value) => Self::Replace {
                hook,
                value: WireTensor::from_tensor(value)?,
            },
            Patch::Position { position, value } => Self::Position {
                hook,
                position: *position,
                value: WireTensor::from_tensor(value)?,
            },
            Patch::Head {
                head,
                n_heads,
                value,
            } => Self::Head {
                hook,
                head: *head,
                n_heads: *n_heads,
                value: WireTensor::from_tensor(value)?,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRequest {
    pub model: String,
    pub input_ids: Vec<u32>,
    pub captures: Vec<String>,
    pub patches: Vec<WirePatch>,
}

impl TraceRequest {
    pub fn new(model: &str, input_ids: &[u32], hooks: &HookSpec) -> Result<Self> {
        let mut captures: Vec<HookPoint> = hooks.captures().copied().collect();
        captures.sort();
        let patches = hooks
            .patches()
            .iter()
            .map(|(point, patch)| WirePatch::new(point, patch))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            model: model.to_string(),
            input_ids: input_ids.to_vec(),
            captures: captures.iter().map(ToString::to_string).collect(),
            patches,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceAccepted {
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Queued,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResult {
    pub logits: WireTensor,
    #[serde(default)]
    pub captures: HashMap<String, WireTensor>,
}

impl TraceResult {
    fn into_output(self) -> Result<TraceOutput> {
        let device = Device::Cpu;
        let mut output = TraceOutput::new(self.logits.to_tensor(&device)?);
        for (name, tensor) in self.captures {
            let point: HookPoint = name.parse()?;
            output.captures.insert(point, tensor.to_tensor(&device)?);
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStatus {
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TraceResult>,
}

/// Backend that runs traced passes on a remote job-dispatch service
pub struct RemoteBackend {
    model: String,
    dims: ModelDims,
    host: String,
    api_key: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
    client: Client,
    runtime: Handle,
}

impl RemoteBackend {
    /// Must be called from within a tokio runtime
    pub fn new(model: &str, dims: ModelDims, config: &RemoteConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            PatchError::Config("remote backend must be created inside a tokio runtime".into())
        })?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok());

        info!("Remote backend for {} at {}", model, config.host);
        Ok(Self {
            model: model.to_string(),
            dims,
            host: config.host.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            client: Client::new(),
            runtime,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    async fn submit(&self, request: &TraceRequest) -> Result<String> {
        let response = self
            .authorized(self.client.post(format!("{}/trace", self.host)))
            .json(request)
            .send()
            .await
            .map_err(|e| PatchError::Connection(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PatchError::Remote(format!("trace submission returned HTTP {status}")).into());
        }
        let accepted: TraceAccepted = response
            .json()
            .await
            .context("decoding trace submission response")?;
        Ok(accepted.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<TraceStatus> {
        let response = self
            .authorized(self.client.get(format!("{}/trace/{}", self.host, job_id)))
            .send()
            .await
            .map_err(|e| PatchError::Connection(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PatchError::Remote(format!("trace {job_id} returned HTTP {status}")).into());
        }
        Ok(response.json().await.context("decoding trace status")?)
    }

    async fn run(&self, request: &TraceRequest) -> Result<TraceResult> {
        let job_id = self.submit(request).await?;
        debug!("Remote trace {} submitted", job_id);

        loop {
            let status = self.poll(&job_id).await?;
            match status.status {
                RemoteStatus::Completed => {
                    return status.result.ok_or_else(|| {
                        PatchError::Remote(format!("trace {job_id} completed without a result"))
                            .into()
                    });
                }
                RemoteStatus::Error => {
                    let description = status
                        .description
                        .unwrap_or_else(|| "no description".to_string());
                    return Err(PatchError::Remote(description).into());
                }
                RemoteStatus::Queued | RemoteStatus::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

impl PatchBackend for RemoteBackend {
    fn n_layers(&self) -> usize {
        self.dims.n_layers
    }

    fn n_heads(&self) -> usize {
        self.dims.n_heads
    }

    fn d_model(&self) -> usize {
        self.dims.d_model
    }

    fn vocab_size(&self) -> usize {
        self.dims.vocab_size
    }

    fn trace(&self, input_ids: &[u32], hooks: &HookSpec) -> Result<TraceOutput> {
        let request = TraceRequest::new(&self.model, input_ids, hooks)?;
        let result = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, self.run(&request)).await })
            .map_err(|_| {
                PatchError::Connection(format!(
                    "remote trace timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        let output = result.into_output()?;
        let (seq_len, vocab) = output.logits.dims2()?;
        anyhow::ensure!(
            seq_len == input_ids.len() && vocab == self.dims.vocab_size,
            "remote logits shape [{seq_len}, {vocab}] does not match [{}, {}]",
            input_ids.len(),
            self.dims.vocab_size
        );
        for point in hooks.captures() {
            output.require(point)?;
        }
        Ok(output)
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        routing::{get, post},
        Json, Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const DIMS: ModelDims = ModelDims {
        n_layers: 2,
        n_heads: 1,
        d_model: 3,
        vocab_size: 4,
    };

    #[derive(Default)]
    struct Mock {
        polls: AtomicUsize,
        last: Mutex<Option<TraceRequest>>,
        fail: bool,
    }

    async fn accept(State(mock): State<Arc<Mock>>, Json(req): Json<TraceRequest>) -> Json<TraceAccepted> {
        *mock.last.lock().unwrap() = Some(req);
        Json(TraceAccepted {
            job_id: "job-1".into(),
        })
    }

    async fn status(State(mock): State<Arc<Mock>>, Path(_id): Path<String>) -> Json<TraceStatus> {
        if mock.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Json(TraceStatus {
                status: RemoteStatus::Queued,
                description: None,
                result: None,
            });
        }
        if mock.fail {
            return Json(TraceStatus {
                status: RemoteStatus::Error,
                description: Some("out of memory".into()),
                result: None,
            });
        }
        let req = mock.last.lock().unwrap().clone().unwrap();
        let seq = req.input_ids.len();
        let captures = req
            .captures
            .iter()
            .map(|name| {
                let tensor = WireTensor {
                    shape: vec![seq, DIMS.d_model],
                    data: vec![0.5; seq * DIMS.d_model],
                };
                (name.clone(), tensor)
            })
            .collect();
        Json(TraceStatus {
            status: RemoteStatus::Completed,
            description: None,
            result: Some(TraceResult {
                logits: WireTensor {
                    shape: vec![seq, DIMS.vocab_size],
                    data: (0..seq * DIMS.vocab_size).map(|v| v as f32).collect(),
                },
                captures,
            }),
        })
    }

    async fn serve(mock: Arc<Mock>) -> String {
        let app = Router::new()
            .route("/trace", post(accept))
            .route("/trace/{id}", get(status))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(host: String) -> RemoteConfig {
        RemoteConfig {
            host,
            api_key: None,
            poll_interval_ms: 5,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_wire_tensor_shape_check() {
        let bad = WireTensor {
            shape: vec![2, 2],
            data: vec![1.0; 3],
        };
        assert!(bad.to_tensor(&Device::Cpu).is_err());
    }

    #[test]
    fn test_trace_request_uses_hook_names() {
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::MlpOut(1)).patch(
            HookPoint::BlockOut(0),
            Patch::Position {
                position: 1,
                value: Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
            },
        );
        let req = TraceRequest::new("gpt2", &[1, 2], &hooks).unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["inputIds"], serde_json::json!([1, 2]));
        assert_eq!(json["captures"], serde_json::json!(["blocks.1.hook_mlp_out"]));
        assert_eq!(json["patches"][0]["kind"], "position");
        assert_eq!(json["patches"][0]["hook"], "blocks.0.hook_resid_post");
        assert_eq!(json["patches"][0]["value"]["shape"], serde_json::json!([3]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trace_round_trip() {
        let mock = Arc::new(Mock::default());
        let host = serve(Arc::clone(&mock)).await;
        let backend = RemoteBackend::new("toy", DIMS, &config(host)).unwrap();
        assert_eq!(backend.kind(), "remote");

        let output = tokio::task::spawn_blocking(move || {
            let mut hooks = HookSpec::new();
            hooks.capture(HookPoint::AttnOut(0));
            backend.trace(&[1, 2, 3], &hooks)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(output.logits.dims(), &[3, 4]);
        let captured = output.require(&HookPoint::AttnOut(0)).unwrap();
        assert_eq!(captured.dims(), &[3, 3]);
        assert!(mock.polls.load(Ordering::SeqCst) >= 2);
        assert_eq!(mock.last.lock().unwrap().as_ref().unwrap().model, "toy");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_error_status() {
        let mock = Arc::new(Mock {
            fail: true,
            ..Mock::default()
        });
        let host = serve(mock).await;
        let backend = RemoteBackend::new("toy", DIMS, &config(host)).unwrap();

        let err = tokio::task::spawn_blocking(move || backend.trace(&[1], &HookSpec::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<PatchError>(),
            Some(&PatchError::Remote("out of memory".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_host_is_connection_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = RemoteBackend::new("toy", DIMS, &config(format!("http://{addr}"))).unwrap();
        let err = tokio::task::spawn_blocking(move || backend.trace(&[1], &HookSpec::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::Connection(_))
        ));
    }

    #[test]
    fn test_requires_runtime() {
        assert!(RemoteBackend::new("toy", DIMS, &config("http://localhost".into())).is_err());
    }
}
