//! HTTP surface
//!
//! Every computation route validates synchronously, submits a job and
//! answers `{jobId}` right away. Results are read from
//! `GET /jobs/{jobId}/listen` as server-sent events.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{ApiResult, PatchError};
use crate::generation::Generator;
use crate::jobs::{JobId, JobRegistry, JobRunner, ResultEvent};
use crate::logit_lens::LogitLens;
use crate::model::{ModelInfo, PatchModel};
use crate::patching::PatchEngine;
use crate::perplexity::TokenScorer;
use crate::schema::{
    GenerationRequest, GridLensRequest, JobAccepted, LineLensRequest, PatchRequest,
    PerplexRequest, PredictionRequest,
};

pub struct AppState {
    models: HashMap<String, Arc<PatchModel>>,
    runner: JobRunner,
}

impl AppState {
    pub fn new(models: HashMap<String, Arc<PatchModel>>, registry: Arc<JobRegistry>) -> Self {
        Self {
            models,
            runner: JobRunner::new(registry),
        }
    }

    pub fn model(&self, name: &str) -> Result<Arc<PatchModel>, PatchError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| PatchError::UnknownModel(name.to_string()))
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.runner.registry()
    }

    /// Model descriptions sorted by name
    pub fn model_infos(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self.models.values().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/patch", post(submit_patch))
        .route("/lens/grid", post(submit_grid_lens))
        .route("/lens/line", post(submit_line_lens))
        .route("/models/generate", post(submit_generation))
        .route("/models/prediction", post(submit_prediction))
        .route("/perplex/calculate", post(submit_perplex))
        .route("/jobs/{job_id}/listen", get(listen))
        .route("/models", get(list_models))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop finished jobs that nobody listened to
pub fn spawn_reaper(registry: Arc<JobRegistry>, ttl: Duration) -> tokio::task::JoinHandle<()> {
    let period = (ttl / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let reaped = registry.reap_abandoned(ttl);
            if reaped > 0 {
                info!("Reaped {} abandoned jobs", reaped);
            }
        }
    })
}

fn accepted(id: JobId) -> Json<JobAccepted> {
    Json(JobAccepted {
        job_id: id.to_string(),
    })
}

async fn submit_patch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PatchRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let plan = PatchEngine::new(&model).prepare(&request)?;
    debug!("Accepted patch request: {:?}", plan);

    let id = state
        .runner
        .submit("patch", move |ctx| PatchEngine::new(&model).execute(&plan, ctx));
    Ok(accepted(id))
}

async fn submit_grid_lens(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GridLensRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let id = state.runner.submit("lens/grid", move |ctx| {
        LogitLens::new(&model).grid(&request.prompt, ctx)
    });
    Ok(accepted(id))
}

async fn submit_line_lens(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LineLensRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let id = state.runner.submit("lens/line", move |ctx| {
        LogitLens::new(&model).line(&request.prompt, &request.token, ctx)
    });
    Ok(accepted(id))
}

async fn submit_generation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let id = state.runner.submit("generate", move |ctx| {
        Generator::new(&model).generate(&request, ctx)
    });
    Ok(accepted(id))
}

async fn submit_prediction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictionRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let id = state.runner.submit("prediction", move |ctx| {
        Generator::new(&model).predict(&request.prompt, request.idx, ctx)
    });
    Ok(accepted(id))
}

async fn submit_perplex(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PerplexRequest>,
) -> ApiResult<Json<JobAccepted>> {
    let model = state.model(&request.model)?;
    let id = state.runner.submit("perplex", move |ctx| {
        TokenScorer::new(&model).score(&request, ctx)
    });
    Ok(accepted(id))
}

fn to_sse(event: &ResultEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.payload().to_string())
}

/// Event stream for one job; unknown ids get `error` then `complete`
pub fn job_events(
    registry: &JobRegistry,
    job_id: &str,
) -> impl Stream<Item = ResultEvent> + Send + 'static {
    let listener = job_id
        .parse::<JobId>()
        .and_then(|id| registry.listen(&id));

    stream! {
        match listener {
            Ok(listener) => {
                let mut events = Box::pin(listener.into_stream());
                while let Some(event) = events.next().await {
                    yield event;
                }
            }
            Err(e) => {
                debug!("Listen failed: {}", e);
                yield ResultEvent::error("Job not found");
                yield ResultEvent::Complete;
            }
        }
    }
}

async fn listen(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = job_events(state.registry(), &job_id);
    let frames = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Sse::new(frames).keep_alive(KeepAlive::default())
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelInfo>> {
    Json(state.model_infos())
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toy::toy_model;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn state() -> Arc<AppState> {
        let model = Arc::new(toy_model(2, 1).unwrap());
        let models = HashMap::from([("toy".to_string(), model)]);
        Arc::new(AppState::new(models, Arc::new(JobRegistry::new(64))))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn patch_body(dest_prompt: &str) -> Value {
        json!({
            "model": "toy",
            "source": {"id": "s", "prompt": "The cat sat"},
            "destination": {"id": "d", "prompt": dest_prompt},
            "submodule": "blocks",
            "correctId": 5,
            "incorrectId": 6,
            "patchTokens": true
        })
    }

    #[tokio::test]
    async fn test_health_and_models() {
        let app = build_router(state());
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");

        let response = app
            .oneshot(Request::get("/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let models = body_json(response).await;
        assert_eq!(models[0]["name"], "toy");
        assert_eq!(models[0]["nLayers"], 2);
    }

    #[tokio::test]
    async fn test_patch_job_streams_result() {
        let app = build_router(state());
        let response = app
            .clone()
            .oneshot(post_json("/patch", patch_body("The dog sat")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = body_json(response).await["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get(format!("/jobs/{job_id}/listen"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.starts_with("event: status\n"));
        assert!(text.contains("event: result\n"));
        assert!(text.trim_end().ends_with("event: complete\ndata: {}"));
        assert_eq!(text.matches("event: complete").count(), 1);
    }

    #[tokio::test]
    async fn test_validation_is_synchronous() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json("/patch", patch_body("The dog sat down")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_empty_prompt_is_422() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json("/patch", patch_body("")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("no tokens"));
    }

    #[tokio::test]
    async fn test_perplex_job_streams_scores() {
        let state = state();
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(post_json(
                "/perplex/calculate",
                json!({"model": "toy", "prompt": "The cat", "output": " sat on"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = body_json(response).await["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let events: Vec<ResultEvent> = job_events(state.registry(), &job_id).collect().await;
        let ResultEvent::Result(payload) = &events[events.len() - 2] else {
            panic!("expected a result event, got {events:?}");
        };
        assert_eq!(payload["model_name"], "toy");
        assert_eq!(payload["prompt_tokens"].as_array().unwrap().len(), 1);
        assert_eq!(payload["output_tokens"].as_array().unwrap().len(), 2);
        assert_eq!(payload["output_tokens"][0]["top_alternatives"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(
                "/lens/grid",
                json!({"model": "gpt-x", "prompt": "The cat"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_job_ends_with_complete() {
        let state = state();
        let events: Vec<ResultEvent> = job_events(state.registry(), "not-a-job").collect().await;
        assert_eq!(
            events,
            vec![ResultEvent::error("Job not found"), ResultEvent::Complete]
        );

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::get("/jobs/00000000-0000-0000-0000-000000000000/listen")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.starts_with("event: error\n"));
        assert!(text.contains("Job not found"));
        assert!(text.trim_end().ends_with("event: complete\ndata: {}"));
    }

    #[tokio::test]
    async fn test_second_listener_gets_not_found() {
        let state = state();
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(post_json(
                "/models/prediction",
                json!({"model": "toy", "prompt": "The cat"}),
            ))
            .await
            .unwrap();
        let job_id = body_json(response).await["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let first: Vec<ResultEvent> = job_events(state.registry(), &job_id).collect().await;
        assert!(matches!(first[first.len() - 2], ResultEvent::Result(_)));
        let second: Vec<ResultEvent> = job_events(state.registry(), &job_id).collect().await;
        assert_eq!(second[0], ResultEvent::error("Job not found"));
    }
}
