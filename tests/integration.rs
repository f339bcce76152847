//! Integration tests for patchlens
//!
//! Everything runs against the seeded toy model on CPU; no downloads.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use patchlens::jobs::{JobRegistry, JobRunner, ResultEvent};
use patchlens::server::job_events;
use patchlens::{
    toy_model, AppState, Completion, Connection, PatchEngine, PatchRequest, PatchResponse,
    PerplexRequest, ServiceConfig, Silent, Submodule, TokenScorer, WordTokenizer,
};
use futures::StreamExt;
use tempfile::NamedTempFile;

fn patch_request(source: &str, dest: &str, submodule: Submodule, patch_tokens: bool) -> PatchRequest {
    let tok = WordTokenizer::default();
    PatchRequest {
        model: "toy".into(),
        source: Completion {
            id: "source".into(),
            prompt: source.into(),
        },
        destination: Completion {
            id: "destination".into(),
            prompt: dest.into(),
        },
        edits: vec![],
        submodule,
        patch_tokens,
        correct_id: tok.token_id(" on").unwrap(),
        incorrect_id: tok.token_id(" down"),
    }
}

/// "The cat sat" into "The dog sat", per token of the residual stream
#[test]
fn test_cat_dog_scenario() {
    let model = toy_model(2, 1).unwrap();
    let req = patch_request("The cat sat", "The dog sat", Submodule::Blocks, true);
    let resp = PatchEngine::new(&model).run(&req, &Silent).unwrap();

    assert_eq!(resp.results.len(), 2);
    assert!(resp.results.iter().all(|row| row.len() == 3));
    assert_eq!(resp.col_labels, vec!["The", " dog", " sat"]);
    assert_eq!(resp.row_labels, vec!["0", "1"]);
    // Position 0 is identical in both prompts under causal attention
    for row in &resp.results {
        assert!(row[0].abs() < 1e-3, "column 0 should be ~0, got {}", row[0]);
    }
    // Patching the last position of the last block reproduces the source run
    assert!((resp.results[1][2] - 1.0).abs() < 1e-3);
}

#[test]
fn test_identity_patch_every_mode() {
    let model = toy_model(2, 2).unwrap();
    let engine = PatchEngine::new(&model);
    let cases = [
        (Submodule::Attn, false),
        (Submodule::Mlp, false),
        (Submodule::Blocks, false),
        (Submodule::Heads, false),
        (Submodule::Mlp, true),
    ];
    for (submodule, patch_tokens) in cases {
        let req = patch_request("The cat sat on", "The cat sat on", submodule, patch_tokens);
        let resp = engine.run(&req, &Silent).unwrap();
        for value in resp.results.iter().flatten() {
            assert!(
                (value - 1.0).abs() < 1e-4,
                "{submodule} (tokens: {patch_tokens}): {value}"
            );
        }
    }
}

#[test]
fn test_grid_shapes_follow_mode() {
    let model = toy_model(3, 2).unwrap();
    let engine = PatchEngine::new(&model);
    let shape = |resp: &PatchResponse| (resp.results.len(), resp.results[0].len());

    let req = patch_request("The cat sat", "The dog sat", Submodule::Attn, false);
    assert_eq!(shape(&engine.run(&req, &Silent).unwrap()), (3, 1));

    let req = patch_request("The cat sat", "The dog sat", Submodule::Heads, false);
    assert_eq!(shape(&engine.run(&req, &Silent).unwrap()), (3, 2));

    let req = patch_request("The cat sat on", "The dog sat on", Submodule::Mlp, true);
    assert_eq!(shape(&engine.run(&req, &Silent).unwrap()), (3, 4));

    let mut req = patch_request("When John went", "When Mary John went", Submodule::Attn, true);
    req.edits = vec![Connection::new(vec![1], vec![1, 2])];
    let resp = engine.run(&req, &Silent).unwrap();
    assert_eq!(shape(&resp), (3, 3));
    assert_eq!(resp.col_labels, vec!["When", " Mary John", " went"]);
}

#[test]
fn test_perplexity_ranks_are_consistent() {
    let model = toy_model(2, 1).unwrap();
    let req = PerplexRequest {
        model: "toy".into(),
        prompt: "When Mary went".into(),
        output: " to the store".into(),
        top_k: 5,
    };
    let resp = TokenScorer::new(&model).score(&req, &Silent).unwrap();
    assert_eq!(resp.prompt_tokens.len(), 2);
    assert_eq!(resp.output_tokens.len(), 3);
    for scored in resp.prompt_tokens.iter().chain(&resp.output_tokens) {
        // Tokens ranked above this one are strictly more likely
        let better = scored
            .top_alternatives
            .iter()
            .filter(|alt| alt.probability > scored.probability)
            .count();
        assert!(better < scored.rank);
        assert!(scored.probability > 0.0 && scored.probability <= 1.0);
    }
}

#[tokio::test]
async fn test_streams_terminate_exactly_once() {
    let runner = JobRunner::new(Arc::new(JobRegistry::new(8)));
    let model = Arc::new(toy_model(2, 1).unwrap());

    let good = {
        let model = Arc::clone(&model);
        let req = patch_request("The cat sat", "The dog sat", Submodule::Blocks, true);
        runner.submit("patch", move |ctx| PatchEngine::new(&model).run(&req, ctx))
    };
    let bad = {
        let model = Arc::clone(&model);
        let req = patch_request("The cat sat", "The dog sat on", Submodule::Blocks, true);
        runner.submit("patch", move |ctx| PatchEngine::new(&model).run(&req, ctx))
    };

    for (id, expect_result) in [(good, true), (bad, false)] {
        let events = runner.registry().listen(&id).unwrap().collect().await;
        assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
        assert_eq!(events.last(), Some(&ResultEvent::Complete));
        let terminal = &events[events.len() - 2];
        if expect_result {
            assert!(matches!(terminal, ResultEvent::Result(_)));
        } else {
            assert!(matches!(terminal, ResultEvent::Error(msg) if msg.starts_with("Processing error")));
        }
    }
}

#[tokio::test]
async fn test_unknown_job_stream() {
    let registry = JobRegistry::new(8);
    let events: Vec<ResultEvent> = job_events(&registry, "7b1f4a52-0c3e-4d7e-9a61-2f0d8c9e1b44")
        .collect()
        .await;
    assert_eq!(
        events,
        vec![ResultEvent::error("Job not found"), ResultEvent::Complete]
    );
}

#[tokio::test]
async fn test_job_ids_unique_and_resolvable() {
    let runner = JobRunner::new(Arc::new(JobRegistry::new(8)));
    let ids: Vec<_> = (0..50).map(|i| runner.submit("count", move |_| Ok(i))).collect();
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());

    for (i, id) in ids.iter().enumerate() {
        let events = runner.registry().listen(id).unwrap().collect().await;
        assert!(events.contains(&ResultEvent::Result(serde_json::json!(i))));
    }
}

#[test]
fn test_config_file_builds_state() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "bind": "127.0.0.1:0",
        "stream_capacity": 16,
        "models": [
            {{"name": "toy-small", "source": "toy"}},
            {{"name": "toy-deep", "source": "toy", "n_layers": 4, "n_heads": 2}}
        ]
    }}"#
    )
    .unwrap();

    let config = ServiceConfig::load(file.path()).unwrap();
    let models: HashMap<_, _> = config.build_models().unwrap();
    let state = AppState::new(models, Arc::new(JobRegistry::new(config.stream_capacity)));

    let infos = state.model_infos();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].name, "toy-deep");
    assert_eq!(infos[0].n_layers, 4);
    assert_eq!(infos[0].n_heads, 2);
    assert!(state.model("gpt2").is_err());
}
