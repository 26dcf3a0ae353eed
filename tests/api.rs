use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt;

use prompt_architect::{
    data_uri::DataUri,
    gemini::{GeminiError, GenerationService},
    models::OptimizedPrompt,
    prompts::{parse_proposals, MANDATED_PREFIX},
    routes::{router, AppState},
    workflow::{MISSING_IMAGES_MESSAGE, OPTIMIZE_FAILED_MESSAGE, PREVIEW_FAILED_MESSAGE},
};

const PORTRAIT: &str = "data:image/jpeg;base64,UA==";
const PRODUCT: &str = "data:image/png;base64,UQ==";

/// Stands in for Gemini: optimize answers with canned JSON text, preview with a canned image.
#[derive(Default)]
struct FakeGenerator {
    optimize_text: String,
    preview: Option<DataUri>,
    optimize_calls: AtomicUsize,
    preview_calls: AtomicUsize,
    preview_requests: Mutex<Vec<(String, String)>>,
    /// When set, optimize calls signal `started` and then wait for `release`.
    optimize_gate: Option<(Arc<Notify>, Arc<Notify>)>,
    /// When set, previews signal `started` and then wait for `release`.
    preview_gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

#[async_trait]
impl GenerationService for FakeGenerator {
    async fn optimize_prompts(&self, _portrait: &DataUri, _product: &DataUri) -> Result<Vec<OptimizedPrompt>, GeminiError> {
        self.optimize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.optimize_gate {
            started.notify_one();
            release.notified().await;
        }
        Ok(parse_proposals(&self.optimize_text)?)
    }

    async fn generate_preview(&self, portrait: &DataUri, prompt: &str) -> Result<DataUri, GeminiError> {
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        self.preview_requests.lock().push((portrait.to_string(), prompt.to_string()));
        if let Some((started, release)) = &self.preview_gate {
            started.notify_one();
            release.notified().await;
        }
        self.preview.clone().ok_or(GeminiError::NoImage)
    }
}

fn four_proposals() -> String {
    let items: Vec<Value> = ["T1", "T2", "T3", "T4"]
        .iter()
        .map(|t| json!({
            "title": t,
            "prompt": format!("{MANDATED_PREFIX}, eye-level cinematic shot for {t}"),
            "camera": "Canon EOS R5",
            "focalLength": "35mm f/1.4",
            "lighting": "high-end commercial lighting",
            "environment": "sunlit studio",
        }))
        .collect();
    Value::Array(items).to_string()
}

fn working_generator() -> FakeGenerator {
    FakeGenerator {
        optimize_text: four_proposals(),
        preview: Some(DataUri::from_base64("image/png", "QkJC")),
        ..Default::default()
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder.header("content-type", "application/json").body(Body::from(v.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn new_session(app: &Router) -> String {
    let (status, view) = send_json(app, "POST", "/api/sessions", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(view["phase"], "empty");
    view["id"].as_str().unwrap().to_string()
}

async fn upload(app: &Router, id: &str, slot: &str, image: &str) -> (StatusCode, Value) {
    send_json(app, "PUT", &format!("/api/sessions/{id}/{slot}"), Some(json!({ "image": image }))).await
}

async fn optimized_session(app: &Router) -> (String, Value) {
    let id = new_session(app).await;
    upload(app, &id, "portrait", PORTRAIT).await;
    let (_, view) = upload(app, &id, "product", PRODUCT).await;
    assert_eq!(view["phase"], "ready");
    let (status, view) = send_json(app, "POST", &format!("/api/sessions/{id}/optimize"), None).await;
    assert_eq!(status, StatusCode::OK);
    (id, view)
}

#[tokio::test]
async fn optimize_then_preview_scenario() {
    let generator = Arc::new(working_generator());
    let app = router(AppState::new(generator.clone()));

    let (id, view) = optimized_session(&app).await;
    assert_eq!(view["phase"], "has-results");
    let proposals = view["result"]["optimizedPrompts"].as_array().unwrap().clone();
    assert_eq!(proposals.len(), 4);
    let titles: Vec<&str> = proposals.iter().map(|p| p["title"].as_str().unwrap()).collect();
    assert_eq!(titles, vec!["T1", "T2", "T3", "T4"]);
    assert!(proposals.iter().all(|p| p["prompt"].as_str().unwrap().starts_with(MANDATED_PREFIX)));
    assert_eq!(view["result"]["originalImage"], PORTRAIT);
    assert!(view["result"].get("generatedImage").is_none());

    let t2 = proposals[1]["id"].as_str().unwrap();
    let (status, view) = send_json(&app, "POST", &format!("/api/sessions/{id}/proposals/{t2}/preview"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "has-preview");
    assert_eq!(view["result"]["generatedImage"], "data:image/png;base64,QkJC");
    assert_eq!(view["result"]["previewProposalId"], t2);
    assert_eq!(view["result"]["optimizedPrompts"].as_array().unwrap(), &proposals);

    assert_eq!(generator.optimize_calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.preview_calls.load(Ordering::SeqCst), 1);
    let requests = generator.preview_requests.lock().clone();
    assert_eq!(requests, vec![(PORTRAIT.to_string(), proposals[1]["prompt"].as_str().unwrap().to_string())]);
}

#[tokio::test]
async fn optimize_without_both_images_makes_no_call() {
    let generator = Arc::new(working_generator());
    let app = router(AppState::new(generator.clone()));

    let id = new_session(&app).await;
    upload(&app, &id, "portrait", PORTRAIT).await;
    let (status, body) = send_json(&app, "POST", &format!("/api/sessions/{id}/optimize"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], MISSING_IMAGES_MESSAGE);
    assert_eq!(generator.optimize_calls.load(Ordering::SeqCst), 0);

    let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(view["error"], MISSING_IMAGES_MESSAGE);
    assert!(view.get("result").is_none());
}

#[tokio::test]
async fn malformed_optimizer_response_is_a_generic_failure() {
    for text in ["", "not json", "[]", "[{\"title\": \"T1\"}]"] {
        let generator = Arc::new(FakeGenerator { optimize_text: text.to_string(), ..Default::default() });
        let app = router(AppState::new(generator.clone()));

        let id = new_session(&app).await;
        upload(&app, &id, "portrait", PORTRAIT).await;
        upload(&app, &id, "product", PRODUCT).await;
        let (status, body) = send_json(&app, "POST", &format!("/api/sessions/{id}/optimize"), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY, "response text {text:?}");
        assert_eq!(body["error"], OPTIMIZE_FAILED_MESSAGE);

        let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(view["phase"], "ready");
        assert_eq!(view["optimizing"], false);
        assert!(view.get("result").is_none());
        assert_eq!(generator.optimize_calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn preview_without_image_fragment_fails() {
    let generator = Arc::new(FakeGenerator { optimize_text: four_proposals(), ..Default::default() });
    let app = router(AppState::new(generator));

    let (id, view) = optimized_session(&app).await;
    let first = view["result"]["optimizedPrompts"][0]["id"].as_str().unwrap().to_string();
    let (status, body) = send_json(&app, "POST", &format!("/api/sessions/{id}/proposals/{first}/preview"), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], PREVIEW_FAILED_MESSAGE);

    let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(view["phase"], "has-results");
    assert_eq!(view["result"]["optimizedPrompts"].as_array().unwrap().len(), 4);
    assert!(view["result"].get("generatedImage").is_none());
}

#[tokio::test]
async fn concurrent_preview_is_rejected() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let generator = Arc::new(FakeGenerator {
        preview_gate: Some((started.clone(), release.clone())),
        ..working_generator()
    });
    let app = router(AppState::new(generator.clone()));

    let (id, view) = optimized_session(&app).await;
    let first = view["result"]["optimizedPrompts"][0]["id"].as_str().unwrap().to_string();
    let second = view["result"]["optimizedPrompts"][1]["id"].as_str().unwrap().to_string();

    let in_flight = {
        let app = app.clone();
        let uri = format!("/api/sessions/{id}/proposals/{first}/preview");
        tokio::spawn(async move { send_json(&app, "POST", &uri, None).await })
    };
    started.notified().await;

    let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(view["phase"], "generating-preview");
    assert_eq!(view["generatingProposalId"], first.as_str());

    let (status, _) = send_json(&app, "POST", &format!("/api/sessions/{id}/proposals/{second}/preview"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send_json(&app, "POST", &format!("/api/sessions/{id}/optimize"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    release.notify_one();
    let (status, view) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["result"]["previewProposalId"], first.as_str());
    assert_eq!(generator.preview_calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.optimize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_optimize_request_still_completes() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let generator = Arc::new(FakeGenerator {
        optimize_gate: Some((started.clone(), release.clone())),
        ..working_generator()
    });
    let app = router(AppState::new(generator.clone()));

    let id = new_session(&app).await;
    upload(&app, &id, "portrait", PORTRAIT).await;
    upload(&app, &id, "product", PRODUCT).await;

    let request = {
        let app = app.clone();
        let uri = format!("/api/sessions/{id}/optimize");
        tokio::spawn(async move { send_json(&app, "POST", &uri, None).await })
    };
    started.notified().await;
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(view["phase"], "optimizing");

    release.notify_one();
    let mut view = Value::Null;
    for _ in 0..100 {
        view = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await.1;
        if view["phase"] != "optimizing" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(view["phase"], "has-results");
    assert_eq!(view["optimizing"], false);
    assert_eq!(view["busy"], false);
    assert_eq!(view["result"]["optimizedPrompts"].as_array().unwrap().len(), 4);
    assert_eq!(generator.optimize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn copy_returns_prompt_text_and_flags_proposal() {
    let app = router(AppState::new(Arc::new(working_generator())));
    let (id, view) = optimized_session(&app).await;
    let proposal = &view["result"]["optimizedPrompts"][2];
    let pid = proposal["id"].as_str().unwrap();

    let (status, body) = send(&app, "POST", &format!("/api/sessions/{id}/proposals/{pid}/copy"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), proposal["prompt"].as_str().unwrap());

    let (_, view) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(view["copiedProposalId"], pid);
}

#[tokio::test]
async fn reupload_clears_results() {
    let app = router(AppState::new(Arc::new(working_generator())));
    let (id, _) = optimized_session(&app).await;

    let (status, view) = upload(&app, &id, "product", "data:image/png;base64,Ug==").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "ready");
    assert!(view.get("result").is_none());
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let app = router(AppState::new(Arc::new(working_generator())));
    let id = new_session(&app).await;

    let (status, body) = upload(&app, &id, "portrait", "just-some-text").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid image"));

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send_json(&app, "GET", &format!("/api/sessions/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(&app, "POST", &format!("/api/sessions/{id}/proposals/{missing}/preview"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
