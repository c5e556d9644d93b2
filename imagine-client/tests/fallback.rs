use std::{collections::HashSet, sync::Arc, time::Duration};

use imagine_client::{ClientConfig, ClientError, GenerateRequest, ImagineClient};
use serde_json::json;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

async fn server_with_models(models: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "available_models": models,
            "default_model": models.first().copied().unwrap_or("sdxl"),
            "model_status": {},
            "system_info": {
                "cpu_usage": 1.0,
                "memory_usage": 50.0,
                "available_memory": 8.0,
                "total_memory": 16.0
            }
        })))
        .mount(&server)
        .await;
    server
}

fn client(server: &MockServer, dir: &tempfile::TempDir) -> ImagineClient {
    ImagineClient::new(ClientConfig {
        base_url: server.uri(),
        token: Some("s3cret".into()),
        output_dir: dir.path().to_path_buf(),
        timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    })
    .unwrap()
}

async fn respond(server: &MockServer, model: &str, template: ResponseTemplate, expect: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/imagine/{model}")))
        .respond_with(template)
        .expect(expect)
        .mount(server)
        .await;
}

fn png() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "image/png")
        .set_body_bytes(PNG)
}

fn failure(detail: &str) -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_json(json!({ "detail": detail }))
}

#[tokio::test]
async fn saves_image_and_history_on_success() {
    let server = server_with_models(&["sdxl"]).await;
    Mock::given(method("POST"))
        .and(path("/imagine/sdxl"))
        .and(query_param("prompt", "A cat"))
        .and(query_param("img_size", "512"))
        .and(query_param("num_inference_steps", "30"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(png())
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir);
    let mut request = GenerateRequest::new("A cat", "sdxl");
    request.num_inference_steps = Some(30);
    let image = client.generate_image(&request).await.unwrap();

    assert_eq!(image.model, "sdxl");
    assert!(image.path.starts_with(dir.path()));
    let name = image.path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("sdxl_A cat_"));
    assert_eq!(std::fs::read(&image.path).unwrap(), PNG);

    let history = client.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].prompt, "A cat");
    assert_eq!(history[0].path, image.path);
    assert_eq!(history[0].parameters.model, "sdxl");
    assert_eq!(history[0].parameters.num_inference_steps, Some(30));
}

#[tokio::test]
async fn empty_prompt_fails_before_network() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let err = client(&server, &dir)
        .generate_image(&GenerateRequest::new("  ", "sdxl"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidPrompt(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unavailable_primary_without_fallbacks() {
    let server = server_with_models(&["flux"]).await;
    let dir = tempfile::tempdir().unwrap();
    let err = client(&server, &dir)
        .generate_image(&GenerateRequest::new("ok", "sdxl"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ModelUnavailable(model) if model == "sdxl"));
}

#[tokio::test]
async fn no_fallback_is_available() {
    let server = server_with_models(&["flux"]).await;
    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "sdxl").with_fallbacks(["sd2"]);
    let err = client(&server, &dir).generate_image(&request).await.unwrap_err();
    assert!(matches!(err, ClientError::NoAvailableModels));
}

#[tokio::test]
async fn walks_fallbacks_in_order_and_reports_last_failure() {
    let server = server_with_models(&["y", "z"]).await;
    respond(&server, "x", png(), 0).await;
    respond(&server, "y", failure("y exploded"), 1).await;
    respond(&server, "z", failure("z exploded"), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "x").with_fallbacks(["y", "z"]);
    let err = client(&server, &dir).generate_image(&request).await.unwrap_err();

    assert_eq!(err.model(), Some("z"));
    let ClientError::Status { status, body, .. } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(status.as_u16(), 500);
    assert!(body.contains("z exploded"));

    let attempts: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(attempts, ["/imagine/y", "/imagine/z"]);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn failed_primary_falls_back() {
    let server = server_with_models(&["sdxl", "flux"]).await;
    respond(&server, "sdxl", ResponseTemplate::new(503), 1).await;
    respond(&server, "flux", png(), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "sdxl").with_fallbacks(["sdxl", "flux"]);
    let image = client(&server, &dir).generate_image(&request).await.unwrap();
    assert_eq!(image.model, "flux");
    assert!(image
        .path
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("flux_ok_"));
}

#[tokio::test]
async fn unloaded_catalog_model_is_skipped_for_loaded_fallback() {
    // flux is in the catalog but failed to load, so /info only lists sdxl.
    let server = server_with_models(&["sdxl"]).await;
    respond(&server, "flux", png(), 0).await;
    respond(&server, "sdxl", png(), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "flux").with_fallbacks(["flux", "sdxl"]);
    let image = client(&server, &dir).generate_image(&request).await.unwrap();
    assert_eq!(image.model, "sdxl");
}

#[tokio::test]
async fn identical_requests_keep_every_image() {
    let server = server_with_models(&["sdxl"]).await;
    respond(&server, "sdxl", png(), 2).await;

    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir);
    let request = GenerateRequest::new("A cat", "sdxl");
    let first = client.generate_image(&request).await.unwrap();
    let second = client.generate_image(&request).await.unwrap();

    assert_ne!(first.path, second.path);
    assert_eq!(std::fs::read(&first.path).unwrap(), PNG);
    assert_eq!(std::fs::read(&second.path).unwrap(), PNG);
    let history = client.history();
    assert_eq!(history.len(), 2);
    assert_ne!(history[0].path, history[1].path);
}

#[tokio::test]
async fn concurrent_generations_all_reach_history() {
    let server = server_with_models(&["sdxl"]).await;
    respond(&server, "sdxl", png(), 10).await;

    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ImagineClient::new(ClientConfig {
        base_url: server.uri(),
        output_dir: dir.path().to_path_buf(),
        min_request_interval: Duration::ZERO,
        ..ClientConfig::default()
    })
    .unwrap());

    let tasks = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .generate_image(&GenerateRequest::new("A cat", "sdxl"))
                    .await
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();
    let mut paths = HashSet::new();
    for task in tasks {
        paths.insert(task.await.unwrap().path);
    }

    assert_eq!(paths.len(), 10);
    let history = client.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history.into_iter().map(|e| e.path).collect::<HashSet<_>>(), paths);
}

#[tokio::test]
async fn generation_calls_are_spaced() {
    let server = server_with_models(&["sdxl"]).await;
    respond(&server, "sdxl", png(), 3).await;

    let dir = tempfile::tempdir().unwrap();
    let client = ImagineClient::new(ClientConfig {
        base_url: server.uri(),
        output_dir: dir.path().to_path_buf(),
        min_request_interval: Duration::from_millis(100),
        ..ClientConfig::default()
    })
    .unwrap();
    let started = std::time::Instant::now();
    for _ in 0..3 {
        client
            .generate_image(&GenerateRequest::new("ok", "sdxl"))
            .await
            .unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn model_names_are_path_escaped() {
    let server = server_with_models(&["a/b"]).await;
    respond(&server, "a%2Fb", png(), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let image = client(&server, &dir)
        .generate_image(&GenerateRequest::new("ok", "a/b"))
        .await
        .unwrap();
    assert_eq!(image.model, "a/b");
}

#[tokio::test]
async fn timeout_is_retried_on_next_model() {
    let server = server_with_models(&["sdxl", "flux"]).await;
    respond(&server, "sdxl", png().set_delay(Duration::from_secs(3)), 1).await;
    respond(&server, "flux", png(), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "sdxl").with_fallbacks(["flux"]);
    let image = client(&server, &dir).generate_image(&request).await.unwrap();
    assert_eq!(image.model, "flux");
}

#[tokio::test]
async fn unreachable_info_means_nothing_available() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let request = GenerateRequest::new("ok", "sdxl").with_fallbacks(["flux"]);
    let err = client(&server, &dir).generate_image(&request).await.unwrap_err();
    assert!(matches!(err, ClientError::NoAvailableModels));
}

#[tokio::test]
async fn passes_through_server_endpoints() {
    let server = server_with_models(&["sdxl"]).await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "healthy",
            "loaded_models": ["sdxl"],
            "system_info": {
                "cpu_usage": 0.0,
                "memory_usage": 0.0,
                "available_memory": 0.0,
                "total_memory": 0.0
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reload_model/sdxl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "sdxl",
            "status": "failed",
            "error": "Failed to load model sdxl: disk full"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/model_info/dalle"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Model dalle not found"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir);

    let health = client.check_health().await.unwrap();
    assert_eq!(health.loaded_models, ["sdxl"]);

    let info = client.server_info().await.unwrap();
    assert_eq!(info.available_models, ["sdxl"]);

    let reload = client.reload_model("sdxl").await.unwrap();
    assert_eq!(reload.error.as_deref(), Some("Failed to load model sdxl: disk full"));

    let err = client.model_info("dalle").await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status, .. } if status.as_u16() == 404));
}
