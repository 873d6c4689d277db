//! Hot reload of a file-backed configuration between requests

mod support;

use std::sync::Arc;
use std::time::Duration;

use batchbox::config::ConfigStore;
use batchbox::prelude::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG: &str = r#"
providers:
  mock: {base_url: "{uri}", api_key: k}
models:
  flux:
    api_endpoints:
      - provider: mock
        modes: {text2img: {path: PATH, response_path: "data[0]"}}
"#;

fn config_for(uri: &str, request_path: &str) -> String {
    CONFIG.replace("{uri}", uri).replace("PATH", request_path)
}

async fn serve(server: &MockServer, request_path: &str, calls: u64) {
    Mock::given(method("POST"))
        .and(path(request_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"b64_json": "AQID"}]})))
        .expect(calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn reload_applies_to_the_next_request() {
    let server = MockServer::start().await;
    serve(&server, "/v1/old", 1).await;
    serve(&server, "/v1/new", 1).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("api_config.yaml");
    std::fs::write(&file, config_for(&server.uri(), "/v1/old")).expect("write config");

    let store = Arc::new(ConfigStore::open(&file, None).expect("open config"));
    let generator = support::generator(store.clone());

    let before = generator.generate(GenerationRequest::new("flux", "one")).await;
    assert!(before.outcomes[0].success, "{:?}", before.outcomes[0].error);

    std::fs::write(&file, config_for(&server.uri(), "/v1/new")).expect("rewrite config");
    let snapshot = store.reload().expect("reload");
    assert!(store.is_stale(before.config_version));

    let after = generator.generate(GenerationRequest::new("flux", "two")).await;
    assert!(after.outcomes[0].success, "{:?}", after.outcomes[0].error);
    assert_eq!(after.config_version, snapshot.version);
    assert!(after.config_version > before.config_version);
}

#[tokio::test]
async fn file_changes_are_picked_up_without_an_explicit_reload() {
    let server = MockServer::start().await;
    serve(&server, "/v1/old", 1).await;
    serve(&server, "/v1/new", 1).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("api_config.yaml");
    std::fs::write(&file, config_for(&server.uri(), "/v1/old")).expect("write config");

    let store = ConfigStore::open(&file, None)
        .expect("open config")
        .with_check_interval(Duration::ZERO)
        .with_ttl(Some(Duration::ZERO));
    let generator = support::generator(Arc::new(store));

    let before = generator.generate(GenerationRequest::new("flux", "one")).await;
    assert!(before.outcomes[0].success, "{:?}", before.outcomes[0].error);

    std::fs::write(&file, config_for(&server.uri(), "/v1/new")).expect("rewrite config");
    let after = generator.generate(GenerationRequest::new("flux", "two")).await;
    assert!(after.outcomes[0].success, "{:?}", after.outcomes[0].error);
    assert!(after.config_version > before.config_version);
}
