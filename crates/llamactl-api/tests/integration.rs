use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use llamactl_api::app;
use llamactl_backend::mock::{MockHealth, MockRuntime};
use llamactl_common::{ControlConfig, ModelProfile, ProfileSet};
use llamactl_core::{ControlPlane, ExitIntent};
use serde_json::{json, Value};

struct Server {
    base: String,
    plane: ControlPlane,
    runtime: Arc<MockRuntime>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
    _srv: tokio::task::JoinHandle<()>,
}

fn profile(id: &str, model: &str, benchmark: bool) -> ModelProfile {
    ModelProfile {
        id: id.into(),
        name: format!("Model {}", id.to_uppercase()),
        speed: "~40 t/s".into(),
        model: model.into(),
        ctx_size: "8192".into(),
        benchmark,
        ..Default::default()
    }
}

async fn start(health: MockHealth) -> Server {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.gguf"), b"gguf").unwrap();
    let profiles = ProfileSet::new(vec![
        profile("a", "a.gguf", false),
        profile("b", "missing.gguf", false),
        profile("a-bench", "a.gguf", true),
    ])
    .unwrap();
    let config = ControlConfig {
        compose_file: dir.path().join("docker-compose.yml"),
        model_dir: dir.path().to_path_buf(),
        health_poll_interval_ms: 10,
        health_timeout_secs: 5,
        command_timeout_secs: 2,
        switch_wait_secs: 1,
        ..Default::default()
    };
    let runtime = Arc::new(MockRuntime::new());
    let plane = ControlPlane::new(config, profiles, runtime.clone(), Arc::new(health));

    let app: Router = app(plane.clone()).unwrap();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });

    Server {
        base: format!("http://{}:{}", addr.ip(), addr.port()),
        plane,
        runtime,
        client: reqwest::Client::new(),
        _dir: dir,
        _srv: srv,
    }
}

impl Server {
    async fn get(&self, path: &str) -> (u16, Value) {
        let r = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
        (r.status().as_u16(), r.json().await.unwrap())
    }

    async fn switch(&self, body: Value) -> (u16, Value) {
        let r = self.client.post(format!("{}/switch", self.base)).json(&body).send().await.unwrap();
        (r.status().as_u16(), r.json().await.unwrap())
    }
}

#[tokio::test]
async fn status_and_models_before_any_switch() {
    let s = start(MockHealth::healthy_after(1)).await;

    let r = s.client.get(format!("{}/healthz", s.base)).send().await.unwrap();
    assert_eq!(r.text().await.unwrap(), "ok");

    let (code, status) = s.get("/status").await;
    assert_eq!(code, 200);
    assert_eq!(status["state"], "idle");
    assert!(status["model"].is_null());

    let (_, models) = s.get("/models").await;
    let models = models.as_array().unwrap();
    assert_eq!(models.len(), 3);
    assert_eq!(models[0]["contextSize"], "8192");
    assert_eq!(models[2]["isBenchmark"], true);
    assert!(models.iter().all(|m| m["active"] == false));
}

#[tokio::test]
async fn switch_waits_for_health_and_marks_active() {
    let s = start(MockHealth::healthy_after(2)).await;

    let (code, body) = s.switch(json!({"model": "a"})).await;
    assert_eq!(code, 200);
    assert_eq!(body, json!({"success": true, "model": "a", "modelName": "Model A", "state": "running", "status": ""}));

    let (_, status) = s.get("/status").await;
    assert_eq!(status["model"], "a");
    assert_eq!(status["modelName"], "Model A");
    assert_eq!(status["state"], "running");

    let (_, models) = s.get("/models").await;
    let active: Vec<_> = models.as_array().unwrap().iter().filter(|m| m["active"] == true).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["id"], "a");
    assert_eq!(s.runtime.count("start"), 1);
}

#[tokio::test]
async fn switch_error_codes() {
    let s = start(MockHealth::healthy_after(1)).await;

    let (code, _) = s.switch(json!({"model": "nope"})).await;
    assert_eq!(code, 404);

    let (code, body) = s.switch(json!({"name": "a"})).await;
    assert_eq!(code, 400);
    assert!(body["error"].is_string());

    let r = s.client.post(format!("{}/switch", s.base)).header("content-type", "application/json").body("{").send().await.unwrap();
    assert_eq!(r.status().as_u16(), 400);

    let (code, body) = s.switch(json!({"model": "b"})).await;
    assert_eq!(code, 200);
    assert_eq!(body["success"], false);
    assert_eq!(body["state"], "idle");
    assert!(body["status"].as_str().unwrap().contains("missing.gguf"));
    assert!(s.runtime.calls().is_empty());
}

#[tokio::test]
async fn concurrent_switch_conflicts_and_slow_switch_is_accepted() {
    let s = start(MockHealth::never()).await;

    let first = {
        let client = s.client.clone();
        let url = format!("{}/switch", s.base);
        tokio::spawn(async move {
            let r = client.post(url).json(&json!({"model": "a"})).send().await.unwrap();
            (r.status().as_u16(), r.json::<Value>().await.unwrap())
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (code, body) = s.switch(json!({"model": "a"})).await;
    assert_eq!(code, 409);
    assert_eq!(body["state"], "starting");

    // the health probe never passes, so the bounded wait runs out first
    let (code, body) = first.await.unwrap();
    assert_eq!(code, 202);
    assert_eq!(body["success"], false);
    assert_eq!(body["model"], "a");
    assert_eq!(body["state"], "starting");
}

#[tokio::test]
async fn logs_telemetry_and_metrics() {
    let s = start(MockHealth::healthy_after(1)).await;
    s.runtime.set_log_lines(vec!["llama-server-1  | loading model".into(), "llama-server-1  | listening".into()]);
    let (code, _) = s.switch(json!({"model": "a"})).await;
    assert_eq!(code, 200);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_, logs) = s.get("/logs?tail=1").await;
    assert_eq!(logs["lines"], json!(["listening"]));

    let (_, telemetry) = s.get("/telemetry").await;
    assert_eq!(telemetry["state"], "running");
    assert_eq!(telemetry["activeModel"]["profileId"], "a");
    assert_eq!(telemetry["activeModel"]["displayName"], "Model A");
    assert!(telemetry["host"]["memTotalMib"].is_u64());
    assert!(telemetry["container"].get("cpuPercentText").is_some());
    assert!(telemetry.get("log_lines").is_none());

    let text = s.client.get(format!("{}/metrics", s.base)).send().await.unwrap().text().await.unwrap();
    assert!(text.contains("llamactl_lifecycle_state{state=\"running\"} 1"));
}

#[tokio::test]
async fn shutdown_request_reaches_the_plane() {
    let s = start(MockHealth::healthy_after(1)).await;
    let r = s
        .client
        .post(format!("{}/shutdown", s.base))
        .json(&json!({"intent": "menu"}))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status().as_u16(), 202);
    let body: Value = r.json().await.unwrap();
    assert_eq!(body["code"], 2);

    let intent = tokio::time::timeout(Duration::from_secs(1), s.plane.exit_requested()).await.unwrap();
    assert_eq!(intent, ExitIntent::ReturnToMenu);
}
