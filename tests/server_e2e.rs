//! Full-stack smoke test: the control plane served over a real loopback
//! socket, exercised with a real HTTP client.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};

use cao_server::{
    api::{router, ApiState},
    config::ServerConfig,
    flow::FlowStore,
    mux::{FakeMux, MuxClient},
    orchestrator::Orchestrator,
    registry::Registry,
    scheduler::FlowScheduler,
};

async fn boot() -> (String, Arc<FakeMux>, tempfile::TempDir) {
    let registry = Arc::new(Registry::new());
    let mux = Arc::new(FakeMux::new());
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        mux.clone(),
        ServerConfig {
            poll_interval: Duration::from_millis(10),
            startup_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        },
    ));
    let flows_dir = tempfile::tempdir().unwrap();
    let flows = Arc::new(FlowStore::open(flows_dir.path()).unwrap());
    let scheduler = Arc::new(FlowScheduler::new(
        flows.clone(),
        orchestrator.clone(),
        Duration::from_secs(30),
    ));
    let app = router(ApiState {
        orchestrator,
        flows,
        scheduler,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mux, flows_dir)
}

#[tokio::test]
async fn control_plane_over_real_sockets() {
    let (base, mux, _flows_dir) = boot().await;
    let http = reqwest::Client::new();

    // Health.
    let health: Value = http
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Create a terminal and watch it reach IDLE once the agent prompts.
    let created: Value = http
        .post(format!("{base}/terminals"))
        .json(&json!({"agent": "developer", "cwd": "/tmp"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let session = created["session_name"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "starting");

    mux.append_line(&session, "> ");
    let mut status = String::new();
    for _ in 0..200 {
        let state: Value = http
            .get(format!("{base}/terminals/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = state["status"].as_str().unwrap_or_default().to_string();
        if status == "idle" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "idle");

    // An idle terminal takes a message immediately.
    let sent: Value = http
        .post(format!("{base}/terminals/{id}/messages"))
        .json(&json!({"from_id": "tester01", "body": "ping"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sent["result"], "delivered");
    assert!(mux.sent_keys(&session)[0].contains("ping"));

    // Register a flow and read it back.
    let flow = "---\nname: sweep\nschedule: \"*/5 * * * *\"\nagent_profile: developer\n---\n\nSweep the queue.\n";
    let added: Value = http
        .post(format!("{base}/flows"))
        .body(flow)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added["name"], "sweep");

    let raw = http
        .get(format!("{base}/flows/sweep"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(raw, flow);

    // Shut the terminal down over the wire.
    let deleted: Value = http
        .delete(format!("{base}/terminals/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["ok"], true);
    assert!(!mux.exists(&session).await);
}
