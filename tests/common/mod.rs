#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

use cloudpilot::auth::jwt::{Claims, encode_token};
use cloudpilot::cloud::SimulatedCloud;
use cloudpilot::config::{
    Config, ExecutionConfig, ProviderConfig, ProviderMode, SchedulerConfig, StoreKind,
    TerraformConfig, WebhookConfig,
};
use cloudpilot::db::MemoryStore;
use cloudpilot::engine::PolicyTable;
use cloudpilot::state::{AppState, Backends, SharedState};
use cloudpilot::terraform::{CliRunner, StaticTemplates};

pub const SECRET: &str = "test-secret";

/// A running server on a random port backed by the in-memory store.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub cloud: Arc<SimulatedCloud>,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    /// Token for a fresh user with the given roles.
    pub fn token(&self, roles: &[&str]) -> String {
        let claims = Claims::new(
            Uuid::now_v7(),
            Some("Test User".to_string()),
            roles.iter().map(|r| r.to_string()).collect(),
            chrono::Duration::minutes(15),
        );
        encode_token(&claims, SECRET).unwrap()
    }

    pub async fn get(&self, token: &str, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("GET failed");
        let status = resp.status();
        (resp.json().await.unwrap_or(json!(null)), status)
    }

    pub async fn post(&self, token: &str, path: &str, body: Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("POST failed");
        let status = resp.status();
        (resp.json().await.unwrap_or(json!(null)), status)
    }

    pub async fn put(&self, token: &str, path: &str, body: Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .put(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("PUT failed");
        let status = resp.status();
        (resp.json().await.unwrap_or(json!(null)), status)
    }

    /// Poll an action until `done` accepts its status view.
    pub async fn wait_for(&self, token: &str, id: &str, done: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..300 {
            let (body, status) = self.get(token, &format!("/actions/{id}/status")).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            if done(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("action {id} never reached the expected state");
    }
}

fn test_config() -> Config {
    Config {
        store: StoreKind::Memory,
        database_url: None,
        jwt_secret: SECRET.to_string(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        log_level: "warn".to_string(),
        max_body_size: 1024 * 1024,
        policy_file: None,
        execution: ExecutionConfig {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
            verify_timeout: Duration::from_secs(2),
            verify_poll: Duration::from_millis(20),
            ..ExecutionConfig::default()
        },
        scheduler: SchedulerConfig {
            worker_count: 4,
            poll_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_secs(900),
        },
        webhooks: WebhookConfig::default(),
        terraform: TerraformConfig {
            binary: "terraform".into(),
            workdir: std::env::temp_dir().join(format!("cloudpilot-api-{}", Uuid::now_v7())),
            templates: "templates".into(),
        },
        providers: ProviderConfig {
            mode: ProviderMode::Simulated,
            gateways: Vec::new(),
        },
    }
}

/// Engine state over the in-memory store, with background loops running
/// on the current runtime until `shutdown` fires.
pub fn test_state(
    shutdown: watch::Receiver<bool>,
) -> (SharedState, Arc<SimulatedCloud>) {
    let cloud = Arc::new(SimulatedCloud::new());
    let config = test_config();
    let backends = Backends {
        store: Arc::new(MemoryStore::new()),
        cloud: cloud.clone(),
        terraform_runner: Arc::new(CliRunner::new(config.terraform.binary.clone())),
        templates: Arc::new(StaticTemplates::default()),
        policy: PolicyTable::default(),
    };

    let handle = tokio::runtime::Handle::current();
    let state = AppState::new(config, backends, handle.clone()).expect("engine wiring failed");
    cloudpilot::worker::spawn_background(&handle, &state, shutdown);
    (state, cloud)
}

pub async fn spawn_app() -> TestApp {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (state, cloud) = test_state(shutdown_rx);

    let app = cloudpilot::build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        client: Client::new(),
        cloud,
        shutdown,
    }
}
