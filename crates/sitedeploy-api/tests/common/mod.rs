//! Shared helpers for HTTP integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::Value;
use sha2::Sha256;
use sitedeploy_api::{AppState, routes};
use sitedeploy_config::{AuthConfig, ProcessorConfig, SecretString};
use sitedeploy_core::{BuildExecutor, DispatchRequest, DispatchedRun, Error, Result};
use sitedeploy_db::MemoryJobRepo;
use tower::ServiceExt;

pub const CRON_SECRET: &str = "cron-test-secret";
pub const CALLBACK_SECRET: &str = "callback-test-secret";
pub const WORDPRESS_SECRET: &str = "wordpress-test-secret";

/// Hands out numeric run ids starting at 1000, or rejects every dispatch.
#[derive(Debug)]
pub struct FakeExecutor {
    next_run: AtomicU64,
    reject: bool,
}

impl FakeExecutor {
    pub fn accepting() -> Self {
        Self {
            next_run: AtomicU64::new(1000),
            reject: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            next_run: AtomicU64::new(1000),
            reject: true,
        }
    }
}

#[async_trait]
impl BuildExecutor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn dispatch(&self, _request: &DispatchRequest) -> Result<DispatchedRun> {
        if self.reject {
            return Err(Error::Dispatch("workflow disabled".to_string()));
        }
        let n = self.next_run.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchedRun {
            run_id: n.to_string(),
            run_url: format!("https://github.com/acme/site/actions/runs/{}", n),
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub repo: MemoryJobRepo,
}

pub fn test_auth() -> AuthConfig {
    AuthConfig {
        cron_secret: Some(SecretString::new(CRON_SECRET)),
        callback_secret: Some(SecretString::new(CALLBACK_SECRET)),
        wordpress_secret: Some(SecretString::new(WORDPRESS_SECRET)),
    }
}

pub fn build_test_app() -> TestApp {
    build_app_with(FakeExecutor::accepting(), test_auth())
}

pub fn build_app_with(executor: FakeExecutor, auth: AuthConfig) -> TestApp {
    let repo = MemoryJobRepo::new();
    let state = AppState::new(
        Arc::new(repo.clone()),
        Arc::new(executor),
        &ProcessorConfig::default(),
        auth,
    );
    TestApp {
        router: routes::router(state),
        repo,
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn post_empty(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::post(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

/// Trigger the scheduled processing endpoint with the test credential.
pub async fn run_cron(app: &Router) -> Response<Body> {
    let request = Request::post("/cron/process")
        .header(header::AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Post a signed CI completion callback.
pub async fn post_ci_callback(app: &Router, body: Value) -> Response<Body> {
    let raw = body.to_string();
    let request = Request::post("/webhooks/ci")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Signature-256", sign(CALLBACK_SECRET, raw.as_bytes()))
        .body(Body::from(raw))
        .unwrap();
    send(app, request).await
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
