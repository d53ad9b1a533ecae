//! HTTP-backed value resolution and the request step against a loopback
//! server.

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use common::MockPage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tabflow_lib::runs::RunRegistry;
use tabflow_lib::storage::MemoryStorage;
use tabflow_lib::workflow::runner::StartContext;
use tabflow_lib::workflow::schema::{
    AllowedSite, AtomicStep, CompareOperator, OnFailure, RequestConfig, RequestSourceConfig,
    RetryCondition, RetryConfig, RunStatus, RunTrigger, StepAction, StepNode, ValueSource,
    Workflow,
};
use tabflow_lib::workflow::steps::StepExecutor;
use tabflow_lib::workflow::template::TemplateContext;
use tabflow_lib::workflow::value::{execute_request_with_retry, resolve_value};
use tabflow_lib::workflow::{WorkflowManager, WorkflowRunner};

#[derive(Default)]
struct ServerState {
    flaky_hits: AtomicUsize,
}

async fn spawn_server() -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());

    async fn token(State(_): State<Arc<ServerState>>) -> Json<serde_json::Value> {
        Json(serde_json::json!({"data": {"token": "abc"}}))
    }

    async fn flaky(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
        let hits = state.flaky_hits.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if hits >= 3 { "done" } else { "running" };
        Json(serde_json::json!({"status": status}))
    }

    async fn fail() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom")
    }

    let app = Router::new()
        .route("/token", get(token))
        .route("/flaky", get(flaky))
        .route("/fail", get(fail))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn request_source(url: String, json_path: &str, retry: RetryConfig) -> RequestSourceConfig {
    RequestSourceConfig {
        url,
        method: "GET".to_string(),
        content_type: String::new(),
        headers: vec![],
        body: String::new(),
        response_json_path: json_path.to_string(),
        retry,
    }
}

#[tokio::test]
async fn test_resolve_value_from_request() {
    let (base, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let ctx = TemplateContext::new("wf-1", "Values");

    let source = ValueSource::Request {
        request: request_source(format!("{base}/token"), "data.token", RetryConfig::default()),
    };
    let value = resolve_value(&client, &source, &ctx).await.unwrap();
    assert_eq!(value, "abc");
}

#[tokio::test]
async fn test_conditional_retry_until_json_field_settles() {
    let (base, state) = spawn_server().await;
    let client = reqwest::Client::new();
    let ctx = TemplateContext::new("wf-1", "Values");

    let retry = RetryConfig {
        enabled: true,
        max_retries: 5,
        condition: Some(RetryCondition::JsonField {
            field: "status".to_string(),
            operator: CompareOperator::NotEquals,
            value: "done".to_string(),
        }),
    };
    let config = request_source(format!("{base}/flaky"), "status", retry);

    let outcome = execute_request_with_retry(&client, &config, &ctx)
        .await
        .unwrap();
    assert_eq!(outcome.extracted, Some(serde_json::json!("done")));
    assert_eq!(state.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_error_status_fails_value_resolution() {
    let (base, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let ctx = TemplateContext::new("wf-1", "Values");

    let source = ValueSource::Request {
        request: request_source(format!("{base}/fail"), "", RetryConfig::default()),
    };
    let err = resolve_value(&client, &source, &ctx).await.unwrap_err();
    assert!(err.contains("500"), "error should carry the status: {err}");
}

#[tokio::test]
async fn test_request_step_saves_variable() {
    let (base, _state) = spawn_server().await;

    let page = MockPage::new();
    let manager = Arc::new(WorkflowManager::new(Arc::new(MemoryStorage::new())));
    let registry = Arc::new(RunRegistry::new());
    let executor = StepExecutor::new(page, manager.clone());
    let runner = WorkflowRunner::new(manager.clone(), registry, executor);

    let mut workflow = Workflow::new("Request step");
    workflow.settings.allowed_sites = vec![AllowedSite {
        host: "a.test".to_string(),
        favicon: String::new(),
    }];
    workflow.steps = vec![StepNode::Step(AtomicStep {
        id: "s1".to_string(),
        name: "fetch token".to_string(),
        enabled: true,
        timeout_ms: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        goto_step: None,
        fallback_code: None,
        action: StepAction::Request {
            request: RequestConfig {
                url: format!("{base}/token"),
                method: "GET".to_string(),
                content_type: String::new(),
                headers: vec![],
                body: String::new(),
                response_json_path: "data.token".to_string(),
                save_to: Some("vars.token".to_string()),
            },
        },
    })];
    let id = workflow.id.clone();
    manager.add(workflow).unwrap();

    let status = runner
        .run(&id, RunTrigger::Manual, StartContext::default())
        .await;
    assert_eq!(status, RunStatus::Success);
    assert_eq!(manager.get(&id).unwrap().variables.get("token").unwrap(), "abc");
}
