//! Shared harness for integration tests: the full router over an in-memory
//! log store, with a scripted model provider and tool executor.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use futures::StreamExt;
use futures::stream;
use parley::api::{AppState, create_router};
use parley::auth::{AuthConfig, AuthState};
use parley::coordinator::{Coordinator, CoordinatorConfig, RunStatus};
use parley::metadata::MemoryMetadataStore;
use parley::producer::ProducerClient;
use parley::provider::{ModelProvider, ProviderError, ProviderEvent, ProviderRequest, ProviderStream};
use parley::proxy::ConsumerProxy;
use parley::store::MemoryLogStore;
use parley::tools::{ToolDefinition, ToolError, ToolExecutor};
use parley_protocol::{ChunkPayload, LogEntry, StreamChunk};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const USER: &str = "alice";
pub const JWT_SECRET: &str = "integration-test-secret-with-enough-length";

// ============================================================================
// Scripted provider
// ============================================================================

/// One scripted model turn.
pub enum Turn {
    /// Emit the events, then end the stream.
    Events(Vec<ProviderEvent>),
    /// Emit the events, then fail with a provider error.
    Fail(Vec<ProviderEvent>, String),
    /// Emit the events, then wait until the run is cancelled.
    Hang(Vec<ProviderEvent>),
}

pub fn deltas(parts: &[&str]) -> Vec<ProviderEvent> {
    parts
        .iter()
        .map(|p| ProviderEvent::TextDelta(p.to_string()))
        .collect()
}

fn finished(reason: &str) -> ProviderEvent {
    ProviderEvent::Finished {
        stop_reason: Some(reason.to_string()),
    }
}

/// A turn that streams text and stops.
pub fn text_turn(parts: &[&str]) -> Turn {
    let mut events = deltas(parts);
    events.push(finished("stop"));
    Turn::Events(events)
}

/// A turn that streams text, then calls one tool.
pub fn tool_turn(parts: &[&str], id: &str, name: &str, input: Value) -> Turn {
    let mut events = deltas(parts);
    events.push(ProviderEvent::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    });
    events.push(finished("tool_calls"));
    Turn::Events(events)
}

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: Turn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_turn(&["ok"]));

        let stream = match turn {
            Turn::Events(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Turn::Fail(events, body) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::once(async move {
                    Err(ProviderError::Status { status: 500, body })
                }))
                .boxed(),
            Turn::Hang(events) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::once(async move {
                    cancel.cancelled().await;
                    Err(ProviderError::Cancelled)
                }))
                .boxed(),
        };
        Ok(stream)
    }
}

// ============================================================================
// Scripted tools
// ============================================================================

enum ToolOutcome {
    Output(String),
    Failure(String),
    Interrupted,
}

/// Runs tools with canned outputs. Unknown tools are left to clients.
#[derive(Default)]
pub struct ScriptedTools {
    outputs: HashMap<String, ToolOutcome>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTools {
    pub fn with_output(mut self, name: &str, output: &str) -> Self {
        self.outputs
            .insert(name.to_string(), ToolOutcome::Output(output.to_string()));
        self
    }

    pub fn with_failure(mut self, name: &str, message: &str) -> Self {
        self.outputs
            .insert(name.to_string(), ToolOutcome::Failure(message.to_string()));
        self
    }

    /// The tool reports that it was cancelled, though nobody stopped the run.
    pub fn with_interruption(mut self, name: &str) -> Self {
        self.outputs.insert(name.to_string(), ToolOutcome::Interrupted);
        self
    }

    /// Tool invocations so far, with the input each one received.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.outputs
            .keys()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("scripted {}", name),
                input_schema: serde_json::json!({ "type": "object" }),
            })
            .collect()
    }

    async fn execute(
        &self,
        name: &str,
        input: &Value,
        _cwd: &str,
        _cancel: CancellationToken,
    ) -> Result<String, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), input.clone()));
        match self.outputs.get(name) {
            Some(ToolOutcome::Output(output)) => Ok(output.clone()),
            Some(ToolOutcome::Failure(message)) => Err(ToolError::Failed(message.clone())),
            Some(ToolOutcome::Interrupted) => Err(ToolError::Cancelled),
            None => Err(ToolError::Unsupported(name.to_string())),
        }
    }
}

// ============================================================================
// App
// ============================================================================

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryLogStore>,
    pub provider: Arc<ScriptedProvider>,
    pub tools: Arc<ScriptedTools>,
}

/// A collected response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_script(Vec::new(), ScriptedTools::default())
    }

    pub fn with_script(turns: Vec<Turn>, tools: ScriptedTools) -> Self {
        Self::build(turns, tools, CoordinatorConfig::default(), 1000)
    }

    pub fn build(
        turns: Vec<Turn>,
        tools: ScriptedTools,
        config: CoordinatorConfig,
        max_batch_entries: usize,
    ) -> Self {
        let store = Arc::new(MemoryLogStore::new(max_batch_entries));
        let producer = ProducerClient::new(store.clone(), 3);
        let proxy = ConsumerProxy::new(store.clone());
        let provider = Arc::new(ScriptedProvider::new(turns));
        let tools = Arc::new(tools);
        let coordinator = Arc::new(Coordinator::new(
            producer.clone(),
            proxy.clone(),
            provider.clone(),
            tools.clone(),
            config,
        ));
        let auth = AuthState::new(&AuthConfig {
            dev_mode: true,
            jwt_secret: Some(JWT_SECRET.to_string()),
        })
        .unwrap();

        let state = AppState {
            producer,
            proxy,
            coordinator,
            metadata: Arc::new(MemoryMetadataStore::new()),
            auth,
            cors_origins: Arc::new(Vec::new()),
            max_body_bytes: 1024 * 1024,
            shutdown: CancellationToken::new(),
        };

        Self {
            router: create_router(state.clone()),
            state,
            store,
            provider,
            tools,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn call(&self, request: Request<Body>) -> TestResponse {
        let response = self.send(request).await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.call(request(Method::GET, uri, None)).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.call(request(Method::POST, uri, Some(body))).await
    }

    /// Append a user message without starting a run.
    pub async fn post_message(&self, session: &str, content: &str) -> TestResponse {
        self.post(
            &format!("/api/sessions/{}/messages", session),
            serde_json::json!({ "content": content, "startRun": false }),
        )
        .await
    }

    /// Post a prompt and return the run's output message id.
    pub async fn start_run(&self, session: &str, body: Value) -> String {
        let resp = self
            .post(&format!("/api/sessions/{}/messages", session), body)
            .await;
        assert_eq!(resp.status, StatusCode::ACCEPTED, "{:?}", resp.body);
        resp.json()["run"]["messageId"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub async fn entries(&self, session: &str) -> Vec<LogEntry> {
        self.state.proxy.read_entries(session).await.unwrap()
    }

    /// Stream chunks of one message, in seq order.
    pub async fn run_chunks(&self, session: &str, message_id: &str) -> Vec<(u64, StreamChunk)> {
        self.entries(session)
            .await
            .into_iter()
            .filter(|e| e.value.message_id == message_id)
            .filter_map(|e| match e.payload().unwrap() {
                ChunkPayload::Stream { chunk } => Some((e.value.seq, chunk)),
                _ => None,
            })
            .collect()
    }

    /// Poll the log until the run writes its terminal marker.
    pub async fn wait_for_terminal(&self, session: &str, message_id: &str) -> Vec<StreamChunk> {
        self.wait_for_chunks(session, message_id, |chunks| {
            chunks.iter().any(StreamChunk::is_terminal)
        })
        .await
    }

    /// Poll the log until `done` holds for the run's chunks.
    pub async fn wait_for_chunks(
        &self,
        session: &str,
        message_id: &str,
        done: impl Fn(&[StreamChunk]) -> bool,
    ) -> Vec<StreamChunk> {
        let poll = async {
            loop {
                let chunks: Vec<StreamChunk> = self
                    .run_chunks(session, message_id)
                    .await
                    .into_iter()
                    .map(|(_, c)| c)
                    .collect();
                if done(&chunks) {
                    return chunks;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("run did not reach the expected chunks in time")
    }

    /// Poll the coordinator until the run waits on an approval.
    pub async fn wait_for_approval(&self, session: &str) -> String {
        let poll = async {
            loop {
                if let Some(RunStatus {
                    pending_approval_id: Some(id),
                    ..
                }) = self.state.coordinator.status(session).await
                {
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("run never requested an approval")
    }

    /// Poll until no run is registered for the session.
    pub async fn wait_for_idle(&self, session: &str) {
        let poll = async {
            while self.state.coordinator.current_run(session).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("run was not released in time");
    }
}

/// A request authenticated as [`USER`] through the dev header.
pub fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-dev-user", USER);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}
