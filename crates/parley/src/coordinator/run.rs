//! A single agent run: its cancellation signal, context and log writer.

use chrono::Utc;
use log::{debug, warn};
use parley_protocol::{ChunkPayload, PermissionMode, Role, StreamChunk};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::encoder::{self, ChunkMeta};
use crate::error::{ParleyError, ParleyResult};
use crate::producer::ProducerSession;
use crate::provider::ProviderMessage;

/// Lifecycle of a run. A session without a registered run is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Running,
    AwaitingApproval,
    AwaitingToolResult,
    Completed,
    Errored,
    Aborted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::AwaitingApproval => write!(f, "awaiting-approval"),
            RunState::AwaitingToolResult => write!(f, "awaiting-tool-result"),
            RunState::Completed => write!(f, "completed"),
            RunState::Errored => write!(f, "errored"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// A human decision on a gated tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub answers: Option<Value>,
}

/// A tool result posted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultDelivery {
    pub output: String,
    pub error: Option<String>,
}

/// What a paused run is waiting for.
enum PendingGate {
    Approval {
        approval_id: String,
        reply: oneshot::Sender<ApprovalDecision>,
    },
    ToolResult {
        tool_call_id: String,
        reply: oneshot::Sender<ToolResultDelivery>,
    },
}

/// Mutable state a run carries between turns.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub model: String,
    pub cwd: String,
    pub permission_mode: PermissionMode,
    pub thinking_enabled: bool,
    pub system_prompt: Option<String>,
    /// Conversation so far, including this run's turns.
    pub messages: Vec<ProviderMessage>,
    /// Answers attached to approval decisions, by approval id.
    pub answers: HashMap<String, Value>,
}

struct RunWriter {
    producer: ProducerSession,
    next_seq: u64,
    terminated: bool,
}

/// Handle to one run. Shared by the run task and the coordinator.
pub struct RunHandle {
    run_id: String,
    session_id: String,
    message_id: String,
    actor_id: String,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
    context: Mutex<RunContext>,
    /// Serializes every write of this run. Cancellation is checked while
    /// holding it, which keeps a single terminal marker per run.
    writer: Mutex<RunWriter>,
    gates: Mutex<Gates>,
}

#[derive(Default)]
struct Gates {
    pending: Option<PendingGate>,
    /// Client tool results that arrived before the run started waiting.
    early_results: HashMap<String, ToolResultDelivery>,
}

impl RunHandle {
    pub fn new(actor_id: impl Into<String>, producer: ProducerSession, context: RunContext) -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            session_id: producer.session_id().to_string(),
            message_id: encoder::new_message_id(),
            actor_id: actor_id.into(),
            cancel: CancellationToken::new(),
            state,
            context: Mutex::new(context),
            writer: Mutex::new(RunWriter {
                producer,
                next_seq: 0,
                terminated: false,
            }),
            gates: Mutex::new(Gates::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Message id shared by every chunk this run writes.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.send_replace(state);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token for work started on behalf of this run.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub(crate) fn context(&self) -> &Mutex<RunContext> {
        &self.context
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append a non-terminal chunk. Fails with
    /// [`ParleyError::AbortedByCaller`] once the run is cancelled.
    pub async fn emit(&self, chunk: StreamChunk) -> ParleyResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.terminated || self.cancel.is_cancelled() {
            return Err(ParleyError::AbortedByCaller);
        }
        self.write_locked(&mut writer, chunk).await
    }

    /// Append the run's terminal marker. Returns `false` if a terminal
    /// marker was already written, or if the run was cancelled and `chunk`
    /// is not the abort marker.
    pub async fn finish(&self, chunk: StreamChunk) -> ParleyResult<bool> {
        let final_state = match &chunk {
            StreamChunk::Done { .. } => RunState::Completed,
            StreamChunk::Error { .. } => RunState::Errored,
            StreamChunk::Aborted { .. } => RunState::Aborted,
            other => {
                return Err(ParleyError::internal(format!(
                    "not a terminal chunk: {:?}",
                    other
                )));
            }
        };

        let mut writer = self.writer.lock().await;
        if writer.terminated {
            return Ok(false);
        }
        if self.cancel.is_cancelled() && final_state != RunState::Aborted {
            return Ok(false);
        }

        self.set_state(final_state);
        self.write_locked(&mut writer, chunk).await?;
        writer.terminated = true;
        Ok(true)
    }

    /// [`Self::finish`] that never fails. Write errors are logged.
    pub(crate) async fn finish_best_effort(&self, chunk: StreamChunk) -> bool {
        match self.finish(chunk).await {
            Ok(written) => written,
            Err(e) => {
                warn!(
                    "Failed to write terminal marker for run {} on session {}: {}",
                    self.run_id, self.session_id, e
                );
                false
            }
        }
    }

    /// Cancel the run and write its abort marker. Returns whether this call
    /// wrote the marker.
    pub async fn abort(&self, reason: &str) -> bool {
        self.cancel.cancel();
        self.gates.lock().await.pending.take();
        let written = self
            .finish_best_effort(StreamChunk::Aborted {
                reason: reason.to_string(),
            })
            .await;
        if written {
            debug!("Run {} aborted: {}", self.run_id, reason);
        }
        written
    }

    async fn write_locked(&self, writer: &mut RunWriter, chunk: StreamChunk) -> ParleyResult<()> {
        let meta = ChunkMeta::single(
            self.message_id.as_str(),
            self.actor_id.as_str(),
            Role::Assistant,
            Utc::now(),
        )
        .with_seq(writer.next_seq);
        let entry = encoder::encode(&ChunkPayload::Stream { chunk }, &meta)?;
        writer.producer.append(&entry).await?;
        writer.next_seq += 1;
        Ok(())
    }

    // ========================================================================
    // Gates
    // ========================================================================

    /// Register a pending approval and enter `AwaitingApproval`.
    pub(crate) async fn open_approval(&self) -> (String, oneshot::Receiver<ApprovalDecision>) {
        let approval_id = format!("apr_{}", uuid::Uuid::new_v4().simple());
        let (reply, rx) = oneshot::channel();
        self.gates.lock().await.pending = Some(PendingGate::Approval {
            approval_id: approval_id.clone(),
            reply,
        });
        self.set_state(RunState::AwaitingApproval);
        (approval_id, rx)
    }

    /// Register a pending client-side tool call and enter
    /// `AwaitingToolResult`.
    pub(crate) async fn open_tool_result(
        &self,
        tool_call_id: &str,
    ) -> oneshot::Receiver<ToolResultDelivery> {
        let (reply, rx) = oneshot::channel();
        let mut gates = self.gates.lock().await;
        if let Some(delivery) = gates.early_results.remove(tool_call_id) {
            let _ = reply.send(delivery);
            return rx;
        }
        gates.pending = Some(PendingGate::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            reply,
        });
        self.set_state(RunState::AwaitingToolResult);
        rx
    }

    /// Id of the approval this run is waiting on, if any.
    pub async fn pending_approval_id(&self) -> Option<String> {
        match self.gates.lock().await.pending.as_ref() {
            Some(PendingGate::Approval { approval_id, .. }) => Some(approval_id.clone()),
            _ => None,
        }
    }

    /// Deliver a decision to the pending approval. With `approval_id`, the
    /// pending approval must match it.
    pub async fn resolve_approval(
        &self,
        approval_id: Option<&str>,
        decision: ApprovalDecision,
    ) -> ParleyResult<()> {
        let mut gates = self.gates.lock().await;
        match gates.pending.take() {
            Some(PendingGate::Approval {
                approval_id: pending_id,
                reply,
            }) if approval_id.is_none_or(|id| id == pending_id) => {
                if let Some(answers) = &decision.answers {
                    self.context
                        .lock()
                        .await
                        .answers
                        .insert(pending_id.clone(), answers.clone());
                }
                self.set_state(RunState::Running);
                reply
                    .send(decision)
                    .map_err(|_| ParleyError::ApprovalNotPending(pending_id))
            }
            other => {
                gates.pending = other;
                Err(ParleyError::ApprovalNotPending(
                    approval_id.unwrap_or("none").to_string(),
                ))
            }
        }
    }

    /// Hand a client's tool result to the run. A result that arrives before
    /// the run starts waiting for it is kept until it does.
    pub async fn deliver_tool_result(&self, tool_call_id: &str, delivery: ToolResultDelivery) {
        let mut gates = self.gates.lock().await;
        match gates.pending.take() {
            Some(PendingGate::ToolResult {
                tool_call_id: pending_id,
                reply,
            }) if pending_id == tool_call_id => {
                self.set_state(RunState::Running);
                if reply.send(delivery).is_err() {
                    debug!("Run {} stopped waiting for {}", self.run_id, tool_call_id);
                }
            }
            other => {
                gates.pending = other;
                gates
                    .early_results
                    .insert(tool_call_id.to_string(), delivery);
            }
        }
    }
}

/// Wait for a gate to be resolved, or for the run to be cancelled.
pub(crate) async fn wait_gate<T>(handle: &RunHandle, rx: oneshot::Receiver<T>) -> ParleyResult<T> {
    tokio::select! {
        biased;
        _ = handle.cancelled() => Err(ParleyError::AbortedByCaller),
        result = rx => result.map_err(|_| ParleyError::AbortedByCaller),
    }
}
