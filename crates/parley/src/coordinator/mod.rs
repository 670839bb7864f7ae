//! Agent run coordination.
//!
//! At most one run is active per session. Starting a run supersedes the
//! previous one: its abort marker is written before the new run writes
//! anything. Each run writes through its own producer epoch, so a late
//! write from a superseded run is fenced by the store.

mod history;
mod registry;
mod run;
mod turns;

pub use history::{SessionHistory, fold_entries};
pub use registry::RunRegistry;
pub use run::{ApprovalDecision, RunContext, RunHandle, RunState, ToolResultDelivery};

use chrono::Utc;
use log::info;
use parley_protocol::{ChunkPayload, Message, PermissionMode, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::encoder::{self, ChunkMeta};
use crate::error::{ParleyError, ParleyResult};
use crate::producer::{ProducerClient, ProducerSession};
use crate::provider::ModelProvider;
use crate::proxy::ConsumerProxy;
use crate::store::validate_session_id;
use crate::tools::ToolExecutor;
use turns::RunDeps;

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Model used when neither the request nor the session config names one.
    pub default_model: String,
    pub default_permission_mode: PermissionMode,
    pub default_cwd: String,
    /// System prompt sent with every model turn.
    pub system_prompt: Option<String>,
    /// Upper bound on model turns per run.
    pub max_turns: u32,
    /// Active time a run may spend, excluding waits for humans and clients.
    pub run_timeout_secs: u64,
    /// Actor id stamped on agent output.
    pub actor_id: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            default_permission_mode: PermissionMode::Default,
            default_cwd: ".".to_string(),
            system_prompt: None,
            max_turns: 25,
            run_timeout_secs: 600,
            actor_id: "agent".to_string(),
        }
    }
}

/// Input for [`Coordinator::start`].
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    /// Who started the run.
    pub actor_id: String,
    /// User message appended before the run starts. `None` when the
    /// caller already appended it.
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    /// Client transaction id stamped on the prompt entry.
    pub txid: Option<String>,
}

impl RunInput {
    pub fn prompt(actor_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }
}

/// An accepted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: String,
    /// Message id shared by the run's output chunks.
    pub message_id: String,
    /// Message id of the prompt appended for this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_message_id: Option<String>,
}

/// Observable state of a session's current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: String,
    pub message_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval_id: Option<String>,
}

/// Starts, cancels and resumes agent runs.
pub struct Coordinator {
    producer: ProducerClient,
    proxy: ConsumerProxy,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<dyn ToolExecutor>,
    registry: Arc<RunRegistry>,
    config: CoordinatorConfig,
    /// Producer id of this process. Each run uses its own epoch under it.
    producer_id: String,
}

impl Coordinator {
    pub fn new(
        producer: ProducerClient,
        proxy: ConsumerProxy,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<dyn ToolExecutor>,
        config: CoordinatorConfig,
    ) -> Self {
        let producer_id = format!("parley-{}", uuid::Uuid::new_v4().simple());
        info!("Coordinator producer id: {}", producer_id);
        Self {
            producer,
            proxy,
            provider,
            tools,
            registry: Arc::new(RunRegistry::new()),
            config,
            producer_id,
        }
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn deps(&self) -> RunDeps {
        RunDeps {
            provider: Arc::clone(&self.provider),
            tools: Arc::clone(&self.tools),
            max_turns: self.config.max_turns.max(1),
            run_timeout: Duration::from_secs(self.config.run_timeout_secs),
        }
    }

    /// Start a run, superseding any active run on the session. Returns once
    /// the run is registered; output streams into the session log.
    pub async fn start(&self, session_id: &str, input: RunInput) -> ParleyResult<RunStarted> {
        validate_session_id(session_id)?;
        if input.actor_id.trim().is_empty() {
            return Err(ParleyError::validation("actor id must not be empty"));
        }
        if input.prompt.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(ParleyError::validation("prompt must not be empty"));
        }

        let _lane = self.registry.lock_lane(session_id).await;

        if let Some(previous) = self.registry.get(session_id) {
            info!(
                "Superseding run {} on session {}",
                previous.run_id(),
                session_id
            );
            previous.abort("superseded by a new run").await;
            self.registry.remove_if_current(session_id, &previous);
        }

        self.producer.ensure_stream(session_id).await?;
        let mut prompt_message_id = None;
        if let Some(prompt) = &input.prompt {
            let message_id = encoder::new_message_id();
            let entry = encoder::encode(
                &ChunkPayload::WholeMessage {
                    message: Message::user(prompt.as_str()),
                },
                &ChunkMeta::single(
                    message_id.as_str(),
                    input.actor_id.as_str(),
                    Role::User,
                    Utc::now(),
                )
                .with_txid(input.txid.clone()),
            )?;
            self.producer.append(session_id, &entry, None).await?;
            prompt_message_id = Some(message_id);
        }

        let entries = self.proxy.read_entries(session_id).await?;
        let history = fold_entries(&entries);
        if history.messages.is_empty() {
            return Err(ParleyError::validation(
                "session has no messages to respond to",
            ));
        }

        let context = RunContext {
            model: input
                .model
                .or(history.config.model)
                .unwrap_or_else(|| self.config.default_model.clone()),
            cwd: input
                .cwd
                .or(history.config.cwd)
                .unwrap_or_else(|| self.config.default_cwd.clone()),
            permission_mode: input
                .permission_mode
                .or(history.config.permission_mode)
                .unwrap_or(self.config.default_permission_mode),
            thinking_enabled: history.config.thinking_enabled.unwrap_or(false),
            system_prompt: self.config.system_prompt.clone(),
            messages: history.messages,
            answers: HashMap::new(),
        };

        let epoch = self.registry.next_epoch(session_id);
        let producer = ProducerSession::new(
            self.producer.clone(),
            session_id,
            self.producer_id.as_str(),
            epoch,
        );
        let handle = Arc::new(RunHandle::new(
            self.config.actor_id.as_str(),
            producer,
            context,
        ));
        self.registry.set(session_id, Arc::clone(&handle));

        info!(
            "Run {} accepted for session {} (started by {}, epoch {})",
            handle.run_id(),
            session_id,
            input.actor_id,
            epoch
        );

        let started = RunStarted {
            run_id: handle.run_id().to_string(),
            message_id: handle.message_id().to_string(),
            prompt_message_id,
        };
        tokio::spawn(turns::drive(
            handle,
            self.deps(),
            Arc::clone(&self.registry),
        ));
        Ok(started)
    }

    /// Cancel the session's run. Returns whether a run was aborted.
    pub async fn cancel(&self, session_id: &str, reason: &str) -> ParleyResult<bool> {
        validate_session_id(session_id)?;
        let _lane = self.registry.lock_lane(session_id).await;
        Ok(self.cancel_locked(session_id, reason).await)
    }

    /// Cancel with the session lane already held.
    async fn cancel_locked(&self, session_id: &str, reason: &str) -> bool {
        let Some(handle) = self.registry.get(session_id) else {
            return false;
        };
        let aborted = handle.abort(reason).await;
        self.registry.remove_if_current(session_id, &handle);
        if aborted {
            info!("Run {} on session {} cancelled: {}", handle.run_id(), session_id, reason);
        }
        aborted
    }

    /// Deliver an approval decision to the session's paused run.
    pub async fn resume(
        &self,
        session_id: &str,
        approval_id: Option<&str>,
        approved: bool,
        answers: Option<Value>,
    ) -> ParleyResult<()> {
        validate_session_id(session_id)?;
        let _lane = self.registry.lock_lane(session_id).await;

        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| ParleyError::RunNotFound(session_id.to_string()))?;
        handle
            .resolve_approval(approval_id, ApprovalDecision { approved, answers })
            .await?;
        info!(
            "Run {} on session {} resumed (approved: {})",
            handle.run_id(),
            session_id,
            approved
        );
        Ok(())
    }

    /// Hand a client-side tool result to the session's run. Returns whether
    /// a run was there to receive it.
    pub async fn deliver_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        output: String,
        error: Option<String>,
    ) -> bool {
        let Some(handle) = self.registry.get(session_id) else {
            return false;
        };
        handle
            .deliver_tool_result(tool_call_id, ToolResultDelivery { output, error })
            .await;
        true
    }

    pub async fn status(&self, session_id: &str) -> Option<RunStatus> {
        let handle = self.registry.get(session_id)?;
        Some(RunStatus {
            run_id: handle.run_id().to_string(),
            message_id: handle.message_id().to_string(),
            state: handle.state(),
            pending_approval_id: handle.pending_approval_id().await,
        })
    }

    /// The run currently registered for the session.
    pub fn current_run(&self, session_id: &str) -> Option<Arc<RunHandle>> {
        self.registry.get(session_id)
    }

    pub fn active_runs(&self) -> usize {
        self.registry.active_count()
    }

    /// Cancel any run of a deleted session. Runs under the session lane, so
    /// a run started concurrently either precedes the delete or follows it.
    pub async fn forget(&self, session_id: &str) {
        let _lane = self.registry.lock_lane(session_id).await;
        self.cancel_locked(session_id, "session deleted").await;
    }

    /// Abort every active run, for server shutdown.
    pub async fn shutdown(&self) {
        let runs = self.registry.active_runs();
        if runs.is_empty() {
            return;
        }
        info!("Aborting {} active run(s)", runs.len());
        for handle in runs {
            handle.abort("server shutting down").await;
            self.registry.remove_if_current(handle.session_id(), &handle);
        }
    }
}
