//! The agent loop: model turns, tool gating and terminal markers.

use futures::StreamExt;
use log::{debug, info, warn};
use parley_protocol::{PermissionMode, Role, StreamChunk};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::registry::RunRegistry;
use super::run::{RunHandle, wait_gate};
use crate::error::{ParleyError, ParleyResult};
use crate::provider::{ContentPart, ModelProvider, ProviderError, ProviderEvent, ProviderMessage, ProviderRequest};
use crate::tools::{ToolError, ToolExecutor};

const MAX_SUMMARY_CHARS: usize = 280;

/// Collaborators a run needs.
#[derive(Clone)]
pub(crate) struct RunDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<dyn ToolExecutor>,
    pub max_turns: u32,
    pub run_timeout: Duration,
}

/// Time budget that only counts active work. Waiting for approvals and
/// client tool results is not charged.
struct Budget {
    remaining: Duration,
}

impl Budget {
    async fn limit<F: Future>(&mut self, fut: F) -> ParleyResult<F::Output> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.remaining, fut).await;
        self.remaining = self.remaining.saturating_sub(started.elapsed());
        result.map_err(|_| ParleyError::Generation("run exceeded its time budget".to_string()))
    }
}

enum Gate {
    Allow,
    Ask,
    Deny,
}

fn gate_for(mode: PermissionMode, is_edit: bool) -> Gate {
    match mode {
        PermissionMode::BypassPermissions => Gate::Allow,
        PermissionMode::AcceptEdits if is_edit => Gate::Allow,
        PermissionMode::Plan => Gate::Deny,
        _ => Gate::Ask,
    }
}

fn provider_error(err: ProviderError) -> ParleyError {
    match err {
        ProviderError::Cancelled => ParleyError::AbortedByCaller,
        other => ParleyError::Generation(other.to_string()),
    }
}

fn summarize(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return Some(text.to_string());
    }
    let truncated: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
    Some(format!("{}...", truncated))
}

/// Attach approval answers to the tool input.
fn with_answers(input: Value, answers: Option<Value>) -> Value {
    match (input, answers) {
        (Value::Object(mut map), Some(answers)) => {
            map.insert("answers".to_string(), answers);
            Value::Object(map)
        }
        (input, _) => input,
    }
}

/// Run the agent to completion and write exactly one terminal marker.
pub(crate) async fn drive(handle: Arc<RunHandle>, deps: RunDeps, registry: Arc<RunRegistry>) {
    info!(
        "Run {} started on session {} (message {})",
        handle.run_id(),
        handle.session_id(),
        handle.message_id()
    );

    match run_turns(&handle, &deps).await {
        Ok(summary) => {
            handle.finish_best_effort(StreamChunk::Done { summary }).await;
            info!("Run {} completed", handle.run_id());
        }
        Err(ParleyError::AbortedByCaller) if handle.is_cancelled() => {
            // Whoever cancelled the run writes its abort marker.
            debug!("Run {} stopped after cancellation", handle.run_id());
        }
        Err(ParleyError::AbortedByCaller) => {
            warn!("Run {} was interrupted without a stop request", handle.run_id());
            handle
                .finish_best_effort(StreamChunk::Aborted {
                    reason: "interrupted".to_string(),
                })
                .await;
        }
        Err(e) => {
            warn!("Run {} failed: {}", handle.run_id(), e);
            handle
                .finish_best_effort(StreamChunk::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }

    registry.remove_if_current(handle.session_id(), &handle);
}

async fn run_turns(handle: &RunHandle, deps: &RunDeps) -> ParleyResult<Option<String>> {
    let mut budget = Budget {
        remaining: deps.run_timeout,
    };

    for turn in 0..deps.max_turns {
        let request = {
            let ctx = handle.context().lock().await;
            ProviderRequest {
                model: ctx.model.clone(),
                system_prompt: ctx.system_prompt.clone(),
                messages: ctx.messages.clone(),
                tools: deps.tools.definitions(),
                thinking_enabled: ctx.thinking_enabled,
            }
        };
        debug!(
            "Run {} turn {} with {} messages",
            handle.run_id(),
            turn,
            request.messages.len()
        );

        let mut stream = tokio::select! {
            biased;
            _ = handle.cancelled() => return Err(ParleyError::AbortedByCaller),
            result = budget.limit(deps.provider.stream(request, handle.child_token())) => {
                result?.map_err(provider_error)?
            }
        };

        let mut text = String::new();
        let mut tool_uses = Vec::new();
        let mut tool_results = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = handle.cancelled() => return Err(ParleyError::AbortedByCaller),
                next = budget.limit(stream.next()) => next?,
            };
            let Some(event) = next else { break };

            match event.map_err(provider_error)? {
                ProviderEvent::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    handle.emit(StreamChunk::TextDelta { delta }).await?;
                }
                ProviderEvent::ToolUse { id, name, input } => {
                    let result =
                        handle_tool_use(handle, deps, &mut budget, &id, &name, input.clone())
                            .await?;
                    tool_uses.push(ContentPart::ToolUse { id, name, input });
                    tool_results.push(result);
                }
                ProviderEvent::Finished { stop_reason } => {
                    debug!("Run {} turn {} finished: {:?}", handle.run_id(), turn, stop_reason);
                    break;
                }
            }
        }

        let mut ctx = handle.context().lock().await;
        let mut content = Vec::with_capacity(tool_uses.len() + 1);
        if !text.is_empty() {
            content.push(ContentPart::Text(text.clone()));
        }
        let finished = tool_uses.is_empty();
        content.extend(tool_uses);
        if !content.is_empty() {
            ctx.messages.push(ProviderMessage {
                role: Role::Assistant,
                content,
            });
        }
        if !tool_results.is_empty() {
            ctx.messages.push(ProviderMessage {
                role: Role::Tool,
                content: tool_results,
            });
        }

        if finished {
            return Ok(summarize(&text));
        }
    }

    Err(ParleyError::Generation(format!(
        "run exceeded {} turns",
        deps.max_turns
    )))
}

/// Gate, execute and record one tool call. Returns the tool result part
/// for the next model turn.
async fn handle_tool_use(
    handle: &RunHandle,
    deps: &RunDeps,
    budget: &mut Budget,
    id: &str,
    name: &str,
    input: Value,
) -> ParleyResult<ContentPart> {
    let (mode, cwd) = {
        let ctx = handle.context().lock().await;
        (ctx.permission_mode, ctx.cwd.clone())
    };

    let mut input = input;
    let gated = match gate_for(mode, deps.tools.is_edit_tool(name)) {
        Gate::Deny => {
            let output = format!("{} is not available in plan mode", name);
            handle
                .emit(StreamChunk::ToolOutput {
                    tool_call_id: id.to_string(),
                    output: output.clone(),
                    is_error: true,
                })
                .await?;
            return Ok(ContentPart::ToolResult {
                tool_use_id: id.to_string(),
                output,
                is_error: true,
            });
        }
        Gate::Allow => {
            handle
                .emit(StreamChunk::ToolCall {
                    tool_call_id: id.to_string(),
                    tool_name: name.to_string(),
                    input: input.clone(),
                })
                .await?;
            false
        }
        Gate::Ask => {
            let (approval_id, rx) = handle.open_approval().await;
            handle
                .emit(StreamChunk::ApprovalRequested {
                    approval_id: approval_id.clone(),
                    tool_call_id: id.to_string(),
                    tool_name: name.to_string(),
                    input: input.clone(),
                })
                .await?;
            info!(
                "Run {} awaiting approval {} for {}",
                handle.run_id(),
                approval_id,
                name
            );

            let decision = wait_gate(handle, rx).await?;
            if !decision.approved {
                let output = format!("the user declined {}", name);
                handle
                    .emit(StreamChunk::ToolOutput {
                        tool_call_id: id.to_string(),
                        output: output.clone(),
                        is_error: true,
                    })
                    .await?;
                return Ok(ContentPart::ToolResult {
                    tool_use_id: id.to_string(),
                    output,
                    is_error: true,
                });
            }
            input = with_answers(input, decision.answers);
            true
        }
    };

    let executed = tokio::select! {
        biased;
        _ = handle.cancelled() => return Err(ParleyError::AbortedByCaller),
        result = budget.limit(deps.tools.execute(name, &input, &cwd, handle.child_token())) => result?,
    };

    let (output, is_error) = match executed {
        Ok(output) => (output, false),
        Err(ToolError::Unsupported(_)) => {
            let rx = handle.open_tool_result(id).await;
            if gated {
                // The client only saw the approval request; tell it to run the tool.
                handle
                    .emit(StreamChunk::ToolCall {
                        tool_call_id: id.to_string(),
                        tool_name: name.to_string(),
                        input: input.clone(),
                    })
                    .await?;
            }
            let delivery = wait_gate(handle, rx).await?;
            match delivery.error {
                Some(error) => (error, true),
                None => (delivery.output, false),
            }
        }
        Err(ToolError::Failed(message)) => (message, true),
        Err(ToolError::Cancelled) => return Err(ParleyError::AbortedByCaller),
    };

    handle
        .emit(StreamChunk::ToolOutput {
            tool_call_id: id.to_string(),
            output: output.clone(),
            is_error,
        })
        .await?;

    Ok(ContentPart::ToolResult {
        tool_use_id: id.to_string(),
        output,
        is_error,
    })
}
