//! OpenAI-compatible chat completions provider (streams over SSE).

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use parley_protocol::Role;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    ContentPart, ModelProvider, ProviderError, ProviderEvent, ProviderMessage, ProviderRequest,
    ProviderStream,
};

/// Streams completions from `{base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::Request(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

/// Translate provider-neutral messages into chat-completions messages.
fn to_wire_messages(system_prompt: Option<&str>, messages: &[ProviderMessage]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        wire.push(json!({ "role": "system", "content": prompt }));
    }

    for message in messages {
        let text = message.text_content();
        let tool_calls: Vec<Value> = message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolUse { id, name, input } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                })),
                _ => None,
            })
            .collect();

        // Tool results travel as one `tool` message each.
        for part in &message.content {
            if let ContentPart::ToolResult {
                tool_use_id,
                output,
                ..
            } = part
            {
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": output,
                }));
            }
        }

        match message.role {
            Role::Tool => {}
            Role::Assistant if !tool_calls.is_empty() => {
                let content = if text.is_empty() { Value::Null } else { Value::String(text) };
                wire.push(json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": tool_calls,
                }));
            }
            role if !text.is_empty() => {
                wire.push(json!({ "role": role.to_string(), "content": text }));
            }
            _ => {}
        }
    }
    wire
}

fn request_body(request: &ProviderRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": to_wire_messages(request.system_prompt.as_deref(), &request.messages),
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        },
                    })
                })
                .collect(),
        );
    }
    if request.thinking_enabled {
        body["reasoning_effort"] = json!("medium");
    }
    body
}

/// Tool calls arrive in fragments keyed by index.
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChunkDecoder {
    tool_calls: BTreeMap<u64, PendingToolCall>,
}

impl ChunkDecoder {
    /// Decode one `data:` payload into zero or more events.
    fn decode(&mut self, data: &str) -> Result<Vec<ProviderEvent>, ProviderError> {
        let chunk: Value =
            serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let mut events = Vec::new();

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Ok(events);
        };
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(text) = delta.get("content").and_then(Value::as_str)
            && !text.is_empty()
        {
            events.push(ProviderEvent::TextDelta(text.to_string()));
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let pending = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    pending.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        pending.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        pending.arguments.push_str(args);
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.extend(self.flush()?);
            events.push(ProviderEvent::Finished {
                stop_reason: Some(reason.to_string()),
            });
        }
        Ok(events)
    }

    fn flush(&mut self) -> Result<Vec<ProviderEvent>, ProviderError> {
        std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|call| {
                let input = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments).map_err(|e| {
                        ProviderError::Decode(format!("tool arguments for {}: {}", call.name, e))
                    })?
                };
                Ok(ProviderEvent::ToolUse {
                    id: call.id,
                    name: call.name,
                    input,
                })
            })
            .collect()
    }
}

async fn status_error(err: reqwest_eventsource::Error) -> ProviderError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => ProviderError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        },
        other => ProviderError::Request(other.to_string()),
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request_body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let mut es = EventSource::new(builder)
            .map_err(|e| ProviderError::Request(format!("cannot stream request: {}", e)))?;
        debug!("Streaming completion from {} (model {})", url, request.model);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut decoder = ChunkDecoder::default();
            let mut finished = false;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        es.close();
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    next = es.next() => next,
                };

                match next {
                    None => break,
                    Some(Ok(Event::Open)) => {}
                    Some(Ok(Event::Message(msg))) => {
                        if msg.data.trim() == "[DONE]" {
                            break;
                        }
                        match decoder.decode(&msg.data) {
                            Ok(events) => {
                                for event in events {
                                    finished |= matches!(event, ProviderEvent::Finished { .. });
                                    if tx.send(Ok(event)).await.is_err() {
                                        es.close();
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                es.close();
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                    Some(Err(e)) => {
                        warn!("Provider stream error: {}", e);
                        es.close();
                        let _ = tx.send(Err(status_error(e).await)).await;
                        return;
                    }
                }
            }

            es.close();
            if !finished {
                match decoder.flush() {
                    Ok(events) => {
                        for event in events {
                            let _ = tx.send(Ok(event)).await;
                        }
                        let _ = tx.send(Ok(ProviderEvent::Finished { stop_reason: None })).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
