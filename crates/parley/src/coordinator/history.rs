//! Rebuilding a conversation from the session log.

use log::debug;
use parley_protocol::{ChunkPayload, LogEntry, Role, SessionConfig, StreamChunk};

use crate::provider::ProviderMessage;

/// Conversation and settings folded from a session log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionHistory {
    pub messages: Vec<ProviderMessage>,
    pub config: SessionConfig,
}

/// Fold log entries into provider messages. Whole messages are taken as
/// they are; streamed text deltas are concatenated per message id; config
/// chunks are merged in order. Entries that fail to decode are skipped.
pub fn fold_entries(entries: &[LogEntry]) -> SessionHistory {
    let mut history = SessionHistory::default();
    let mut streaming: Option<(String, String)> = None;

    let flush = |streaming: &mut Option<(String, String)>, messages: &mut Vec<ProviderMessage>| {
        if let Some((_, text)) = streaming.take()
            && !text.is_empty()
        {
            messages.push(ProviderMessage::text(Role::Assistant, text));
        }
    };

    for entry in entries {
        let payload = match entry.payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Skipping undecodable entry {}: {}", entry.key, e);
                continue;
            }
        };

        match payload {
            ChunkPayload::Stream { chunk } => {
                let message_id = &entry.value.message_id;
                if streaming.as_ref().is_some_and(|(id, _)| id != message_id) {
                    flush(&mut streaming, &mut history.messages);
                }
                match chunk {
                    StreamChunk::TextDelta { delta } => {
                        streaming
                            .get_or_insert_with(|| (message_id.clone(), String::new()))
                            .1
                            .push_str(&delta);
                    }
                    c if c.is_terminal() => flush(&mut streaming, &mut history.messages),
                    _ => {}
                }
            }
            ChunkPayload::WholeMessage { message } => {
                flush(&mut streaming, &mut history.messages);
                history
                    .messages
                    .push(ProviderMessage::text(message.role, message.content));
            }
            ChunkPayload::Config(config) => history.config.merge(&config),
            ChunkPayload::ToolResult { .. }
            | ChunkPayload::ApprovalResponse { .. }
            | ChunkPayload::Control { .. } => {}
        }
    }

    flush(&mut streaming, &mut history.messages);
    history
}
