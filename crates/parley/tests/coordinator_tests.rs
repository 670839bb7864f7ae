//! Agent run tests driven through the HTTP API with a scripted model.

mod common;

use axum::http::StatusCode;
use common::{ScriptedTools, TestApp, Turn, deltas, text_turn, tool_turn};
use parley::ParleyError;
use parley::coordinator::{CoordinatorConfig, RunInput};
use parley::provider::ContentPart;
use parley_protocol::{ChunkPayload, Role, StreamChunk};
use serde_json::json;

fn terminal_count(chunks: &[StreamChunk]) -> usize {
    chunks.iter().filter(|c| c.is_terminal()).count()
}

fn text_of(chunks: &[StreamChunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_approved_tool_call_runs_to_completion() {
    let app = TestApp::with_script(
        vec![
            tool_turn(
                &["Let", " me", " look", " at", " it."],
                "call_1",
                "Read",
                json!({ "path": "notes.txt" }),
            ),
            text_turn(&["It", " says", " hi."]),
        ],
        ScriptedTools::default().with_output("Read", "hi"),
    );

    let message_id = app
        .start_run("S1", json!({ "content": "What is in notes.txt?" }))
        .await;
    let approval_id = app.wait_for_approval("S1").await;

    let paused = app.run_chunks("S1", &message_id).await;
    assert_eq!(paused.len(), 6);
    match &paused[5] {
        (
            5,
            StreamChunk::ApprovalRequested {
                approval_id: id,
                tool_name,
                input,
                ..
            },
        ) => {
            assert_eq!(id, &approval_id);
            assert_eq!(tool_name, "Read");
            assert_eq!(input, &json!({ "path": "notes.txt" }));
        }
        other => panic!("unexpected chunk {:?}", other),
    }

    let run = app.get("/api/sessions/S1/run").await.json();
    assert_eq!(run["state"], "awaiting-approval");
    assert_eq!(run["pendingApprovalId"], approval_id.as_str());

    let resp = app
        .post(
            &format!("/api/sessions/S1/approvals/{}", approval_id),
            json!({ "approved": true }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    app.wait_for_terminal("S1", &message_id).await;
    let chunks = app.run_chunks("S1", &message_id).await;
    assert_eq!(chunks.len(), 11);
    for (i, (seq, _)) in chunks.iter().enumerate() {
        assert_eq!(*seq, i as u64);
    }
    assert_eq!(
        chunks[6].1,
        StreamChunk::ToolOutput {
            tool_call_id: "call_1".to_string(),
            output: "hi".to_string(),
            is_error: false,
        }
    );
    let only_chunks: Vec<_> = chunks.into_iter().map(|(_, c)| c).collect();
    assert_eq!(text_of(&only_chunks[7..10]), "It says hi.");
    assert_eq!(
        only_chunks[10],
        StreamChunk::Done {
            summary: Some("It says hi.".to_string())
        }
    );

    // The decision is part of the log, and the second turn saw the result.
    let entries = app.entries("S1").await;
    assert!(entries.iter().any(|e| matches!(
        e.payload().unwrap(),
        ChunkPayload::ApprovalResponse { approved: true, .. }
    )));
    let requests = app.provider.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(
        last.content,
        vec![ContentPart::ToolResult {
            tool_use_id: "call_1".to_string(),
            output: "hi".to_string(),
            is_error: false,
        }]
    );

    app.wait_for_idle("S1").await;
    let resp = app.get("/api/sessions/S1/run").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_denied_tool_call_reports_error_and_continues() {
    let app = TestApp::with_script(
        vec![
            tool_turn(&[], "call_1", "Bash", json!({ "command": "rm -rf /" })),
            text_turn(&["Okay."]),
        ],
        ScriptedTools::default().with_output("Bash", "never"),
    );

    let message_id = app.start_run("S1", json!({ "content": "clean up" })).await;
    let approval_id = app.wait_for_approval("S1").await;
    let resp = app
        .post(
            &format!("/api/sessions/S1/approvals/{}", approval_id),
            json!({ "approved": false }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::ToolOutput { is_error: true, .. }
    )));
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
    assert_eq!(terminal_count(&chunks), 1);
}

#[tokio::test]
async fn test_approval_answers_reach_the_tool_input() {
    let app = TestApp::with_script(
        vec![
            tool_turn(&[], "call_1", "AskUserQuestion", json!({ "question": "color?" })),
            text_turn(&["Blue it is."]),
        ],
        ScriptedTools::default().with_output("AskUserQuestion", "answered"),
    );

    let message_id = app.start_run("S1", json!({ "content": "pick" })).await;
    let approval_id = app.wait_for_approval("S1").await;
    app.post(
        &format!("/api/sessions/S1/approvals/{}", approval_id),
        json!({ "approved": true, "answers": ["blue"] }),
    )
    .await;
    app.wait_for_terminal("S1", &message_id).await;

    assert_eq!(
        app.tools.calls(),
        vec![(
            "AskUserQuestion".to_string(),
            json!({ "question": "color?", "answers": ["blue"] })
        )]
    );
}

#[tokio::test]
async fn test_approval_without_run_is_404() {
    let app = TestApp::new();
    app.post_message("S1", "hello").await;
    let resp = app
        .post(
            "/api/sessions/S1/approvals/apr_missing",
            json!({ "approved": true }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_approval_with_wrong_id_conflicts() {
    let app = TestApp::with_script(
        vec![tool_turn(&[], "call_1", "Read", json!({}))],
        ScriptedTools::default().with_output("Read", "x"),
    );
    app.start_run("S1", json!({ "content": "go" })).await;
    app.wait_for_approval("S1").await;

    let resp = app
        .post(
            "/api/sessions/S1/approvals/apr_other",
            json!({ "approved": true }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_client_tool_waits_for_posted_result() {
    let app = TestApp::with_script(
        vec![
            tool_turn(&[], "call_7", "browser_open", json!({ "url": "https://example.com" })),
            text_turn(&["Opened."]),
        ],
        ScriptedTools::default(),
    );

    let message_id = app
        .start_run(
            "S1",
            json!({ "content": "open it", "permissionMode": "bypass-permissions" }),
        )
        .await;
    let chunks = app
        .wait_for_chunks("S1", &message_id, |chunks| {
            chunks
                .iter()
                .any(|c| matches!(c, StreamChunk::ToolCall { .. }))
        })
        .await;
    assert!(matches!(
        &chunks[0],
        StreamChunk::ToolCall { tool_call_id, tool_name, .. }
            if tool_call_id == "call_7" && tool_name == "browser_open"
    ));

    let resp = app
        .post(
            "/api/sessions/S1/tool-results",
            json!({ "toolCallId": "call_7", "output": "loaded" }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["delivered"], true);

    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(chunks.contains(&StreamChunk::ToolOutput {
        tool_call_id: "call_7".to_string(),
        output: "loaded".to_string(),
        is_error: false,
    }));
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
}

#[tokio::test]
async fn test_tool_result_without_run_is_recorded_only() {
    let app = TestApp::new();
    app.post_message("S1", "hello").await;
    let resp = app
        .post(
            "/api/sessions/S1/tool-results",
            json!({ "toolCallId": "call_1", "output": "late" }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["delivered"], false);
    assert_eq!(app.entries("S1").await.len(), 2);
}

#[tokio::test]
async fn test_plan_mode_denies_tools_without_asking() {
    let app = TestApp::with_script(
        vec![
            tool_turn(&[], "call_1", "Write", json!({ "path": "a" })),
            text_turn(&["Here is the plan."]),
        ],
        ScriptedTools::default().with_output("Write", "written"),
    );

    let message_id = app
        .start_run("S1", json!({ "content": "plan", "permissionMode": "plan" }))
        .await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(
        !chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::ApprovalRequested { .. }))
    );
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::ToolOutput { is_error: true, .. }
    )));
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
}

#[tokio::test]
async fn test_accept_edits_runs_edit_tools_directly() {
    let app = TestApp::with_script(
        vec![
            tool_turn(&[], "call_1", "Edit", json!({ "path": "a" })),
            text_turn(&["Edited."]),
        ],
        ScriptedTools::default().with_output("Edit", "ok"),
    );

    let message_id = app
        .start_run(
            "S1",
            json!({ "content": "fix", "permissionMode": "accept-edits" }),
        )
        .await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(matches!(&chunks[0], StreamChunk::ToolCall { tool_name, .. } if tool_name == "Edit"));
    assert!(matches!(
        &chunks[1],
        StreamChunk::ToolOutput { is_error: false, .. }
    ));
}

#[tokio::test]
async fn test_new_prompt_supersedes_running_run() {
    let app = TestApp::with_script(
        vec![Turn::Hang(deltas(&["partial"])), text_turn(&["second answer"])],
        ScriptedTools::default(),
    );

    let first = app.start_run("S1", json!({ "content": "first" })).await;
    app.wait_for_chunks("S1", &first, |chunks| !chunks.is_empty())
        .await;

    let second = app.start_run("S1", json!({ "content": "second" })).await;
    let second_chunks = app.wait_for_terminal("S1", &second).await;
    assert!(matches!(second_chunks.last(), Some(StreamChunk::Done { .. })));

    let first_chunks = app.wait_for_terminal("S1", &first).await;
    assert_eq!(terminal_count(&first_chunks), 1);
    assert!(matches!(
        first_chunks.last(),
        Some(StreamChunk::Aborted { reason }) if reason.contains("superseded")
    ));

    // The abort marker lands before the new prompt.
    let entries = app.entries("S1").await;
    let abort_at = entries
        .iter()
        .position(|e| {
            e.value.message_id == first
                && matches!(
                    e.payload().unwrap(),
                    ChunkPayload::Stream {
                        chunk: StreamChunk::Aborted { .. }
                    }
                )
        })
        .unwrap();
    let prompt_at = entries
        .iter()
        .position(|e| match e.payload().unwrap() {
            ChunkPayload::WholeMessage { message } => message.content == "second",
            _ => false,
        })
        .unwrap();
    assert!(abort_at < prompt_at);

    // The second run saw the interrupted first run.
    let requests = app.provider.requests();
    let history = &requests[1].messages;
    assert_eq!(history.last().unwrap().text_content(), "second");
}

#[tokio::test]
async fn test_stop_control_aborts_run() {
    let app = TestApp::with_script(
        vec![Turn::Hang(deltas(&["thinking"]))],
        ScriptedTools::default(),
    );

    let message_id = app.start_run("S1", json!({ "content": "go" })).await;
    app.wait_for_chunks("S1", &message_id, |chunks| !chunks.is_empty())
        .await;

    let resp = app
        .post("/api/sessions/S1/control", json!({ "action": "stop" }))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["cancelled"], true);

    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert_eq!(terminal_count(&chunks), 1);
    assert!(matches!(chunks.last(), Some(StreamChunk::Aborted { .. })));

    let resp = app.get("/api/sessions/S1/run").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    // Stopping again finds nothing to cancel.
    let resp = app
        .post("/api/sessions/S1/control", json!({ "action": "stop" }))
        .await;
    assert_eq!(resp.json()["cancelled"], false);
}

#[tokio::test]
async fn test_stop_while_awaiting_approval() {
    let app = TestApp::with_script(
        vec![tool_turn(&[], "call_1", "Read", json!({}))],
        ScriptedTools::default().with_output("Read", "x"),
    );
    let message_id = app.start_run("S1", json!({ "content": "go" })).await;
    app.wait_for_approval("S1").await;

    app.post("/api/sessions/S1/control", json!({ "action": "stop" }))
        .await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert_eq!(terminal_count(&chunks), 1);
    assert!(matches!(chunks.last(), Some(StreamChunk::Aborted { .. })));
}

#[tokio::test]
async fn test_provider_failure_writes_one_error_marker() {
    let app = TestApp::with_script(
        vec![Turn::Fail(deltas(&["a", "b"]), "upstream exploded".to_string())],
        ScriptedTools::default(),
    );

    let message_id = app.start_run("S1", json!({ "content": "go" })).await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(text_of(&chunks), "ab");
    assert_eq!(terminal_count(&chunks), 1);
    assert!(matches!(
        &chunks[2],
        StreamChunk::Error { message } if message.contains("upstream exploded")
    ));
}

#[tokio::test]
async fn test_turn_limit_ends_run_with_error() {
    let config = CoordinatorConfig {
        max_turns: 1,
        ..CoordinatorConfig::default()
    };
    let app = TestApp::build(
        vec![tool_turn(&[], "call_1", "Read", json!({}))],
        ScriptedTools::default().with_output("Read", "x"),
        config,
        1000,
    );

    let message_id = app
        .start_run(
            "S1",
            json!({ "content": "loop", "permissionMode": "bypass-permissions" }),
        )
        .await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(matches!(
        chunks.last(),
        Some(StreamChunk::Error { message }) if message.contains("turns")
    ));
}

#[tokio::test]
async fn test_session_config_selects_model() {
    let app = TestApp::with_script(vec![text_turn(&["hi"])], ScriptedTools::default());
    app.post("/api/sessions/S1/config", json!({ "model": "m-2" }))
        .await;

    let message_id = app.start_run("S1", json!({ "content": "hello" })).await;
    app.wait_for_terminal("S1", &message_id).await;

    let requests = app.provider.requests();
    assert_eq!(requests[0].model, "m-2");

    // A per-request model wins over the session config.
    let message_id = app
        .start_run("S1", json!({ "content": "again", "model": "m-3" }))
        .await;
    app.wait_for_terminal("S1", &message_id).await;
    assert_eq!(app.provider.requests()[1].model, "m-3");
}

#[tokio::test]
async fn test_history_includes_prior_run_output() {
    let app = TestApp::with_script(
        vec![text_turn(&["Hello", " there"]), text_turn(&["Again"])],
        ScriptedTools::default(),
    );

    let first = app.start_run("S1", json!({ "content": "hi" })).await;
    app.wait_for_terminal("S1", &first).await;
    app.wait_for_idle("S1").await;
    let second = app.start_run("S1", json!({ "content": "more" })).await;
    app.wait_for_terminal("S1", &second).await;

    let requests = app.provider.requests();
    let texts: Vec<(Role, String)> = requests[1]
        .messages
        .iter()
        .map(|m| (m.role, m.text_content()))
        .collect();
    assert_eq!(
        texts,
        vec![
            (Role::User, "hi".to_string()),
            (Role::Assistant, "Hello there".to_string()),
            (Role::User, "more".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_aborts_active_runs() {
    let app = TestApp::with_script(
        vec![Turn::Hang(deltas(&["working"]))],
        ScriptedTools::default(),
    );
    let message_id = app.start_run("S1", json!({ "content": "go" })).await;
    app.wait_for_chunks("S1", &message_id, |chunks| !chunks.is_empty())
        .await;

    app.state.coordinator.shutdown().await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert!(matches!(
        chunks.last(),
        Some(StreamChunk::Aborted { reason }) if reason.contains("shutting down")
    ));
    assert_eq!(app.state.coordinator.active_runs(), 0);
}

#[tokio::test]
async fn test_interrupted_tool_still_ends_run() {
    let app = TestApp::with_script(
        vec![tool_turn(&[], "call_1", "Read", json!({ "path": "a" }))],
        ScriptedTools::default().with_interruption("Read"),
    );

    let message_id = app
        .start_run(
            "S1",
            json!({ "content": "read it", "permissionMode": "bypass-permissions" }),
        )
        .await;
    let chunks = app.wait_for_terminal("S1", &message_id).await;
    assert_eq!(terminal_count(&chunks), 1);
    assert!(matches!(
        chunks.last(),
        Some(StreamChunk::Aborted { reason }) if reason == "interrupted"
    ));
    app.wait_for_idle("S1").await;
}

#[tokio::test]
async fn test_resume_without_run_is_not_found() {
    let app = TestApp::new();
    app.post_message("S1", "hello").await;

    let result = app
        .state
        .coordinator
        .resume("S1", Some("apr_1"), true, None)
        .await;
    assert!(matches!(result, Err(ParleyError::RunNotFound(_))));
}

#[tokio::test]
async fn test_delete_racing_new_run_leaves_no_orphan() {
    let app = TestApp::with_script(
        vec![
            Turn::Hang(deltas(&["first"])),
            Turn::Hang(deltas(&["second"])),
        ],
        ScriptedTools::default(),
    );
    let first = app.start_run("S1", json!({ "content": "one" })).await;
    app.wait_for_chunks("S1", &first, |chunks| !chunks.is_empty())
        .await;

    let coordinator = &app.state.coordinator;
    let (_, started) = tokio::join!(
        coordinator.forget("S1"),
        coordinator.start("S1", RunInput::prompt(common::USER, "two")),
    );
    let started = started.unwrap();

    // Either the new run is still registered, or the delete aborted it.
    match coordinator.current_run("S1") {
        Some(handle) => assert_eq!(handle.run_id(), started.run_id),
        None => {
            let chunks = app.wait_for_terminal("S1", &started.message_id).await;
            assert!(matches!(
                chunks.last(),
                Some(StreamChunk::Aborted { reason }) if reason == "session deleted"
            ));
        }
    }
    let chunks = app.wait_for_terminal("S1", &first).await;
    assert_eq!(terminal_count(&chunks), 1);

    coordinator.shutdown().await;
}
