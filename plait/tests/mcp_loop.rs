//! End-to-end scenarios: a scripted model driving the full stack against an
//! in-process fake MCP server speaking newline-delimited JSON-RPC over stdio.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use plait::{
    BackendRunner, ContextPathConfig, McpStatusKind, Message, MockModel, PathKind,
    PathPermissionManager, Permission, RunnerOptions, ServerSpec, StreamChunk,
};

/// Shell implementation of an MCP server exposing `read_file` and
/// `write_file`. Responses echo the request id; `resources/list` and
/// `prompts/list` are unsupported on purpose.
const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2025-11-25","capabilities":{"tools":{}}}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"read_file","description":"Read a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}},{"name":"write_file","description":"Write a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"},"contents":{"type":"string"}}}}]}}\n' "$id";;
    *'"method":"resources/list"'*|*'"method":"prompts/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32601,"message":"method not found"}}\n' "$id";;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"hi"}]}}\n' "$id";;
    *) ;;
  esac
done
"#;

fn fake_server_spec(dir: &Path, name: &str) -> ServerSpec {
    let script = dir.join("fake_server.sh");
    std::fs::write(&script, FAKE_SERVER).unwrap();
    ServerSpec::stdio(
        name,
        vec!["sh".to_string(), script.display().to_string()],
    )
}

fn unreachable_spec(name: &str) -> ServerSpec {
    ServerSpec::stdio(
        name,
        vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
    )
}

fn fast_options() -> RunnerOptions {
    RunnerOptions {
        retry_base_delay: std::time::Duration::from_millis(10),
        ..RunnerOptions::default()
    }
}

async fn collect(runner: &Arc<BackendRunner>, messages: Vec<Message>) -> Vec<StreamChunk> {
    Arc::clone(runner).stream(messages).collect::<Vec<_>>().await
}

fn statuses(chunks: &[StreamChunk]) -> Vec<McpStatusKind> {
    chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::McpStatus { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_one_tool() {
    let dir = tempfile::tempdir().unwrap();

    let model = Arc::new(MockModel::new());
    model.push_tool_call_turn("call_1", "mcp__fs__read_file", r#"{"path":"/work/hello.txt"}"#);
    model.push_text_turn("The file says hi.");

    let permissions = Arc::new(PathPermissionManager::new(false));
    permissions.add_path(Path::new("/work"), Permission::Write, PathKind::Workspace);

    let runner = Arc::new(
        BackendRunner::new(
            model.clone(),
            vec![fake_server_spec(dir.path(), "fs")],
            fast_options(),
        )
        .with_permission_manager(permissions),
    );

    let chunks = collect(&runner, vec![Message::user("read /work/hello.txt")]).await;

    assert_eq!(
        statuses(&chunks),
        vec![
            McpStatusKind::McpConnected,
            McpStatusKind::McpToolCalled,
            McpStatusKind::McpToolResponse,
        ]
    );
    assert!(chunks
        .iter()
        .any(|c| matches!(c, StreamChunk::Content { content } if content == "The file says hi.")));
    assert!(matches!(chunks.last(), Some(StreamChunk::Done)));

    // The registry exposed the namespaced tool and the loop fed the session's
    // answer back as a tool result.
    let registry = runner.mcp_registry().unwrap();
    assert!(registry.tool_names().contains(&"mcp__fs__read_file".to_string()));
    let second = &model.recorded_calls()[1].messages;
    assert!(second
        .iter()
        .any(|m| matches!(m, Message::Tool { call_id, content } if call_id == "call_1" && content == "hi")));

    runner.cleanup_mcp().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_denied_surfaces_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = dir.path().join("work");
    std::fs::create_dir_all(&ctx).unwrap();

    let model = Arc::new(MockModel::new());
    model.push_tool_call_turn(
        "call_w",
        "mcp__fs__write_file",
        &format!(r#"{{"path":"{}","contents":"y"}}"#, ctx.join("x").display()),
    );
    model.push_text_turn("That path is read-only.");

    // The work dir is a context path; write access stays off.
    let permissions = Arc::new(PathPermissionManager::new(false));
    permissions.add_context_paths(&[ContextPathConfig {
        path: ctx.display().to_string(),
        permission: Permission::Write,
        protected_paths: vec![],
    }]);

    let runner = Arc::new(
        BackendRunner::new(
            model.clone(),
            vec![fake_server_spec(dir.path(), "fs")],
            fast_options(),
        )
        .with_permission_manager(permissions),
    );

    let chunks = collect(&runner, vec![Message::user("write please")]).await;
    assert!(matches!(chunks.last(), Some(StreamChunk::Done)));

    let second = &model.recorded_calls()[1].messages;
    let tool_result = second
        .iter()
        .find_map(|m| match m {
            Message::Tool { content, .. } => Some(content.clone()),
            _ => None,
        })
        .expect("denial should be appended as a tool result");
    assert!(
        tool_result.contains("No write permission") && tool_result.contains("read-only context path"),
        "unexpected tool result: {}",
        tool_result
    );

    runner.cleanup_mcp().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_opens_and_blocks_permanently() {
    let model = Arc::new(MockModel::new());
    model.push_text_turn("no tools here");
    model.push_text_turn("still no tools");

    let runner = Arc::new(BackendRunner::new(
        model.clone(),
        vec![unreachable_spec("srv")],
        fast_options(),
    ));

    let chunks = collect(&runner, vec![Message::user("hello")]).await;

    // Three setup attempts, three recorded failures, circuit open.
    let (failures, _, open) = runner.breaker().server_status("srv");
    assert_eq!(failures, 3);
    assert!(open);
    assert!(runner.is_permanently_blocked());
    assert_eq!(statuses(&chunks), vec![McpStatusKind::McpBlocked]);
    // The backend still streamed plain model output.
    assert!(chunks
        .iter()
        .any(|c| matches!(c, StreamChunk::Content { content } if content.contains("no tools here"))));

    // Subsequent calls bypass MCP and announce nothing further.
    let chunks = collect(&runner, vec![Message::user("again")]).await;
    assert!(statuses(&chunks).is_empty());
    assert!(chunks
        .iter()
        .any(|c| matches!(c, StreamChunk::Content { content } if content.contains("still no tools"))));
    assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
}

#[tokio::test(flavor = "multi_thread")]
async fn workflow_tool_passes_through_untouched() {
    let dir = tempfile::tempdir().unwrap();

    let model = Arc::new(MockModel::new());
    model.push_tool_call_turn("call_v", "vote", r#"{"agent":"a2","reason":"better"}"#);

    let runner = Arc::new(BackendRunner::new(
        model.clone(),
        vec![fake_server_spec(dir.path(), "fs")],
        fast_options(),
    ));

    let chunks = collect(&runner, vec![Message::user("decide")]).await;

    let tool_calls = chunks.iter().find_map(|c| match c {
        StreamChunk::ToolCalls { tool_calls } => Some(tool_calls.clone()),
        _ => None,
    });
    let tool_calls = tool_calls.expect("workflow batch must be handed upward");
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].name, "vote");
    assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
    // One model turn only: `vote` was never executed here.
    assert_eq!(model.recorded_calls().len(), 1);

    runner.cleanup_mcp().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn session_survives_tool_timeout() {
    // A server that answers discovery but never answers tools/call.
    const SLOW_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2025-11-25"}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"slow","description":"never answers","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"method":"resources/list"'*|*'"method":"prompts/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id";;
    *) ;;
  esac
done
"#;
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("slow_server.sh");
    std::fs::write(&script, SLOW_SERVER).unwrap();
    let spec = ServerSpec::stdio("slow", vec!["sh".to_string(), script.display().to_string()]);

    let registry = plait::MultiServerRegistry::connect_all(
        &[spec],
        std::time::Duration::from_millis(200),
        None,
        None,
    )
    .await
    .unwrap();

    let err = registry
        .call_tool("mcp__slow__slow", serde_json::json!({}))
        .await
        .unwrap_err();
    match &err {
        plait::McpError::Timeout { operation, .. } => assert_eq!(operation, "call_tool(slow)"),
        other => panic!("expected timeout, got {:?}", other),
    }

    // The session is still Ready and usable after the timeout.
    let health = registry.health_check_all().await;
    assert_eq!(health.get("slow"), Some(&true));

    registry.disconnect_sessions().await;
}
