//! Claude CLI backend
//!
//! Spawns the `claude` CLI as a subprocess and communicates via stdin/stdout
//! using the NDJSON stream-json protocol. The run's toolset is declared as an
//! in-process (`"type": "sdk"`) MCP server, so `tools/list` and `tools/call`
//! requests come back over the same pipe as `mcp_message` control requests
//! and are dispatched to the [`ToolRegistry`] right here.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cardforge_protocol::RunUsage;

use crate::{AgentBackend, AgentError, AgentEvent, AgentRequest, AgentStream, ToolRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const STDIN_CHANNEL_CAPACITY: usize = 64;

/// Production backend: one CLI subprocess per run.
#[derive(Debug, Clone, Default)]
pub struct CliBackend {
    binary: Option<String>,
    model: Option<String>,
}

impl CliBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Option<String>) -> Self {
        Self {
            binary: None,
            model,
        }
    }

    fn resolve_binary(&self) -> String {
        self.binary
            .clone()
            .or_else(|| std::env::var("CARDFORGE_AGENT_BIN").ok())
            .unwrap_or_else(|| "claude".to_string())
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentStream>, AgentError> {
        let binary = self.resolve_binary();
        let server_name = request.tools.server_name().to_string();

        // The CLI reads the tool-server declaration from a config file; the
        // `sdk` type routes tool traffic back over our stdio pipe.
        let mcp_config = tempfile::NamedTempFile::new()?;
        let mut servers = serde_json::Map::new();
        servers.insert(
            server_name.clone(),
            json!({ "type": "sdk", "name": server_name }),
        );
        let config = json!({ "mcpServers": servers });
        std::fs::write(mcp_config.path(), serde_json::to_vec(&config)?)?;

        let allowed_tools = request.tools.qualified_names().join(",");
        let config_path = mcp_config.path().to_string_lossy().to_string();

        let mut args: Vec<String> = vec![
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--mcp-config".into(),
            config_path,
            "--system-prompt".into(),
            request.system_prompt.clone(),
        ];
        if !allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(allowed_tools);
        }
        if let Some(ref model) = self.model {
            args.push("--model".into());
            args.push(model.clone());
        }

        info!(
            component = "agent_cli",
            event = "agent.spawn",
            binary = %binary,
            tools = request.tools.len(),
            "Spawning agent CLI"
        );

        let mut child = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("Failed to spawn {}: {}", binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("No stdin on agent child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("No stdout on agent child".into()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_CHANNEL_CAPACITY);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "agent_cli",
                        event = "agent.stderr",
                        line = %line,
                        "Agent CLI stderr"
                    );
                }
            });
        }

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let tools = request.tools.clone();
        let reader_stdin_tx = stdin_tx.clone();
        tokio::spawn(event_loop(stdout, event_tx, reader_stdin_tx, tools));

        // Initialize handshake, then the single user prompt for this run.
        send_json(
            &stdin_tx,
            &json!({
                "type": "control_request",
                "request_id": uuid::Uuid::new_v4().to_string(),
                "request": { "subtype": "initialize" }
            }),
        )
        .await?;
        send_json(
            &stdin_tx,
            &json!({
                "type": "user",
                "session_id": "",
                "parent_tool_use_id": null,
                "message": {
                    "role": "user",
                    "content": [ { "type": "text", "text": request.prompt } ]
                }
            }),
        )
        .await?;

        Ok(Box::new(CliAgentStream {
            child,
            event_rx,
            closed: false,
            _mcp_config: mcp_config,
        }))
    }
}

/// One live CLI subprocess. Exactly-once teardown: `shutdown` kills the
/// child on first call and is a no-op afterwards.
pub struct CliAgentStream {
    child: Child,
    event_rx: mpsc::Receiver<Result<AgentEvent, AgentError>>,
    closed: bool,
    _mcp_config: tempfile::NamedTempFile,
}

#[async_trait]
impl AgentStream for CliAgentStream {
    async fn next_event(&mut self) -> Option<Result<AgentEvent, AgentError>> {
        self.event_rx.recv().await
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.child.kill().await {
            warn!(
                component = "agent_cli",
                event = "agent.shutdown.kill_failed",
                error = %e,
                "Failed to kill agent CLI"
            );
        }
        let _ = self.child.wait().await;
        info!(
            component = "agent_cli",
            event = "agent.shutdown",
            "Agent CLI shut down"
        );
    }
}

async fn send_json(stdin_tx: &mpsc::Sender<String>, value: &Value) -> Result<(), AgentError> {
    let line = serde_json::to_string(value)?;
    stdin_tx
        .send(line)
        .await
        .map_err(|_| AgentError::ChannelClosed)
}

/// Dedicated stdin writer task — reads from channel, writes to child stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "agent_cli",
                event = "agent.stdin.write_error",
                error = %e,
                "Failed to write to agent CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "agent_cli",
                event = "agent.stdin.flush_error",
                error = %e,
                "Failed to flush agent CLI stdin"
            );
            break;
        }
    }
}

/// Read stdout line-by-line, parse JSON, translate to agent events.
/// Returns (ending the stream) on the terminal result event or EOF.
async fn event_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<Result<AgentEvent, AgentError>>,
    stdin_tx: mpsc::Sender<String>,
    tools: ToolRegistry,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(
                    component = "agent_cli",
                    event = "agent.stdout.eof",
                    "Agent CLI stdout EOF"
                );
                return;
            }
            Err(e) => {
                let _ = event_tx.send(Err(AgentError::Io(e))).await;
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    component = "agent_cli",
                    event = "agent.stdout.parse_error",
                    error = %e,
                    "Failed to parse agent stdout JSON"
                );
                continue;
            }
        };

        let (events, finished) = dispatch_stdout_message(&raw, &stdin_tx, &tools).await;
        for ev in events {
            if event_tx.send(ev).await.is_err() {
                info!(
                    component = "agent_cli",
                    event = "agent.event_loop.channel_closed",
                    "Event channel closed, stopping reader"
                );
                return;
            }
        }
        if finished {
            return;
        }
    }
}

/// Dispatch a raw stdout JSON message by its `type` field. The second
/// return value is true once the terminal result was seen.
async fn dispatch_stdout_message(
    raw: &Value,
    stdin_tx: &mpsc::Sender<String>,
    tools: &ToolRegistry,
) -> (Vec<Result<AgentEvent, AgentError>>, bool) {
    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "assistant" => (assistant_events(raw), false),
        "result" => (vec![result_event(raw)], true),
        "control_request" => {
            handle_control_request(raw, stdin_tx, tools).await;
            (vec![], false)
        }
        // init bookkeeping, echoed user messages, partial deltas — nothing
        // the run driver needs.
        "system" | "user" | "stream_event" | "control_response" | "control_cancel_request"
        | "keep_alive" => (vec![], false),
        _ => {
            debug!(
                component = "agent_cli",
                event = "agent.stdout.unknown_type",
                msg_type = %msg_type,
                "Unknown stdout message type"
            );
            (vec![], false)
        }
    }
}

fn assistant_events(raw: &Value) -> Vec<Result<AgentEvent, AgentError>> {
    let Some(blocks) = raw
        .pointer("/message/content")
        .and_then(|v| v.as_array())
    else {
        return vec![];
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.trim().is_empty() {
                        events.push(Ok(AgentEvent::AssistantText(text.to_string())));
                    }
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                events.push(Ok(AgentEvent::ToolUse { name, input }));
            }
            _ => {}
        }
    }
    events
}

fn result_event(raw: &Value) -> Result<AgentEvent, AgentError> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    if subtype.starts_with("error") {
        let detail = raw
            .get("result")
            .and_then(|v| v.as_str())
            .unwrap_or(subtype);
        return Err(AgentError::Backend(detail.to_string()));
    }

    let usage = Some(RunUsage {
        input_tokens: raw
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: raw
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        num_turns: raw.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0),
        total_cost_usd: raw.get("total_cost_usd").and_then(|v| v.as_f64()),
    });
    Ok(AgentEvent::Completed { usage })
}

/// Answer `can_use_tool` (auto-allow — the toolset is ours) and
/// `mcp_message` (dispatch to the registry) control requests.
async fn handle_control_request(
    raw: &Value,
    stdin_tx: &mpsc::Sender<String>,
    tools: &ToolRegistry,
) {
    let Some(request_id) = raw.get("request_id").and_then(|v| v.as_str()) else {
        return;
    };
    let subtype = raw
        .pointer("/request/subtype")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let response = match subtype {
        "can_use_tool" => {
            let input = raw
                .pointer("/request/input")
                .cloned()
                .unwrap_or(Value::Null);
            json!({ "behavior": "allow", "updatedInput": input })
        }
        "mcp_message" => {
            let Some(message) = raw.pointer("/request/message") else {
                return;
            };
            let Some(mcp_response) = handle_mcp_message(message, tools).await else {
                // Notification — no reply expected.
                return;
            };
            json!({ "mcp_response": mcp_response })
        }
        other => {
            debug!(
                component = "agent_cli",
                event = "agent.control.unsupported",
                subtype = %other,
                "Unsupported control request subtype"
            );
            return;
        }
    };

    let reply = json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response
        }
    });
    let _ = send_json(stdin_tx, &reply).await;
}

/// JSON-RPC handler for the in-process tool server.
async fn handle_mcp_message(message: &Value, tools: &ToolRegistry) -> Option<Value> {
    let method = message.get("method").and_then(|v| v.as_str()).unwrap_or("");
    let id = message.get("id").cloned();

    let result = match method {
        "initialize" => json!({
            "protocolVersion": message
                .pointer("/params/protocolVersion")
                .cloned()
                .unwrap_or_else(|| json!("2024-11-05")),
            "capabilities": { "tools": {} },
            "serverInfo": { "name": tools.server_name(), "version": env!("CARGO_PKG_VERSION") }
        }),
        "notifications/initialized" => return None,
        "tools/list" => {
            let specs: Vec<Value> = tools
                .specs()
                .into_iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": spec.input_schema
                    })
                })
                .collect();
            json!({ "tools": specs })
        }
        "tools/call" => {
            let name = message
                .pointer("/params/name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let arguments = message
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(json!({}));
            let output = tools.call(name, arguments).await;
            json!({
                "content": [ { "type": "text", "text": output.text } ],
                "isError": output.is_error
            })
        }
        _ => {
            let id = id?;
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {}", method) }
            }));
        }
    };

    Some(json!({ "jsonrpc": "2.0", "id": id.unwrap_or(Value::Null), "result": result }))
}
