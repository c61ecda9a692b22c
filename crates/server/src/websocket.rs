//! WebSocket handling
//!
//! One WebSocket connection is one session: the connection reserves the
//! session's output directory, loops over inbound prompts, and runs at most
//! one agent run at a time. A prompt that arrives while a run is in flight
//! preempts it; the old run's teardown is awaited before the new run
//! starts, so the directory-diff artifact detection never races a stale
//! writer. A preempted run emits no terminal event.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cardforge_agent::AgentRequest;
use cardforge_protocol::{new_session_id, ServerMessage};

use crate::artifacts;
use crate::run::{drive, DriverOutcome, RunEvent};
use crate::state::{AppState, ArtifactRecord};
use crate::tools::build_toolset;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const SYSTEM_PROMPT: &str = include_str!("prompt.md");

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// Handle to the session's in-flight agent run.
struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveRun {
    /// Cancel the run and wait for its task, including agent teardown, to
    /// finish. Returns only once the run can no longer touch the session's
    /// output directory.
    async fn retire(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(
                    component = "websocket",
                    event = "ws.run.panicked",
                    error = %e,
                    "Agent run task panicked during retirement"
                );
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let session_id = new_session_id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %session_id,
        "WebSocket connection opened"
    );

    let session_dir = match state.reserve_output_dir(&session_id) {
        Ok(dir) => dir,
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.session.reserve_failed",
                connection_id = conn_id,
                session_id = %session_id,
                error = %e,
                "Failed to reserve session output directory"
            );
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut active_run: Option<ActiveRun> = None;

    while let Some(result) = ws_rx.next().await {
        let prompt = match result {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    session_id = %session_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    session_id = %session_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            continue;
        }

        info!(
            component = "websocket",
            event = "ws.prompt.received",
            connection_id = conn_id,
            session_id = %session_id,
            prompt_chars = prompt.chars().count(),
            preempting = active_run.is_some(),
            "Prompt received"
        );

        // Preempt any run still in flight. The await here is the ordering
        // guarantee: the old agent session is fully torn down before the
        // new run snapshots the output directory.
        if let Some(run) = active_run.take() {
            run.retire().await;
        }

        send_json(&outbound_tx, ServerMessage::Start).await;
        active_run = Some(spawn_run(
            &state,
            session_id.clone(),
            session_dir.clone(),
            prompt,
            outbound_tx.clone(),
        ));
    }

    if let Some(run) = active_run.take() {
        run.retire().await;
    }
    state.release_output_dir(&session_id);

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %session_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

/// Spawn one agent run for a prompt. The returned handle is the only way to
/// stop it early.
fn spawn_run(
    state: &Arc<AppState>,
    session_id: String,
    session_dir: PathBuf,
    prompt: String,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) -> ActiveRun {
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let state = state.clone();

    let task = tokio::spawn(async move {
        let started = Instant::now();

        let before = match artifacts::snapshot(&session_dir) {
            Ok(snap) => snap,
            Err(e) => {
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        message: format!("Could not inspect output directory: {}", e),
                    },
                )
                .await;
                return;
            }
        };

        let request = AgentRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            prompt,
            tools: build_toolset(state.http(), session_dir.clone()),
        };

        let backend = state.backend();
        let (events_tx, mut events_rx) = mpsc::channel::<RunEvent>(64);
        let mut driver = std::pin::pin!(drive(
            backend.as_ref(),
            request,
            state.verbose(),
            events_tx,
            &run_cancel,
        ));

        let outcome = loop {
            tokio::select! {
                biased;

                outcome = &mut driver => break outcome,

                event = events_rx.recv() => {
                    if let Some(event) = event {
                        forward_run_event(&outbound_tx, event).await;
                    }
                }
            }
        };

        // Drain buffered log events so every one of them reaches the client
        // before the terminal message.
        while let Ok(event) = events_rx.try_recv() {
            forward_run_event(&outbound_tx, event).await;
        }

        if outcome == DriverOutcome::Cancelled {
            debug!(
                component = "websocket",
                event = "ws.run.preempted",
                session_id = %session_id,
                "Run preempted, suppressing terminal event"
            );
            return;
        }

        match artifacts::detect_new(&before, &session_dir) {
            Ok(Some(path)) => {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                state.record_artifact(ArtifactRecord {
                    session_id: session_id.clone(),
                    path,
                    filename: filename.clone(),
                });
                let elapsed_time = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
                send_json(
                    &outbound_tx,
                    ServerMessage::Complete {
                        session_id,
                        filename,
                        elapsed_time,
                    },
                )
                .await;
            }
            Ok(None) => {
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        message: "No package file was generated.".to_string(),
                    },
                )
                .await;
            }
            Err(e) => {
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        message: format!("Could not inspect output directory: {}", e),
                    },
                )
                .await;
            }
        }
    });

    ActiveRun { cancel, task }
}

async fn forward_run_event(tx: &mpsc::Sender<OutboundMessage>, event: RunEvent) {
    let msg = match event {
        RunEvent::Log(message) => ServerMessage::Log { message },
        RunEvent::Error(message) => ServerMessage::Error { message },
    };
    send_json(tx, msg).await;
}
