//! Agent run driver
//!
//! Wraps one agent invocation as a cancellable unit of work and translates
//! its event stream into an ordered log-message stream. Cancellation is
//! cooperative at every suspension point between agent events; on every
//! exit path — exhaustion, failure, cancellation — the agent stream is shut
//! down before the outcome is returned, so no orphaned agent session can
//! outlive a run. Non-cancellation failures are swallowed into one final
//! error-tagged event; cancellation always propagates as its own outcome so
//! the controller never mistakes a preempted run for a completed one.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cardforge_agent::{AgentBackend, AgentEvent, AgentRequest};

/// One entry of the driver's log stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Log(String),
    Error(String),
}

/// How a run ended, from the controller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The event sequence is exhausted (including swallowed failures);
    /// the session directory may now be diffed for a new artifact.
    Finished,
    /// The run was preempted or the session closed; no terminal client
    /// event may be emitted for it.
    Cancelled,
}

/// Drive one agent run to completion or cancellation, emitting log events
/// in generation order.
pub async fn drive(
    backend: &dyn AgentBackend,
    request: AgentRequest,
    verbose: bool,
    events_tx: mpsc::Sender<RunEvent>,
    cancel: &CancellationToken,
) -> DriverOutcome {
    let mut stream = match backend.start(request).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                component = "run",
                event = "run.start_failed",
                error = %e,
                "Agent session failed to start"
            );
            let _ = events_tx
                .send(RunEvent::Error(format!("Agent failed to start: {}", e)))
                .await;
            return DriverOutcome::Finished;
        }
    };

    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break DriverOutcome::Cancelled;
            }

            event = stream.next_event() => match event {
                Some(Ok(event)) => {
                    for line in format_event(&event, verbose) {
                        let _ = events_tx.send(RunEvent::Log(line)).await;
                    }
                }
                Some(Err(e)) => {
                    let _ = events_tx
                        .send(RunEvent::Error(format!("Agent error: {}", e)))
                        .await;
                    break DriverOutcome::Finished;
                }
                None => break DriverOutcome::Finished,
            },
        }
    };

    // Scoped release: the agent session is torn down before cancellation
    // (or completion) propagates to the caller.
    stream.shutdown().await;

    info!(
        component = "run",
        event = "run.ended",
        outcome = ?outcome,
        "Agent run ended"
    );
    outcome
}

/// Map one agent event to zero or more client-facing log lines.
fn format_event(event: &AgentEvent, verbose: bool) -> Vec<String> {
    match event {
        AgentEvent::AssistantText(text) => vec![format!("Agent: {}", text)],
        AgentEvent::ToolUse { name, input } => {
            let mut lines = vec![format!("Using tool: {}", name)];
            if verbose {
                lines.push(format!("  input: {}", input));
            }
            lines
        }
        AgentEvent::Completed { usage } => match usage {
            Some(usage) => {
                let mut lines = vec![format!(
                    "Run finished: {} turns, {} input / {} output tokens",
                    usage.num_turns, usage.input_tokens, usage.output_tokens
                )];
                if let Some(cost) = usage.total_cost_usd {
                    lines.push(format!("Estimated cost: ${:.4}", cost));
                }
                lines
            }
            None => vec![],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cardforge_agent::{ScriptStep, ScriptedBackend, ToolRegistry};
    use cardforge_protocol::RunUsage;

    fn request() -> AgentRequest {
        AgentRequest {
            system_prompt: String::new(),
            prompt: "topic".into(),
            tools: ToolRegistry::builder("deck-tools").build(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn streams_logs_in_generation_order() {
        let backend = ScriptedBackend::new(vec![
            ScriptStep::AssistantText("first".into()),
            ScriptStep::CallTool {
                name: "search".into(),
                input: serde_json::json!({"query": "q"}),
            },
            ScriptStep::AssistantText("second".into()),
            ScriptStep::Complete { usage: None },
        ]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let outcome = drive(&backend, request(), false, tx, &cancel).await;
        assert_eq!(outcome, DriverOutcome::Finished);
        assert_eq!(backend.shutdown_count(), 1);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                RunEvent::Log("Agent: first".into()),
                RunEvent::Log("Using tool: search".into()),
                RunEvent::Log("Agent: second".into()),
            ]
        );
    }

    #[tokio::test]
    async fn verbose_mode_adds_tool_parameter_dump() {
        let backend = ScriptedBackend::new(vec![
            ScriptStep::CallTool {
                name: "search".into(),
                input: serde_json::json!({"query": "rust"}),
            },
            ScriptStep::Complete { usage: None },
        ]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        drive(&backend, request(), true, tx, &cancel).await;
        let events = collect(rx).await;
        assert_eq!(events[0], RunEvent::Log("Using tool: search".into()));
        assert!(matches!(
            &events[1],
            RunEvent::Log(line) if line.contains(r#""query":"rust""#)
        ));
    }

    #[tokio::test]
    async fn result_usage_becomes_summary_lines() {
        let backend = ScriptedBackend::new(vec![ScriptStep::Complete {
            usage: Some(RunUsage {
                input_tokens: 100,
                output_tokens: 50,
                num_turns: 3,
                total_cost_usd: Some(0.0125),
            }),
        }]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        drive(&backend, request(), false, tx, &cancel).await;
        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                RunEvent::Log("Run finished: 3 turns, 100 input / 50 output tokens".into()),
                RunEvent::Log("Estimated cost: $0.0125".into()),
            ]
        );
    }

    #[tokio::test]
    async fn failure_is_swallowed_into_one_error_event() {
        let backend = ScriptedBackend::new(vec![
            ScriptStep::AssistantText("working".into()),
            ScriptStep::Fail("connection reset".into()),
        ]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let outcome = drive(&backend, request(), false, tx, &cancel).await;
        // Failure ends the sequence normally; it is not a cancellation.
        assert_eq!(outcome, DriverOutcome::Finished);
        assert_eq!(backend.shutdown_count(), 1);

        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            RunEvent::Error(msg) if msg.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_releases_the_agent_exactly_once() {
        // Five events behind a slow gap; cancel after the second.
        let backend = ScriptedBackend::new(vec![
            ScriptStep::AssistantText("one".into()),
            ScriptStep::AssistantText("two".into()),
            ScriptStep::Delay(Duration::from_secs(5)),
            ScriptStep::AssistantText("three".into()),
            ScriptStep::AssistantText("four".into()),
            ScriptStep::AssistantText("five".into()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let driver_backend = backend.clone();
        let driver_cancel = cancel.clone();
        let driver = tokio::spawn(async move {
            drive(&driver_backend, request(), false, tx, &driver_cancel).await
        });

        assert_eq!(rx.recv().await, Some(RunEvent::Log("Agent: one".into())));
        assert_eq!(rx.recv().await, Some(RunEvent::Log("Agent: two".into())));

        cancel.cancel();
        let outcome = driver.await.unwrap();
        assert_eq!(outcome, DriverOutcome::Cancelled);
        // Teardown ran exactly once, and no further events were forwarded.
        assert_eq!(backend.shutdown_count(), 1);
        assert_eq!(rx.recv().await, None);
    }
}
