//! Scripted backend
//!
//! Replays a fixed sequence of steps instead of talking to a real agent.
//! Tool-invocation steps go through the run's real [`ToolRegistry`], so a
//! script can exercise the packaging tool against a real directory. The
//! shutdown counter and configurable teardown delay exist so tests can
//! assert exactly-once connection release and awaited preemption.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use cardforge_protocol::RunUsage;

use crate::{AgentBackend, AgentError, AgentEvent, AgentRequest, AgentStream, ToolRegistry};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit an assistant text event.
    AssistantText(String),
    /// Invoke a registered tool (handler runs for real), then emit the
    /// corresponding tool-use event.
    CallTool { name: String, input: Value },
    /// Suspend between events for the given duration.
    Delay(Duration),
    /// Emit a backend error, ending the sequence.
    Fail(String),
    /// Emit the terminal result event.
    Complete { usage: Option<RunUsage> },
}

/// Backend replaying the same script for every run.
#[derive(Clone)]
pub struct ScriptedBackend {
    steps: Vec<ScriptStep>,
    shutdown_delay: Duration,
    shutdowns: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            shutdown_delay: Duration::ZERO,
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every stream's teardown take this long. Lets tests observe the
    /// await-teardown-before-restart rule.
    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Total `shutdown` calls across all streams started by this backend.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Shared counter handle, for assertions after the backend was moved.
    pub fn shutdown_counter(&self) -> Arc<AtomicUsize> {
        self.shutdowns.clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentStream>, AgentError> {
        Ok(Box::new(ScriptedStream {
            steps: self.steps.clone().into(),
            tools: request.tools,
            finished: false,
            shutdown_delay: self.shutdown_delay,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
    tools: ToolRegistry,
    finished: bool,
    shutdown_delay: Duration,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentStream for ScriptedStream {
    async fn next_event(&mut self) -> Option<Result<AgentEvent, AgentError>> {
        if self.finished {
            return None;
        }
        loop {
            match self.steps.pop_front()? {
                ScriptStep::AssistantText(text) => {
                    return Some(Ok(AgentEvent::AssistantText(text)));
                }
                ScriptStep::CallTool { name, input } => {
                    let _ = self.tools.call(&name, input.clone()).await;
                    return Some(Ok(AgentEvent::ToolUse { name, input }));
                }
                ScriptStep::Delay(duration) => {
                    tokio::time::sleep(duration).await;
                }
                ScriptStep::Fail(message) => {
                    self.finished = true;
                    return Some(Err(AgentError::Backend(message)));
                }
                ScriptStep::Complete { usage } => {
                    self.finished = true;
                    return Some(Ok(AgentEvent::Completed { usage }));
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn request_with_counter() -> (AgentRequest, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        let tools = ToolRegistry::builder("deck-tools")
            .tool(
                crate::ToolSpec {
                    name: "noop".into(),
                    description: "Counts invocations".into(),
                    input_schema: json!({"type": "object"}),
                },
                move |_input| {
                    let calls = calls_in_handler.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        crate::ToolOutput::text("ok")
                    }
                    .boxed()
                },
            )
            .build();
        (
            AgentRequest {
                system_prompt: String::new(),
                prompt: "topic".into(),
                tools,
            },
            calls,
        )
    }

    #[tokio::test]
    async fn replays_steps_in_order_and_ends() {
        let backend = ScriptedBackend::new(vec![
            ScriptStep::AssistantText("thinking".into()),
            ScriptStep::Complete { usage: None },
        ]);
        let (request, _) = request_with_counter();
        let mut stream = backend.start(request).await.unwrap();

        assert!(matches!(
            stream.next_event().await,
            Some(Ok(AgentEvent::AssistantText(_)))
        ));
        assert!(matches!(
            stream.next_event().await,
            Some(Ok(AgentEvent::Completed { .. }))
        ));
        assert!(stream.next_event().await.is_none());
        stream.shutdown().await;
        assert_eq!(backend.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn call_tool_steps_run_the_real_handler() {
        let backend = ScriptedBackend::new(vec![
            ScriptStep::CallTool {
                name: "noop".into(),
                input: json!({}),
            },
            ScriptStep::Complete { usage: None },
        ]);
        let (request, calls) = request_with_counter();
        let mut stream = backend.start(request).await.unwrap();

        assert!(matches!(
            stream.next_event().await,
            Some(Ok(AgentEvent::ToolUse { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn failure_ends_the_sequence() {
        let backend = ScriptedBackend::new(vec![ScriptStep::Fail("boom".into())]);
        let (request, _) = request_with_counter();
        let mut stream = backend.start(request).await.unwrap();

        assert!(matches!(
            stream.next_event().await,
            Some(Err(AgentError::Backend(_)))
        ));
        assert!(stream.next_event().await.is_none());
        stream.shutdown().await;
    }
}
