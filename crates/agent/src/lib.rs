//! Cardforge agent capability
//!
//! The agent is an opaque external collaborator: it accepts a system prompt,
//! a declared toolset, and a user prompt, and produces a finite sequence of
//! response events. This crate owns that boundary — event and error types,
//! the tool registry handed to a run, and two backends: a `claude` CLI
//! subprocess (production) and a scripted replay (tests and demos).
//!
//! A backend connection is scoped to one run. Callers must call
//! [`AgentStream::shutdown`] on every exit path, including cancellation, so
//! the underlying agent session is never orphaned; `shutdown` is idempotent
//! on the real resource.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use cardforge_protocol::RunUsage;

pub mod cli;
pub mod scripted;

pub use cli::CliBackend;
pub use scripted::{ScriptStep, ScriptedBackend};

/// Errors crossing the agent boundary.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Agent communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent protocol error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent event channel closed")]
    ChannelClosed,

    #[error("Agent error: {0}")]
    Backend(String),
}

/// Events emitted by an agent stream, in generation order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A block of assistant text.
    AssistantText(String),

    /// The agent invoked one of the declared tools.
    ToolUse { name: String, input: Value },

    /// Terminal result event carrying usage metadata when the agent
    /// reports it. The stream ends after this.
    Completed { usage: Option<RunUsage> },
}

/// One request to the agent capability. Consumed by [`AgentBackend::start`].
pub struct AgentRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub tools: ToolRegistry,
}

/// Result of a tool invocation. Failures are reported inline as
/// error-tagged text, never thrown across the tool boundary.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Declaration of one tool: name, description, and JSON input schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Async tool handler. Handlers capture their own context (e.g. the
/// session's output directory) at registration time.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ToolOutput> + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// The toolset declared to the agent for one run.
///
/// Built per run so handlers can own the run's output directory without any
/// shared mutable global; two concurrent sessions never observe each
/// other's registry.
#[derive(Clone)]
pub struct ToolRegistry {
    server_name: String,
    tools: Arc<Vec<RegisteredTool>>,
}

/// Builder side of [`ToolRegistry`].
pub struct ToolRegistryBuilder {
    server_name: String,
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn builder(server_name: impl Into<String>) -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            server_name: server_name.into(),
            tools: Vec::new(),
        }
    }

    /// Name of the in-process tool server as declared to the agent.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Fully-qualified tool identifiers in the agent's
    /// `mcp__{server}__{tool}` naming scheme.
    pub fn qualified_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| format!("mcp__{}__{}", self.server_name, t.spec.name))
            .collect()
    }

    /// Invoke a tool by bare name. Unknown tools yield an error-tagged
    /// result rather than an error.
    pub async fn call(&self, name: &str, input: Value) -> ToolOutput {
        match self.tools.iter().find(|t| t.spec.name == name) {
            Some(tool) => (tool.handler)(input).await,
            None => ToolOutput::error(format!("Unknown tool: {}", name)),
        }
    }
}

impl ToolRegistryBuilder {
    pub fn tool<F>(mut self, spec: ToolSpec, handler: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, ToolOutput> + Send + Sync + 'static,
    {
        self.tools.push(RegisteredTool {
            spec,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            server_name: self.server_name,
            tools: Arc::new(self.tools),
        }
    }
}

/// One agent capability implementation.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Open an agent session and submit the prompt. The returned stream is
    /// finite and not restartable.
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentStream>, AgentError>;
}

/// A live agent session: a finite event sequence plus its teardown.
#[async_trait]
pub trait AgentStream: Send {
    /// Next event, or `None` when the sequence is exhausted.
    async fn next_event(&mut self) -> Option<Result<AgentEvent, AgentError>>;

    /// Release the underlying agent session. Must be called on every exit
    /// path; closing the real resource more than once is a no-op.
    async fn shutdown(&mut self);
}
