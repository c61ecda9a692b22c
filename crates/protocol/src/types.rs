//! Card records and run metadata shared between the agent toolset and the
//! package serializer.

use serde::{Deserialize, Serialize};

/// The three card templates the serializer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    /// Front/back card; content is `question||answer`.
    Qa,
    /// Cloze-deletion card; content carries a `{{c1::...}}` marker.
    Cloze,
    /// Multiple-choice card; content is `question||option||...||answer`.
    Mcq,
}

/// One flashcard as emitted by the agent's packaging tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRecord {
    pub model_type: CardKind,
    pub content: String,
}

/// Usage metadata reported by the agent's terminal result event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}
