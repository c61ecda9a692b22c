//! Per-run toolset
//!
//! Builds the three tools declared to the agent for one run. The session's
//! output directory is captured by the package tool's handler at build
//! time, so concurrent sessions write to their own directories without any
//! ambient state.

pub mod deck;
pub mod web;

use std::path::PathBuf;

use futures::FutureExt;
use serde_json::{json, Value};

use cardforge_agent::{ToolOutput, ToolRegistry, ToolSpec};
use cardforge_protocol::CardRecord;

/// Tool server name as the agent sees it.
pub const TOOL_SERVER_NAME: &str = "deck-tools";

/// Build the toolset for one run, bound to that run's output directory.
pub fn build_toolset(http: reqwest::Client, session_dir: PathBuf) -> ToolRegistry {
    let search_client = http.clone();
    let read_client = http;

    ToolRegistry::builder(TOOL_SERVER_NAME)
        .tool(
            ToolSpec {
                name: "search_web_for_topic".into(),
                description: "Search the web for pages about a topic. Returns titles, links, and snippets.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" }
                    },
                    "required": ["query"]
                }),
            },
            move |input: Value| {
                let client = search_client.clone();
                async move {
                    match input["query"].as_str() {
                        Some(query) => web::search_web(&client, query).await,
                        None => ToolOutput::error("Missing required parameter: query"),
                    }
                }
                .boxed()
            },
        )
        .tool(
            ToolSpec {
                name: "read_web_page_content".into(),
                description: "Fetch a web page and return its readable text content.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "URL of the page to read" }
                    },
                    "required": ["url"]
                }),
            },
            move |input: Value| {
                let client = read_client.clone();
                async move {
                    match input["url"].as_str() {
                        Some(url) => web::read_page(&client, url).await,
                        None => ToolOutput::error("Missing required parameter: url"),
                    }
                }
                .boxed()
            },
        )
        .tool(
            ToolSpec {
                name: "create_flashcard_package".into(),
                description: "Write the finished flashcards to a downloadable package file. \
                              Each card has a model_type (qa, cloze, or mcq) and content. \
                              qa: 'front||back'. cloze: text with {{c1::...}} markers. \
                              mcq: 'question||option||option||answer'.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "topic": { "type": "string", "description": "Deck topic, used for the filename" },
                        "cards": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "model_type": { "type": "string", "enum": ["qa", "cloze", "mcq"] },
                                    "content": { "type": "string" }
                                },
                                "required": ["model_type", "content"]
                            }
                        }
                    },
                    "required": ["topic", "cards"]
                }),
            },
            move |input: Value| {
                let dir = session_dir.clone();
                async move {
                    let topic = match input["topic"].as_str() {
                        Some(topic) => topic.to_string(),
                        None => return ToolOutput::error("Missing required parameter: topic"),
                    };
                    let cards: Vec<CardRecord> =
                        match serde_json::from_value(input["cards"].clone()) {
                            Ok(cards) => cards,
                            Err(e) => {
                                return ToolOutput::error(format!(
                                    "Could not parse card data: {}",
                                    e
                                ))
                            }
                        };

                    let write_topic = topic.clone();
                    match tokio::task::spawn_blocking(move || {
                        deck::write_deck_package(&dir, &write_topic, &cards)
                    })
                    .await
                    {
                        Ok(Ok(summary)) => ToolOutput::text(summary.message(&topic)),
                        Ok(Err(e)) => {
                            ToolOutput::error(format!("Failed to create package: {}", e))
                        }
                        Err(e) => ToolOutput::error(format!("Package task failed: {}", e)),
                    }
                }
                .boxed()
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolset(dir: &std::path::Path) -> ToolRegistry {
        build_toolset(reqwest::Client::new(), dir.to_path_buf())
    }

    #[test]
    fn toolset_declares_the_three_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toolset(dir.path());
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "search_web_for_topic",
                "read_web_page_content",
                "create_flashcard_package"
            ]
        );
        assert!(registry
            .qualified_names()
            .contains(&"mcp__deck-tools__create_flashcard_package".to_string()));
    }

    #[tokio::test]
    async fn package_tool_writes_into_the_bound_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toolset(dir.path());

        let out = registry
            .call(
                "create_flashcard_package",
                json!({
                    "topic": "Rust",
                    "cards": [
                        {"model_type": "qa", "content": "What?||That."},
                        {"model_type": "qa", "content": "broken"}
                    ]
                }),
            )
            .await;
        assert!(!out.is_error, "{}", out.text);
        assert!(out.text.contains("1 cards (1 skipped)"));

        let written: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(written.len(), 1);
        assert!(crate::artifacts::has_package_extension(&written[0]));
    }

    #[tokio::test]
    async fn missing_parameters_are_inline_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toolset(dir.path());

        let out = registry.call("search_web_for_topic", json!({})).await;
        assert!(out.is_error);
        assert!(out.text.contains("query"));

        let out = registry
            .call("create_flashcard_package", json!({"cards": []}))
            .await;
        assert!(out.is_error);
        assert!(out.text.contains("topic"));
    }

    #[tokio::test]
    async fn unparseable_cards_are_inline_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toolset(dir.path());

        let out = registry
            .call(
                "create_flashcard_package",
                json!({"topic": "T", "cards": [{"model_type": "haiku", "content": "x"}]}),
            )
            .await;
        assert!(out.is_error);
        assert!(out.text.contains("Could not parse card data"));
    }
}
