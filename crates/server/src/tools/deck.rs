//! Flashcard package serializer
//!
//! Turns a topic plus card records into a single package file inside the
//! run's output directory. Malformed cards are skipped and counted, never
//! fatal to the batch. The on-disk format is a small SQLite database; the
//! filename carries a random nonce so repeated runs on the same topic never
//! collide.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, info};

use cardforge_protocol::{CardKind, CardRecord};

use crate::artifacts::PACKAGE_EXTENSION;

#[derive(Debug, Error)]
pub enum DeckError {
    #[error("Package write failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Package I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one serialization, reported back to the agent as text.
#[derive(Debug)]
pub struct PackageSummary {
    pub path: PathBuf,
    pub filename: String,
    pub accepted: usize,
    pub skipped: usize,
}

impl PackageSummary {
    pub fn message(&self, topic: &str) -> String {
        format!(
            "Created package for '{}' with {} cards ({} skipped). Saved as {}.",
            topic, self.accepted, self.skipped, self.filename
        )
    }
}

#[derive(Debug, PartialEq)]
enum Note {
    Qa {
        front: String,
        back: String,
    },
    Cloze {
        text: String,
    },
    Mcq {
        question: String,
        options: Vec<String>,
        answer: String,
    },
}

/// Parse one card per its declared model. `None` means the card is
/// malformed and gets skipped.
fn parse_note(card: &CardRecord) -> Option<Note> {
    let content = card.content.trim();
    if content.is_empty() {
        return None;
    }
    match card.model_type {
        CardKind::Qa => {
            let (front, back) = content.split_once("||")?;
            let (front, back) = (front.trim(), back.trim());
            if front.is_empty() || back.is_empty() {
                return None;
            }
            Some(Note::Qa {
                front: front.to_string(),
                back: back.to_string(),
            })
        }
        CardKind::Cloze => {
            // A cloze needs a {{c1::...}} marker; wrap the whole content
            // when the agent forgot one.
            let text = if content.contains("{{c") && content.contains("}}") {
                content.to_string()
            } else {
                format!("{{{{c1::{}}}}}", content)
            };
            Some(Note::Cloze { text })
        }
        CardKind::Mcq => {
            let parts: Vec<&str> = content.split("||").map(str::trim).collect();
            if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
                return None;
            }
            Some(Note::Mcq {
                question: parts[0].to_string(),
                options: parts[1..parts.len() - 1]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                answer: parts[parts.len() - 1].to_string(),
            })
        }
    }
}

/// Write one package file for `topic` into `dir`. Blocking; callers on the
/// event loop must go through `spawn_blocking`.
pub fn write_deck_package(
    dir: &Path,
    topic: &str,
    cards: &[CardRecord],
) -> Result<PackageSummary, DeckError> {
    let mut notes = Vec::new();
    let mut skipped = 0usize;
    for card in cards {
        match parse_note(card) {
            Some(note) => notes.push(note),
            None => {
                skipped += 1;
                debug!(
                    component = "deck",
                    event = "deck.card.skipped",
                    model_type = ?card.model_type,
                    content_preview = %card.content.chars().take(80).collect::<String>(),
                    "Skipping malformed card"
                );
            }
        }
    }

    let filename = format!(
        "{}_{}.{}",
        sanitize_topic(topic),
        &uuid::Uuid::new_v4().simple().to_string()[..8],
        PACKAGE_EXTENSION
    );
    let path = dir.join(&filename);

    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let mut conn = Connection::open(&path)?;
    conn.execute_batch(
        "CREATE TABLE deck (topic TEXT NOT NULL, created_at INTEGER NOT NULL);
         CREATE TABLE notes (
             id INTEGER PRIMARY KEY,
             kind TEXT NOT NULL,
             front TEXT NOT NULL,
             back TEXT,
             options TEXT
         );",
    )?;

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO deck (topic, created_at) VALUES (?1, ?2)",
        params![topic, created_at],
    )?;
    for note in &notes {
        match note {
            Note::Qa { front, back } => tx.execute(
                "INSERT INTO notes (kind, front, back) VALUES ('qa', ?1, ?2)",
                params![front, back],
            )?,
            Note::Cloze { text } => tx.execute(
                "INSERT INTO notes (kind, front) VALUES ('cloze', ?1)",
                params![text],
            )?,
            Note::Mcq {
                question,
                options,
                answer,
            } => tx.execute(
                "INSERT INTO notes (kind, front, back, options) VALUES ('mcq', ?1, ?2, ?3)",
                params![question, answer, serde_json::to_string(options).unwrap_or_default()],
            )?,
        };
    }
    tx.commit()?;

    info!(
        component = "deck",
        event = "deck.package.written",
        topic = %topic,
        filename = %filename,
        accepted = notes.len(),
        skipped = skipped,
        "Wrote flashcard package"
    );

    Ok(PackageSummary {
        path,
        filename,
        accepted: notes.len(),
        skipped,
    })
}

/// Keep filenames filesystem-safe without losing the topic entirely.
fn sanitize_topic(topic: &str) -> String {
    let cleaned: String = topic
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "deck".to_string()
    } else {
        cleaned.to_string()
    }
}
