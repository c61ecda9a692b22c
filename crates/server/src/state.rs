//! Application state
//!
//! The only cross-session shared mutable state: the output-directory
//! reservation table and the artifact record store. Both are keyed by
//! unguessable session IDs with single-writer-per-key discipline, so plain
//! atomic map insertion/lookup is all the locking needed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use cardforge_agent::AgentBackend;

/// A completed run's downloadable artifact.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub session_id: String,
    pub path: PathBuf,
    pub filename: String,
}

/// Shared application state.
pub struct AppState {
    artifact_root: PathBuf,
    /// Session ID → reserved output directory. Held for the lifetime of the
    /// WebSocket connection; the only legal write target for that session's
    /// runs.
    output_dirs: DashMap<String, PathBuf>,
    /// Session ID → most recent completed artifact. Written only by the
    /// owning session's controller, read by the download gateway.
    artifacts: DashMap<String, ArtifactRecord>,
    backend: Arc<dyn AgentBackend>,
    http: reqwest::Client,
    verbose: bool,
}

impl AppState {
    pub fn new(artifact_root: PathBuf, backend: Arc<dyn AgentBackend>, verbose: bool) -> Self {
        Self {
            artifact_root,
            output_dirs: DashMap::new(),
            artifacts: DashMap::new(),
            backend,
            http: reqwest::Client::new(),
            verbose,
        }
    }

    pub fn backend(&self) -> Arc<dyn AgentBackend> {
        self.backend.clone()
    }

    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Reserve (creating if needed) the session's exclusive output
    /// directory under the artifact root.
    pub fn reserve_output_dir(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.artifact_root.join(session_id);
        std::fs::create_dir_all(&dir)?;
        self.output_dirs.insert(session_id.to_string(), dir.clone());
        info!(
            component = "state",
            event = "output_dir.reserved",
            session_id = %session_id,
            dir = %dir.display(),
            "Reserved session output directory"
        );
        Ok(dir)
    }

    pub fn output_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.output_dirs.get(session_id).map(|e| e.value().clone())
    }

    /// Unbind the session's output directory. The directory itself is
    /// retained on disk so an already-announced artifact stays
    /// downloadable after disconnect.
    pub fn release_output_dir(&self, session_id: &str) {
        if self.output_dirs.remove(session_id).is_some() {
            info!(
                component = "state",
                event = "output_dir.released",
                session_id = %session_id,
                "Released session output directory"
            );
        }
    }

    pub fn record_artifact(&self, record: ArtifactRecord) {
        info!(
            component = "state",
            event = "artifact.recorded",
            session_id = %record.session_id,
            filename = %record.filename,
            "Recorded session artifact"
        );
        self.artifacts.insert(record.session_id.clone(), record);
    }

    pub fn artifact_for(&self, session_id: &str) -> Option<ArtifactRecord> {
        self.artifacts.get(session_id).map(|e| e.value().clone())
    }
}
