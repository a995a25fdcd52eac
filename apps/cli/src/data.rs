//! State kept between runs. Not meant to be edited by hand.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use notesync_core::{Document, MediaState, NoteId, RunContext};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to access data file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize data file: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataFile {
    /// Basenames of media files already stored by the service.
    pub added_media: BTreeSet<String>,
    /// Path → content hash as of the last successful sync of that file.
    pub file_hashes: BTreeMap<String, String>,
    /// Tags each note received from its source at its last sync.
    pub note_tags: BTreeMap<NoteId, Vec<String>>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl DataFile {
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("notesync")
            .join("data.json")
    }

    /// Load the data file. A missing file starts empty; an unreadable one is
    /// reported and replaced by an empty record.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(DataError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        match serde_json::from_str(&content) {
            Ok(data) => Ok(data),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "data file is corrupt, starting fresh");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        let io_err = |source| DataError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_err)
    }

    /// Forget every uploaded media file so the next run sends them again.
    pub fn reset_media(&mut self) {
        self.added_media.clear();
    }

    pub fn media_state(&self) -> MediaState {
        MediaState::new(self.added_media.iter().cloned())
    }

    /// Whether `path` had exactly `content` at its last sync.
    pub fn is_unchanged(&self, path: &Path, content: &str) -> bool {
        self.file_hashes
            .get(&key(path))
            .is_some_and(|hash| *hash == hash_content(content))
    }

    pub fn record_file(&mut self, path: &Path, content: &str) {
        self.file_hashes.insert(key(path), hash_content(content));
    }

    pub fn forget_file(&mut self, path: &Path) {
        self.file_hashes.remove(&key(path));
    }

    /// Hash every synced document as it now reads on disk. Documents that
    /// still disagree with the collection are forgotten so the next run
    /// scans them again.
    pub fn record_documents(&mut self, documents: &[Document]) {
        for doc in documents {
            if doc.needs_resync() {
                self.forget_file(doc.path());
                continue;
            }
            match fs::read_to_string(doc.path()) {
                Ok(text) => self.record_file(doc.path(), &text),
                Err(error) => {
                    tracing::warn!(path = %doc.path().display(), %error, "cannot hash synced file");
                    self.forget_file(doc.path());
                }
            }
        }
    }

    pub fn restore(&self, ctx: &mut RunContext) {
        ctx.note_tags = self.note_tags.clone();
    }

    /// Record the outcome of a finished run.
    pub fn record_sync(&mut self, ctx: &RunContext, at: DateTime<Utc>) {
        self.added_media.extend(ctx.media.uploaded().iter().cloned());
        self.note_tags = ctx.note_tags.clone();
        self.last_sync = Some(at);
    }
}

pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
