//! Error types for notesync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Span;

/// Result type alias using ParseError.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors that can occur while parsing a single note.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown note type {name:?}")]
    UnknownNoteType { name: String },

    #[error("inline note has no [note type] tag")]
    MissingNoteType,

    #[error("invalid ID: {value}")]
    InvalidId { value: String },

    #[error("note has neither content nor ID")]
    EmptyNote,
}

/// A parse error located in a document.
#[derive(Debug, Error)]
#[error("{}: note at {}..{}: {source}", path.display(), span.start, span.end)]
pub struct ScanError {
    pub path: PathBuf,
    pub span: Span,
    #[source]
    pub source: ParseError,
}

/// Errors raised while talking to the flashcard service or persisting results.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("malformed response: {0}")]
    Envelope(String),

    #[error("failed to decode {action} result: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("invalid pattern for note type {note_type:?}: {source}")]
    Pattern {
        note_type: String,
        #[source]
        source: regex::Error,
    },
}
