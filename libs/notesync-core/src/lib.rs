//! Engine that turns marked-up note files into flashcards and keeps both
//! sides in step through the AnkiConnect API.
//!
//! Provides:
//! - Markup conversion (math, cloze, code, media) for field text
//! - Block, inline, and custom-pattern note parsing
//! - Per-file scanning with identifier write-back and crash-safe saves
//! - The two-batch sync against any [`AnkiService`]

pub mod anki;
pub mod edit;
pub mod error;
pub mod format;
pub mod grammar;
pub mod note;
pub mod persist;
pub mod scanner;
pub mod settings;
pub mod sync;
pub mod types;

pub use anki::{AnkiService, NoteInfo, Request, API_VERSION};
pub use error::{ParseError, Result, ScanError, SyncError};
pub use format::{MarkupConverter, MediaState};
pub use grammar::Grammar;
pub use note::{NoteKind, NoteParser, ParseContext};
pub use scanner::{Document, DocumentOptions, ScanWarning};
pub use settings::{ParseErrorPolicy, Settings, Syntax};
pub use sync::{
    fetch_existing_ids, fetch_schema, scan_documents, RunContext, ScanReport, SyncCoordinator,
    SyncStats,
};
pub use types::{Fields, Note, NoteId, NoteSchema, ParsedNote, Span};
