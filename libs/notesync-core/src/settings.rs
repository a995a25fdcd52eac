//! Engine settings.
//!
//! These are plain data: the CLI deserializes them from its config file and
//! [`Grammar::compile`](crate::grammar::Grammar::compile) turns them into
//! regular expressions once per run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Marker strings recognized in source documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Syntax {
    pub begin_note: String,
    pub end_note: String,
    pub begin_inline_note: String,
    pub end_inline_note: String,
    pub target_deck_line: String,
    pub file_tags_line: String,
    pub delete_note_line: String,
    pub frozen_fields_line: String,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            begin_note: "START".to_string(),
            end_note: "END".to_string(),
            begin_inline_note: "STARTI".to_string(),
            end_inline_note: "ENDI".to_string(),
            target_deck_line: "TARGET DECK".to_string(),
            file_tags_line: "FILE TAGS".to_string(),
            delete_note_line: "DELETE".to_string(),
            frozen_fields_line: "FROZEN".to_string(),
        }
    }
}

/// What to do when a note in a document fails to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorPolicy {
    /// Stop the whole run on the first parse error.
    Abort,
    /// Leave the offending document out of the run and keep going.
    #[default]
    SkipDocument,
}

/// Engine-wide behavior switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub syntax: Syntax,
    /// Deck used when a document names none.
    pub default_deck: String,
    /// Tags added to every note.
    pub default_tags: Vec<String>,
    /// Translate `{...}` spans into cloze markers for cloze note types.
    pub curly_cloze: bool,
    /// Treat `==highlight==` as a cloze span too.
    pub highlights_to_cloze: bool,
    pub cloze_note_types: BTreeSet<String>,
    /// Write identifiers as `<!--ID: n-->`.
    pub id_comments: bool,
    /// Also search documents with the custom note patterns.
    pub regex_mode: bool,
    /// Note type → regular expression whose capture groups are the fields.
    pub custom_patterns: BTreeMap<String, String>,
    pub vault_name: Option<String>,
    pub add_file_link: bool,
    /// Keep tags added to a note outside of the source text.
    pub preserve_external_tags: bool,
    pub on_parse_error: ParseErrorPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            syntax: Syntax::default(),
            default_deck: "Default".to_string(),
            default_tags: vec!["Obsidian_to_Anki".to_string()],
            curly_cloze: false,
            highlights_to_cloze: false,
            cloze_note_types: BTreeSet::from(["Cloze".to_string()]),
            id_comments: false,
            regex_mode: false,
            custom_patterns: BTreeMap::new(),
            vault_name: None,
            add_file_link: false,
            preserve_external_tags: true,
            on_parse_error: ParseErrorPolicy::default(),
        }
    }
}

impl Settings {
    /// Whether curly-brace clozes are converted for this note type.
    pub fn cloze_enabled(&self, note_type: &str) -> bool {
        self.curly_cloze && self.cloze_note_types.contains(note_type)
    }
}
