//! Regular expressions built from [`Settings`], compiled once per run.

use regex::Regex;

use crate::error::SyncError;
use crate::note::{ID_SUFFIX_PATTERN, TAG_SUFFIX_PATTERN};
use crate::settings::{Settings, Syntax};

/// One custom note pattern, expanded into its four search tiers.
#[derive(Debug, Clone)]
pub struct CustomPattern {
    pub note_type: String,
    tiers: Vec<PatternTier>,
}

/// A pattern variant and which optional suffixes it carries.
#[derive(Debug, Clone)]
pub struct PatternTier {
    pub regex: Regex,
    pub tags: bool,
    pub id: bool,
}

impl CustomPattern {
    pub fn compile(note_type: &str, pattern: &str) -> Result<Self, SyncError> {
        let build = |tags: bool, id: bool| {
            let mut source = format!("(?m){pattern}");
            if tags {
                source.push_str(TAG_SUFFIX_PATTERN);
            }
            if id {
                source.push_str(ID_SUFFIX_PATTERN);
            }
            Regex::new(&source)
                .map(|regex| PatternTier { regex, tags, id })
                .map_err(|source| SyncError::Pattern {
                    note_type: note_type.to_string(),
                    source,
                })
        };

        // Most specific first: a looser tier must never claim text a stricter one matched.
        let tiers = vec![
            build(true, true)?,
            build(false, true)?,
            build(true, false)?,
            build(false, false)?,
        ];

        Ok(Self {
            note_type: note_type.to_string(),
            tiers,
        })
    }

    pub fn tiers(&self) -> &[PatternTier] {
        &self.tiers
    }
}

/// Compiled document-level patterns.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub block_note: Regex,
    pub inline_note: Regex,
    pub target_deck: Regex,
    pub file_tags: Regex,
    pub delete_marker: Regex,
    pub frozen_fields: Regex,
    pub custom: Vec<CustomPattern>,
}

impl Grammar {
    pub fn compile(settings: &Settings) -> Result<Self, SyncError> {
        let Syntax {
            begin_note,
            end_note,
            begin_inline_note,
            end_inline_note,
            target_deck_line,
            file_tags_line,
            delete_note_line,
            frozen_fields_line,
        } = &settings.syntax;

        let begin = regex::escape(begin_note);
        let end = regex::escape(end_note);

        let custom = if settings.regex_mode {
            settings
                .custom_patterns
                .iter()
                .filter(|(_, pattern)| !pattern.trim().is_empty())
                .map(|(note_type, pattern)| CustomPattern::compile(note_type, pattern))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            block_note: fixed(&format!(
                r"(?m)^{begin}\n((?:[\s\S]*?\n)?){end}$(?:\n((?:<!--)?ID: \d+.*))?\n?"
            )),
            inline_note: fixed(&format!(
                r"{}(.*?){}",
                regex::escape(begin_inline_note),
                regex::escape(end_inline_note)
            )),
            target_deck: fixed(&format!(
                r"(?m)^{}(?:\n|: )(.*)",
                regex::escape(target_deck_line)
            )),
            file_tags: fixed(&format!(
                r"(?m)^{}(?:\n|: )(.*)",
                regex::escape(file_tags_line)
            )),
            delete_marker: fixed(&format!(
                r"(?m)^{}{}\n?",
                regex::escape(delete_note_line),
                ID_SUFFIX_PATTERN
            )),
            frozen_fields: fixed(&format!(
                r"{} - (.*?):\n((?:[^\n][\n]?)+)",
                regex::escape(frozen_fields_line)
            )),
            custom,
        })
    }
}

/// Compile a pattern whose only variable parts went through `regex::escape`.
fn fixed(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|e| panic!("escaped marker pattern {source:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> Grammar {
        Grammar::compile(&Settings::default()).unwrap()
    }

    #[test]
    fn block_note_captures_body_and_trailing_id() {
        let g = grammar();
        let caps = g
            .block_note
            .captures("START\nBasic\nFront: Q\nEND\nID: 42\nrest")
            .unwrap();
        assert_eq!(&caps[1], "Basic\nFront: Q\n");
        assert_eq!(&caps[2], "ID: 42");
    }

    #[test]
    fn block_note_allows_empty_body() {
        let g = grammar();
        let caps = g.block_note.captures("START\nEND\nID: 9\n").unwrap();
        assert_eq!(&caps[1], "");
        assert_eq!(&caps[2], "ID: 9");
    }

    #[test]
    fn markers_are_escaped() {
        let mut settings = Settings::default();
        settings.syntax.begin_note = "+++".to_string();
        settings.syntax.end_note = "---".to_string();
        let g = Grammar::compile(&settings).unwrap();
        assert!(g.block_note.is_match("+++\nBasic\nx\n---\n"));
    }

    #[test]
    fn deck_line_accepts_both_forms() {
        let g = grammar();
        let same_line = g.target_deck.captures("TARGET DECK: Maths").unwrap();
        assert_eq!(&same_line[1], "Maths");
        let next_line = g.target_deck.captures("TARGET DECK\nScience").unwrap();
        assert_eq!(&next_line[1], "Science");
    }

    #[test]
    fn delete_marker_captures_id() {
        let g = grammar();
        let caps = g.delete_marker.captures("text\nDELETE\n<!--ID: 77-->\n").unwrap();
        assert_eq!(&caps[1], "77");
    }

    #[test]
    fn custom_patterns_only_in_regex_mode() {
        let mut settings = Settings::default();
        settings
            .custom_patterns
            .insert("Basic".to_string(), r"^Q: (.*)\nA: (.*)".to_string());
        assert!(Grammar::compile(&settings).unwrap().custom.is_empty());

        settings.regex_mode = true;
        let g = Grammar::compile(&settings).unwrap();
        assert_eq!(g.custom.len(), 1);
        assert_eq!(g.custom[0].tiers().len(), 4);
        assert!(g.custom[0].tiers()[0].tags && g.custom[0].tiers()[0].id);
    }

    #[test]
    fn invalid_custom_pattern_is_reported() {
        let mut settings = Settings::default();
        settings.regex_mode = true;
        settings
            .custom_patterns
            .insert("Basic".to_string(), "(unclosed".to_string());
        let err = Grammar::compile(&settings).unwrap_err();
        assert!(matches!(err, SyncError::Pattern { ref note_type, .. } if note_type == "Basic"));
    }
}
