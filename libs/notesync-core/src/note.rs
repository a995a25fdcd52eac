//! Note parsing for block, inline and pattern syntaxes.
//!
//! # Block
//! ```text
//! START
//! Basic
//! Front: What is Rust?
//! Back: A systems programming language.
//! Tags: lang rust
//! END
//! ID: 1566052191670
//! ```
//!
//! # Inline
//! ```text
//! STARTI [Basic] What is Rust? Back: A language. ID: 1566052191670 ENDI
//! ```
//!
//! # Pattern
//! Capture groups of a user regex map onto the note type's fields in order,
//! optionally followed by a `Tags: ` group and an `ID: ` line.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::{ParseError, Result};
use crate::format::{MarkupConverter, MediaState};
use crate::settings::Settings;
use crate::types::{Fields, FrozenFields, Note, NoteId, NoteSchema, ParsedNote};

pub const ID_PREFIX: &str = "ID: ";
pub const TAG_PREFIX: &str = "Tags: ";

/// Appended to a custom pattern to capture a trailing identifier line.
pub const ID_SUFFIX_PATTERN: &str = r"\n(?:<!--)?(?:ID: (\d+).*)";
/// Appended to a custom pattern to capture a tag line.
pub const TAG_SUFFIX_PATTERN: &str = r"(Tags: .*)";

static LINE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:<!--)?ID: (\d+)").expect("valid regex"));
static ANY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:<!--)?ID: (\d+)").expect("valid regex"));
static INLINE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tags: (.*)").expect("valid regex"));
static INLINE_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]").expect("valid regex"));
static CLOZE_MARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{c\d+::[\s\S]+?\}\}").expect("valid regex"));

/// Which source syntax a note came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    Block,
    Inline,
    Pattern,
}

#[derive(Debug, Clone)]
enum Body {
    Lines(Vec<String>),
    Words(String),
    Groups(Vec<Option<String>>),
}

/// Everything field conversion needs from the surrounding run.
pub struct ParseContext<'a> {
    pub settings: &'a Settings,
    pub schema: &'a NoteSchema,
    pub media: &'a mut MediaState,
    /// Directory that relative media paths resolve against.
    pub base_dir: &'a Path,
}

/// Raw note text split into identifier, tags, note type and field source.
#[derive(Debug, Clone)]
pub struct NoteParser {
    kind: NoteKind,
    identifier: Option<NoteId>,
    tags: Vec<String>,
    /// `None` when only an identifier was left.
    note_type: Option<String>,
    body: Body,
}

impl NoteParser {
    /// Parse the text between the begin and end markers, plus any identifier
    /// line that followed the end marker.
    pub fn block(text: &str) -> Result<Self> {
        let mut lines: Vec<&str> = text.lines().collect();

        let identifier = lines
            .last()
            .copied()
            .and_then(|line| LINE_ID.captures(line))
            .map(|caps| parse_id(&caps[1]))
            .transpose()?;
        if identifier.is_some() {
            lines.pop();
        }

        if lines.iter().all(|line| line.trim().is_empty()) {
            return Self::only_identifier(NoteKind::Block, identifier);
        }

        let tags = match lines
            .last()
            .copied()
            .and_then(|line| line.strip_prefix(TAG_PREFIX))
        {
            Some(rest) => {
                let tags = split_tags(rest);
                lines.pop();
                tags
            }
            None => Vec::new(),
        };

        let note_type = lines.first().map(|line| line.trim().to_string());
        let body = lines.iter().skip(1).map(|line| line.to_string()).collect();

        Ok(Self {
            kind: NoteKind::Block,
            identifier,
            tags,
            note_type,
            body: Body::Lines(body),
        })
    }

    /// Parse the text between the inline markers.
    pub fn inline(text: &str) -> Result<Self> {
        let mut text = text.trim();

        let mut identifier = None;
        if let Some(caps) = ANY_ID.captures(text) {
            identifier = Some(parse_id(&caps[1])?);
            text = text[..caps.get(0).map_or(0, |m| m.start())].trim_end();
        }

        if text.is_empty() {
            return Self::only_identifier(NoteKind::Inline, identifier);
        }

        let mut tags = Vec::new();
        if let Some(caps) = INLINE_TAGS.captures(text) {
            tags = split_tags(&caps[1]);
            text = &text[..caps.get(0).map_or(0, |m| m.start())];
        }

        let caps = INLINE_TYPE
            .captures(text)
            .ok_or(ParseError::MissingNoteType)?;
        let note_type = caps[1].trim().to_string();
        let rest = &text[caps.get(0).map_or(0, |m| m.end())..];

        Ok(Self {
            kind: NoteKind::Inline,
            identifier,
            tags,
            note_type: Some(note_type),
            body: Body::Words(rest.to_string()),
        })
    }

    /// Build from a custom pattern match. With `id`, the last group is the
    /// identifier; with `tags`, the last remaining group is the tag line.
    pub fn pattern(note_type: &str, captures: &Captures<'_>, tags: bool, id: bool) -> Result<Self> {
        let mut groups: Vec<Option<String>> = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|m| m.as_str().to_string()))
            .collect();

        let identifier = if id {
            groups.pop().flatten().map(|value| parse_id(&value)).transpose()?
        } else {
            None
        };

        let tags = if tags {
            groups
                .pop()
                .flatten()
                .map(|line| split_tags(line.strip_prefix(TAG_PREFIX).unwrap_or(&line)))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Self {
            kind: NoteKind::Pattern,
            identifier,
            tags,
            note_type: Some(note_type.to_string()),
            body: Body::Groups(groups),
        })
    }

    fn only_identifier(kind: NoteKind, identifier: Option<NoteId>) -> Result<Self> {
        match identifier {
            Some(_) => Ok(Self {
                kind,
                identifier,
                tags: Vec::new(),
                note_type: None,
                body: Body::Lines(Vec::new()),
            }),
            None => Err(ParseError::EmptyNote),
        }
    }

    pub fn kind(&self) -> NoteKind {
        self.kind
    }

    pub fn identifier(&self) -> Option<NoteId> {
        self.identifier
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn note_type(&self) -> Option<&str> {
        self.note_type.as_deref()
    }

    /// Only an identifier remained: the note should be deleted.
    pub fn is_delete(&self) -> bool {
        self.note_type.is_none()
    }

    /// Segment the body into fields and convert each one.
    pub fn fields(&self, ctx: &mut ParseContext<'_>) -> Result<Fields> {
        let note_type = self.note_type.as_deref().ok_or(ParseError::EmptyNote)?;
        let names = ctx
            .schema
            .fields(note_type)
            .ok_or_else(|| ParseError::UnknownNoteType {
                name: note_type.to_string(),
            })?;

        let mut acc = FieldAccumulator::new(names);
        match &self.body {
            Body::Lines(lines) => {
                for line in lines {
                    let rest = acc.switch_on_prefix(line);
                    acc.push(rest);
                    acc.push("\n");
                }
            }
            Body::Words(text) => {
                for word in text.split_whitespace() {
                    if !acc.switch_on_token(word) {
                        acc.push(word);
                    }
                    acc.push(" ");
                }
            }
            Body::Groups(groups) => {
                for (index, group) in groups.iter().enumerate() {
                    if let Some(text) = group {
                        acc.set(index, text);
                    }
                }
            }
        }

        let cloze = ctx.settings.cloze_enabled(note_type);
        let mut converter = MarkupConverter::new(&mut *ctx.media, ctx.base_dir)
            .with_highlights_to_cloze(ctx.settings.highlights_to_cloze);
        Ok(acc.finish(|raw| converter.convert(raw.trim(), cloze).trim().to_string()))
    }

    /// Assemble the final note for `deck`.
    pub fn parse(
        &self,
        deck: &str,
        url: Option<&str>,
        frozen: &FrozenFields,
        ctx: &mut ParseContext<'_>,
    ) -> Result<ParsedNote> {
        let Some(note_type) = self.note_type.as_deref() else {
            return self
                .identifier
                .map(ParsedNote::Delete)
                .ok_or(ParseError::EmptyNote);
        };

        let mut fields = self.fields(ctx)?;
        let settings = ctx.settings;

        if settings.add_file_link && settings.vault_name.is_some() {
            if let (Some(url), Some(first)) = (url, fields.first_mut()) {
                first.push_str(&format!(
                    r#"<br><a href="{url}" class="obsidian-link">Obsidian</a>"#
                ));
            }
        }

        if let Some(defaults) = frozen.get(note_type) {
            for (name, value) in fields.iter_mut() {
                if let Some(extra) = defaults.get(name) {
                    value.push_str(extra);
                }
            }
        }

        let mut note = Note {
            model_name: note_type.to_string(),
            deck_name: deck.to_string(),
            fields,
            tags: Vec::new(),
        };
        note.extend_tags(settings.default_tags.iter().map(String::as_str));
        note.extend_tags(self.tags.iter().map(String::as_str));

        if self.kind == NoteKind::Pattern
            && settings.cloze_enabled(note_type)
            && !note.fields.iter().any(|(_, value)| CLOZE_MARK.is_match(value))
        {
            tracing::debug!(note_type, "pattern note has no cloze markers, rejecting");
            return Ok(ParsedNote::Rejected);
        }

        Ok(ParsedNote::Note {
            note,
            id: self.identifier,
        })
    }
}

/// Collects raw field text while the current field switches.
struct FieldAccumulator<'n> {
    names: &'n [String],
    values: Vec<String>,
    current: usize,
}

impl<'n> FieldAccumulator<'n> {
    fn new(names: &'n [String]) -> Self {
        Self {
            names,
            values: vec![String::new(); names.len()],
            current: 0,
        }
    }

    /// Switch on a leading `Field:` prefix, returning the rest of the line.
    fn switch_on_prefix<'l>(&mut self, line: &'l str) -> &'l str {
        for (index, name) in self.names.iter().enumerate() {
            if let Some(rest) = line
                .strip_prefix(name.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
            {
                self.current = index;
                return rest;
            }
        }
        line
    }

    /// Switch when the whole token is `Field:`.
    fn switch_on_token(&mut self, token: &str) -> bool {
        let Some(name) = token.strip_suffix(':') else {
            return false;
        };
        match self.names.iter().position(|n| n == name) {
            Some(index) => {
                self.current = index;
                true
            }
            None => false,
        }
    }

    fn push(&mut self, text: &str) {
        if let Some(value) = self.values.get_mut(self.current) {
            value.push_str(text);
        }
    }

    fn set(&mut self, index: usize, text: &str) {
        if let Some(value) = self.values.get_mut(index) {
            *value = text.to_string();
        }
    }

    fn finish(self, mut convert: impl FnMut(&str) -> String) -> Fields {
        self.names
            .iter()
            .zip(self.values)
            .map(|(name, raw)| (name.clone(), convert(&raw)))
            .collect()
    }
}

fn parse_id(digits: &str) -> Result<NoteId> {
    digits.parse().map_err(|_| ParseError::InvalidId {
        value: digits.to_string(),
    })
}

fn split_tags(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn schema() -> NoteSchema {
        [
            ("Basic", vec!["Front", "Back"]),
            ("Cloze", vec!["Text", "Back Extra"]),
        ]
        .into_iter()
        .map(|(name, fields)| {
            (
                name.to_string(),
                fields.into_iter().map(str::to_string).collect(),
            )
        })
        .collect()
    }

    fn parse_with(
        parser: &NoteParser,
        settings: &Settings,
        frozen: &FrozenFields,
        url: Option<&str>,
    ) -> Result<ParsedNote> {
        let schema = schema();
        let mut media = MediaState::default();
        let mut ctx = ParseContext {
            settings,
            schema: &schema,
            media: &mut media,
            base_dir: Path::new("."),
        };
        parser.parse("Default", url, frozen, &mut ctx)
    }

    fn parse(parser: &NoteParser) -> ParsedNote {
        parse_with(parser, &Settings::default(), &FrozenFields::new(), None).unwrap()
    }

    fn fields_of(parsed: &ParsedNote) -> Vec<(String, String)> {
        match parsed {
            ParsedNote::Note { note, .. } => note
                .fields
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            other => panic!("expected a note, got {other:?}"),
        }
    }

    fn pair(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn block_fields_follow_prefixes() {
        let parser = NoteParser::block("Basic\nFront: Q\nBack: A\n").unwrap();
        assert_eq!(parser.identifier(), None);
        let parsed = parse(&parser);
        assert_eq!(fields_of(&parsed), vec![pair("Front", "Q"), pair("Back", "A")]);
    }

    #[test]
    fn block_text_before_prefix_goes_to_first_field() {
        let parser = NoteParser::block("Basic\nThis is the question\nBack: answer\n").unwrap();
        let parsed = parse(&parser);
        assert_eq!(
            fields_of(&parsed),
            vec![pair("Front", "This is the question"), pair("Back", "answer")]
        );
    }

    #[test]
    fn block_multiline_field() {
        let parser = NoteParser::block("Basic\nFront: Q\nBack: line one\nline two\n").unwrap();
        let parsed = parse(&parser);
        assert_eq!(fields_of(&parsed)[1], pair("Back", "line one<br />\nline two"));
    }

    #[test]
    fn block_id_and_tags_are_popped() {
        let parser =
            NoteParser::block("Basic\nFront: Q\nBack: A\nTags: one two\nID: 1234").unwrap();
        assert_eq!(parser.identifier(), Some(1234));
        assert_eq!(parser.tags(), ["one", "two"]);
        match parse(&parser) {
            ParsedNote::Note { note, id } => {
                assert_eq!(id, Some(1234));
                assert_eq!(note.tags, vec!["Obsidian_to_Anki", "one", "two"]);
                assert_eq!(note.fields.get("Back"), Some("A"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commented_id_is_recognized() {
        let parser = NoteParser::block("Basic\nFront: Q\n<!--ID: 77-->").unwrap();
        assert_eq!(parser.identifier(), Some(77));
    }

    #[test]
    fn block_with_only_id_is_delete() {
        let parser = NoteParser::block("ID: 99").unwrap();
        assert!(parser.is_delete());
        assert_eq!(parse(&parser), ParsedNote::Delete(99));
    }

    #[test]
    fn empty_block_is_an_error() {
        assert_eq!(NoteParser::block("\n").unwrap_err(), ParseError::EmptyNote);
    }

    #[test]
    fn oversized_id_is_an_error() {
        let err = NoteParser::block("Basic\nQ\nID: 99999999999999999999").unwrap_err();
        assert!(matches!(err, ParseError::InvalidId { .. }));
    }

    #[test]
    fn unknown_note_type_is_an_error() {
        let parser = NoteParser::block("Basci\nFront: Q\n").unwrap();
        let err = parse_with(&parser, &Settings::default(), &FrozenFields::new(), None)
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownNoteType {
                name: "Basci".to_string()
            }
        );
    }

    #[test]
    fn inline_note_fields_id_and_tags() {
        let parser =
            NoteParser::inline(" [Basic] What is it? Back: **this** Tags: t1 ID: 42 ").unwrap();
        assert_eq!(parser.kind(), NoteKind::Inline);
        assert_eq!(parser.identifier(), Some(42));
        assert_eq!(parser.tags(), ["t1"]);
        let parsed = parse(&parser);
        assert_eq!(
            fields_of(&parsed),
            vec![pair("Front", "What is it?"), pair("Back", "<strong>this</strong>")]
        );
    }

    #[test]
    fn inline_fields_switch_after_any_whitespace() {
        let parser = NoteParser::inline("[Basic] Question\tBack:\tAnswer").unwrap();
        assert_eq!(
            fields_of(&parse(&parser)),
            vec![pair("Front", "Question"), pair("Back", "Answer")]
        );
    }

    #[test]
    fn inline_without_type_is_an_error() {
        assert_eq!(
            NoteParser::inline("no type here").unwrap_err(),
            ParseError::MissingNoteType
        );
    }

    #[test]
    fn inline_with_only_id_is_delete() {
        let parser = NoteParser::inline(" ID: 5 ").unwrap();
        assert_eq!(parse(&parser), ParsedNote::Delete(5));
    }

    fn pattern_regex() -> Regex {
        Regex::new(&format!(
            r"(?m)^Q: (.*)\nA: (.*)\n{TAG_SUFFIX_PATTERN}{ID_SUFFIX_PATTERN}"
        ))
        .unwrap()
    }

    #[test]
    fn pattern_groups_map_positionally() {
        let regex = Regex::new(r"(?m)^Q: (.*)\nA: (.*)").unwrap();
        let caps = regex.captures("Q: question\nA: answer").unwrap();
        let parser = NoteParser::pattern("Basic", &caps, false, false).unwrap();
        let parsed = parse(&parser);
        assert_eq!(
            fields_of(&parsed),
            vec![pair("Front", "question"), pair("Back", "answer")]
        );
    }

    #[test]
    fn pattern_tags_and_id_groups() {
        let regex = pattern_regex();
        let caps = regex
            .captures("Q: question\nA: answer\nTags: a b\nID: 314")
            .unwrap();
        let parser = NoteParser::pattern("Basic", &caps, true, true).unwrap();
        assert_eq!(parser.identifier(), Some(314));
        assert_eq!(parser.tags(), ["a", "b"]);
    }

    #[test]
    fn pattern_cloze_without_markers_is_rejected() {
        let mut settings = Settings::default();
        settings.curly_cloze = true;
        let regex = Regex::new(r"(?m)^C: (.*)").unwrap();

        let plain = regex.captures("C: nothing hidden").unwrap();
        let parser = NoteParser::pattern("Cloze", &plain, false, false).unwrap();
        assert_eq!(
            parse_with(&parser, &settings, &FrozenFields::new(), None).unwrap(),
            ParsedNote::Rejected
        );

        let clozed = regex.captures("C: the {answer}").unwrap();
        let parser = NoteParser::pattern("Cloze", &clozed, false, false).unwrap();
        let parsed = parse_with(&parser, &settings, &FrozenFields::new(), None).unwrap();
        assert_eq!(fields_of(&parsed)[0], pair("Text", "the {{c1::answer}}"));
    }

    #[test]
    fn frozen_text_is_appended() {
        let frozen: FrozenFields = HashMap::from([(
            "Basic".to_string(),
            HashMap::from([("Back".to_string(), ", frozen suffix".to_string())]),
        )]);
        let parser = NoteParser::block("Basic\nFront: Q\nBack: A\n").unwrap();
        let parsed = parse_with(&parser, &Settings::default(), &frozen, None).unwrap();
        assert_eq!(fields_of(&parsed)[1], pair("Back", "A, frozen suffix"));
    }

    #[test]
    fn file_link_goes_on_first_field_only() {
        let mut settings = Settings::default();
        settings.add_file_link = true;
        settings.vault_name = Some("Vault".to_string());
        let parser = NoteParser::block("Basic\nFront: Q\nBack: A\n").unwrap();
        let url = "obsidian://open?vault=Vault&file=a.md";
        let parsed = parse_with(&parser, &settings, &FrozenFields::new(), Some(url)).unwrap();
        let fields = fields_of(&parsed);
        assert_eq!(
            fields[0].1,
            format!(r#"Q<br><a href="{url}" class="obsidian-link">Obsidian</a>"#)
        );
        assert_eq!(fields[1].1, "A");
    }

    #[test]
    fn cloze_numbering_restarts_for_each_note() {
        let mut settings = Settings::default();
        settings.curly_cloze = true;
        for _ in 0..2 {
            let parser = NoteParser::block("Cloze\nText: {a} and {b}\n").unwrap();
            let parsed = parse_with(&parser, &settings, &FrozenFields::new(), None).unwrap();
            assert_eq!(
                fields_of(&parsed)[0],
                pair("Text", "{{c1::a}} and {{c2::b}}")
            );
        }
    }
}
