//! Per-document scanning and rewriting.
//!
//! A [`Document`] finds every note span in one file, sorts the parsed notes
//! into add / edit / delete buckets, and after the first service batch
//! writes the new identifiers back and strips deleted placeholders. All text
//! changes are recorded against the text as it was read and applied once.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Captures;

use crate::anki::{NoteInfo, Request};
use crate::edit::TextEdits;
use crate::error::{ParseError, ScanError};
use crate::format::protected_spans;
use crate::grammar::Grammar;
use crate::note::{NoteParser, ParseContext, ID_PREFIX};
use crate::persist::write_safe;
use crate::sync::RunContext;
use crate::types::{FrozenFields, Note, NoteId, ParsedNote, Span};

/// Per-file inputs that come from outside the file's own text.
#[derive(Debug, Clone, Default)]
pub struct DocumentOptions {
    /// Deck used when the file has no target deck line.
    pub deck: Option<String>,
    /// Tags added to every note in the file.
    pub tags: Vec<String>,
    /// Link back to the file, appended to the first field when enabled.
    pub url: Option<String>,
}

/// Where a new identifier goes once the service has assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// On its own line at this offset.
    Line(usize),
    /// Inside an inline note, just before the end marker.
    Inline(usize),
    /// Directly after a pattern match, as the line the identifier tier expects.
    AfterMatch(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAdd {
    pub note: Note,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub id: NoteId,
    pub note: Note,
    /// Filled from the `notesInfo` result of the first batch.
    pub info: Option<NoteInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    /// The file names an identifier the service does not know.
    UnknownId { id: NoteId, span: Span },
    /// The service did not create the note at this add-bucket position.
    NotCreated { index: usize, model_name: String },
}

/// One scanned file.
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    /// File text with `\r\n` folded to `\n`. Spans and edits refer to this.
    original: String,
    /// `original` plus a newline, so end-anchored patterns match at EOF.
    text: String,
    crlf: bool,
    options: DocumentOptions,
    deck: String,
    global_tags: Vec<String>,
    frozen: FrozenFields,
    to_add: Vec<PendingAdd>,
    to_edit: Vec<PendingEdit>,
    to_delete: Vec<NoteId>,
    placeholders: Vec<Span>,
    warnings: Vec<ScanWarning>,
    /// Identifier and add-bucket index of every note the service created.
    assigned: Vec<(NoteId, usize)>,
    edits: TextEdits,
    id_comments: bool,
    write_failed: bool,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>, options: DocumentOptions) -> Self {
        let raw: String = text.into();
        let crlf = raw.contains("\r\n");
        let original = if crlf { raw.replace("\r\n", "\n") } else { raw };
        let text = format!("{original}\n");
        Self {
            path: path.into(),
            original,
            text,
            crlf,
            options,
            deck: String::new(),
            global_tags: Vec::new(),
            frozen: FrozenFields::new(),
            to_add: Vec::new(),
            to_edit: Vec::new(),
            to_delete: Vec::new(),
            placeholders: Vec::new(),
            warnings: Vec::new(),
            assigned: Vec::new(),
            edits: TextEdits::new(),
            id_comments: false,
            write_failed: false,
        }
    }

    pub fn open(path: impl Into<PathBuf>, options: DocumentOptions) -> io::Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        Ok(Self::new(path, text, options))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn deck(&self) -> &str {
        &self.deck
    }

    pub fn to_add(&self) -> &[PendingAdd] {
        &self.to_add
    }

    pub fn to_edit(&self) -> &[PendingEdit] {
        &self.to_edit
    }

    pub fn to_delete(&self) -> &[NoteId] {
        &self.to_delete
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    pub fn has_edits(&self) -> bool {
        !self.to_edit.is_empty()
    }

    /// Whether the file must be scanned again next run: it carried warnings
    /// or its rewrite failed, so the file and the collection disagree.
    pub fn needs_resync(&self) -> bool {
        self.write_failed || !self.warnings.is_empty()
    }

    pub(crate) fn mark_write_failed(&mut self) {
        self.write_failed = true;
    }

    fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn reset(&mut self) {
        self.global_tags.clear();
        self.frozen.clear();
        self.to_add.clear();
        self.to_edit.clear();
        self.to_delete.clear();
        self.placeholders.clear();
        self.warnings.clear();
        self.assigned.clear();
        self.edits = TextEdits::new();
        self.write_failed = false;
    }

    /// Find every note in the file and bucket it.
    pub fn scan(&mut self, ctx: &mut RunContext) -> Result<(), ScanError> {
        self.reset();
        let RunContext {
            ref settings,
            ref grammar,
            ref schema,
            ref existing_ids,
            ref mut media,
            ..
        } = *ctx;
        self.id_comments = settings.id_comments;

        let text = std::mem::take(&mut self.text);
        let base_dir = self.base_dir();
        let mut pctx = ParseContext {
            settings,
            schema,
            media,
            base_dir: &base_dir,
        };
        let result = self.scan_text(&text, &mut pctx, grammar, existing_ids);
        self.text = text;
        result
    }

    fn scan_text(
        &mut self,
        text: &str,
        pctx: &mut ParseContext<'_>,
        grammar: &Grammar,
        existing_ids: &HashSet<NoteId>,
    ) -> Result<(), ScanError> {
        self.deck = grammar
            .target_deck
            .captures(text)
            .map(|caps| caps[1].trim().to_string())
            .or_else(|| self.options.deck.clone())
            .unwrap_or_else(|| pctx.settings.default_deck.clone());

        if let Some(caps) = grammar.file_tags.captures(text) {
            self.global_tags = caps[1].split_whitespace().map(str::to_string).collect();
        }
        for tag in &self.options.tags {
            if !self.global_tags.contains(tag) {
                self.global_tags.push(tag.clone());
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            deck = %self.deck,
            tags = ?self.global_tags,
            "scanning document"
        );

        for caps in grammar.frozen_fields.captures_iter(text) {
            let span = whole(&caps);
            let note_type = caps[1].trim().to_string();
            let parser = NoteParser::block(&format!("{note_type}\n{}", &caps[2]))
                .map_err(|source| self.located(span, source))?;
            let fields = parser
                .fields(pctx)
                .map_err(|source| self.located(span, source))?;
            let defaults = self.frozen.entry(note_type).or_default();
            for (name, value) in fields.iter().filter(|(_, v)| !v.is_empty()) {
                defaults.insert(name.to_string(), value.to_string());
            }
        }

        let mut claimed: Vec<Span> = Vec::new();

        for caps in grammar.block_note.captures_iter(text) {
            let span = whole(&caps);
            claimed.push(span);
            let mut body = caps[1].to_string();
            if let Some(id_line) = caps.get(2) {
                body.push_str(id_line.as_str());
            }
            let parsed = NoteParser::block(&body)
                .and_then(|parser| self.parse(&parser, pctx))
                .map_err(|source| self.located(span, source))?;
            self.classify(parsed, span, Placement::Line(span.end), existing_ids);
        }

        for caps in grammar.inline_note.captures_iter(text) {
            let span = whole(&caps);
            claimed.push(span);
            let inner = caps.get(1).map_or(span.end, |m| m.end());
            let parsed = NoteParser::inline(&caps[1])
                .and_then(|parser| self.parse(&parser, pctx))
                .map_err(|source| self.located(span, source))?;
            self.classify(parsed, span, Placement::Inline(inner), existing_ids);
        }

        for caps in grammar.delete_marker.captures_iter(text) {
            let span = whole(&caps);
            claimed.push(span);
            let id = caps[1]
                .parse::<NoteId>()
                .map_err(|_| ParseError::InvalidId {
                    value: caps[1].to_string(),
                })
                .map_err(|source| self.located(span, source))?;
            self.classify(ParsedNote::Delete(id), span, Placement::Line(span.end), existing_ids);
        }

        if !grammar.custom.is_empty() {
            claimed.extend(protected_spans(text));
            for pattern in &grammar.custom {
                for tier in pattern.tiers() {
                    for caps in tier.regex.captures_iter(text) {
                        let span = whole(&caps);
                        if span.start == span.end
                            || claimed.iter().any(|c| span.contained_in(c))
                        {
                            continue;
                        }
                        claimed.push(span);
                        let parsed =
                            NoteParser::pattern(&pattern.note_type, &caps, tier.tags, tier.id)
                                .and_then(|parser| self.parse(&parser, pctx))
                                .map_err(|source| self.located(span, source))?;
                        if parsed == ParsedNote::Rejected {
                            claimed.pop();
                            continue;
                        }
                        let placement = Placement::AfterMatch(span.end);
                        self.classify(parsed, span, placement, existing_ids);
                    }
                }
            }
        }

        tracing::info!(
            path = %self.path.display(),
            add = self.to_add.len(),
            edit = self.to_edit.len(),
            delete = self.to_delete.len(),
            "scanned document"
        );
        Ok(())
    }

    fn parse(&self, parser: &NoteParser, pctx: &mut ParseContext<'_>) -> Result<ParsedNote, ParseError> {
        parser.parse(&self.deck, self.options.url.as_deref(), &self.frozen, pctx)
    }

    fn located(&self, span: Span, source: ParseError) -> ScanError {
        ScanError {
            path: self.path.clone(),
            span,
            source,
        }
    }

    fn classify(
        &mut self,
        parsed: ParsedNote,
        span: Span,
        placement: Placement,
        existing_ids: &HashSet<NoteId>,
    ) {
        match parsed {
            ParsedNote::Note { mut note, id: None } => {
                note.extend_tags(self.global_tags.iter().map(String::as_str));
                tracing::debug!(model = %note.model_name, "note to add");
                self.to_add.push(PendingAdd { note, placement });
            }
            ParsedNote::Note { id: Some(id), .. } if !existing_ids.contains(&id) => {
                tracing::warn!(
                    path = %self.path.display(),
                    id,
                    "note ID does not exist in the collection, skipping"
                );
                self.warnings.push(ScanWarning::UnknownId { id, span });
            }
            ParsedNote::Note {
                mut note,
                id: Some(id),
            } => {
                note.extend_tags(self.global_tags.iter().map(String::as_str));
                tracing::debug!(id, "note to edit");
                self.to_edit.push(PendingEdit {
                    id,
                    note,
                    info: None,
                });
            }
            ParsedNote::Delete(id) => {
                tracing::debug!(id, "note to delete");
                if !self.to_delete.contains(&id) {
                    self.to_delete.push(id);
                }
                self.placeholders.push(span);
            }
            ParsedNote::Rejected => {}
        }
    }

    /// Record the identifiers the service assigned, positionally matched to
    /// the add bucket. Missing identifiers are reported and left out.
    pub fn write_ids(&mut self, ids: &[Option<NoteId>]) -> usize {
        let mut written = 0;
        for (index, add) in self.to_add.iter().enumerate() {
            match ids.get(index).copied().flatten() {
                Some(id) => {
                    let (at, text) = self.id_insert(id, add.placement);
                    self.edits.insert(at, text);
                    self.assigned.push((id, index));
                    written += 1;
                }
                None => {
                    tracing::warn!(
                        path = %self.path.display(),
                        model = %add.note.model_name,
                        "service did not create note"
                    );
                    self.warnings.push(ScanWarning::NotCreated {
                        index,
                        model_name: add.note.model_name.clone(),
                    });
                }
            }
        }
        written
    }

    fn id_insert(&self, id: NoteId, placement: Placement) -> (usize, String) {
        let mut marker = format!("{ID_PREFIX}{id}");
        if self.id_comments {
            marker = format!("<!--{marker}-->");
        }
        match placement {
            Placement::Inline(at) => (at, format!("{marker} ")),
            Placement::AfterMatch(at) => {
                (at.min(self.original.len()), format!("\n{marker}"))
            }
            Placement::Line(at) => {
                let at = at.min(self.original.len());
                if at == 0 || self.original[..at].ends_with('\n') {
                    (at, format!("{marker}\n"))
                } else {
                    (at, format!("\n{marker}"))
                }
            }
        }
    }

    /// Attach `notesInfo` entries to the edit bucket in order.
    pub fn apply_note_info(&mut self, infos: Vec<NoteInfo>) {
        if infos.len() != self.to_edit.len() {
            tracing::warn!(
                path = %self.path.display(),
                expected = self.to_edit.len(),
                got = infos.len(),
                "note info count does not match edited notes"
            );
        }
        for (edit, info) in self.to_edit.iter_mut().zip(infos) {
            edit.info = Some(info);
        }
    }

    /// Strip the placeholders of deleted notes.
    pub fn remove_empties(&mut self) {
        for span in &self.placeholders {
            self.edits.remove(*span);
        }
    }

    /// The file text with every recorded edit applied, in the file's own
    /// line endings.
    pub fn render(&self) -> String {
        self.restore_line_endings(self.edits.apply(&self.original))
    }

    fn restore_line_endings(&self, text: String) -> String {
        if self.crlf {
            text.replace('\n', "\r\n")
        } else {
            text
        }
    }

    /// Write the rendered text if it changed. Returns whether a write happened.
    pub fn write_file(&self) -> io::Result<bool> {
        let rendered = self.edits.apply(&self.original);
        if rendered == self.original {
            return Ok(false);
        }
        tracing::info!(path = %self.path.display(), "writing updated note IDs");
        write_safe(&self.path, &self.restore_line_endings(rendered))?;
        Ok(true)
    }

    pub fn add_notes_request(&self) -> Request {
        Request::add_notes(self.to_add.iter().map(|add| &add.note))
    }

    pub fn update_fields_request(&self) -> Request {
        Request::multi(
            self.to_edit
                .iter()
                .map(|edit| Request::update_note_fields(edit.id, &edit.note.fields))
                .collect(),
        )
    }

    pub fn notes_info_request(&self) -> Request {
        Request::notes_info(&self.edit_ids())
    }

    pub fn delete_notes_request(&self) -> Request {
        Request::delete_notes(&self.to_delete)
    }

    pub fn change_deck_request(&self) -> Request {
        let cards: Vec<i64> = self
            .to_edit
            .iter()
            .filter_map(|edit| edit.info.as_ref())
            .flat_map(|info| info.cards.iter().copied())
            .collect();
        Request::change_deck(&cards, &self.deck)
    }

    /// Clear `all_tags` from every edited note.
    pub fn remove_tags_request(&self, all_tags: &[String]) -> Request {
        Request::remove_tags(&self.edit_ids(), &all_tags.join(" "))
    }

    /// Re-add each edited note's source tags. With `preserve_external`, tags
    /// the note carries that did not come from its source at the last sync
    /// (per `last_synced`) are kept too. A note with no record keeps all of
    /// its current tags.
    pub fn add_tags_request(
        &self,
        preserve_external: bool,
        last_synced: &BTreeMap<NoteId, Vec<String>>,
    ) -> Request {
        Request::multi(
            self.to_edit
                .iter()
                .map(|edit| {
                    let mut tags = edit.note.tags.clone();
                    if let (true, Some(info)) = (preserve_external, &edit.info) {
                        let previous = last_synced.get(&edit.id);
                        for tag in &info.tags {
                            let from_source = previous.is_some_and(|p| p.contains(tag));
                            if !from_source && !tags.contains(tag) {
                                tags.push(tag.clone());
                            }
                        }
                    }
                    Request::add_tags(&[edit.id], &tags.join(" "))
                })
                .collect(),
        )
    }

    /// Identifier and source tags of every note this run created or updated.
    pub fn synced_tags(&self) -> impl Iterator<Item = (NoteId, &[String])> + '_ {
        let added = self
            .assigned
            .iter()
            .map(|&(id, index)| (id, self.to_add[index].note.tags.as_slice()));
        let edited = self
            .to_edit
            .iter()
            .map(|edit| (edit.id, edit.note.tags.as_slice()));
        added.chain(edited)
    }

    fn edit_ids(&self) -> Vec<NoteId> {
        self.to_edit.iter().map(|edit| edit.id).collect()
    }
}

fn whole(caps: &Captures<'_>) -> Span {
    caps.get(0)
        .map(Span::from)
        .unwrap_or_else(|| Span::new(0, 0))
}
