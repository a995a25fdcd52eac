//! Sync coordinator.
//!
//! One run is a fixed pipeline with two service round trips:
//!
//! 1. scan every document
//! 2. batch 1: tag listing, media uploads, creates, field updates, note info
//!    and deletes for every document in one `multi` call
//! 3. write identifiers back, strip delete placeholders, save files
//! 4. batch 2: deck moves and tag replacement for edited notes
//!
//! A service error anywhere aborts the run. Files already written in step 3
//! stay written.

use std::collections::{BTreeMap, HashSet};
use std::fs;

use base64::Engine;
use serde::Serialize;
use serde_json::Value;

use crate::anki::{call, decode, parse_multi, AnkiService, NoteInfo, Request};
use crate::error::{ScanError, SyncError};
use crate::format::MediaState;
use crate::grammar::Grammar;
use crate::scanner::Document;
use crate::settings::{ParseErrorPolicy, Settings};
use crate::types::{NoteId, NoteSchema};

/// State shared by every document in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub settings: Settings,
    pub grammar: Grammar,
    pub schema: NoteSchema,
    /// Every note identifier the service knows about.
    pub existing_ids: HashSet<NoteId>,
    pub media: MediaState,
    /// Tags each note received from its source at its last sync. Empty
    /// unless the caller restores it from a previous run.
    pub note_tags: BTreeMap<NoteId, Vec<String>>,
}

impl RunContext {
    pub fn new(
        settings: Settings,
        schema: NoteSchema,
        existing_ids: HashSet<NoteId>,
        media: MediaState,
    ) -> Result<Self, SyncError> {
        let grammar = Grammar::compile(&settings)?;
        Ok(Self {
            settings,
            grammar,
            schema,
            existing_ids,
            media,
            note_tags: BTreeMap::new(),
        })
    }
}

/// Sync statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub documents: usize,
    pub notes_added: usize,
    pub notes_not_created: usize,
    pub notes_updated: usize,
    pub notes_deleted: usize,
    pub media_uploaded: usize,
    pub files_written: usize,
    pub write_failures: usize,
    pub unknown_ids: usize,
}

/// Documents that scanned cleanly, plus the errors of those left out.
#[derive(Debug)]
pub struct ScanReport {
    pub documents: Vec<Document>,
    pub failed: Vec<ScanError>,
}

/// Fetch every note type and its ordered field names.
pub async fn fetch_schema<S: AnkiService>(service: &S) -> Result<NoteSchema, SyncError> {
    let names: Vec<String> = decode("modelNames", call(service, &Request::model_names()).await?)?;
    let requests = names
        .iter()
        .map(|name| Request::model_field_names(name))
        .collect();
    let fields = parse_multi(call(service, &Request::multi(requests)).await?)?;
    if fields.len() != names.len() {
        return Err(SyncError::Envelope(format!(
            "asked for fields of {} note types, got {}",
            names.len(),
            fields.len()
        )));
    }

    names
        .into_iter()
        .zip(fields)
        .map(|(name, fields)| Ok((name, decode("modelFieldNames", fields)?)))
        .collect()
}

/// Fetch the identifiers of every note in the collection.
pub async fn fetch_existing_ids<S: AnkiService>(service: &S) -> Result<HashSet<NoteId>, SyncError> {
    let ids: Vec<NoteId> = decode(
        "findNotes",
        call(service, &Request::find_notes("deck:*")).await?,
    )?;
    Ok(ids.into_iter().collect())
}

/// Scan every document, applying the configured parse error policy.
pub fn scan_documents(
    documents: Vec<Document>,
    ctx: &mut RunContext,
) -> Result<ScanReport, SyncError> {
    let mut report = ScanReport {
        documents: Vec::with_capacity(documents.len()),
        failed: Vec::new(),
    };

    for mut doc in documents {
        let media_before = ctx.media.clone();
        match doc.scan(ctx) {
            Ok(()) => report.documents.push(doc),
            Err(error) => match ctx.settings.on_parse_error {
                ParseErrorPolicy::Abort => return Err(error.into()),
                ParseErrorPolicy::SkipDocument => {
                    tracing::warn!(%error, "skipping document");
                    ctx.media = media_before;
                    report.failed.push(error);
                }
            },
        }
    }

    Ok(report)
}

/// Drives one sync run against a flashcard service.
pub struct SyncCoordinator<S> {
    service: S,
}

impl<S: AnkiService> SyncCoordinator<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Fetch the schema and known identifiers and build the run context.
    pub async fn prepare(
        &self,
        settings: Settings,
        media: MediaState,
    ) -> Result<RunContext, SyncError> {
        tracing::info!("fetching note types");
        let schema = fetch_schema(&self.service).await?;
        tracing::info!("fetching existing note IDs");
        let existing_ids = fetch_existing_ids(&self.service).await?;
        RunContext::new(settings, schema, existing_ids, media)
    }

    /// Push every scanned document to the service and rewrite the files.
    pub async fn sync(
        &self,
        documents: &mut [Document],
        ctx: &mut RunContext,
    ) -> Result<SyncStats, SyncError> {
        let mut stats = SyncStats {
            documents: documents.len(),
            ..SyncStats::default()
        };

        let media = self.media_requests(&mut ctx.media);
        tracing::info!(
            documents = documents.len(),
            media = media.len(),
            "sending first batch"
        );
        let batch = Request::multi(vec![
            Request::get_tags(),
            Request::multi(media),
            Request::multi(documents.iter().map(Document::add_notes_request).collect()),
            Request::multi(documents.iter().map(Document::update_fields_request).collect()),
            Request::multi(documents.iter().map(Document::notes_info_request).collect()),
            Request::multi(documents.iter().map(Document::delete_notes_request).collect()),
        ]);
        let [tags, uploads, adds, updates, infos, deletes] =
            sections(parse_multi(call(&self.service, &batch).await?)?)?;

        let all_tags: Vec<String> = decode("getTags", tags)?;
        parse_multi(uploads)?;
        stats.media_uploaded = ctx.media.commit().len();

        let adds = per_document(adds, documents.len())?;
        let infos = per_document(infos, documents.len())?;
        for update in per_document(updates, documents.len())? {
            parse_multi(update)?;
        }
        per_document(deletes, documents.len())?;

        for ((doc, added), info) in documents.iter_mut().zip(adds).zip(infos) {
            let ids: Vec<Option<NoteId>> = decode("addNotes", added)?;
            let info: Vec<NoteInfo> = decode("notesInfo", info)?;

            let written = doc.write_ids(&ids);
            stats.notes_added += written;
            stats.notes_not_created += doc.to_add().len() - written;
            stats.notes_updated += doc.to_edit().len();
            stats.notes_deleted += doc.to_delete().len();
            stats.unknown_ids += doc
                .warnings()
                .iter()
                .filter(|w| matches!(w, crate::scanner::ScanWarning::UnknownId { .. }))
                .count();

            doc.apply_note_info(info);
            doc.remove_empties();
            match doc.write_file() {
                Ok(true) => stats.files_written += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        path = %doc.path().display(),
                        %error,
                        "failed to write file"
                    );
                    stats.write_failures += 1;
                    doc.mark_write_failed();
                }
            }
        }

        let editing: Vec<&Document> = documents.iter().filter(|doc| doc.has_edits()).collect();
        if !editing.is_empty() {
            tracing::info!(documents = editing.len(), "moving cards and replacing tags");
            let preserve = ctx.settings.preserve_external_tags;
            let batch = Request::multi(vec![
                Request::multi(editing.iter().map(|doc| doc.change_deck_request()).collect()),
                Request::multi(
                    editing
                        .iter()
                        .map(|doc| doc.remove_tags_request(&all_tags))
                        .collect(),
                ),
                Request::multi(
                    editing
                        .iter()
                        .map(|doc| doc.add_tags_request(preserve, &ctx.note_tags))
                        .collect(),
                ),
            ]);
            let [decks, cleared, added] =
                sections(parse_multi(call(&self.service, &batch).await?)?)?;
            parse_multi(decks)?;
            parse_multi(cleared)?;
            for per_doc in parse_multi(added)? {
                parse_multi(per_doc)?;
            }
        }

        for doc in documents.iter() {
            for id in doc.to_delete() {
                ctx.note_tags.remove(id);
            }
            for (id, tags) in doc.synced_tags() {
                ctx.note_tags.insert(id, tags.to_vec());
            }
        }

        tracing::info!(?stats, "sync finished");
        Ok(stats)
    }

    /// Read and encode every pending media file. Unreadable files are dropped
    /// from the pending set.
    fn media_requests(&self, media: &mut MediaState) -> Vec<Request> {
        let pending: Vec<(String, std::path::PathBuf)> = media
            .pending()
            .map(|(name, path)| (name.to_string(), path.to_path_buf()))
            .collect();

        let mut requests = Vec::with_capacity(pending.len());
        for (name, path) in pending {
            match fs::read(&path) {
                Ok(bytes) => {
                    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                    requests.push(Request::store_media_file(&name, &data));
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "cannot read media file");
                    media.drop_pending(&name);
                }
            }
        }
        requests
    }
}

fn sections<const N: usize>(results: Vec<Value>) -> Result<[Value; N], SyncError> {
    results.try_into().map_err(|results: Vec<Value>| {
        SyncError::Envelope(format!(
            "expected {N} batch results, got {}",
            results.len()
        ))
    })
}

fn per_document(result: Value, documents: usize) -> Result<Vec<Value>, SyncError> {
    let results = parse_multi(result)?;
    if results.len() != documents {
        return Err(SyncError::Envelope(format!(
            "expected {documents} per-document results, got {}",
            results.len()
        )));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::DocumentOptions;
    use serde_json::json;

    fn basic_context(policy: ParseErrorPolicy) -> RunContext {
        let settings = Settings {
            on_parse_error: policy,
            ..Settings::default()
        };
        let schema = [(
            "Basic".to_string(),
            vec!["Front".to_string(), "Back".to_string()],
        )]
        .into_iter()
        .collect();
        RunContext::new(settings, schema, HashSet::new(), MediaState::default()).unwrap()
    }

    fn documents() -> Vec<Document> {
        vec![
            Document::new("good.md", "START\nBasic\nFront: Q\nEND\n", DocumentOptions::default()),
            Document::new("bad.md", "START\nMissing\nFront: Q\nEND\n", DocumentOptions::default()),
        ]
    }

    #[test]
    fn skip_policy_keeps_other_documents() {
        let mut ctx = basic_context(ParseErrorPolicy::SkipDocument);
        let report = scan_documents(documents(), &mut ctx).unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].path(), std::path::Path::new("good.md"));
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn abort_policy_fails_the_run() {
        let mut ctx = basic_context(ParseErrorPolicy::Abort);
        let err = scan_documents(documents(), &mut ctx).unwrap_err();
        assert!(matches!(err, SyncError::Scan(_)));
    }

    #[test]
    fn skipped_document_media_is_not_uploaded() {
        let mut ctx = basic_context(ParseErrorPolicy::SkipDocument);
        let docs = vec![Document::new(
            "bad.md",
            "START\nBasic\nFront: ![](pic.png)\nEND\nSTART\nMissing\nx\nEND\n",
            DocumentOptions::default(),
        )];
        scan_documents(docs, &mut ctx).unwrap();
        assert_eq!(ctx.media.pending_len(), 0);
    }

    #[test]
    fn sections_checks_length() {
        let ok: [Value; 2] = sections(vec![json!(1), json!(2)]).unwrap();
        assert_eq!(ok[1], json!(2));
        assert!(sections::<3>(vec![json!(1)]).is_err());
    }
}
