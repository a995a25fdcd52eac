//! AnkiConnect request model.
//!
//! Every call is `{"action", "version": 6, "params"}` and every response is
//! an envelope with exactly two keys, `result` and `error`. `multi` batches
//! sub-requests and answers with one envelope per sub-request.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::types::{Fields, Note, NoteId};

pub const API_VERSION: u8 = 6;

/// One AnkiConnect action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub action: &'static str,
    pub version: u8,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotePayload<'a> {
    deck_name: &'a str,
    model_name: &'a str,
    fields: &'a Fields,
    tags: &'a [String],
    options: NoteOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NoteOptions {
    allow_duplicate: bool,
    duplicate_scope: &'static str,
}

impl<'a> From<&'a Note> for NotePayload<'a> {
    fn from(note: &'a Note) -> Self {
        Self {
            deck_name: &note.deck_name,
            model_name: &note.model_name,
            fields: &note.fields,
            tags: &note.tags,
            options: NoteOptions {
                allow_duplicate: false,
                duplicate_scope: "deck",
            },
        }
    }
}

impl Request {
    pub fn new(action: &'static str, params: Value) -> Self {
        Self {
            action,
            version: API_VERSION,
            params,
        }
    }

    pub fn multi(actions: Vec<Request>) -> Self {
        Self::new("multi", json!({ "actions": actions }))
    }

    pub fn model_names() -> Self {
        Self::new("modelNames", Value::Null)
    }

    pub fn model_field_names(model_name: &str) -> Self {
        Self::new("modelFieldNames", json!({ "modelName": model_name }))
    }

    pub fn find_notes(query: &str) -> Self {
        Self::new("findNotes", json!({ "query": query }))
    }

    pub fn add_notes<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let notes: Vec<NotePayload<'_>> = notes.into_iter().map(NotePayload::from).collect();
        Self::new("addNotes", json!({ "notes": notes }))
    }

    pub fn update_note_fields(id: NoteId, fields: &Fields) -> Self {
        Self::new(
            "updateNoteFields",
            json!({ "note": { "id": id, "fields": fields } }),
        )
    }

    pub fn notes_info(ids: &[NoteId]) -> Self {
        Self::new("notesInfo", json!({ "notes": ids }))
    }

    pub fn delete_notes(ids: &[NoteId]) -> Self {
        Self::new("deleteNotes", json!({ "notes": ids }))
    }

    pub fn change_deck(cards: &[i64], deck: &str) -> Self {
        Self::new("changeDeck", json!({ "cards": cards, "deck": deck }))
    }

    /// `tags` is space separated.
    pub fn add_tags(ids: &[NoteId], tags: &str) -> Self {
        Self::new("addTags", json!({ "notes": ids, "tags": tags }))
    }

    /// `tags` is space separated.
    pub fn remove_tags(ids: &[NoteId], tags: &str) -> Self {
        Self::new("removeTags", json!({ "notes": ids, "tags": tags }))
    }

    pub fn get_tags() -> Self {
        Self::new("getTags", Value::Null)
    }

    /// `data` is the base64 encoded file.
    pub fn store_media_file(filename: &str, data: &str) -> Self {
        Self::new(
            "storeMediaFile",
            json!({ "filename": filename, "data": data }),
        )
    }
}

/// Transport to a running flashcard service.
///
/// Implementations send the request and hand back the raw response envelope;
/// validation happens in [`parse_response`].
pub trait AnkiService {
    fn invoke(&self, request: &Request) -> impl Future<Output = Result<Value, SyncError>> + Send;
}

/// Send `request` and unwrap its envelope.
pub async fn call<S: AnkiService>(service: &S, request: &Request) -> Result<Value, SyncError> {
    tracing::debug!(action = request.action, "invoking service");
    parse_response(service.invoke(request).await?)
}

/// Check the two-key envelope and return its `result`.
pub fn parse_response(response: Value) -> Result<Value, SyncError> {
    let Value::Object(mut map) = response else {
        return Err(SyncError::Envelope(
            "response is not a JSON object".to_string(),
        ));
    };
    if map.len() != 2 {
        return Err(SyncError::Envelope(format!(
            "response has {} fields, expected 2",
            map.len()
        )));
    }
    let error = map
        .remove("error")
        .ok_or_else(|| SyncError::Envelope("response is missing the error field".to_string()))?;
    let result = map
        .remove("result")
        .ok_or_else(|| SyncError::Envelope("response is missing the result field".to_string()))?;

    match error {
        Value::Null => Ok(result),
        Value::String(message) => Err(SyncError::Service(message)),
        other => Err(SyncError::Service(other.to_string())),
    }
}

/// Unwrap the result of a `multi` call: a list of envelopes, one per
/// sub-request.
pub fn parse_multi(result: Value) -> Result<Vec<Value>, SyncError> {
    match result {
        Value::Array(items) => items.into_iter().map(parse_response).collect(),
        other => Err(SyncError::Envelope(format!(
            "multi result is not a list: {other}"
        ))),
    }
}

/// Deserialize an unwrapped result.
pub fn decode<T: DeserializeOwned>(action: &'static str, value: Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|source| SyncError::Decode { action, source })
}

/// Entry of a `notesInfo` result. Unknown notes come back as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoteInfo {
    pub note_id: NoteId,
    pub tags: Vec<String>,
    pub cards: Vec<i64>,
}
