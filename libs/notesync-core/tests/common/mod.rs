//! In-memory flashcard service for integration tests.
//!
//! Understands the subset of AnkiConnect actions the sync engine sends and
//! answers with real `{result, error}` envelopes, including nested ones for
//! `multi`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use notesync_core::{AnkiService, NoteId, Request, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNote {
    pub model: String,
    pub deck: String,
    pub fields: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub cards: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct State {
    pub models: BTreeMap<String, Vec<String>>,
    pub notes: BTreeMap<NoteId, StoredNote>,
    pub media: BTreeMap<String, String>,
    pub actions: Vec<String>,
    pub fail_action: Option<String>,
    next_id: NoteId,
}

#[derive(Debug, Clone)]
pub struct FakeAnki {
    state: Arc<Mutex<State>>,
}

impl FakeAnki {
    pub fn new() -> Self {
        let mut state = State {
            next_id: 1,
            ..State::default()
        };
        state.models.insert(
            "Basic".to_string(),
            vec!["Front".to_string(), "Back".to_string()],
        );
        state.models.insert(
            "Cloze".to_string(),
            vec!["Text".to_string(), "Back Extra".to_string()],
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn note(&self, id: NoteId) -> Option<StoredNote> {
        self.state().notes.get(&id).cloned()
    }

    pub fn fail_on(&self, action: &str) {
        self.state().fail_action = Some(action.to_string());
    }

    pub fn count(&self, action: &str) -> usize {
        self.state().actions.iter().filter(|a| *a == action).count()
    }

    fn handle(&self, request: &Value) -> Value {
        let action = request["action"].as_str().unwrap_or_default().to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let outcome = if action == "multi" {
            let actions = params["actions"].as_array().cloned().unwrap_or_default();
            Ok(Value::Array(actions.iter().map(|a| self.handle(a)).collect()))
        } else {
            self.state().dispatch(&action, &params)
        };
        match outcome {
            Ok(result) => json!({ "result": result, "error": null }),
            Err(message) => json!({ "result": null, "error": message }),
        }
    }
}

impl State {
    fn dispatch(&mut self, action: &str, params: &Value) -> Result<Value, String> {
        self.actions.push(action.to_string());
        if self.fail_action.as_deref() == Some(action) {
            return Err(format!("{action} failed"));
        }

        match action {
            "modelNames" => Ok(json!(self.models.keys().collect::<Vec<_>>())),
            "modelFieldNames" => {
                let name = params["modelName"].as_str().unwrap_or_default();
                self.models
                    .get(name)
                    .map(|fields| json!(fields))
                    .ok_or_else(|| format!("model was not found: {name}"))
            }
            "findNotes" => Ok(json!(self.notes.keys().collect::<Vec<_>>())),
            "getTags" => {
                let tags: BTreeSet<&String> =
                    self.notes.values().flat_map(|n| n.tags.iter()).collect();
                Ok(json!(tags))
            }
            "storeMediaFile" => {
                let name = params["filename"].as_str().unwrap_or_default().to_string();
                let data = params["data"].as_str().unwrap_or_default().to_string();
                self.media.insert(name.clone(), data);
                Ok(json!(name))
            }
            "addNotes" => {
                let notes = params["notes"].as_array().cloned().unwrap_or_default();
                let ids: Vec<Option<NoteId>> = notes.iter().map(|n| self.add(n)).collect();
                Ok(json!(ids))
            }
            "updateNoteFields" => {
                let id = params["note"]["id"].as_i64().unwrap_or_default();
                let note = self
                    .notes
                    .get_mut(&id)
                    .ok_or_else(|| "note was not found".to_string())?;
                if let Some(fields) = params["note"]["fields"].as_object() {
                    for (name, value) in fields {
                        note.fields
                            .insert(name.clone(), value.as_str().unwrap_or_default().to_string());
                    }
                }
                Ok(Value::Null)
            }
            "notesInfo" => {
                let infos: Vec<Value> = ids(params)
                    .iter()
                    .map(|id| match self.notes.get(id) {
                        Some(note) => json!({
                            "noteId": id,
                            "modelName": note.model,
                            "tags": note.tags,
                            "fields": note.fields,
                            "cards": note.cards,
                        }),
                        None => json!({}),
                    })
                    .collect();
                Ok(json!(infos))
            }
            "deleteNotes" => {
                for id in ids(params) {
                    self.notes.remove(&id);
                }
                Ok(Value::Null)
            }
            "changeDeck" => {
                let cards: Vec<i64> = params["cards"]
                    .as_array()
                    .map(|c| c.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let deck = params["deck"].as_str().unwrap_or_default();
                for note in self.notes.values_mut() {
                    if note.cards.iter().any(|c| cards.contains(c)) {
                        note.deck = deck.to_string();
                    }
                }
                Ok(Value::Null)
            }
            "addTags" | "removeTags" => {
                let tags: Vec<String> = params["tags"]
                    .as_str()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                for id in ids(params) {
                    if let Some(note) = self.notes.get_mut(&id) {
                        for tag in &tags {
                            if action == "addTags" {
                                note.tags.insert(tag.clone());
                            } else {
                                note.tags.remove(tag);
                            }
                        }
                    }
                }
                Ok(Value::Null)
            }
            other => Err(format!("unsupported action {other}")),
        }
    }

    fn add(&mut self, note: &Value) -> Option<NoteId> {
        let model = note["modelName"].as_str()?;
        if !self.models.contains_key(model) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let fields = note["fields"]
            .as_object()?
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
            .collect();
        let tags = note["tags"]
            .as_array()?
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect();
        self.notes.insert(
            id,
            StoredNote {
                model: model.to_string(),
                deck: note["deckName"].as_str()?.to_string(),
                fields,
                tags,
                cards: vec![id * 100],
            },
        );
        Some(id)
    }
}

fn ids(params: &Value) -> Vec<NoteId> {
    params["notes"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

impl AnkiService for FakeAnki {
    fn invoke(&self, request: &Request) -> impl Future<Output = Result<Value, SyncError>> + Send {
        let response = serde_json::to_value(request)
            .map(|request| self.handle(&request))
            .map_err(|e| SyncError::Network(e.to_string()));
        async move { response }
    }
}
