//! Core types shared by the parser, scanner and sync coordinator.

use std::collections::HashMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Identifier assigned to a note by the flashcard service.
pub type NoteId = i64;

/// Byte range into a document's original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whether this span lies inside `other`, allowing one byte of slack on each side.
    pub fn contained_in(&self, other: &Span) -> bool {
        self.start + 1 >= other.start && self.end <= other.end + 1
    }
}

impl From<regex::Match<'_>> for Span {
    fn from(m: regex::Match<'_>) -> Self {
        Self::new(m.start(), m.end())
    }
}

/// Note type name → ordered field names, fetched once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteSchema {
    types: HashMap<String, Vec<String>>,
}

impl NoteSchema {
    pub fn new(types: HashMap<String, Vec<String>>) -> Self {
        Self { types }
    }

    /// Field names of a note type, in display order.
    pub fn fields(&self, note_type: &str) -> Option<&[String]> {
        self.types.get(note_type).map(Vec::as_slice)
    }

    pub fn note_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Vec<String>)> for NoteSchema {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Field name → rendered body, kept in the note type's field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn first_mut(&mut self) -> Option<&mut String> {
        self.0.first_mut().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut String)> {
        self.0.iter_mut().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A parsed flashcard ready to be created or updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub model_name: String,
    pub deck_name: String,
    pub fields: Fields,
    pub tags: Vec<String>,
}

impl Note {
    /// Add tags, skipping empties and ones already present.
    pub fn extend_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) {
        for tag in tags {
            if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
                self.tags.push(tag.to_string());
            }
        }
    }
}

/// Outcome of parsing one note span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedNote {
    /// A note to create (`id` is `None`) or update.
    Note { note: Note, id: Option<NoteId> },
    /// Only an identifier remained: delete that note.
    Delete(NoteId),
    /// A cloze-typed pattern note without any cloze marker.
    Rejected,
}

/// Note type → field → text appended to every note of that type.
pub type FrozenFields = HashMap<String, HashMap<String, String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_containment_has_one_byte_slack() {
        let outer = Span::new(10, 20);
        assert!(Span::new(10, 20).contained_in(&outer));
        assert!(Span::new(9, 21).contained_in(&outer));
        assert!(!Span::new(8, 15).contained_in(&outer));
        assert!(!Span::new(12, 22).contained_in(&outer));
    }

    #[test]
    fn span_containment_at_zero() {
        assert!(Span::new(0, 3).contained_in(&Span::new(0, 5)));
        assert!(Span::new(0, 3).contained_in(&Span::new(1, 5)));
    }

    #[test]
    fn fields_serialize_in_order() {
        let fields: Fields = vec![
            ("Front".to_string(), "Q".to_string()),
            ("Back".to_string(), "A".to_string()),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"Front":"Q","Back":"A"}"#);
    }

    #[test]
    fn extend_tags_deduplicates() {
        let mut note = Note {
            model_name: "Basic".to_string(),
            deck_name: "Default".to_string(),
            fields: Fields::default(),
            tags: vec!["a".to_string()],
        };
        note.extend_tags(["a", "", "b", "b"]);
        assert_eq!(note.tags, vec!["a", "b"]);
    }
}
