//! Text edits computed against an unchanging original buffer and applied in
//! one pass, so earlier edits never shift the offsets of later ones.

use std::ops::Range;

use crate::types::Span;

/// Pending insertions and removals, all in original-buffer offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextEdits {
    inserts: Vec<(usize, String)>,
    removals: Vec<Range<usize>>,
}

impl TextEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `text` before the byte at `at`. Inserts at the same offset keep
    /// the order they were recorded in.
    pub fn insert(&mut self, at: usize, text: impl Into<String>) {
        self.inserts.push((at, text.into()));
    }

    /// Remove the bytes covered by `span`. Overlapping removals merge, and
    /// inserts strictly inside a removal are dropped with it.
    pub fn remove(&mut self, span: Span) {
        if span.start < span.end {
            self.removals.push(span.start..span.end);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removals.is_empty()
    }

    pub fn apply(&self, original: &str) -> String {
        let len = original.len();

        let mut inserts: Vec<(usize, &str)> = self
            .inserts
            .iter()
            .map(|(at, text)| ((*at).min(len), text.as_str()))
            .collect();
        inserts.sort_by_key(|(at, _)| *at);

        let mut out = String::with_capacity(
            len + inserts.iter().map(|(_, text)| text.len()).sum::<usize>(),
        );
        let mut cursor = 0;
        let mut pending = inserts.into_iter().peekable();

        for removal in merge(&self.removals, len) {
            while let Some((at, text)) = pending.next_if(|(at, _)| *at <= removal.start) {
                out.push_str(&original[cursor..at]);
                out.push_str(text);
                cursor = at;
            }
            while pending.next_if(|(at, _)| *at < removal.end).is_some() {}

            out.push_str(&original[cursor..removal.start]);
            cursor = removal.end;
        }

        for (at, text) in pending {
            out.push_str(&original[cursor..at]);
            out.push_str(text);
            cursor = at;
        }
        out.push_str(&original[cursor..]);
        out
    }
}

fn merge(removals: &[Range<usize>], len: usize) -> Vec<Range<usize>> {
    let mut sorted: Vec<Range<usize>> = removals
        .iter()
        .map(|r| r.start.min(len)..r.end.min(len))
        .collect();
    sorted.sort_by_key(|r| r.start);

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
