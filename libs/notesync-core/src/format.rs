//! Field markup conversion.
//!
//! Turns one field's source text into the HTML dialect the flashcard service
//! stores:
//! - `$x$` / `$$x$$` become `\(x\)` / `\[x\]` and are shielded from markdown
//! - `{x}` style spans become numbered clozes for cloze note types
//! - everything else is rendered by pulldown-cmark
//! - local image and sound references are queued for upload and flattened
//!   to their basename
//!
//! Conversion never fails. Unmatched delimiters pass through literally.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pulldown_cmark::{html, Event, Options, Parser};
use regex::{Captures, Regex};
use uuid::Uuid;

use crate::types::Span;

static DISPLAY_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$([\s\S]*?)\$\$").expect("valid regex"));
static TARGET_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\\[[\s\S]*?\\\])|(\\\([\s\S]*?\\\))").expect("valid regex"));
static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").expect("valid regex"));
static HIGHLIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"==([^=\n](?:[^\n]*?[^=\n])?)==").expect("valid regex"));
static IMAGE_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^>]*?\ssrc="([^"]*)""#).expect("valid regex"));
static SOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[sound:(.+?)\]").expect("valid regex"));
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://").expect("valid regex"));

const PARA_OPEN: &str = "<p>";
const PARA_CLOSE: &str = "</p>";

/// Run-scoped record of media files: what the service already has and what
/// still has to be uploaded.
#[derive(Debug, Clone, Default)]
pub struct MediaState {
    uploaded: HashSet<String>,
    pending: BTreeMap<String, PathBuf>,
}

impl MediaState {
    pub fn new(uploaded: impl IntoIterator<Item = String>) -> Self {
        Self {
            uploaded: uploaded.into_iter().collect(),
            pending: BTreeMap::new(),
        }
    }

    /// Queue a file for upload under `name`. Returns false when the name is
    /// already uploaded or pending.
    pub fn queue(&mut self, name: &str, path: PathBuf) -> bool {
        if self.uploaded.contains(name) || self.pending.contains_key(name) {
            return false;
        }
        self.pending.insert(name.to_string(), path);
        true
    }

    pub fn pending(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.pending.iter().map(|(n, p)| (n.as_str(), p.as_path()))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn drop_pending(&mut self, name: &str) {
        self.pending.remove(name);
    }

    /// Move every pending file into the uploaded record.
    pub fn commit(&mut self) -> Vec<String> {
        let names: Vec<String> = std::mem::take(&mut self.pending).into_keys().collect();
        self.uploaded.extend(names.iter().cloned());
        names
    }

    pub fn uploaded(&self) -> &HashSet<String> {
        &self.uploaded
    }
}

/// Converts field text, queuing referenced media into a [`MediaState`].
pub struct MarkupConverter<'a> {
    media: &'a mut MediaState,
    base_dir: &'a Path,
    highlights_to_cloze: bool,
}

impl<'a> MarkupConverter<'a> {
    /// `base_dir` is the directory relative media paths are resolved against.
    pub fn new(media: &'a mut MediaState, base_dir: &'a Path) -> Self {
        Self {
            media,
            base_dir,
            highlights_to_cloze: false,
        }
    }

    pub fn with_highlights_to_cloze(mut self, enabled: bool) -> Self {
        self.highlights_to_cloze = enabled;
        self
    }

    /// Convert one field. `cloze` turns on curly-brace cloze translation.
    pub fn convert(&mut self, text: &str, cloze: bool) -> String {
        let text = source_math_to_target(text);

        let nonce = Uuid::new_v4().simple().to_string();
        let (text, math) = censor_regex(&text, &TARGET_MATH, &sentinel_prefix("MATH", &nonce));
        let (text, fenced) = censor_regex(&text, &FENCED_CODE, &sentinel_prefix("FENCE", &nonce));
        let (text, inline) = censor_spans(
            &text,
            &inline_code_spans(&text),
            &sentinel_prefix("CODE", &nonce),
        );

        let text = if cloze {
            let text = if self.highlights_to_cloze {
                HIGHLIGHT.replace_all(&text, "{$1}").into_owned()
            } else {
                text
            };
            curly_to_cloze(&text)
        } else {
            text
        };

        let text = restore(&text, &sentinel_prefix("CODE", &nonce), &inline, |s| s.to_string());
        let text = restore(&text, &sentinel_prefix("FENCE", &nonce), &fenced, |s| s.to_string());
        let html = render_markdown(&text);
        let html = restore(&html, &sentinel_prefix("MATH", &nonce), &math, |s| {
            html_escape::encode_text(s).into_owned()
        });

        let html = self.collect_media(&html);
        strip_paragraph(html.trim()).to_string()
    }

    fn collect_media(&mut self, html: &str) -> String {
        let html = IMAGE_SRC.replace_all(html, |caps: &Captures| self.flatten(caps));
        SOUND
            .replace_all(&html, |caps: &Captures| self.flatten(caps))
            .into_owned()
    }

    fn flatten(&mut self, caps: &Captures) -> String {
        let whole = &caps[0];
        let reference = &caps[1];
        if URL.is_match(reference) {
            return whole.to_string();
        }

        let decoded = urlencoding::decode(reference)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| reference.to_string());
        let Some(name) = Path::new(&decoded)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            return whole.to_string();
        };

        let path = self.base_dir.join(&decoded);
        if self.media.queue(&name, path) {
            tracing::debug!(file = %name, "queued media upload");
        }

        whole.replacen(reference, &name, 1)
    }
}

/// Translate `$$x$$` and `$x$` into `\[x\]` and `\(x\)`.
pub fn source_math_to_target(text: &str) -> String {
    let text = DISPLAY_MATH.replace_all(text, |caps: &Captures| {
        if caps[1].trim().is_empty() {
            caps[0].to_string()
        } else {
            format!(r"\[{}\]", &caps[1])
        }
    });

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in inline_math_spans(&text) {
        out.push_str(&text[last..span.start]);
        out.push_str(r"\(");
        out.push_str(&text[span.start + 1..span.end - 1]);
        out.push_str(r"\)");
        last = span.end;
    }
    out.push_str(&text[last..]);
    out
}

/// Spans of `$x$` inline math.
///
/// The opening `$` is not preceded by another `$` and is followed by a
/// character that is neither whitespace nor `$`. The closing `$` is the first
/// one after that which follows a non-whitespace character.
pub fn inline_math_spans(text: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' || (i > 0 && bytes[i - 1] == b'$') {
            i += 1;
            continue;
        }
        let Some(first) = text[i + 1..].chars().next() else {
            break;
        };
        if first.is_whitespace() || first == '$' {
            i += 1;
            continue;
        }

        let from = i + 1 + first.len_utf8();
        let close = text[from..].char_indices().find_map(|(offset, c)| {
            let at = from + offset;
            let prev = text[..at].chars().next_back();
            (c == '$' && prev.is_some_and(|p| !p.is_whitespace())).then_some(at)
        });
        match close {
            Some(end) => {
                spans.push(Span::new(i, end + 1));
                i = end + 1;
            }
            None => i += 1,
        }
    }
    spans
}

/// Spans of `$$x$$` display math.
pub fn display_math_spans(text: &str) -> Vec<Span> {
    DISPLAY_MATH.find_iter(text).map(Span::from).collect()
}

/// Spans of single-backtick inline code.
pub fn inline_code_spans(text: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let opens = bytes[i] == b'`'
            && (i == 0 || bytes[i - 1] != b'`')
            && bytes[i + 1] != b'`';
        if !opens {
            i += 1;
            continue;
        }
        match bytes[i + 2..].iter().position(|&b| b == b'`') {
            Some(offset) => {
                let end = i + 2 + offset + 1;
                spans.push(Span::new(i, end));
                i = end;
            }
            None => break,
        }
    }
    spans
}

/// Spans of triple-backtick fenced code.
pub fn fenced_code_spans(text: &str) -> Vec<Span> {
    FENCED_CODE.find_iter(text).map(Span::from).collect()
}

/// Every math and code region of `text`.
pub fn protected_spans(text: &str) -> Vec<Span> {
    let mut spans = inline_math_spans(text);
    spans.extend(display_math_spans(text));
    spans.extend(inline_code_spans(text));
    spans.extend(fenced_code_spans(text));
    spans
}

/// Translate `{x}`, `{2:x}`, `{c2:x}` and `{2|x}` spans into `{{cN::x}}`.
///
/// Spans without an explicit number are numbered from 1 within this call.
pub fn curly_to_cloze(text: &str) -> String {
    let mut next_unset = 1;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut search = 0;

    while let Some(offset) = text[search..].find('{') {
        let open = search + offset;
        match cloze_at(text, open) {
            Some(cloze) => {
                out.push_str(&text[last..open]);
                let number = match cloze.number {
                    Some(n) => n.to_string(),
                    None => {
                        let n = next_unset;
                        next_unset += 1;
                        n.to_string()
                    }
                };
                out.push_str(&format!("{{{{c{number}::{}}}}}", cloze.content));
                last = cloze.end;
                search = cloze.end;
            }
            None => search = open + 1,
        }
    }
    out.push_str(&text[last..]);
    out
}

struct ClozeMatch<'t> {
    number: Option<&'t str>,
    content: &'t str,
    end: usize,
}

fn cloze_at(text: &str, open: usize) -> Option<ClozeMatch<'_>> {
    let bytes = text.as_bytes();
    if open > 0 && bytes[open - 1] == b'{' {
        return None;
    }
    let after = open + 1;

    if let Some((number, content_start)) = cloze_label(text, after) {
        if let Some((content, end)) = cloze_body(text, content_start) {
            return Some(ClozeMatch {
                number: Some(number),
                content,
                end,
            });
        }
    }

    let (content, end) = cloze_body(text, after)?;
    Some(ClozeMatch {
        number: None,
        content,
        end,
    })
}

/// `c?digits` followed by `:` or `|`.
fn cloze_label(text: &str, at: usize) -> Option<(&str, usize)> {
    let rest = &text[at..];
    let digits_from = usize::from(rest.starts_with('c'));
    let digits = rest[digits_from..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    let sep = digits_from + digits;
    match rest.as_bytes().get(sep) {
        Some(b':') | Some(b'|') => Some((&rest[digits_from..sep], at + sep + 1)),
        _ => None,
    }
}

/// Content from `start` up to the first lone `}`.
fn cloze_body(text: &str, start: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    match bytes.get(start) {
        None | Some(b'{') | Some(b'\n') => return None,
        _ => {}
    }

    let mut k = start + 1;
    while k < bytes.len() {
        if bytes[k] == b'}' && bytes[k - 1] != b'}' && bytes.get(k + 1) != Some(&b'}') {
            let content = &text[start..k];
            if content.contains("\n\n") {
                return None;
            }
            return Some((content, k + 1));
        }
        k += 1;
    }
    None
}

fn sentinel_prefix(kind: &str, nonce: &str) -> String {
    format!("NOTESYNC{kind}{nonce}N")
}

fn sentinel(prefix: &str, index: usize) -> String {
    format!("{prefix}{index}Z")
}

fn censor_regex(text: &str, pattern: &Regex, prefix: &str) -> (String, Vec<String>) {
    let spans: Vec<Span> = pattern.find_iter(text).map(Span::from).collect();
    censor_spans(text, &spans, prefix)
}

fn censor_spans(text: &str, spans: &[Span], prefix: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut originals = Vec::with_capacity(spans.len());
    let mut last = 0;
    for span in spans {
        out.push_str(&text[last..span.start]);
        out.push_str(&sentinel(prefix, originals.len()));
        originals.push(text[span.start..span.end].to_string());
        last = span.end;
    }
    out.push_str(&text[last..]);
    (out, originals)
}

fn restore(text: &str, prefix: &str, originals: &[String], f: impl Fn(&str) -> String) -> String {
    originals
        .iter()
        .enumerate()
        .fold(text.to_string(), |acc, (index, original)| {
            acc.replacen(&sentinel(prefix, index), &f(original), 1)
        })
}

/// Render markdown to HTML with tables, footnotes and strikethrough, keeping
/// single newlines as line breaks.
fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(text, options).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Remove one wrapping paragraph so single-paragraph fields render inline.
fn strip_paragraph(html: &str) -> &str {
    match html
        .strip_prefix(PARA_OPEN)
        .and_then(|rest| rest.strip_suffix(PARA_CLOSE))
    {
        Some(inner) if !inner.contains(PARA_OPEN) && !inner.contains(PARA_CLOSE) => inner,
        _ => html,
    }
}
