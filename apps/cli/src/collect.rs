//! Finding the files to sync and their folder-derived options.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use glob::Pattern;
use thiserror::Error;

use notesync_core::DocumentOptions;

use crate::config::Folders;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// A file to scan, with the options its location implies.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub options: DocumentOptions,
}

pub struct Collector<'a> {
    folders: &'a Folders,
    ignore: Vec<Pattern>,
    vault_name: Option<&'a str>,
    recurse: bool,
}

impl<'a> Collector<'a> {
    pub fn new(
        folders: &'a Folders,
        vault_name: Option<&'a str>,
        recurse: bool,
    ) -> Result<Self, CollectError> {
        let ignore = folders
            .ignore
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|source| CollectError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            folders,
            ignore,
            vault_name: vault_name.filter(|name| !name.is_empty()),
            recurse,
        })
    }

    /// Every file to scan under `target`. A file target is returned as is;
    /// a directory is listed, and walked when recursing.
    pub fn collect(&self, target: &Path) -> Result<Vec<SourceFile>, CollectError> {
        let target = fs::canonicalize(target).map_err(|source| CollectError::Io {
            path: target.to_path_buf(),
            source,
        })?;

        if target.is_file() {
            let root = target.parent().unwrap_or(Path::new("/")).to_path_buf();
            return Ok(vec![self.source_file(&root, target)]);
        }

        let mut files = Vec::new();
        self.walk(&target, &target, &mut files)?;
        tracing::debug!(root = %target.display(), count = files.len(), "collected files");
        Ok(files)
    }

    fn walk(&self, root: &Path, dir: &Path, out: &mut Vec<SourceFile>) -> Result<(), CollectError> {
        let io_err = |source| CollectError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if self.is_ignored(root, &path) {
                tracing::debug!(path = %path.display(), "ignored");
                continue;
            }
            let file_type = entry.file_type().map_err(io_err)?;
            if file_type.is_dir() {
                if !is_hidden(&path) {
                    dirs.push(path);
                }
            } else if self.has_supported_extension(&path) {
                files.push(path);
            }
        }

        files.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
        out.extend(files.into_iter().map(|path| self.source_file(root, path)));

        if self.recurse {
            dirs.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
            for sub in dirs {
                self.walk(root, &sub, out)?;
            }
        }
        Ok(())
    }

    fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.ignore.iter().any(|pattern| pattern.matches_path(relative))
    }

    fn has_supported_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.folders.extensions.iter().any(|e| e == ext))
    }

    fn source_file(&self, root: &Path, path: PathBuf) -> SourceFile {
        let folder = path
            .parent()
            .and_then(|parent| parent.strip_prefix(root).ok())
            .map(folder_key)
            .unwrap_or_default();
        let options = DocumentOptions {
            deck: folder_deck(self.folders, &folder),
            tags: folder_tags(self.folders, &folder),
            url: self.vault_name.and_then(|vault| vault_url(vault, &path)),
        };
        SourceFile { path, options }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `a/b/c` style key for a relative folder. The scan root is `""`.
fn folder_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `folder` and each of its ancestors, nearest first, ending with the root.
fn ancestors(folder: &str) -> Vec<&str> {
    let mut out = vec![folder];
    let mut rest = folder;
    while let Some(idx) = rest.rfind('/') {
        rest = &rest[..idx];
        out.push(rest);
    }
    if !folder.is_empty() {
        out.push("");
    }
    out
}

fn folder_deck(folders: &Folders, folder: &str) -> Option<String> {
    ancestors(folder)
        .into_iter()
        .find_map(|key| folders.decks.get(key))
        .filter(|deck| !deck.is_empty())
        .cloned()
}

fn folder_tags(folders: &Folders, folder: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for key in ancestors(folder).into_iter().rev() {
        if let Some(line) = folders.tags.get(key) {
            for tag in line.split_whitespace() {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
        }
    }
    tags
}

/// Link that opens `path` in its vault, if the path lies inside a folder
/// named after the vault.
pub fn vault_url(vault: &str, path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let start = parts.iter().rposition(|part| part == vault)?;
    let file = parts[start + 1..].join("/");
    if file.is_empty() {
        return None;
    }
    Some(format!(
        "obsidian://open?vault={}&file={}",
        urlencoding::encode(vault),
        urlencoding::encode(&file)
    ))
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk<'a> {
    Digits(&'a str),
    Text(String),
}

fn chunks(name: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = name.as_bytes();
    while start < bytes.len() {
        let digit = bytes[start].is_ascii_digit();
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() == digit {
            end += 1;
        }
        // Digit runs are ASCII, so both ends sit on char boundaries.
        let part = &name[start..end];
        out.push(if digit {
            Chunk::Digits(part.trim_start_matches('0'))
        } else {
            Chunk::Text(part.to_lowercase())
        });
        start = end;
    }
    out
}

/// Compare file names so `note2` sorts before `note10`, ignoring case.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (left, right) = (chunks(a), chunks(b));
    for (x, y) in left.iter().zip(&right) {
        let ord = match (x, y) {
            (Chunk::Digits(x), Chunk::Digits(y)) => x.len().cmp(&y.len()).then_with(|| x.cmp(y)),
            (Chunk::Text(x), Chunk::Text(y)) => x.cmp(y),
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn names(files: &[SourceFile], root: &Path) -> Vec<String> {
        let root = fs::canonicalize(root).unwrap();
        files
            .iter()
            .map(|f| folder_key(f.path.strip_prefix(&root).unwrap()))
            .collect()
    }

    #[test]
    fn natural_order() {
        let mut names = vec!["note10.md", "Note2.md", "note1.md", "apple.md"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["apple.md", "note1.md", "Note2.md", "note10.md"]);
    }

    #[test]
    fn lists_supported_files_only() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.md");
        touch(dir.path(), "a.txt");
        touch(dir.path(), "c.pdf");
        touch(dir.path(), "sub/d.md");

        let folders = Folders::default();
        let files = Collector::new(&folders, None, false)
            .unwrap()
            .collect(dir.path())
            .unwrap();

        assert_eq!(names(&files, dir.path()), vec!["a.txt", "b.md"]);
    }

    #[test]
    fn recursion_skips_hidden_and_ignored() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.md");
        touch(dir.path(), "sub/inner.md");
        touch(dir.path(), ".obsidian/hidden.md");
        touch(dir.path(), "templates/t.md");
        touch(dir.path(), "sub/draft-1.md");

        let folders = Folders {
            ignore: vec!["templates".to_string(), "**/draft-*".to_string()],
            ..Folders::default()
        };
        let files = Collector::new(&folders, None, true)
            .unwrap()
            .collect(dir.path())
            .unwrap();

        assert_eq!(names(&files, dir.path()), vec!["top.md", "sub/inner.md"]);
    }

    #[test]
    fn folder_decks_and_tags() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "maths/algebra/groups.md");
        touch(dir.path(), "history/rome.md");

        let mut folders = Folders::default();
        folders.decks.insert("maths".to_string(), "Maths".to_string());
        folders.tags.insert("".to_string(), "vault".to_string());
        folders.tags.insert("maths".to_string(), "maths".to_string());
        folders
            .tags
            .insert("maths/algebra".to_string(), "algebra maths".to_string());

        let files = Collector::new(&folders, None, true)
            .unwrap()
            .collect(dir.path())
            .unwrap();

        let rome = files.iter().find(|f| f.path.ends_with("rome.md")).unwrap();
        assert_eq!(rome.options.deck, None);
        assert_eq!(rome.options.tags, vec!["vault"]);

        let groups = files.iter().find(|f| f.path.ends_with("groups.md")).unwrap();
        assert_eq!(groups.options.deck.as_deref(), Some("Maths"));
        assert_eq!(groups.options.tags, vec!["vault", "maths", "algebra"]);
    }

    #[test]
    fn single_file_target() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "only.md");
        let folders = Folders::default();

        let files = Collector::new(&folders, None, false)
            .unwrap()
            .collect(&dir.path().join("only.md"))
            .unwrap();

        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("only.md"));
    }

    #[test]
    fn vault_links() {
        assert_eq!(
            vault_url("My Vault", Path::new("/home/u/My Vault/dir/a b.md")).as_deref(),
            Some("obsidian://open?vault=My%20Vault&file=dir%2Fa%20b.md")
        );
        assert_eq!(vault_url("Vault", Path::new("/elsewhere/a.md")), None);
    }

    #[test]
    fn ancestors_end_at_root() {
        assert_eq!(ancestors("a/b"), vec!["a/b", "a", ""]);
        assert_eq!(ancestors(""), vec![""]);
    }
}
