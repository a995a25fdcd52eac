//! User configuration file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use notesync_core::{ParseErrorPolicy, Settings, Syntax};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub anki: AnkiConfig,
    pub syntax: Syntax,
    pub defaults: Defaults,
    /// Note type → whether curly clozes apply to it.
    pub cloze_note_types: BTreeMap<String, bool>,
    /// Note type → custom pattern. Blank entries are ignored.
    pub custom_regexps: BTreeMap<String, String>,
    pub folders: Folders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnkiConfig {
    pub url: String,
    /// Executable to launch when the service is not reachable.
    pub path: String,
    pub profile: String,
    pub connect_timeout_secs: u64,
}

impl Default for AnkiConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8765".to_string(),
            path: String::new(),
            profile: String::new(),
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub tags: Vec<String>,
    pub deck: String,
    pub curly_cloze: bool,
    pub highlights_to_cloze: bool,
    pub regex: bool,
    pub id_comments: bool,
    pub vault_name: String,
    pub add_file_link: bool,
    pub preserve_external_tags: bool,
    pub on_parse_error: ParseErrorPolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            tags: settings.default_tags,
            deck: settings.default_deck,
            curly_cloze: settings.curly_cloze,
            highlights_to_cloze: settings.highlights_to_cloze,
            regex: settings.regex_mode,
            id_comments: settings.id_comments,
            vault_name: String::new(),
            add_file_link: settings.add_file_link,
            preserve_external_tags: settings.preserve_external_tags,
            on_parse_error: settings.on_parse_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Folders {
    /// Glob patterns, relative to the scan root, of paths to skip.
    pub ignore: Vec<String>,
    pub extensions: Vec<String>,
    /// Folder relative to the scan root → deck for files without a target
    /// deck line. The nearest configured ancestor wins.
    pub decks: BTreeMap<String, String>,
    /// Folder relative to the scan root → space separated tags. Tags of every
    /// configured ancestor apply.
    pub tags: BTreeMap<String, String>,
}

impl Default for Folders {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            extensions: vec!["md".to_string(), "txt".to_string()],
            decks: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("notesync")
            .join("config.toml")
    }

    pub fn load_from_path(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Load the config, writing the defaults first if there is none.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if let Some(config) = Self::load_from_path(path)? {
            return Ok(config);
        }
        tracing::info!(path = %path.display(), "creating default config file");
        let config = Self::default();
        config.save_to_path(path)?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_err)
    }

    /// Add entries for note types the config does not know yet. `Cloze` is
    /// always marked as a cloze type; other existing entries are kept.
    pub fn update_note_types<'a>(&mut self, note_types: impl IntoIterator<Item = &'a str>) {
        for name in note_types {
            self.cloze_note_types
                .entry(name.to_string())
                .or_insert(false);
            self.custom_regexps.entry(name.to_string()).or_default();
            if name == "Cloze" {
                self.cloze_note_types.insert(name.to_string(), true);
            }
        }
    }

    /// Engine settings for this config.
    pub fn settings(&self) -> Settings {
        let defaults = &self.defaults;
        let mut cloze_note_types: std::collections::BTreeSet<String> = self
            .cloze_note_types
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone())
            .collect();
        if self.cloze_note_types.is_empty() {
            cloze_note_types = Settings::default().cloze_note_types;
        }

        Settings {
            syntax: self.syntax.clone(),
            default_deck: defaults.deck.clone(),
            default_tags: defaults.tags.clone(),
            curly_cloze: defaults.curly_cloze,
            highlights_to_cloze: defaults.highlights_to_cloze,
            cloze_note_types,
            id_comments: defaults.id_comments,
            regex_mode: defaults.regex,
            custom_patterns: self
                .custom_regexps
                .iter()
                .filter(|(_, pattern)| !pattern.trim().is_empty())
                .map(|(name, pattern)| (name.clone(), pattern.clone()))
                .collect(),
            vault_name: Some(defaults.vault_name.clone()).filter(|name| !name.is_empty()),
            add_file_link: defaults.add_file_link,
            preserve_external_tags: defaults.preserve_external_tags,
            on_parse_error: defaults.on_parse_error,
        }
    }

    /// The launch executable with `~` and environment variables expanded.
    pub fn anki_path(&self) -> Option<PathBuf> {
        if self.anki.path.is_empty() {
            return None;
        }
        Some(expand_path(Path::new(&self.anki.path)))
    }
}

pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
