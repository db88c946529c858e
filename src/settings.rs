//! Settings provider.
//!
//! One JSON file supplies the tracked directories, the exiftool option
//! table, the virtual-tag definition tables and a handful of behavior
//! switches. The engine treats all of it as read-only input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tags;
use crate::types::{CompositeDef, ConditionalCandidate, DatetimeTagDef};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// State of one exiftool command-line option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionState {
    Off,
    On,
    Forced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directories whose first-level files are tracked.
    pub dirs: Vec<PathBuf>,
    /// exiftool executable. Overridden by `EXIFDECK_EXIFTOOL`.
    pub exiftool_path: String,
    /// Option string -> state. `on` and `forced` options are passed on every
    /// gateway call; multi-word options become separate arguments.
    pub exiftool_options: BTreeMap<String, OptionState>,
    /// Save each edit immediately instead of batching.
    pub auto_save: bool,
    /// Offset applied to naive datetimes of non-UTC tags (`+08:00`, `local`).
    pub default_timezone: Option<String>,
    /// Engine log file. Defaults to the data dir when unset.
    pub log_file: Option<PathBuf>,
    pub composite_tags: BTreeMap<String, CompositeDef>,
    pub conditional_tags: BTreeMap<String, Vec<ConditionalCandidate>>,
    pub datetime_tags: BTreeMap<String, DatetimeTagDef>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            exiftool_path: "exiftool".to_string(),
            exiftool_options: BTreeMap::from([
                ("-G".to_string(), OptionState::Forced),
                ("-charset filename=utf8".to_string(), OptionState::On),
                ("-n".to_string(), OptionState::Off),
            ]),
            auto_save: false,
            default_timezone: None,
            log_file: None,
            composite_tags: default_composite_tags(),
            conditional_tags: default_conditional_tags(),
            datetime_tags: default_datetime_tags(),
        }
    }
}

fn default_composite_tags() -> BTreeMap<String, CompositeDef> {
    BTreeMap::from([(
        "DateTimeOriginalAll".to_string(),
        CompositeDef {
            format: "[<EXIF:DateTimeOriginal>][.<EXIF:SubSecTimeOriginal>][<EXIF:OffsetTimeOriginal>]"
                .to_string(),
            pattern: r"^(?P<EXIF_DateTimeOriginal>\d{4}:\d{2}:\d{2} \d{2}:\d{2}:\d{2})(?:\.(?P<EXIF_SubSecTimeOriginal>\d+))?(?P<EXIF_OffsetTimeOriginal>[-+]\d{2}:\d{2})?$"
                .to_string(),
        },
    )])
}

fn default_conditional_tags() -> BTreeMap<String, Vec<ConditionalCandidate>> {
    BTreeMap::from([(
        "DateTime".to_string(),
        vec![
            ConditionalCandidate {
                target: "QuickTime:CreateDate".to_string(),
                condition: "<File:MIMEType>".to_string(),
                pattern: "^video/".to_string(),
            },
            ConditionalCandidate {
                target: "&DateTimeOriginalAll".to_string(),
                condition: "<File:MIMEType>".to_string(),
                pattern: "^image/".to_string(),
            },
            // Fallback: the empty pattern matches anything.
            ConditionalCandidate {
                target: "File:FileModifyDate".to_string(),
                condition: String::new(),
                pattern: String::new(),
            },
        ],
    )])
}

fn default_datetime_tags() -> BTreeMap<String, DatetimeTagDef> {
    let exif = DatetimeTagDef {
        as_utc: false,
        is_timezone_explicit: false,
        support_subsec: false,
    };
    let quicktime = DatetimeTagDef {
        as_utc: true,
        is_timezone_explicit: false,
        support_subsec: false,
    };
    let filesystem = DatetimeTagDef {
        as_utc: false,
        is_timezone_explicit: true,
        support_subsec: false,
    };
    let xmp = DatetimeTagDef {
        as_utc: false,
        is_timezone_explicit: true,
        support_subsec: true,
    };
    BTreeMap::from([
        ("EXIF:DateTimeOriginal".to_string(), exif),
        ("EXIF:CreateDate".to_string(), exif),
        ("EXIF:ModifyDate".to_string(), exif),
        ("QuickTime:CreateDate".to_string(), quicktime),
        ("QuickTime:ModifyDate".to_string(), quicktime),
        ("QuickTime:MediaCreateDate".to_string(), quicktime),
        ("File:FileModifyDate".to_string(), filesystem),
        ("File:FileCreateDate".to_string(), filesystem),
        ("XMP:CreateDate".to_string(), xmp),
        ("XMP:ModifyDate".to_string(), xmp),
        ("Composite:SubSecDateTimeOriginal".to_string(), xmp),
    ])
}

impl Settings {
    /// Settings path: explicit argument, then `EXIFDECK_SETTINGS`, then the
    /// per-user config dir.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var("EXIFDECK_SETTINGS")
            && !path.trim().is_empty()
        {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("exifdeck")
            .join("settings.json")
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the resolved settings file, falling back to built-in defaults
    /// when no file exists. A malformed file is still an error.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let path = Self::resolve_path(explicit);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// exiftool executable, `EXIFDECK_EXIFTOOL` winning over the settings.
    pub fn exiftool_program(&self) -> String {
        match std::env::var("EXIFDECK_EXIFTOOL") {
            Ok(p) if !p.trim().is_empty() => p,
            _ => self.exiftool_path.clone(),
        }
    }

    /// Extra arguments for every gateway call: each `on`/`forced` option,
    /// split on spaces into separate arguments.
    pub fn exiftool_args(&self) -> Vec<String> {
        self.exiftool_options
            .iter()
            .filter(|(_, state)| matches!(state, OptionState::On | OptionState::Forced))
            .flat_map(|(opt, _)| opt.split_whitespace().map(str::to_string))
            .collect()
    }

    /// First-level files of every tracked directory, sorted for stable
    /// indices. Unreadable directories are skipped.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut all = Vec::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    all.push(path);
                }
            }
        }
        all.sort();
        all
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("exifdeck")
                .join("exifdeck.log")
        })
    }

    pub fn composite_def(&self, name: &str) -> Option<&CompositeDef> {
        self.composite_tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, def)| def)
    }

    pub fn conditional_def(&self, name: &str) -> Option<&[ConditionalCandidate]> {
        self.conditional_tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, def)| def.as_slice())
    }

    /// Datetime conventions for a tag, matched by normalized equivalence.
    pub fn datetime_def(&self, tag: &str) -> Option<&DatetimeTagDef> {
        self.datetime_tags
            .iter()
            .find(|(k, _)| tags::is_equal(k, tag))
            .map(|(_, def)| def)
    }

    pub fn is_datetime_tag(&self, tag: &str) -> bool {
        self.datetime_def(tag).is_some()
    }
}
