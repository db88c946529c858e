//! Per-file metadata cache and edit reconciliation.
//!
//! Each tracked file owns a [`FileRecord`] with three layers: `saved` is the
//! last known on-disk truth keyed by exiftool's raw qualified tag names,
//! `edited` holds pending user edits keyed by normalized tag, and `failed`
//! holds edits the tool rejected on a previous save. Whether an edit
//! actually took effect is decided in exactly one place: the post-write
//! re-read-and-diff in [`MetadataCache::save_file`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde_json::Value;

use crate::datetime::{self, Instant};
use crate::gateway::{Gateway, SOURCE_FILE_TAG, WARNING_TAG};
use crate::log::Log;
use crate::resolve;
use crate::settings::Settings;
use crate::tags;
use crate::types::{CastKind, EditStatus, TagAddress, TagMap};

pub const FILENAME_TAG: &str = "File:FileName";
pub const DIRECTORY_TAG: &str = "File:Directory";

/// Depth bound for conditional/composite recursion. Definition tables are
/// user-supplied and may accidentally cycle.
const MAX_RESOLVE_DEPTH: usize = 8;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        eprintln!("[data] record mutex poisoned, recovering");
        e.into_inner()
    })
}

/// One tracked file: three parallel tag maps plus the current path.
#[derive(Debug, Default)]
pub struct FileRecord {
    pub source_path: PathBuf,
    /// Last known on-disk truth, raw qualified keys.
    pub saved: TagMap,
    /// Pending edits, normalized keys, string values.
    pub edited: TagMap,
    /// Rejected edits, normalized keys, string values. A tag present here
    /// with a given value means the last write of that value did not take.
    pub failed: TagMap,
}

/// Resolved view of one tag for presentation: the saved value, the pending
/// edit overlay, and the combined edit status.
#[derive(Debug, Clone, PartialEq)]
pub struct TagView {
    pub value: Option<String>,
    pub edited: Option<String>,
    pub status: EditStatus,
}

pub struct MetadataCache {
    settings: Settings,
    gateway: Box<dyn Gateway>,
    log: Log,
    records: Vec<Mutex<FileRecord>>,
}

impl MetadataCache {
    /// Build the cache with one gateway read per tracked file. A failed read
    /// produces an empty-but-valid record so downstream code never sees a
    /// missing entry.
    pub fn load(settings: Settings, gateway: Box<dyn Gateway>, log: Log) -> Self {
        let mut cache = Self {
            settings,
            gateway,
            log,
            records: Vec::new(),
        };
        cache.reload();
        cache
    }

    /// Discard every record and re-read the tracked directories. Pending and
    /// failed edits do not survive a reload.
    pub fn reload(&mut self) {
        let extra = self.settings.exiftool_args();
        let mut records = Vec::new();
        for path in self.settings.files() {
            let mut saved = match self.gateway.read_tags(&path, None, &extra) {
                Ok(map) => map,
                Err(e) => {
                    self.log
                        .append("error", &path.display().to_string(), &format!("read failed: {e}"));
                    let mut empty = TagMap::new();
                    empty.insert(
                        SOURCE_FILE_TAG.to_string(),
                        Value::String(path.display().to_string()),
                    );
                    empty
                }
            };
            self.fix_base64_paths(&mut saved, &path);
            let source_path = tags::get(&saved, SOURCE_FILE_TAG, false)
                .map(|v| PathBuf::from(tags::to_display(v)))
                .unwrap_or_else(|| path.clone());
            records.push(Mutex::new(FileRecord {
                source_path,
                saved,
                edited: TagMap::new(),
                failed: TagMap::new(),
            }));
        }
        tracing::info!(files = records.len(), "metadata cache loaded");
        self.records = records;
    }

    /// exiftool encodes values it cannot render in the system charset as
    /// `base64:...`. Path-bearing tags must be usable as real paths, so they
    /// are decoded to UTF-8 at load time; undecodable values stay raw.
    fn fix_base64_paths(&self, map: &mut TagMap, path: &Path) {
        for tag in [SOURCE_FILE_TAG, FILENAME_TAG, DIRECTORY_TAG] {
            let Some(raw) = tags::get(map, tag, false).map(tags::to_display) else {
                continue;
            };
            let Some(encoded) = raw.strip_prefix("base64:") else {
                continue;
            };
            match BASE64.decode(encoded).map(String::from_utf8) {
                Ok(Ok(decoded)) => tags::set(map, tag, Value::String(decoded), false),
                _ => self.log.append(
                    "warning",
                    &path.display().to_string(),
                    &format!("undecodable base64 value in {tag}"),
                ),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn file_path(&self, idx: usize) -> Option<PathBuf> {
        self.records
            .get(idx)
            .map(|r| lock_or_recover(r).source_path.clone())
    }

    /// Index of the record currently at `path`, if tracked.
    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.records
            .iter()
            .position(|r| lock_or_recover(r).source_path == path)
    }

    /// Run `f` against a record under its lock. Presentation shells use this
    /// to walk the raw tag maps.
    pub fn with_record<R>(&self, idx: usize, f: impl FnOnce(&FileRecord) -> R) -> Option<R> {
        self.records.get(idx).map(|r| f(&lock_or_recover(r)))
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Resolved display value of a tag address, or `default` when absent.
    pub fn get(&self, idx: usize, tag: &str, default: &str) -> String {
        self.get_with(idx, tag, default, false)
    }

    pub fn get_with(&self, idx: usize, tag: &str, default: &str, strict: bool) -> String {
        let Some(record) = self.records.get(idx) else {
            return default.to_string();
        };
        let record = lock_or_recover(record);
        self.value_of(&record, tag, strict, 0)
            .map_or_else(|| default.to_string(), |v| tags::to_display(&v))
    }

    /// Saved value, edit overlay and status of one tag address.
    pub fn view(&self, idx: usize, tag: &str) -> TagView {
        let absent = TagView {
            value: None,
            edited: None,
            status: Some(true),
        };
        let Some(record) = self.records.get(idx) else {
            return absent;
        };
        let record = lock_or_recover(record);
        self.view_inner(&record, tag, 0)
    }

    fn view_inner(&self, record: &FileRecord, tag: &str, depth: usize) -> TagView {
        match TagAddress::parse(tag) {
            TagAddress::Normal(name) => {
                let norm = tags::normalize(&name);
                TagView {
                    value: tags::get(&record.saved, &name, false).map(tags::to_display),
                    edited: record.edited.get(&norm).map(tags::to_display),
                    status: self.tag_status(record, &norm),
                }
            }
            TagAddress::Conditional(name) => match self.resolve_conditional(record, &name, depth) {
                Some(target) if depth < MAX_RESOLVE_DEPTH => {
                    self.view_inner(record, &target, depth + 1)
                }
                _ => TagView {
                    value: None,
                    edited: None,
                    status: Some(true),
                },
            },
            TagAddress::Composite(name) => self.composite_read(record, &name, depth),
            TagAddress::Cast { kind, inner } => TagView {
                value: self
                    .cast_read(record, kind, &inner, depth)
                    .map(|v| tags::to_display(&v)),
                edited: None,
                status: Some(true),
            },
        }
    }

    /// Saved-layer value of any tag address. `strict` only applies to normal
    /// tags; virtual addresses have no raw key to match exactly.
    fn value_of(
        &self,
        record: &FileRecord,
        tag: &str,
        strict: bool,
        depth: usize,
    ) -> Option<Value> {
        if depth > MAX_RESOLVE_DEPTH {
            self.log.append(
                "warning",
                &record.source_path.display().to_string(),
                &format!("tag resolution too deep at {tag}"),
            );
            return None;
        }
        match TagAddress::parse(tag) {
            TagAddress::Normal(name) => tags::get(&record.saved, &name, strict).cloned(),
            TagAddress::Conditional(name) => {
                let target = self.resolve_conditional(record, &name, depth)?;
                self.value_of(record, &target, false, depth + 1)
            }
            TagAddress::Composite(name) => self
                .composite_read(record, &name, depth)
                .value
                .map(Value::String),
            TagAddress::Cast { kind, inner } => self.cast_read(record, kind, &inner, depth),
        }
    }

    fn display_value(&self, record: &FileRecord, tag: &str, depth: usize) -> String {
        self.value_of(record, tag, false, depth)
            .map(|v| tags::to_display(&v))
            .unwrap_or_default()
    }

    /// Edit-overlay value: the pending edit when present, else saved.
    fn effective_value(&self, record: &FileRecord, tag: &str, depth: usize) -> String {
        let norm = tags::normalize(tag);
        match record.edited.get(&norm) {
            Some(v) => tags::to_display(v),
            None => self.display_value(record, tag, depth),
        }
    }

    /// Edit status of one normalized tag: `Some(true)` when nothing is
    /// pending or the edit matches saved, `Some(false)` when it matches the
    /// known-rejected value, `None` while in flight.
    fn tag_status(&self, record: &FileRecord, norm: &str) -> EditStatus {
        let Some(edited) = record.edited.get(norm) else {
            return Some(true);
        };
        let edited = tags::to_display(edited);
        let saved = tags::get_or(&record.saved, norm, "", false);
        if edited == saved {
            return Some(true);
        }
        match record.failed.get(norm) {
            Some(failed) if tags::to_display(failed) == edited => Some(false),
            _ => None,
        }
    }

    /// First-match-wins resolution of a conditional tag to its target
    /// address string. `None` means "tag absent for this file".
    fn resolve_conditional(
        &self,
        record: &FileRecord,
        name: &str,
        depth: usize,
    ) -> Option<String> {
        if depth > MAX_RESOLVE_DEPTH {
            return None;
        }
        let candidates = self.settings.conditional_def(name)?;
        for candidate in candidates {
            let substituted = resolve::substitute(&candidate.condition, |tag| {
                self.display_value(record, tag, depth + 1)
            });
            let re = match Regex::new(&candidate.pattern) {
                Ok(re) => re,
                Err(e) => {
                    self.log.append(
                        "error",
                        &record.source_path.display().to_string(),
                        &format!("bad condition pattern for ?{name}: {e}"),
                    );
                    continue;
                }
            };
            if re.is_match(&substituted) {
                return match TagAddress::parse(&candidate.target) {
                    TagAddress::Conditional(inner) => {
                        self.resolve_conditional(record, &inner, depth + 1)
                    }
                    _ => Some(candidate.target.clone()),
                };
            }
        }
        None
    }

    /// Composite read: display value over saved, overlay over edited, and
    /// the combined per-placeholder status.
    fn composite_read(&self, record: &FileRecord, name: &str, depth: usize) -> TagView {
        let Some(def) = self.settings.composite_def(name) else {
            return TagView {
                value: None,
                edited: None,
                status: Some(true),
            };
        };
        let value = resolve::compose(&def.format, |tag| {
            self.display_value(record, tag, depth + 1)
        });
        let edited = resolve::compose(&def.format, |tag| {
            self.effective_value(record, tag, depth + 1)
        });
        let status = resolve::combine_status(
            resolve::placeholders(&def.format)
                .into_iter()
                .map(|tag| self.tag_status(record, &tags::normalize(tag))),
        );
        TagView {
            value,
            edited,
            status,
        }
    }

    fn cast_read(
        &self,
        record: &FileRecord,
        kind: CastKind,
        inner: &str,
        depth: usize,
    ) -> Option<Value> {
        match kind {
            CastKind::Datetime => {
                let raw = self.value_of(record, inner, false, depth + 1)?;
                let instant = self.parse_tag_datetime(record, inner, &tags::to_display(&raw))?;
                Some(Value::String(datetime::format_instant(&instant)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Datetime interpretation
    // -----------------------------------------------------------------------

    /// Read and interpret a tag's value as an instant: parse, then attach an
    /// offset per the tag's conventions — implicit UTC first, the configured
    /// default timezone second, naive (logged) last.
    pub fn get_datetime(&self, idx: usize, tag: &str) -> Option<Instant> {
        let record = self.records.get(idx)?;
        let record = lock_or_recover(record);
        let raw = self.value_of(&record, tag, false, 0)?;
        self.parse_tag_datetime(&record, tag, &tags::to_display(&raw))
    }

    fn parse_tag_datetime(
        &self,
        record: &FileRecord,
        tag: &str,
        value: &str,
    ) -> Option<Instant> {
        let file = record.source_path.display().to_string();
        let Some(mut instant) = datetime::parse_instant(value) else {
            if self.settings.is_datetime_tag(tag) {
                self.log
                    .append("warning", &file, &format!("unparsable timestamp in {tag}: {value}"));
            }
            return None;
        };

        let Some(def) = self.settings.datetime_def(tag) else {
            if instant.offset.is_none() {
                self.log.append(
                    "warning",
                    &file,
                    &format!("no datetime conventions for {tag}; passing naive value through"),
                );
            }
            return Some(instant);
        };

        if instant.offset.is_none() && def.as_utc {
            instant.offset = chrono::FixedOffset::east_opt(0);
        }
        if instant.offset.is_none()
            && let Some(tz) = self
                .settings
                .default_timezone
                .as_deref()
                .and_then(datetime::resolve_timezone)
        {
            instant.offset = Some(tz);
            self.log.append(
                "warning",
                &file,
                &format!(
                    "naive value in {tag} defaulted to {}",
                    datetime::format_offset(tz)
                ),
            );
        }
        if instant.offset.is_none() {
            self.log
                .append("warning", &file, &format!("naive datetime in {tag} tolerated"));
        }
        Some(instant)
    }

    /// Apply a destination tag's conventions to an instant before
    /// serialization: UTC coercion, offset stripping, sub-second support.
    pub fn format_for_tag(&self, file: &str, tag: &str, instant: Instant) -> String {
        let Some(def) = self.settings.datetime_def(tag) else {
            self.log.append(
                "warning",
                file,
                &format!("no datetime conventions for {tag}; writing value as parsed"),
            );
            return datetime::format_instant(&instant);
        };
        let mut instant = instant;
        if def.as_utc && instant.offset.is_some() {
            instant = instant.into_utc();
        }
        if !def.is_timezone_explicit && instant.offset.is_some() {
            instant.offset = None;
            self.log.append(
                "warning",
                file,
                &format!("{tag} cannot carry a timezone; offset dropped"),
            );
        }
        if !def.support_subsec && instant.subsec_digits != Some(0) {
            if instant.naive.and_utc().timestamp_subsec_micros() != 0 {
                self.log.append(
                    "warning",
                    file,
                    &format!("{tag} cannot carry sub-seconds; rounding to whole seconds"),
                );
            }
            instant.subsec_digits = Some(0);
        }
        datetime::format_instant(&instant)
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    /// Stage an edit. Empty or whitespace-bearing tag names are caller bugs
    /// and ignored. Composite addresses fan out, conditional addresses
    /// resolve once, cast addresses are read-only and dropped.
    pub fn edit(&self, idx: usize, tag: &str, value: &str, auto_save: bool) {
        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return;
        }
        let Some(record) = self.records.get(idx) else {
            return;
        };

        let assignments = {
            let record = lock_or_recover(record);
            self.expand_edit(&record, tag, value, 0)
        };
        if assignments.is_empty() {
            return;
        }

        // Anti-duplicate rename resolution runs unlocked: it scans the other
        // records and must not hold this record's lock while doing so.
        let assignments: Vec<(String, String)> = assignments
            .into_iter()
            .map(|(t, v)| {
                if tags::is_equal(&t, FILENAME_TAG) {
                    let unique = self.dedupe_rename(idx, v);
                    (t, unique)
                } else {
                    (t, v)
                }
            })
            .collect();

        {
            let mut record = lock_or_recover(record);
            for (t, v) in assignments {
                record.edited.insert(tags::normalize(&t), Value::String(v));
            }
        }

        if auto_save {
            self.save_file(idx);
        }
    }

    /// Expand a tag address into concrete `(tag, value)` assignments.
    fn expand_edit(
        &self,
        record: &FileRecord,
        tag: &str,
        value: &str,
        depth: usize,
    ) -> Vec<(String, String)> {
        if depth > MAX_RESOLVE_DEPTH {
            return Vec::new();
        }
        let file = record.source_path.display().to_string();
        match TagAddress::parse(tag) {
            TagAddress::Normal(name) => vec![(name, value.to_string())],
            TagAddress::Conditional(name) => match self.resolve_conditional(record, &name, depth) {
                Some(target) => self.expand_edit(record, &target, value, depth + 1),
                None => Vec::new(),
            },
            TagAddress::Composite(name) => {
                let Some(def) = self.settings.composite_def(&name) else {
                    return Vec::new();
                };
                let pattern = match Regex::new(&def.pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        self.log
                            .append("error", &file, &format!("bad pattern for &{name}: {e}"));
                        return Vec::new();
                    }
                };
                match resolve::decompose(&def.format, &pattern, value) {
                    Some(parts) => parts
                        .into_iter()
                        .flat_map(|(t, v)| self.expand_edit(record, &t, &v, depth + 1))
                        .collect(),
                    None => {
                        self.log.append(
                            "warning",
                            &file,
                            &format!("value does not match &{name} pattern: {value}"),
                        );
                        Vec::new()
                    }
                }
            }
            // Cast tags are read-only views.
            TagAddress::Cast { .. } => Vec::new(),
        }
    }

    /// Keep simultaneous pending renames from colliding: append `_N` to the
    /// stem until no *other* file's pending rename carries the same name.
    fn dedupe_rename(&self, idx: usize, candidate: String) -> String {
        let norm = tags::normalize(FILENAME_TAG);
        let pending: Vec<String> = self
            .records
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .filter_map(|(_, r)| lock_or_recover(r).edited.get(&norm).map(tags::to_display))
            .collect();

        if !pending.contains(&candidate) {
            return candidate;
        }
        let (stem, ext) = match candidate.rfind('.') {
            Some(dot) => (&candidate[..dot], &candidate[dot..]),
            None => (candidate.as_str(), ""),
        };
        let mut n = 1;
        loop {
            let next = format!("{stem}_{n}{ext}");
            if !pending.contains(&next) {
                return next;
            }
            n += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Saving and reconciliation
    // -----------------------------------------------------------------------

    /// Save every file. Outcomes are independent per file; inspect each
    /// record's `failed` layer afterwards.
    pub fn save(&self) {
        for idx in 0..self.records.len() {
            self.save_file(idx);
        }
    }

    /// Write one file's unsaved edits and reconcile against a re-read.
    ///
    /// The record stays locked for the whole operation: edits and saves of
    /// the same file never interleave, while other files proceed freely.
    pub fn save_file(&self, idx: usize) {
        let Some(record) = self.records.get(idx) else {
            return;
        };
        let mut record = lock_or_recover(record);

        let unsaved = self.unsaved_tags(&record);
        if unsaved.is_empty() {
            return;
        }

        let path = record.source_path.clone();
        let file = path.display().to_string();
        let extra = self.settings.exiftool_args();

        if let Err(e) = self.gateway.write_tags(&path, &unsaved, &extra) {
            // Not fatal: the re-read below establishes what actually stuck.
            self.log
                .append("error", &file, &format!("write failed: {e}"));
        }

        let read_path = match self.renamed_path(&record, &unsaved) {
            Some(new_path) if new_path != path => {
                if new_path.exists() {
                    new_path
                } else {
                    self.log.append(
                        "warning",
                        &file,
                        &format!(
                            "rename target {} not on disk; keeping original path",
                            new_path.display()
                        ),
                    );
                    path.clone()
                }
            }
            _ => path.clone(),
        };

        let mut query: Vec<String> = unsaved.iter().map(|(t, _)| t.clone()).collect();
        query.push(WARNING_TAG.to_string());
        let reread = match self.gateway.read_tags(&read_path, Some(query.as_slice()), &extra) {
            Ok(map) => map,
            Err(e) => {
                self.log
                    .append("error", &file, &format!("post-write read failed: {e}"));
                TagMap::new()
            }
        };
        if let Some(warning) = tags::get(&reread, WARNING_TAG, false) {
            self.log
                .append("warning", &file, &tags::to_display(warning));
        }

        for (tag, edited_value) in &unsaved {
            self.reconcile_tag(&mut record, &reread, tag, edited_value, &file);
        }

        if read_path != path {
            record.source_path = read_path.clone();
            tags::set(
                &mut record.saved,
                SOURCE_FILE_TAG,
                Value::String(read_path.display().to_string()),
                false,
            );
        }
    }

    /// Pending edits that still need a write: the value differs from the
    /// saved truth and from any known-rejected value.
    fn unsaved_tags(&self, record: &FileRecord) -> Vec<(String, String)> {
        record
            .edited
            .iter()
            .filter_map(|(tag, v)| {
                let value = tags::to_display(v);
                let saved = tags::get_or(&record.saved, tag, "", false);
                if value == saved {
                    return None;
                }
                if let Some(failed) = record.failed.get(tag)
                    && tags::to_display(failed) == value
                {
                    return None;
                }
                Some((tag.clone(), value))
            })
            .collect()
    }

    /// Compute the path a write will leave the file at, when a rename/move
    /// tag is among the unsaved set.
    fn renamed_path(&self, record: &FileRecord, unsaved: &[(String, String)]) -> Option<PathBuf> {
        let pending = |target: &str| -> Option<String> {
            unsaved
                .iter()
                .find(|(t, _)| tags::is_equal(t, target))
                .map(|(_, v)| v.clone())
        };
        let new_name = pending(FILENAME_TAG);
        let new_dir = pending(DIRECTORY_TAG);
        if new_name.is_none() && new_dir.is_none() {
            return None;
        }

        let dir = new_dir.map(PathBuf::from).or_else(|| {
            tags::get(&record.saved, DIRECTORY_TAG, false)
                .map(|v| PathBuf::from(tags::to_display(v)))
                .or_else(|| record.source_path.parent().map(Path::to_path_buf))
        })?;
        let name = new_name.or_else(|| {
            tags::get(&record.saved, FILENAME_TAG, false)
                .map(|v| tags::to_display(v))
                .or_else(|| {
                    record
                        .source_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
        })?;
        Some(dir.join(name))
    }

    /// Fold one re-read tag back into the record: replace the raw key set in
    /// `saved`, then decide success or failure by comparing every returned
    /// value against the written one.
    fn reconcile_tag(
        &self,
        record: &mut FileRecord,
        reread: &TagMap,
        tag: &str,
        edited_value: &str,
        file: &str,
    ) {
        let returned: Vec<(String, Value)> = tags::lookup_all(reread, tag, false)
            .into_iter()
            .map(|k| (k.to_string(), reread[k].clone()))
            .collect();

        let old_keys: Vec<String> = tags::lookup_all(&record.saved, tag, false)
            .into_iter()
            .map(str::to_string)
            .collect();
        for key in &old_keys {
            if !returned.iter().any(|(k, _)| k == key) {
                record.saved.shift_remove(key);
            }
        }
        for (key, value) in &returned {
            record.saved.insert(key.clone(), value.clone());
        }

        let took_effect = if returned.is_empty() {
            // Absent after the write: success only for a deletion.
            edited_value.is_empty()
        } else {
            returned
                .iter()
                .all(|(_, v)| tags::to_display(v) == edited_value)
        };

        if took_effect {
            record.failed.shift_remove(tag);
        } else {
            self.log.append(
                "failed",
                file,
                &format!("edit of {tag} to {edited_value:?} did not take effect"),
            );
            record
                .failed
                .insert(tag.to_string(), Value::String(edited_value.to_string()));
        }
    }

    /// Rejected edits of one file, for presentation.
    pub fn failed_tags(&self, idx: usize) -> Vec<(String, String)> {
        self.with_record(idx, |r| {
            r.failed
                .iter()
                .map(|(k, v)| (k.clone(), tags::to_display(v)))
                .collect()
        })
        .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;

    use serde_json::json;

    use crate::settings::Settings;

    #[test]
    fn get_resolves_normalized_variants() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);
        assert_eq!(
            cache.get(0, "exif:datetimeoriginal", ""),
            "2023:05:17 15:54:30"
        );
        assert_eq!(cache.get(0, "EXIF:Missing", "fallback"), "fallback");
        assert_eq!(cache.get(0, "EXIF:ImageWidth", ""), "4000");
    }

    #[test]
    fn edit_then_save_confirms_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        cache.edit(0, "EXIF:Artist", "New Artist", false);
        assert_eq!(cache.view(0, "EXIF:Artist").status, None);

        cache.save();
        assert_eq!(cache.get(0, "EXIF:Artist", ""), "New Artist");
        assert_eq!(cache.view(0, "EXIF:Artist").status, Some(true));
        assert!(cache.failed_tags(0).is_empty());

        // Second save finds nothing unsaved and makes no gateway calls.
        cache.save();
        cache.with_record(0, |r| assert!(r.failed.is_empty())).unwrap();
    }

    #[test]
    fn second_save_skips_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"x").unwrap();
        let gateway = std::sync::Arc::new(MockGateway::new(vec![(
            path.clone(),
            basic_tags(&path),
        )]));
        let settings = Settings {
            dirs: vec![dir.path().to_path_buf()],
            ..Settings::default()
        };
        let cache = MetadataCache::load(settings, Box::new(gateway.clone()), Log::disabled());

        cache.edit(0, "EXIF:Artist", "New Artist", false);
        cache.save();
        assert_eq!(gateway.writes(), 1);
        cache.save();
        assert_eq!(gateway.writes(), 1);
    }

    #[test]
    fn rejected_edit_lands_in_failed_and_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g.rejecting("EXIF:Artist"));

        cache.edit(0, "EXIF:Artist", "Rejected Value", false);
        cache.save();

        assert_eq!(
            cache.failed_tags(0),
            vec![("exif:artist".to_string(), "Rejected Value".to_string())]
        );
        // Saved truth still holds the original value.
        assert_eq!(cache.get(0, "EXIF:Artist", ""), "Original");
        assert_eq!(cache.view(0, "EXIF:Artist").status, Some(false));

        // A known-rejected value is excluded from the next save.
        cache.with_record(0, |r| {
            assert!(cache.unsaved_tags(r).is_empty());
        });

        // A fresh, different edit supersedes the failure marker.
        cache.edit(0, "EXIF:Artist", "Third Try", false);
        cache.with_record(0, |r| {
            assert_eq!(cache.unsaved_tags(r).len(), 1);
        });
        assert_eq!(cache.view(0, "EXIF:Artist").status, None);
    }

    #[test]
    fn gateway_write_error_degrades_to_failed_tags() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g.failing());

        cache.edit(0, "EXIF:Artist", "Never Lands", false);
        cache.save();

        assert_eq!(cache.failed_tags(0).len(), 1);
        assert_eq!(cache.get(0, "EXIF:Artist", ""), "Original");
    }

    #[test]
    fn delete_edit_succeeding_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        cache.edit(0, "EXIF:Artist", "", false);
        cache.save();

        assert!(cache.failed_tags(0).is_empty());
        assert_eq!(cache.get(0, "EXIF:Artist", "absent"), "absent");
    }

    #[test]
    fn failed_add_of_new_tag_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| {
            g.rejecting("EXIF:Copyright")
        });

        cache.edit(0, "EXIF:Copyright", "Me", false);
        cache.save();
        assert_eq!(
            cache.failed_tags(0),
            vec![("exif:copyright".to_string(), "Me".to_string())]
        );
    }

    #[test]
    fn rename_updates_record_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        cache.edit(0, FILENAME_TAG, "b.jpg", false);
        cache.save();

        let path = cache.file_path(0).unwrap();
        assert!(path.ends_with("b.jpg"));
        assert!(path.exists());
        assert_eq!(cache.get(0, FILENAME_TAG, ""), "b.jpg");
        assert!(cache.failed_tags(0).is_empty());
    }

    #[test]
    fn anti_duplicate_rename_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg", "b.jpg", "c.jpg"], basic_tags, |g| g);

        cache.edit(0, FILENAME_TAG, "holiday.jpg", false);
        cache.edit(1, FILENAME_TAG, "holiday.jpg", false);
        cache.edit(2, FILENAME_TAG, "holiday.jpg", false);

        let names: Vec<String> = (0..3)
            .map(|i| {
                cache
                    .with_record(i, |r| {
                        tags::to_display(&r.edited[&tags::normalize(FILENAME_TAG)])
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(names, vec!["holiday.jpg", "holiday_1.jpg", "holiday_2.jpg"]);
    }

    #[test]
    fn composite_edit_fans_out_and_empty_deletes_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        cache.edit(0, "&DateTimeOriginalAll", "2024:01:02 03:04:05.99+01:00", false);
        cache.with_record(0, |r| {
            assert_eq!(
                tags::to_display(&r.edited["exif:datetimeoriginal"]),
                "2024:01:02 03:04:05"
            );
            assert_eq!(tags::to_display(&r.edited["exif:subsectimeoriginal"]), "99");
            assert_eq!(
                tags::to_display(&r.edited["exif:offsettimeoriginal"]),
                "+01:00"
            );
        });

        cache.edit(0, "&DateTimeOriginalAll", "", false);
        cache.with_record(0, |r| {
            assert!(r.edited.values().all(|v| tags::to_display(v).is_empty()));
        });
    }

    #[test]
    fn composite_view_overlays_edits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        let before = cache.view(0, "&DateTimeOriginalAll");
        assert_eq!(before.value.as_deref(), Some("2023:05:17 15:54:30"));
        assert_eq!(before.status, Some(true));

        cache.edit(0, "EXIF:SubSecTimeOriginal", "123", false);
        let after = cache.view(0, "&DateTimeOriginalAll");
        assert_eq!(after.edited.as_deref(), Some("2023:05:17 15:54:30.123"));
        assert_eq!(after.status, None);
    }

    #[test]
    fn conditional_resolves_by_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["clip.mp4"],
            |path| {
                let mut map = basic_tags(path);
                map.insert("File:MIMEType".into(), json!("video/mp4"));
                map.insert("QuickTime:CreateDate".into(), json!("2022:01:01 00:00:00"));
                map
            },
            |g| g,
        );
        assert_eq!(cache.get(0, "?DateTime", ""), "2022:01:01 00:00:00");
    }

    #[test]
    fn conditional_falls_back_and_may_be_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["notes.txt"],
            |path| {
                let mut map = basic_tags(path);
                map.insert("File:MIMEType".into(), json!("text/plain"));
                map.insert("File:FileModifyDate".into(), json!("2021:02:03 04:05:06"));
                map
            },
            |g| g,
        );
        // Falls through image/video candidates to the catch-all.
        assert_eq!(cache.get(0, "?DateTime", ""), "2021:02:03 04:05:06");
        // Unknown conditional names are simply absent.
        assert_eq!(cache.get(0, "?NoSuchConditional", "absent"), "absent");
    }

    #[test]
    fn cast_reads_format_and_writes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg"],
            |path| {
                let mut map = basic_tags(path);
                map.insert("EXIF:SomeEpoch".into(), json!("1687806635"));
                map
            },
            |g| g,
        );
        assert_eq!(
            cache.get(0, "(datetime)EXIF:SomeEpoch", ""),
            "2023:06:26 19:10:35+00:00"
        );

        cache.edit(0, "(datetime)EXIF:SomeEpoch", "2024:01:01 00:00:00", false);
        cache.with_record(0, |r| assert!(r.edited.is_empty()));
    }

    #[test]
    fn whitespace_and_empty_tags_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);
        cache.edit(0, "", "x", false);
        cache.edit(0, "EXIF:Date Time", "x", false);
        cache.with_record(0, |r| assert!(r.edited.is_empty()));
    }

    #[test]
    fn naive_values_get_default_timezone_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        let log_path = log_dir.path().join("engine.log");
        let mut files = Vec::new();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            let mut map = basic_tags(&path);
            map.insert("XMP:CreateDate".into(), json!("2023:05:17 15:54:30"));
            files.push((path, map));
        }
        let settings = Settings {
            dirs: vec![dir.path().to_path_buf()],
            default_timezone: Some("+08:00".to_string()),
            ..Settings::default()
        };
        let cache = MetadataCache::load(
            settings,
            Box::new(MockGateway::new(files)),
            Log::to_file(&log_path),
        );

        for idx in 0..3 {
            // XMP:CreateDate is timezone-explicit and not implicitly UTC, so
            // the configured default attaches to the naive value.
            let instant = cache.get_datetime(idx, "XMP:CreateDate").unwrap();
            assert_eq!(
                instant.offset,
                Some(chrono::FixedOffset::east_opt(8 * 3600).unwrap())
            );
        }

        let mut content = String::new();
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            content = std::fs::read_to_string(&log_path).unwrap_or_default();
            if content.contains("defaulted") {
                break;
            }
        }
        assert!(content.contains("naive value in XMP:CreateDate defaulted to +08:00"));
    }

    #[test]
    fn as_utc_wins_over_default_timezone() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"x").unwrap();
        let mut map = basic_tags(&path);
        map.insert("QuickTime:CreateDate".into(), json!("2023:05:17 15:54:30"));
        files.push((path, map));
        let settings = Settings {
            dirs: vec![dir.path().to_path_buf()],
            default_timezone: Some("+08:00".to_string()),
            ..Settings::default()
        };
        let cache = MetadataCache::load(
            settings,
            Box::new(MockGateway::new(files)),
            Log::disabled(),
        );

        let instant = cache.get_datetime(0, "QuickTime:CreateDate").unwrap();
        assert_eq!(instant.offset, chrono::FixedOffset::east_opt(0));
    }

    #[test]
    fn format_for_tag_applies_destination_conventions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        let instant = datetime::parse_instant("2023:05:17 15:54:30.75+08:00").unwrap();
        // EXIF tags carry neither offsets nor sub-seconds in the default
        // table: offset dropped, fraction rounded up.
        assert_eq!(
            cache.format_for_tag("a.jpg", "EXIF:DateTimeOriginal", instant),
            "2023:05:17 15:54:31"
        );
        // QuickTime tags are implicitly UTC: wall clock rewritten first.
        assert_eq!(
            cache.format_for_tag("a.jpg", "QuickTime:CreateDate", instant),
            "2023:05:17 07:54:31"
        );
    }

    #[test]
    fn failed_read_leaves_empty_but_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"x").unwrap();
        // Gateway knows no files at all: every read fails.
        let settings = Settings {
            dirs: vec![dir.path().to_path_buf()],
            ..Settings::default()
        };
        let cache = MetadataCache::load(
            settings,
            Box::new(MockGateway::new(Vec::new())),
            Log::disabled(),
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(0, FILENAME_TAG, "none"), "none");
        assert_eq!(cache.file_path(0).unwrap(), path);
    }

    #[test]
    fn base64_paths_are_decoded_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg"],
            |path| {
                let mut map = basic_tags(path);
                // "fotoğraf.jpg" base64-encoded as UTF-8.
                map.insert(FILENAME_TAG.into(), json!("base64:Zm90b8SfcmFmLmpwZw=="));
                map
            },
            |g| g,
        );
        assert_eq!(cache.get(0, FILENAME_TAG, ""), "fotoğraf.jpg");
    }
}
