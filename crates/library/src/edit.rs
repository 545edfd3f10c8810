use std::fs;
use std::path::{Path, PathBuf};

use common::{path_string, FileRecord};
use metadata::{write_tags, TagWrite};
use tracing::{info, warn};

use crate::{extract, MetadataStore, StoreError};

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const UNKNOWN_ARTIST: &str = "Unknown Artist";
const UNKNOWN_ALBUM: &str = "Unknown Album";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Writes the non-empty fields of `update` into each file and refreshes its cached record.
pub fn update_tags(store: &MetadataStore, paths: &[String], update: &TagWrite) -> Vec<FileRecord> {
    let update = TagWrite {
        artist: non_empty(&update.artist),
        album_artist: non_empty(&update.album_artist),
        title: non_empty(&update.title),
        album: non_empty(&update.album),
    };
    let mut updated = Vec::new();
    if update.is_empty() {
        return updated;
    }

    for path in paths {
        let file = Path::new(path);
        if !file.exists() {
            continue;
        }
        if let Err(err) = write_tags(file, &update) {
            warn!("Failed to update tags for {:?}: {}", file, err);
            continue;
        }
        let record = extract(file);
        if let Err(err) = store.upsert_batch(std::slice::from_ref(&record)) {
            warn!("Failed to cache updated tags for {:?}: {}", file, err);
        }
        info!("Updated tags for {:?}", file);
        updated.push(record);
    }
    updated
}

/// Renames each file after `pattern`; returns `(old path, new record)` for every move.
pub fn rename_files(
    store: &MetadataStore,
    paths: &[String],
    pattern: &str,
) -> Vec<(String, FileRecord)> {
    let mut renamed = Vec::new();
    for path in paths {
        let file = Path::new(path);
        if !file.exists() {
            continue;
        }
        match rename_one(store, file, pattern) {
            Ok(Some(record)) => renamed.push((path.clone(), record)),
            Ok(None) => {}
            Err(err) => warn!("Failed to rename {:?}: {}", file, err),
        }
    }
    renamed
}

fn rename_one(
    store: &MetadataStore,
    file: &Path,
    pattern: &str,
) -> Result<Option<FileRecord>, StoreError> {
    let current = extract(file);
    let base = render_pattern(pattern, &current)?;
    let base: String = base
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c))
        .collect();
    let base = base.trim();
    if base.is_empty() {
        return Err(StoreError::Pattern("pattern produced an empty name".to_string()));
    }

    let target = free_target(file, base);
    if target == file {
        return Ok(None);
    }
    fs::rename(file, &target)?;
    info!("Renamed {:?} -> {:?}", file, target);

    let record = extract(&target);
    if let Err(err) = store.delete(&path_string(file)) {
        warn!("Failed to drop cached row for {:?}: {}", file, err);
    }
    if let Err(err) = store.upsert_batch(std::slice::from_ref(&record)) {
        warn!("Failed to cache renamed file {:?}: {}", target, err);
    }
    Ok(Some(record))
}

fn free_target(file: &Path, base: &str) -> PathBuf {
    let dir = file.parent().unwrap_or_else(|| Path::new(""));
    let ext = file
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut candidate = dir.join(format!("{}{}", base, ext));
    let mut counter = 1;
    while candidate.exists() && candidate != file {
        candidate = dir.join(format!("{} ({}){}", base, counter, ext));
        counter += 1;
    }
    candidate
}

/// Expands `{artist}`, `{title}`, `{album}` and `{album_artist}`; `{{`/`}}` are literal braces.
pub fn render_pattern(pattern: &str, record: &FileRecord) -> Result<String, StoreError> {
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(StoreError::Pattern(format!("unclosed placeholder {{{}", name)))
                        }
                    }
                }
                out.push_str(&placeholder(&name, record)?);
            }
            '}' => return Err(StoreError::Pattern("single '}' in pattern".to_string())),
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn placeholder(name: &str, record: &FileRecord) -> Result<String, StoreError> {
    let value = match name {
        "artist" => filename_value(&record.artist, UNKNOWN_ARTIST),
        "title" => filename_value(&record.title, &record.filename),
        "album" => filename_value(&record.album, UNKNOWN_ALBUM),
        "album_artist" => filename_value(&record.album_artist, UNKNOWN_ARTIST),
        other => return Err(StoreError::Pattern(format!("unknown placeholder {{{}}}", other))),
    };
    Ok(value)
}

fn filename_value(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        return fallback.to_string();
    }
    value
        .replace(" / ", " & ")
        .replace('/', " & ")
        .replace(';', " & ")
}

/// Deletes files and their cached rows. Missing files only lose their row.
pub fn delete_files(store: &MetadataStore, paths: &[String]) -> DeleteReport {
    let mut report = DeleteReport::default();
    for path in paths {
        let file = Path::new(path);
        if file.exists() {
            if let Err(err) = fs::remove_file(file) {
                warn!("Failed to delete {:?}: {}", file, err);
                report.failed.push(path.clone());
                continue;
            }
            info!("Deleted {:?}", file);
        }
        report.deleted.push(path.clone());
    }
    if let Err(err) = store.delete_batch(&report.deleted) {
        warn!("Failed to drop deleted files from cache: {}", err);
    }
    report
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
