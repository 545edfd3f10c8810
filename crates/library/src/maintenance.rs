use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use common::{extension_lower, file_stem, has_extension, path_string, FileRecord};
use metadata::{read_cover, read_tags};
use rayon::prelude::*;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{extract, MetadataStore};

pub const DEDUPE_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "m4a", "aac", "wma"];
pub const PURGE_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "wav"];
pub const MATERIALIZE_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a"];
pub const MUSIC_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "m4a", "wma", "ape", "ogg"];
pub const JUNK_EXTENSIONS: &[&str] = &["nfo", "jpg", "jpeg", "png", "lrc", "txt"];
const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const FOLDER_COVER_STEM: &str = "folder";

pub const DEFAULT_DEDUPE_WORKERS: usize = 4;
pub const DEFAULT_MIN_DURATION_SECS: u32 = 60;

/// Outcome of one maintenance run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobReport {
    pub examined: usize,
    pub deleted: Vec<String>,
    pub written: Vec<String>,
    pub removed_dirs: Vec<String>,
    pub failed: Vec<String>,
}

impl JobReport {
    fn merge(&mut self, other: JobReport) {
        self.examined += other.examined;
        self.deleted.extend(other.deleted);
        self.written.extend(other.written);
        self.removed_dirs.extend(other.removed_dirs);
        self.failed.extend(other.failed);
    }
}

/// Keeps the best-quality file of each (directory, stem) group and deletes the rest.
pub fn dedupe_quality(target: &Path, store: &MetadataStore, workers: usize) -> JobReport {
    let mut groups: HashMap<(PathBuf, String), Vec<PathBuf>> = HashMap::new();
    for path in audio_files(target, DEDUPE_EXTENSIONS) {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        groups.entry((dir, file_stem(&path))).or_default().push(path);
    }
    let groups: Vec<Vec<PathBuf>> = groups
        .into_values()
        .filter(|paths| paths.len() > 1)
        .collect();

    let outcomes: Vec<JobReport> = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("dedupe-{}", i))
        .build()
    {
        Ok(pool) => pool.install(|| groups.into_par_iter().map(dedupe_group).collect()),
        Err(err) => {
            warn!("Dedupe pool unavailable ({}); running inline", err);
            groups.into_iter().map(dedupe_group).collect()
        }
    };

    let mut report = JobReport::default();
    for outcome in outcomes {
        report.merge(outcome);
    }
    forget_paths(store, &report.deleted);
    info!(
        "Quality dedupe finished under {:?}: {} deleted, {} failed",
        target,
        report.deleted.len(),
        report.failed.len()
    );
    report
}

fn dedupe_group(mut paths: Vec<PathBuf>) -> JobReport {
    let mut report = JobReport {
        examined: paths.len(),
        ..JobReport::default()
    };
    paths.sort();
    paths.sort_by_key(|path| quality_score(path));
    let Some(keeper) = paths.pop() else {
        return report;
    };
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Dedupe removed {:?} (kept {:?})", path, keeper);
                report.deleted.push(path_string(&path));
            }
            Err(err) => {
                warn!("Dedupe failed to remove {:?}: {}", path, err);
                report.failed.push(path_string(&path));
            }
        }
    }
    report
}

/// `(format rank, size in bytes)`; larger is better.
pub fn quality_score(path: &Path) -> (u8, u64) {
    let rank = match extension_lower(path).as_deref() {
        Some("flac") | Some("wav") => 3,
        Some("m4a") | Some("aac") => 2,
        Some("mp3") => 1,
        _ => 0,
    };
    let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    (rank, size)
}

/// Deletes audio shorter than `min_duration` seconds. Files with unknown duration stay.
pub fn purge_short(target: &Path, store: &MetadataStore, min_duration: u32) -> JobReport {
    let threshold_ms = u64::from(min_duration) * 1000;
    let mut report = JobReport::default();

    for path in audio_files(target, PURGE_EXTENSIONS) {
        report.examined += 1;
        let duration_ms = match read_tags(&path) {
            Ok(tags) => u64::from(tags.duration_ms.unwrap_or(0)),
            Err(err) => {
                warn!("Skipping {:?}: {}", path, err);
                continue;
            }
        };
        if duration_ms == 0 || duration_ms >= threshold_ms {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Purged short clip {:?} ({}s)", path, duration_ms / 1000);
                report.deleted.push(path_string(&path));
            }
            Err(err) => {
                warn!("Failed to purge {:?}: {}", path, err);
                report.failed.push(path_string(&path));
            }
        }
    }

    forget_paths(store, &report.deleted);
    info!(
        "Short clip purge finished under {:?}: {} deleted",
        target,
        report.deleted.len()
    );
    report
}

/// Writes missing `.nfo` sidecars and cover images next to tagged audio.
pub fn materialize(target: &Path, store: &MetadataStore) -> JobReport {
    let mut report = JobReport::default();

    for path in audio_files(target, MATERIALIZE_EXTENSIONS) {
        report.examined += 1;
        let Some(dir) = path.parent() else {
            continue;
        };
        let stem = file_stem(&path);
        let record = match store.get(&path_string(&path)) {
            Ok(Some(record)) => record,
            _ => extract(&path),
        };

        let nfo_path = dir.join(format!("{}.nfo", stem));
        if !nfo_path.exists() {
            match fs::write(&nfo_path, render_nfo(&record, &stem)) {
                Ok(()) => {
                    info!("Wrote {:?}", nfo_path);
                    report.written.push(path_string(&nfo_path));
                }
                Err(err) => {
                    warn!("Failed to write {:?}: {}", nfo_path, err);
                    report.failed.push(path_string(&nfo_path));
                }
            }
        }

        let mut missing = Vec::new();
        if find_cover(dir, FOLDER_COVER_STEM).is_none() {
            missing.push(FOLDER_COVER_STEM.to_string());
        }
        if find_cover(dir, &stem).is_none() {
            missing.push(stem.clone());
        }
        if missing.is_empty() {
            continue;
        }

        let cover = match read_cover(&path) {
            Ok(Some(cover)) => cover,
            Ok(None) => continue,
            Err(err) => {
                warn!("Failed to read cover from {:?}: {}", path, err);
                continue;
            }
        };
        for cover_stem in missing {
            let cover_path = dir.join(format!("{}.{}", cover_stem, cover.extension()));
            match fs::write(&cover_path, &cover.data) {
                Ok(()) => {
                    info!("Extracted cover {:?}", cover_path);
                    report.written.push(path_string(&cover_path));
                }
                Err(err) => {
                    warn!("Failed to write {:?}: {}", cover_path, err);
                    report.failed.push(path_string(&cover_path));
                }
            }
        }
    }

    info!(
        "Metadata materialization finished under {:?}: {} artifacts written",
        target,
        report.written.len()
    );
    report
}

fn find_cover(dir: &Path, stem: &str) -> Option<PathBuf> {
    COVER_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|candidate| candidate.exists())
}

fn render_nfo(record: &FileRecord, stem: &str) -> String {
    let title = if record.title.is_empty() {
        stem
    } else {
        record.title.as_str()
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n\
         <musicvideo>\n  \
         <title>{}</title>\n  \
         <artist>{}</artist>\n  \
         <album>{}</album>\n  \
         <plot></plot>\n  \
         <runtime>{}</runtime>\n\
         </musicvideo>\n",
        xml_escape(title),
        xml_escape(&record.artist),
        xml_escape(&record.album),
        format_runtime(record.duration)
    )
}

fn format_runtime(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Removes sidecars from directories without audio, then prunes empty directories.
pub fn clean_junk(target: &Path) -> JobReport {
    let mut report = JobReport::default();

    let dirs = WalkDir::new(target)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir());

    for entry in dirs {
        let dir = entry.path();
        report.examined += 1;
        let files: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(read) => read
                .filter_map(Result::ok)
                .map(|child| child.path())
                .filter(|child| child.is_file())
                .collect(),
            Err(err) => {
                warn!("Cannot list {:?}: {}", dir, err);
                continue;
            }
        };
        if files.iter().any(|file| has_extension(file, MUSIC_EXTENSIONS)) {
            continue;
        }

        for file in files.iter().filter(|file| has_extension(file, JUNK_EXTENSIONS)) {
            match fs::remove_file(file) {
                Ok(()) => {
                    info!("Removed orphan sidecar {:?}", file);
                    report.deleted.push(path_string(file));
                }
                Err(err) => {
                    warn!("Failed to remove {:?}: {}", file, err);
                    report.failed.push(path_string(file));
                }
            }
        }

        if dir == target {
            continue;
        }
        let is_empty = fs::read_dir(dir)
            .map(|mut read| read.next().is_none())
            .unwrap_or(false);
        if is_empty {
            match fs::remove_dir(dir) {
                Ok(()) => {
                    info!("Removed empty directory {:?}", dir);
                    report.removed_dirs.push(path_string(dir));
                }
                Err(err) => {
                    warn!("Failed to remove directory {:?}: {}", dir, err);
                    report.failed.push(path_string(dir));
                }
            }
        }
    }

    info!(
        "Junk cleanup finished under {:?}: {} files, {} directories removed",
        target,
        report.deleted.len(),
        report.removed_dirs.len()
    );
    report
}

fn audio_files(root: &Path, allowed: &[&str]) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && has_extension(entry.path(), allowed))
        .map(|entry| entry.into_path())
        .collect()
}

fn forget_paths(store: &MetadataStore, paths: &[String]) {
    if paths.is_empty() {
        return;
    }
    if let Err(err) = store.delete_batch(paths) {
        warn!("Failed to drop {} deleted files from cache: {}", paths.len(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{record, write_wav};

    fn store_in(dir: &tempfile::TempDir) -> MetadataStore {
        MetadataStore::open(&dir.path().join("db/metadata.redb")).unwrap()
    }

    #[test]
    fn dedupe_keeps_lossless_copy() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("other")).unwrap();
        fs::write(music.join("a.mp3"), vec![0u8; 4096]).unwrap();
        fs::write(music.join("a.flac"), vec![0u8; 1024]).unwrap();
        fs::write(music.join("other/a.mp3"), vec![0u8; 10]).unwrap();
        let store = store_in(&dir);
        let mp3 = path_string(&music.join("a.mp3"));
        store.upsert_batch(&[record(&mp3, "A", "a")]).unwrap();

        let report = dedupe_quality(&music, &store, DEFAULT_DEDUPE_WORKERS);
        assert_eq!(report.deleted, vec![mp3.clone()]);
        assert!(music.join("a.flac").exists());
        assert!(!music.join("a.mp3").exists());
        assert!(music.join("other/a.mp3").exists());
        assert!(store.get(&mp3).unwrap().is_none());
    }

    #[test]
    fn larger_file_wins_within_same_rank() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.mp3");
        let small = dir.path().join("small.mp3");
        fs::write(&big, vec![0u8; 2048]).unwrap();
        fs::write(&small, vec![0u8; 16]).unwrap();
        assert!(quality_score(&big) > quality_score(&small));
        assert_eq!(quality_score(Path::new("/none/x.ogg")).0, 0);
    }

    #[test]
    fn purge_removes_only_short_clips() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        write_wav(&music.join("short.wav"), 45);
        write_wav(&music.join("long.wav"), 75);
        fs::write(music.join("broken.mp3"), b"not audio").unwrap();
        let store = store_in(&dir);

        let report = purge_short(&music, &store, DEFAULT_MIN_DURATION_SECS);
        assert_eq!(report.examined, 3);
        assert_eq!(report.deleted, vec![path_string(&music.join("short.wav"))]);
        assert!(!music.join("short.wav").exists());
        assert!(music.join("long.wav").exists());
        assert!(music.join("broken.mp3").exists());
    }

    #[test]
    fn junk_cleanup_cascades_but_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("orphan/nested")).unwrap();
        fs::create_dir_all(music.join("album")).unwrap();
        fs::write(music.join("orphan/cover.jpg"), b"img").unwrap();
        fs::write(music.join("orphan/nested/lyrics.lrc"), b"la").unwrap();
        fs::write(music.join("album/track.flac"), b"audio").unwrap();
        fs::write(music.join("album/cover.jpg"), b"img").unwrap();

        let report = clean_junk(&music);
        assert!(!music.join("orphan").exists());
        assert!(music.join("album/cover.jpg").exists());
        assert!(music.exists());
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.removed_dirs.len(), 2);
    }

    #[test]
    fn junk_cleanup_leaves_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("misc")).unwrap();
        fs::write(music.join("misc/readme.txt"), b"t").unwrap();
        fs::write(music.join("misc/data.bin"), b"b").unwrap();

        clean_junk(&music);
        assert!(!music.join("misc/readme.txt").exists());
        assert!(music.join("misc/data.bin").exists());
    }

    #[test]
    fn materialize_writes_nfo_once() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(&music).unwrap();
        let track = music.join("Artist - Song.mp3");
        fs::write(&track, b"untagged").unwrap();
        let store = store_in(&dir);
        let mut cached = record(&path_string(&track), "Tom & Jerry", "Song <Live>");
        cached.duration = 125;
        store.upsert_batch(&[cached]).unwrap();

        let report = materialize(&music, &store);
        let nfo = music.join("Artist - Song.nfo");
        assert_eq!(report.written, vec![path_string(&nfo)]);
        let body = fs::read_to_string(&nfo).unwrap();
        assert!(body.contains("<title>Song &lt;Live&gt;</title>"));
        assert!(body.contains("<artist>Tom &amp; Jerry</artist>"));
        assert!(body.contains("<runtime>2:05</runtime>"));

        fs::write(&nfo, b"custom").unwrap();
        let again = materialize(&music, &store);
        assert!(again.written.is_empty());
        assert_eq!(fs::read(&nfo).unwrap(), b"custom");
    }

    #[test]
    fn runtime_formats_minutes_and_seconds() {
        assert_eq!(format_runtime(0), "0:00");
        assert_eq!(format_runtime(61), "1:01");
        assert_eq!(format_runtime(3600), "60:00");
    }
}
