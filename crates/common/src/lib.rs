use serde::{Deserialize, Serialize};
use std::path::Path;

/// Extensions picked up by library scans.
pub const SCAN_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "wma"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub filename: String,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub album_artist: String,
    pub duration: u32,
    pub size_mb: f64,
    pub bitrate: u32,
    pub search_text: String,
}

impl FileRecord {
    pub fn build_search_text(artist: &str, title: &str, filename: &str) -> String {
        format!("{} {} {}", artist, title, filename).to_lowercase()
    }

    pub fn refresh_search_text(&mut self) {
        self.search_text = Self::build_search_text(&self.artist, &self.title, &self.filename);
    }
}

/// Records the clusterer believes are the same recording.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateGroup {
    pub files: Vec<FileRecord>,
}

impl CandidateGroup {
    pub fn new(files: Vec<FileRecord>) -> Self {
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Opaque identifier derived from the member paths.
    pub fn token(&self) -> String {
        let joined: Vec<&str> = self.files.iter().map(|f| f.path.as_str()).collect();
        stable_id(&joined.join("\n"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmedDuplicate {
    pub files: Vec<FileRecord>,
    pub reason: String,
    pub best_id: Option<usize>,
    #[serde(default)]
    pub duplicate_ids: Vec<usize>,
}

impl ConfirmedDuplicate {
    pub fn keeper(&self) -> Option<&FileRecord> {
        self.best_id.and_then(|id| self.files.get(id))
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    match extension_lower(path) {
        Some(ext) => allowed.iter().any(|candidate| *candidate == ext),
        None => false,
    }
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn search_text_is_lowercased_concatenation() {
        let text = FileRecord::build_search_text("Queen", "Bohemian Rhapsody", "Queen - BR.MP3");
        assert_eq!(text, "queen bohemian rhapsody queen - br.mp3");
    }

    #[test]
    fn extension_matching_ignores_case() {
        assert!(has_extension(Path::new("/m/a.FLAC"), SCAN_EXTENSIONS));
        assert!(!has_extension(Path::new("/m/a.txt"), SCAN_EXTENSIONS));
        assert!(!has_extension(Path::new("/m/noext"), SCAN_EXTENSIONS));
    }

    #[test]
    fn group_token_depends_on_members() {
        let a = FileRecord {
            path: "/m/a.mp3".to_string(),
            ..FileRecord::default()
        };
        let b = FileRecord {
            path: "/m/b.mp3".to_string(),
            ..FileRecord::default()
        };
        let first = CandidateGroup::new(vec![a.clone(), b.clone()]);
        let second = CandidateGroup::new(vec![a, b.clone()]);
        let third = CandidateGroup::new(vec![b]);
        assert_eq!(first.token(), second.token());
        assert_ne!(first.token(), third.token());
    }

    #[test]
    fn keeper_ignores_out_of_range_id() {
        let dup = ConfirmedDuplicate {
            files: vec![FileRecord::default()],
            reason: String::new(),
            best_id: Some(3),
            duplicate_ids: Vec::new(),
        };
        assert!(dup.keeper().is_none());
    }
}
