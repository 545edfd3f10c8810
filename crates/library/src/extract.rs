use std::fs;
use std::path::Path;

use common::{file_name, file_stem, path_string, FileRecord};
use metadata::{read_tags, TagInfo};
use tracing::warn;

const TITLE_SEP: &str = " - ";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Builds a record for `path`. Unreadable tags degrade to filename-derived values.
pub fn extract(path: &Path) -> FileRecord {
    let filename = file_name(path);
    let size_mb = match fs::metadata(path) {
        Ok(meta) => round_mb(meta.len()),
        Err(_) => 0.0,
    };

    let tags = match read_tags(path) {
        Ok(tags) => tags,
        Err(err) => {
            warn!("Failed to read tags for {:?}: {}", path, err);
            TagInfo::default()
        }
    };

    let mut artist = clean(tags.artist);
    let mut title = clean(tags.title);
    if title.is_empty() {
        let stem = file_stem(path);
        match stem.split_once(TITLE_SEP) {
            Some((left, right)) => {
                if artist.is_empty() {
                    artist = left.trim().to_string();
                }
                title = right.trim().to_string();
            }
            None => title = stem.trim().to_string(),
        }
    }

    let mut record = FileRecord {
        path: path_string(path),
        filename,
        artist,
        title,
        album: clean(tags.album),
        album_artist: clean(tags.album_artist),
        duration: tags.duration_ms.map(|ms| ms / 1000).unwrap_or(0),
        size_mb,
        bitrate: tags.bitrate.unwrap_or(0),
        search_text: String::new(),
    };
    record.refresh_search_text();
    record
}

fn clean(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn untagged_file_splits_stem_into_artist_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Queen - Bohemian Rhapsody - Live.mp3");
        fs::write(&path, b"not really an mp3").unwrap();

        let record = extract(&path);
        assert_eq!(record.artist, "Queen");
        assert_eq!(record.title, "Bohemian Rhapsody - Live");
        assert_eq!(record.filename, "Queen - Bohemian Rhapsody - Live.mp3");
        assert_eq!(record.duration, 0);
        assert_eq!(
            record.search_text,
            "queen bohemian rhapsody - live queen - bohemian rhapsody - live.mp3"
        );
    }

    #[test]
    fn stem_without_separator_becomes_title() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Interlude.flac");
        fs::write(&path, b"junk").unwrap();

        let record = extract(&path);
        assert_eq!(record.artist, "");
        assert_eq!(record.title, "Interlude");
    }

    #[test]
    fn missing_file_still_yields_record() {
        let record = extract(Path::new("/definitely/missing/Artist - Song.mp3"));
        assert_eq!(record.size_mb, 0.0);
        assert_eq!(record.artist, "Artist");
        assert_eq!(record.title, "Song");
    }

    #[test]
    fn reads_duration_from_audio_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 3);

        let record = extract(&path);
        assert_eq!(record.duration, 3);
        assert_eq!(record.title, "tone");
    }

    #[test]
    fn size_is_rounded_to_two_decimals() {
        assert_eq!(round_mb(1024 * 1024), 1.0);
        assert_eq!(round_mb(1_572_864), 1.5);
        assert_eq!(round_mb(0), 0.0);
    }
}
