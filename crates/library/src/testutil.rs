use std::fs;
use std::path::Path;

use common::FileRecord;

use crate::{MetadataStore, FILES_TABLE};

const SAMPLE_RATE: u32 = 8000;

/// Writes a silent 8 kHz mono 8-bit PCM file lasting `seconds`.
pub fn write_wav(path: &Path, seconds: u32) {
    let data_len = SAMPLE_RATE * seconds;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    bytes.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&8u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(44 + data_len as usize, 0x80);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

pub fn record(path: &str, artist: &str, title: &str) -> FileRecord {
    let filename = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut record = FileRecord {
        path: path.to_string(),
        filename,
        artist: artist.to_string(),
        title: title.to_string(),
        ..FileRecord::default()
    };
    record.refresh_search_text();
    record
}

/// Stores raw bytes under `path`, bypassing encoding and the indices.
pub fn insert_raw(store: &MetadataStore, path: &str, bytes: &[u8]) {
    let txn = store.db.begin_write().unwrap();
    {
        let mut files = txn.open_table(FILES_TABLE).unwrap();
        files.insert(path, bytes).unwrap();
    }
    txn.commit().unwrap();
}
