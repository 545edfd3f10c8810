use std::path::Path;

use common::{has_extension, FileRecord, SCAN_EXTENSIONS};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{extract, MetadataStore, StoreError};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Replace the whole cache.
    Full,
    /// Replace only records under the scanned root.
    Subtree,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub batch_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Destination of scanned records.
pub trait RecordSink {
    fn clear_all(&self) -> Result<(), StoreError>;
    fn delete_prefix(&self, root: &Path) -> Result<usize, StoreError>;
    fn upsert_batch(&self, records: &[FileRecord]) -> Result<usize, StoreError>;
}

impl RecordSink for MetadataStore {
    fn clear_all(&self) -> Result<(), StoreError> {
        MetadataStore::clear_all(self)
    }

    fn delete_prefix(&self, root: &Path) -> Result<usize, StoreError> {
        MetadataStore::delete_prefix(self, root)
    }

    fn upsert_batch(&self, records: &[FileRecord]) -> Result<usize, StoreError> {
        MetadataStore::upsert_batch(self, records)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub files: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Walks `root`, persisting extracted records in batches.
///
/// `on_batch` receives every flushed batch with the running file count, including
/// batches whose store write failed.
pub fn scan<S, F>(
    store: &S,
    root: &Path,
    mode: ScanMode,
    options: ScanOptions,
    mut on_batch: F,
) -> Result<ScanSummary, StoreError>
where
    S: RecordSink + ?Sized,
    F: FnMut(&[FileRecord], usize),
{
    match mode {
        ScanMode::Full => store.clear_all()?,
        ScanMode::Subtree => {
            let removed = store.delete_prefix(root)?;
            info!("Dropped {} cached records under {:?}", removed, root);
        }
    }

    let batch_size = options.batch_size.max(1);
    let mut summary = ScanSummary::default();
    let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_size);

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry during scan: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_extension(entry.path(), SCAN_EXTENSIONS) {
            continue;
        }

        batch.push(extract(entry.path()));
        summary.files += 1;
        if batch.len() >= batch_size {
            flush(store, &mut batch, &mut summary, &mut on_batch);
        }
    }
    if !batch.is_empty() {
        flush(store, &mut batch, &mut summary, &mut on_batch);
    }

    info!(
        "Scan of {:?} finished: {} files in {} batches ({} failed)",
        root, summary.files, summary.batches, summary.failed_batches
    );
    Ok(summary)
}

fn flush<S, F>(
    store: &S,
    batch: &mut Vec<FileRecord>,
    summary: &mut ScanSummary,
    on_batch: &mut F,
) where
    S: RecordSink + ?Sized,
    F: FnMut(&[FileRecord], usize),
{
    summary.batches += 1;
    if let Err(err) = store.upsert_batch(batch) {
        summary.failed_batches += 1;
        warn!("Failed to persist scan batch of {}: {}", batch.len(), err);
    }
    on_batch(batch, summary.files);
    batch.clear();
}
