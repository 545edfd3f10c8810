pub mod cluster;
pub mod edit;
pub mod extract;
pub mod maintenance;
pub mod scanner;

#[cfg(test)]
pub(crate) mod testutil;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::FileRecord;
use metadata::MetadataError;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, Table, TableDefinition,
    TableError, TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use cluster::{token_set_ratio, Clusterer};
pub use extract::extract;
pub use scanner::{scan, RecordSink, ScanMode, ScanOptions, ScanSummary};

const SCHEMA_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
const FILENAME_INDEX: TableDefinition<&str, &str> = TableDefinition::new("files_by_filename");
const ARTIST_INDEX: TableDefinition<&str, &str> = TableDefinition::new("files_by_artist");
const SEARCH_INDEX: TableDefinition<&str, &str> = TableDefinition::new("files_by_search");

const META_VERSION_KEY: &str = "version";

/// Persistent cache of extracted file metadata, keyed by absolute path.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<Database>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = open_or_create_db(path)?;
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        info!("Opened metadata cache at {:?}", path);
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let version = read_version(&self.db)?;
        let write_txn = self.db.begin_write()?;
        match version {
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                warn!("Metadata cache version mismatch ({}); clearing", version);
                clear_tables(&write_txn)?;
            }
            None => {}
        }
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let version_bytes = encode_value(&SCHEMA_VERSION)?;
            meta.insert(META_VERSION_KEY, version_bytes.as_slice())?;
            let _ = write_txn.open_table(FILES_TABLE)?;
            let _ = write_txn.open_table(FILENAME_INDEX)?;
            let _ = write_txn.open_table(ARTIST_INDEX)?;
            let _ = write_txn.open_table(SEARCH_INDEX)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Inserts or replaces every record in one transaction. Returns the number of new paths.
    pub fn upsert_batch(&self, records: &[FileRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut files = write_txn.open_table(FILES_TABLE)?;
            let mut indices = IndexTables::open(&write_txn)?;
            let mut inserted = 0usize;
            for record in records {
                let previous: Option<FileRecord> = match files.get(record.path.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                match previous {
                    Some(previous) => indices.remove(&previous)?,
                    None => inserted += 1,
                }
                let bytes = encode_value(record)?;
                files.insert(record.path.as_str(), bytes.as_slice())?;
                indices.insert(record)?;
            }
            inserted
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    pub fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES_TABLE)?;
        let record = match files.get(path)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(record)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES_TABLE)?;
        Ok(files.len()? as usize)
    }

    pub fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let removed = self.delete_batch(&[path.to_string()])?;
        Ok(removed > 0)
    }

    /// Removes the given paths; absent paths are ignored.
    pub fn delete_batch(&self, paths: &[String]) -> Result<usize, StoreError> {
        if paths.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut files = write_txn.open_table(FILES_TABLE)?;
            let mut indices = IndexTables::open(&write_txn)?;
            remove_paths(&mut files, &mut indices, paths)?
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Removes every record located under `root` (component-wise prefix).
    pub fn delete_prefix(&self, root: &Path) -> Result<usize, StoreError> {
        let prefix = root.to_string_lossy().to_string();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut files = write_txn.open_table(FILES_TABLE)?;
            let mut indices = IndexTables::open(&write_txn)?;
            let mut doomed = Vec::new();
            for entry in files.range(prefix.as_str()..)? {
                let entry = entry?;
                let path = entry.0.value();
                if !path.starts_with(prefix.as_str()) {
                    break;
                }
                if Path::new(path).starts_with(root) {
                    doomed.push(path.to_string());
                }
            }
            remove_paths(&mut files, &mut indices, &doomed)?
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Case-insensitive substring match on filename, artist or title, ordered by filename.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<FileRecord>, usize), StoreError> {
        let query = query.trim().to_lowercase();

        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(FILENAME_INDEX)?;
        let files = read_txn.open_table(FILES_TABLE)?;

        let mut total = 0usize;
        let mut items = Vec::new();

        for entry in index.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            let (filename_lower, path) = split_key_last(key)?;
            if !query.is_empty() {
                let (artist_lower, title_lower) = split_key_last(entry.1.value())?;
                if !filename_lower.contains(query.as_str())
                    && !artist_lower.contains(query.as_str())
                    && !title_lower.contains(query.as_str())
                {
                    continue;
                }
            }

            total += 1;
            if total <= offset {
                continue;
            }
            if items.len() >= limit {
                continue;
            }

            if let Some(value) = files.get(path)? {
                let record: FileRecord = decode_value(value.value())?;
                items.push(record);
            }
        }

        Ok((items, total))
    }

    pub fn list(&self, limit: usize, offset: usize) -> Result<(Vec<FileRecord>, usize), StoreError> {
        self.search("", limit, offset)
    }

    pub fn list_by_artist(
        &self,
        artist: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<FileRecord>, usize), StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ARTIST_INDEX)?;
        let files = read_txn.open_table(FILES_TABLE)?;

        let prefix = prefix_key(&artist.trim().to_lowercase());
        let mut end = prefix.clone();
        end.push('\u{10ffff}');

        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            if let Some(value) = files.get(entry.1.value())? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok((items, total))
    }

    /// Every record, ordered by search text.
    pub fn load_sorted_by_search_text(&self) -> Result<Vec<FileRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SEARCH_INDEX)?;
        let files = read_txn.open_table(FILES_TABLE)?;
        let mut records = Vec::new();
        for entry in index.iter()? {
            let entry = entry?;
            if let Some(value) = files.get(entry.1.value())? {
                records.push(decode_value(value.value())?);
            }
        }
        Ok(records)
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        clear_tables(&write_txn)?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let version_bytes = encode_value(&SCHEMA_VERSION)?;
            meta.insert(META_VERSION_KEY, version_bytes.as_slice())?;
            let _ = write_txn.open_table(FILES_TABLE)?;
            let _ = write_txn.open_table(FILENAME_INDEX)?;
            let _ = write_txn.open_table(ARTIST_INDEX)?;
            let _ = write_txn.open_table(SEARCH_INDEX)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

struct IndexTables<'db, 'txn> {
    by_filename: Table<'db, 'txn, &'static str, &'static str>,
    by_artist: Table<'db, 'txn, &'static str, &'static str>,
    by_search: Table<'db, 'txn, &'static str, &'static str>,
}

impl<'db, 'txn> IndexTables<'db, 'txn> {
    fn open(txn: &'txn WriteTransaction<'db>) -> Result<Self, StoreError> {
        Ok(Self {
            by_filename: txn.open_table(FILENAME_INDEX)?,
            by_artist: txn.open_table(ARTIST_INDEX)?,
            by_search: txn.open_table(SEARCH_INDEX)?,
        })
    }

    fn insert(&mut self, record: &FileRecord) -> Result<(), StoreError> {
        let path = record.path.as_str();
        let match_text = match_value(record);
        self.by_filename
            .insert(filename_key(record).as_str(), match_text.as_str())?;
        self.by_artist.insert(artist_key(record).as_str(), path)?;
        self.by_search.insert(search_key(record).as_str(), path)?;
        Ok(())
    }

    fn remove(&mut self, record: &FileRecord) -> Result<(), StoreError> {
        self.by_filename.remove(filename_key(record).as_str())?;
        self.by_artist.remove(artist_key(record).as_str())?;
        self.by_search.remove(search_key(record).as_str())?;
        Ok(())
    }
}

fn remove_paths(
    files: &mut Table<'_, '_, &'static str, &'static [u8]>,
    indices: &mut IndexTables<'_, '_>,
    paths: &[String],
) -> Result<usize, StoreError> {
    let mut removed = 0usize;
    for path in paths {
        let previous: Option<FileRecord> = match files.remove(path.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        if let Some(previous) = previous {
            indices.remove(&previous)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    Pattern(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Metadata(err) => write!(f, "metadata error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
            StoreError::KeyParse(value) => write!(f, "key parse error: {}", value),
            StoreError::Pattern(value) => write!(f, "rename pattern error: {}", value),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<MetadataError> for StoreError {
    fn from(err: MetadataError) -> Self {
        StoreError::Metadata(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_version(db: &Database) -> Result<Option<u32>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

fn clear_tables(txn: &WriteTransaction) -> Result<(), StoreError> {
    clear_table(txn, META_TABLE)?;
    clear_table(txn, FILES_TABLE)?;
    clear_index(txn, FILENAME_INDEX)?;
    clear_index(txn, ARTIST_INDEX)?;
    clear_index(txn, SEARCH_INDEX)?;
    Ok(())
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), StoreError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn clear_index(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &str>,
) -> Result<(), StoreError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

fn index_key(value: &str, path: &str) -> String {
    let mut out = String::new();
    out.push_str(value);
    out.push(KEY_SEP);
    out.push_str(path);
    out
}

fn filename_key(record: &FileRecord) -> String {
    index_key(&record.filename.to_lowercase(), &record.path)
}

fn artist_key(record: &FileRecord) -> String {
    index_key(record.artist.trim().to_lowercase().as_str(), &record.path)
}

fn search_key(record: &FileRecord) -> String {
    index_key(&record.search_text, &record.path)
}

fn match_value(record: &FileRecord) -> String {
    let mut out = String::new();
    out.push_str(&record.artist.to_lowercase().replace(KEY_SEP, " "));
    out.push(KEY_SEP);
    out.push_str(&record.title.to_lowercase().replace(KEY_SEP, " "));
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn split_key_last(value: &str) -> Result<(&str, &str), StoreError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| StoreError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}
