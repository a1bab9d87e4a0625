use crate::chunking::LineChunker;
use crate::embeddings::Embedder;
use crate::error::{IngestError, Result};
use crate::models::{ChunkRecord, Line, VectorMetadata};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::VectorStore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_json_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_json = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Records that parsed, plus a count of the array elements that did not.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecords<T> {
    pub records: Vec<T>,
    pub malformed: usize,
}

fn load_records<T: DeserializeOwned>(
    path: &Path,
    accept: impl Fn(&T) -> bool,
) -> Result<LoadedRecords<T>> {
    let raw = fs::read_to_string(path)?;
    let Value::Array(items) = serde_json::from_str::<Value>(&raw)? else {
        return Err(IngestError::InvalidArgument(format!(
            "expected a JSON array in {}",
            path.display()
        )));
    };

    let mut records = Vec::with_capacity(items.len());
    let mut malformed = 0;
    for (position, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(record) if accept(&record) => records.push(record),
            Ok(_) => {
                malformed += 1;
                warn!(path = %path.display(), position, "skipping empty record");
            }
            Err(error) => {
                malformed += 1;
                warn!(path = %path.display(), position, %error, "skipping malformed record");
            }
        }
    }

    Ok(LoadedRecords { records, malformed })
}

pub fn load_line_records(path: &Path) -> Result<LoadedRecords<Line>> {
    load_records(path, |_: &Line| true)
}

pub fn load_chunk_records(path: &Path) -> Result<LoadedRecords<ChunkRecord>> {
    load_records(path, |record: &ChunkRecord| !record.text.trim().is_empty())
}

/// Chunks one file of positioned lines into ingestion records.
pub fn chunk_line_file(
    path: &Path,
    chunker: &LineChunker,
    source: &str,
    kind: &str,
) -> Result<LoadedRecords<ChunkRecord>> {
    let lines = load_line_records(path)?;
    let records = chunker
        .chunk(&lines.records, source)
        .into_iter()
        .map(|chunk| chunk.into_record(kind))
        .collect::<Vec<_>>();

    debug!(path = %path.display(), lines = lines.records.len(), chunks = records.len(), "line file chunked");
    Ok(LoadedRecords {
        records,
        malformed: lines.malformed,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIngestion {
    pub file: String,
    pub added: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub files: Vec<FileIngestion>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn added(&self) -> usize {
        self.files.iter().map(|file| file.added).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.files.iter().map(|file| file.duplicates).sum()
    }

    pub fn malformed(&self) -> usize {
        self.files.iter().map(|file| file.malformed).sum()
    }
}

/// Embeds the records not yet stored under `file` and appends them.
///
/// Nothing is written unless every embedding in the batch succeeds.
pub async fn ingest_records<E: Embedder>(
    store: &VectorStore,
    embedder: &E,
    retry: &RetryPolicy,
    file: &str,
    records: Vec<ChunkRecord>,
) -> Result<FileIngestion> {
    let total = records.len();
    let fresh: Vec<ChunkRecord> = records
        .into_iter()
        .filter(|record| !store.contains(file, record.chunk_id))
        .collect();
    let already_stored = total - fresh.len();

    if fresh.is_empty() {
        debug!(file, already_stored, "no new records");
        return Ok(FileIngestion {
            file: file.to_string(),
            added: 0,
            duplicates: already_stored,
            malformed: 0,
        });
    }

    let mut vectors = Vec::with_capacity(fresh.len());
    for record in &fresh {
        let vector =
            retry_with_backoff(retry, "embedding", || embedder.embed(&record.text)).await?;
        vectors.push(vector);
    }

    let metadata = fresh
        .into_iter()
        .map(|record| VectorMetadata::from_record(file, record))
        .collect();
    let outcome = store.add(vectors, metadata)?;

    Ok(FileIngestion {
        file: file.to_string(),
        added: outcome.added,
        duplicates: already_stored + outcome.duplicates,
        malformed: 0,
    })
}

/// Ingests every chunk JSON file under `folder`.
///
/// Unreadable files are reported and skipped; an embedding or store failure aborts
/// the run, leaving earlier files committed.
pub async fn ingest_folder<E: Embedder>(
    store: &VectorStore,
    embedder: &E,
    retry: &RetryPolicy,
    folder: &Path,
) -> Result<IngestionReport> {
    let files = discover_json_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no json files found in {}",
            folder.display()
        )));
    }

    let mut report = IngestionReport::default();
    for path in files {
        let loaded = file_key(&path).and_then(|key| Ok((key, load_chunk_records(&path)?)));
        let (key, loaded) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping file");
                report.skipped_files.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
                continue;
            }
        };

        let mut outcome = ingest_records(store, embedder, retry, &key, loaded.records).await?;
        outcome.malformed = loaded.malformed;
        info!(
            file = %outcome.file,
            added = outcome.added,
            duplicates = outcome.duplicates,
            malformed = outcome.malformed,
            "file ingested"
        );
        report.files.push(outcome);
    }

    Ok(report)
}

fn file_key(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })
}
