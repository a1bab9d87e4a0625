use crate::error::{SearchError, StoreError};
use crate::models::{DedupKey, VectorMetadata};
use crate::traits::{KeywordIndex, VectorIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub const INDEX_FILE: &str = "index.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Label reported for result slots the index could not fill.
pub const NO_MATCH: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: i64,
    /// Squared Euclidean distance.
    pub distance: f32,
}

/// Exhaustive Euclidean index over row-major vectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatL2Index {
    dimension: usize,
    vectors: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.vectors.len() / self.dimension
        }
    }

    fn is_consistent(&self) -> bool {
        self.dimension > 0 && self.vectors.len() % self.dimension == 0
    }

    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), StoreError> {
        if let Some(bad) = vectors
            .iter()
            .find(|vector| vector.is_empty() || vector.len() != self.dimension)
        {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        for vector in vectors {
            self.vectors.extend_from_slice(vector);
        }
        Ok(())
    }

    /// Always returns `k` neighbours; unfilled slots carry [`NO_MATCH`].
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError> {
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .chunks_exact(self.dimension.max(1))
            .enumerate()
            .map(|(row, vector)| Neighbor {
                label: row as i64,
                distance: vector
                    .iter()
                    .zip(query)
                    .map(|(left, right)| (left - right) * (left - right))
                    .sum(),
            })
            .collect();

        neighbors.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then(left.label.cmp(&right.label))
        });
        neighbors.truncate(k);
        neighbors.resize(
            k,
            Neighbor {
                label: NO_MATCH,
                distance: f32::MAX,
            },
        );

        Ok(neighbors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddOutcome {
    pub added: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct Snapshot {
    index: Option<FlatL2Index>,
    metadata: Vec<VectorMetadata>,
    keys: HashSet<DedupKey>,
}

impl Snapshot {
    fn new(index: Option<FlatL2Index>, metadata: Vec<VectorMetadata>) -> Self {
        let keys = metadata.iter().map(VectorMetadata::dedup_key).collect();
        Self {
            index,
            metadata,
            keys,
        }
    }
}

/// Append-only vector index with parallel metadata, persisted as a pair of files.
///
/// Writers serialize on `writer` for the whole add-then-persist cycle and publish
/// a new snapshot only once both artifacts are on disk. Readers clone the current
/// snapshot handle and never wait on a writer's embedding or disk work.
pub struct VectorStore {
    directory: PathBuf,
    writer: Mutex<()>,
    current: RwLock<Arc<Snapshot>>,
}

impl VectorStore {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        let snapshot = load_snapshot(&directory);

        Ok(Self {
            directory,
            writer: Mutex::new(()),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        self.snapshot().index.as_ref().map(FlatL2Index::dimension)
    }

    pub fn contains(&self, file: &str, chunk_id: u64) -> bool {
        self.snapshot().keys.contains(&DedupKey {
            file: file.to_string(),
            chunk_id,
        })
    }

    /// Appends the items whose `(file, chunk_id)` key is new and persists the result.
    pub fn add(
        &self,
        vectors: Vec<Vec<f32>>,
        metadata: Vec<VectorMetadata>,
    ) -> Result<AddOutcome, StoreError> {
        if vectors.len() != metadata.len() {
            return Err(StoreError::LengthMismatch {
                vectors: vectors.len(),
                metadata: metadata.len(),
            });
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();

        let mut keys = current.keys.clone();
        let mut accepted_vectors = Vec::new();
        let mut accepted_metadata = Vec::new();
        let mut duplicates = 0;

        for (vector, item) in vectors.into_iter().zip(metadata) {
            if keys.insert(item.dedup_key()) {
                accepted_vectors.push(vector);
                accepted_metadata.push(item);
            } else {
                duplicates += 1;
            }
        }

        if accepted_vectors.is_empty() {
            debug!(duplicates, "nothing new to add");
            return Ok(AddOutcome {
                added: 0,
                duplicates,
            });
        }

        let mut index = match &current.index {
            Some(index) => index.clone(),
            None => FlatL2Index::new(accepted_vectors[0].len()),
        };
        index.add(&accepted_vectors)?;

        let mut combined = current.metadata.clone();
        combined.extend(accepted_metadata);

        let next = Snapshot {
            index: Some(index),
            metadata: combined,
            keys,
        };
        write_snapshot(&self.directory, &next)?;

        let added = accepted_vectors.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!(added, duplicates, total = self.len(), "vector store updated");

        Ok(AddOutcome { added, duplicates })
    }

    /// Rewrites both artifacts from the current in-memory state.
    pub fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_snapshot(&self.directory, &self.snapshot())
    }

    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMetadata>, StoreError> {
        let snapshot = self.snapshot();
        let Some(index) = &snapshot.index else {
            return Ok(Vec::new());
        };
        // Padding past the row count only yields sentinels.
        let k = k.min(index.count());
        if k == 0 {
            return Ok(Vec::new());
        }

        Ok(index
            .search(vector, k)?
            .into_iter()
            .filter(|neighbor| neighbor.label != NO_MATCH)
            .filter_map(|neighbor| usize::try_from(neighbor.label).ok())
            .filter_map(|row| snapshot.metadata.get(row).cloned())
            .collect())
    }

    pub fn keyword_search(&self, term: &str, max_hits: usize) -> Vec<VectorMetadata> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        self.snapshot()
            .metadata
            .iter()
            .filter(|item| item.text.to_lowercase().contains(&needle))
            .take(max_hits)
            .cloned()
            .collect()
    }
}

impl VectorIndex for VectorStore {
    fn search_vector(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMetadata>, SearchError> {
        Ok(self.search(query_vector, k)?)
    }
}

impl KeywordIndex for VectorStore {
    fn search_keyword(
        &self,
        term: &str,
        max_hits: usize,
    ) -> Result<Vec<VectorMetadata>, SearchError> {
        Ok(self.keyword_search(term, max_hits))
    }
}

fn load_snapshot(directory: &Path) -> Snapshot {
    let index_path = directory.join(INDEX_FILE);
    let metadata_path = directory.join(METADATA_FILE);

    match (index_path.exists(), metadata_path.exists()) {
        (false, false) => {
            debug!(directory = %directory.display(), "no persisted store, starting empty");
            Snapshot::default()
        }
        (true, true) => match read_pair(&index_path, &metadata_path) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(directory = %directory.display(), %error, "store artifacts unusable, rebuilding");
                Snapshot::default()
            }
        },
        _ => {
            warn!(
                directory = %directory.display(),
                "found one store artifact without the other, rebuilding"
            );
            Snapshot::default()
        }
    }
}

fn read_pair(index_path: &Path, metadata_path: &Path) -> Result<Snapshot, StoreError> {
    let index: FlatL2Index = serde_json::from_slice(&fs::read(index_path)?)?;
    let metadata: Vec<VectorMetadata> = serde_json::from_slice(&fs::read(metadata_path)?)?;

    if !index.is_consistent() {
        return Err(StoreError::Inconsistent(
            "index blob is not a whole number of vectors".to_string(),
        ));
    }
    if index.count() != metadata.len() {
        return Err(StoreError::Inconsistent(format!(
            "index holds {} vectors but metadata has {} records",
            index.count(),
            metadata.len()
        )));
    }

    Ok(Snapshot::new(Some(index), metadata))
}

fn write_snapshot(directory: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let Some(index) = &snapshot.index else {
        return Ok(());
    };

    // Index before metadata: metadata never references rows missing from disk.
    write_atomically(&directory.join(INDEX_FILE), &serde_json::to_vec(index)?)?;
    write_atomically(
        &directory.join(METADATA_FILE),
        &serde_json::to_vec_pretty(&snapshot.metadata)?,
    )?;
    Ok(())
}

pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);

    let mut file = fs::File::create(&staged)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&staged, path)
}
