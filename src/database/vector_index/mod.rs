// Vector index module
// Flat inner-product index over L2-normalized vectors with directory snapshots


use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::embeddings::EmbeddingRecord;
use crate::{RagError, Result};

const SNAPSHOT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const ID_MAP_FILE: &str = "id_map.json";
const METADATA_FILE: &str = "metadata.json";
const RAW_VECTORS_FILE: &str = "raw_vectors.json";
/// Names the active snapshot generation inside a snapshot directory
const CURRENT_FILE: &str = "CURRENT";
const GENERATION_PREFIX: &str = "snapshot-";

/// Metadata stored for every indexed chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub hash: String,
}

/// A single search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Cosine similarity between the query and the chunk
    pub score: f32,
    pub metadata: ChunkMetadata,
    /// The chunk's vector as originally added, before normalization
    pub vector: Vec<f32>,
}

impl SearchHit {
    #[inline]
    pub fn to_record(&self) -> EmbeddingRecord {
        EmbeddingRecord {
            document_id: self.metadata.document_id.clone(),
            chunk_id: self.chunk_id.clone(),
            vector: self.vector.clone(),
            text: self.metadata.text.clone(),
            hash: self.metadata.hash.clone(),
            model_name: self.metadata.model_name.clone(),
            created_at: self.metadata.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub entries: usize,
    pub documents: usize,
    pub dimension: usize,
    pub searches: u64,
    pub average_search_ms: f64,
    pub approximate_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    dimension: usize,
    next_id: u64,
    count: usize,
}

#[derive(Debug, Default)]
struct IndexState {
    next_id: u64,
    /// Normalized vectors keyed by internal id
    entries: BTreeMap<u64, Vec<f32>>,
    id_map: BTreeMap<u64, String>,
    internal_ids: HashMap<String, u64>,
    metadata: HashMap<String, ChunkMetadata>,
    raw_vectors: HashMap<String, Vec<f32>>,
    documents: HashMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn remove_chunk(&mut self, chunk_id: &str) -> bool {
        let Some(internal_id) = self.internal_ids.remove(chunk_id) else {
            return false;
        };
        self.entries.remove(&internal_id);
        self.id_map.remove(&internal_id);
        self.raw_vectors.remove(chunk_id);
        let Some(meta) = self.metadata.remove(chunk_id) else {
            return true;
        };
        let emptied = self
            .documents
            .get_mut(&meta.document_id)
            .is_some_and(|chunks| {
                chunks.remove(chunk_id);
                chunks.is_empty()
            });
        if emptied {
            self.documents.remove(&meta.document_id);
        }
        true
    }

    fn remove_document(&mut self, document_id: &str) -> usize {
        let Some(chunk_ids) = self.documents.remove(document_id) else {
            return 0;
        };
        let mut removed = 0;
        for chunk_id in &chunk_ids {
            if let Some(internal_id) = self.internal_ids.remove(chunk_id) {
                self.entries.remove(&internal_id);
                self.id_map.remove(&internal_id);
                removed += 1;
            }
            self.metadata.remove(chunk_id);
            self.raw_vectors.remove(chunk_id);
        }
        removed
    }

    fn insert(&mut self, record: &EmbeddingRecord, normalized: Vec<f32>) {
        self.remove_chunk(&record.chunk_id);

        let internal_id = self.next_id;
        self.next_id += 1;

        self.entries.insert(internal_id, normalized);
        self.id_map.insert(internal_id, record.chunk_id.clone());
        self.internal_ids.insert(record.chunk_id.clone(), internal_id);
        self.raw_vectors
            .insert(record.chunk_id.clone(), record.vector.clone());
        self.metadata.insert(
            record.chunk_id.clone(),
            ChunkMetadata {
                document_id: record.document_id.clone(),
                chunk_id: record.chunk_id.clone(),
                text: record.text.clone(),
                timestamp: record.created_at,
                model_name: record.model_name.clone(),
                hash: record.hash.clone(),
            },
        );
        self.documents
            .entry(record.document_id.clone())
            .or_default()
            .insert(record.chunk_id.clone());
    }
}

/// Similarity-searchable store of chunk vectors.
///
/// Mutations take the write lock for their whole duration, so a concurrent
/// search observes either the state before or after a mutation.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    state: RwLock<IndexState>,
    save_lock: Mutex<()>,
    searches: AtomicU64,
    search_micros: AtomicU64,
}

impl VectorIndex {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(IndexState::default()),
            save_lock: Mutex::new(()),
            searches: AtomicU64::new(0),
            search_micros: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Add records for a document, replacing any live entries with the same chunk id
    #[inline]
    pub async fn add(&self, document_id: &str, records: &[EmbeddingRecord]) -> Result<usize> {
        let prepared = self.prepare(document_id, records)?;

        let mut state = self.state.write().await;
        for (record, normalized) in records.iter().zip(prepared) {
            state.insert(record, normalized);
        }

        debug!(
            "Indexed {} vectors for document {} ({} total)",
            records.len(),
            document_id,
            state.entries.len()
        );
        Ok(records.len())
    }

    /// Swap a document's entries for a new set under a single write lock
    #[inline]
    pub async fn replace_document(
        &self,
        document_id: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize> {
        let prepared = self.prepare(document_id, records)?;

        let mut state = self.state.write().await;
        let removed = state.remove_document(document_id);
        for (record, normalized) in records.iter().zip(prepared) {
            state.insert(record, normalized);
        }

        debug!(
            "Replaced document {}: removed {} vectors, added {}",
            document_id,
            removed,
            records.len()
        );
        Ok(records.len())
    }

    /// Whether the index holds exactly these chunks, with these hashes, for the document
    #[inline]
    pub async fn is_current(&self, document_id: &str, records: &[EmbeddingRecord]) -> bool {
        let state = self.state.read().await;
        let Some(live) = state.documents.get(document_id) else {
            return records.is_empty();
        };

        live.len() == records.len()
            && records.iter().all(|record| {
                state
                    .metadata
                    .get(&record.chunk_id)
                    .is_some_and(|meta| meta.document_id == document_id && meta.hash == record.hash)
            })
    }

    /// Search for the `top_k` most similar chunks scoring at or above `threshold`
    #[inline]
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Err(RagError::Validation("top_k must be at least 1".to_string()));
        }
        if !threshold.is_finite() {
            return Err(RagError::Validation(format!(
                "Search threshold must be finite, got {}",
                threshold
            )));
        }
        self.check_dimension(query.len(), "query")?;
        let query = normalize(query).ok_or_else(|| {
            RagError::Validation("Query vector must be finite and non-zero".to_string())
        })?;

        let started = Instant::now();
        let state = self.state.read().await;

        let mut scored: Vec<(u64, f32)> = state
            .entries
            .iter()
            .map(|(id, vector)| (*id, dot(&query, vector)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);

        let mut hits = Vec::with_capacity(scored.len());
        for (internal_id, score) in scored {
            let chunk_id = state.id_map.get(&internal_id).ok_or_else(|| {
                RagError::IndexInconsistency(format!(
                    "Internal id {} has no chunk mapping",
                    internal_id
                ))
            })?;
            let metadata = state.metadata.get(chunk_id).ok_or_else(|| {
                RagError::IndexInconsistency(format!("Chunk {} has no metadata", chunk_id))
            })?;
            let vector = state.raw_vectors.get(chunk_id).ok_or_else(|| {
                RagError::IndexInconsistency(format!("Chunk {} has no raw vector", chunk_id))
            })?;
            hits.push(SearchHit {
                chunk_id: chunk_id.clone(),
                score,
                metadata: metadata.clone(),
                vector: vector.clone(),
            });
        }
        drop(state);

        self.searches.fetch_add(1, Ordering::Relaxed);
        self.search_micros.fetch_add(
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        debug!(
            "Search returned {} hits (top_k={}, threshold={})",
            hits.len(),
            top_k,
            threshold
        );
        Ok(hits)
    }

    /// Remove every entry belonging to a document, returning how many were removed
    #[inline]
    pub async fn remove(&self, document_id: &str) -> usize {
        let mut state = self.state.write().await;
        let removed = state.remove_document(document_id);
        if removed > 0 {
            info!("Removed {} vectors for document {}", removed, document_id);
        } else {
            debug!("Document {} not present in index", document_id);
        }
        removed
    }

    #[inline]
    pub async fn contains_chunk(&self, chunk_id: &str) -> bool {
        self.state.read().await.internal_ids.contains_key(chunk_id)
    }

    #[inline]
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    #[inline]
    pub async fn document_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state.documents.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[inline]
    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        let entries = state.entries.len();
        let searches = self.searches.load(Ordering::Relaxed);
        let micros = self.search_micros.load(Ordering::Relaxed);

        let text_bytes: usize = state
            .metadata
            .values()
            .map(|m| m.text.len() + m.chunk_id.len() + m.document_id.len() + m.hash.len())
            .sum();

        IndexStats {
            entries,
            documents: state.documents.len(),
            dimension: self.dimension,
            searches,
            average_search_ms: if searches == 0 {
                0.0
            } else {
                micros as f64 / searches as f64 / 1000.0
            },
            approximate_bytes: entries * self.dimension * size_of::<f32>() * 2 + text_bytes,
        }
    }

    /// Write a snapshot of the index into `dir`.
    ///
    /// Each save fills a fresh `snapshot-N` generation directory, then points
    /// `CURRENT` at it with a single rename. Until that rename the previous
    /// generation stays active, so an interrupted save never leaves a mixed
    /// snapshot behind. Older generations are removed afterwards.
    #[inline]
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let _saving = self.save_lock.lock().await;
        let state = self.state.read().await;

        let manifest = Manifest {
            version: SNAPSHOT_VERSION,
            dimension: self.dimension,
            next_id: state.next_id,
            count: state.entries.len(),
        };
        let mut vectors = Vec::with_capacity(state.entries.len() * self.dimension * 4);
        for value in state.entries.values().flatten() {
            vectors.extend_from_slice(&value.to_le_bytes());
        }
        let metadata: BTreeMap<&String, &ChunkMetadata> = state.metadata.iter().collect();
        let raw_vectors: BTreeMap<&String, &Vec<f32>> = state.raw_vectors.iter().collect();

        // Manifest last: a generation without one was never finished
        let files = [
            (VECTORS_FILE, vectors),
            (ID_MAP_FILE, serde_json::to_vec(&state.id_map)?),
            (METADATA_FILE, serde_json::to_vec(&metadata)?),
            (RAW_VECTORS_FILE, serde_json::to_vec(&raw_vectors)?),
            (MANIFEST_FILE, serde_json::to_vec_pretty(&manifest)?),
        ];
        drop(state);

        tokio::fs::create_dir_all(dir).await?;
        let generation = match current_generation(dir).await? {
            Some(name) => parse_generation(&name).map_or(1, |n| n + 1),
            None => 1,
        };
        let name = format!("{}{}", GENERATION_PREFIX, generation);
        let target = dir.join(&name);
        if tokio::fs::try_exists(&target).await? {
            // Left over from a save that never reached the swap
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::create_dir(&target).await?;
        for (file, bytes) in &files {
            write_synced(&target.join(file), bytes).await?;
        }

        let pointer = dir.join(format!("{}.tmp", CURRENT_FILE));
        write_synced(&pointer, name.as_bytes()).await?;
        tokio::fs::rename(&pointer, dir.join(CURRENT_FILE)).await?;

        prune_snapshots(dir, &name).await;

        info!(
            "Saved index snapshot {} with {} vectors to {}",
            name,
            manifest.count,
            dir.display()
        );
        Ok(())
    }

    /// Replace the in-memory state with the snapshot in `dir`.
    ///
    /// Returns `Ok(false)` when no snapshot exists. A snapshot that fails
    /// validation leaves the current state untouched.
    #[inline]
    pub async fn load(&self, dir: &Path) -> Result<bool> {
        let Some(snapshot) = active_snapshot_dir(dir).await? else {
            debug!("No index snapshot at {}", dir.display());
            return Ok(false);
        };

        let manifest_path = snapshot.join(MANIFEST_FILE);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Err(RagError::IndexInconsistency(format!(
                "Active snapshot {} has no manifest",
                snapshot.display()
            )));
        }

        let manifest: Manifest = read_json(&manifest_path).await?;
        if manifest.version != SNAPSHOT_VERSION {
            return Err(RagError::IndexInconsistency(format!(
                "Unsupported snapshot version {}",
                manifest.version
            )));
        }
        if manifest.dimension != self.dimension {
            return Err(RagError::IndexInconsistency(format!(
                "Snapshot dimension {} does not match configured dimension {}",
                manifest.dimension, self.dimension
            )));
        }

        let vectors = tokio::fs::read(snapshot.join(VECTORS_FILE)).await?;
        let id_map: BTreeMap<u64, String> = read_json(&snapshot.join(ID_MAP_FILE)).await?;
        let metadata: HashMap<String, ChunkMetadata> =
            read_json(&snapshot.join(METADATA_FILE)).await?;
        let raw_vectors: HashMap<String, Vec<f32>> =
            read_json(&snapshot.join(RAW_VECTORS_FILE)).await?;

        let state = self.rebuild_state(&manifest, &vectors, id_map, metadata, raw_vectors)?;
        let count = state.entries.len();
        *self.state.write().await = state;

        info!(
            "Loaded index snapshot with {} vectors from {}",
            count,
            snapshot.display()
        );
        Ok(true)
    }

    fn rebuild_state(
        &self,
        manifest: &Manifest,
        vectors: &[u8],
        id_map: BTreeMap<u64, String>,
        metadata: HashMap<String, ChunkMetadata>,
        raw_vectors: HashMap<String, Vec<f32>>,
    ) -> Result<IndexState> {
        let expected_bytes = manifest.count * self.dimension * 4;
        if vectors.len() != expected_bytes {
            return Err(RagError::IndexInconsistency(format!(
                "Vector blob has {} bytes, expected {}",
                vectors.len(),
                expected_bytes
            )));
        }
        if id_map.len() != manifest.count
            || metadata.len() != manifest.count
            || raw_vectors.len() != manifest.count
        {
            return Err(RagError::IndexInconsistency(format!(
                "Snapshot counts disagree: manifest {}, id map {}, metadata {}, raw vectors {}",
                manifest.count,
                id_map.len(),
                metadata.len(),
                raw_vectors.len()
            )));
        }

        let mut state = IndexState {
            next_id: manifest.next_id,
            ..IndexState::default()
        };

        let floats: Vec<f32> = vectors
            .chunks_exact(4)
            .filter_map(|b| <[u8; 4]>::try_from(b).ok())
            .map(f32::from_le_bytes)
            .collect();

        for ((internal_id, chunk_id), vector) in
            id_map.into_iter().zip(floats.chunks_exact(self.dimension))
        {
            if internal_id >= manifest.next_id {
                return Err(RagError::IndexInconsistency(format!(
                    "Internal id {} is not below next id {}",
                    internal_id, manifest.next_id
                )));
            }
            let meta = metadata.get(&chunk_id).ok_or_else(|| {
                RagError::IndexInconsistency(format!("Chunk {} has no metadata", chunk_id))
            })?;
            let raw = raw_vectors.get(&chunk_id).ok_or_else(|| {
                RagError::IndexInconsistency(format!("Chunk {} has no raw vector", chunk_id))
            })?;
            if raw.len() != self.dimension {
                return Err(RagError::IndexInconsistency(format!(
                    "Raw vector for chunk {} has dimension {}",
                    chunk_id,
                    raw.len()
                )));
            }
            if state.internal_ids.insert(chunk_id.clone(), internal_id).is_some() {
                return Err(RagError::IndexInconsistency(format!(
                    "Chunk {} is mapped more than once",
                    chunk_id
                )));
            }

            state.entries.insert(internal_id, vector.to_vec());
            state
                .documents
                .entry(meta.document_id.clone())
                .or_default()
                .insert(chunk_id.clone());
            state.id_map.insert(internal_id, chunk_id);
        }

        state.metadata = metadata;
        state.raw_vectors = raw_vectors;
        Ok(state)
    }

    fn prepare(&self, document_id: &str, records: &[EmbeddingRecord]) -> Result<Vec<Vec<f32>>> {
        records
            .iter()
            .map(|record| {
                if record.document_id != document_id {
                    return Err(RagError::Validation(format!(
                        "Chunk {} belongs to document {}, not {}",
                        record.chunk_id, record.document_id, document_id
                    )));
                }
                self.check_dimension(record.vector.len(), &record.chunk_id)?;
                normalize(&record.vector).ok_or_else(|| {
                    warn!("Rejecting degenerate vector for chunk {}", record.chunk_id);
                    RagError::Validation(format!(
                        "Vector for chunk {} must be finite and non-zero",
                        record.chunk_id
                    ))
                })
            })
            .collect()
    }

    fn check_dimension(&self, actual: usize, what: &str) -> Result<()> {
        if actual == self.dimension {
            Ok(())
        } else {
            Err(RagError::IndexInconsistency(format!(
                "Vector for {} has dimension {}, index expects {}",
                what, actual, self.dimension
            )))
        }
    }
}

/// Directory holding the snapshot to load: the generation named by `CURRENT`,
/// or `dir` itself for a snapshot written without generations
async fn active_snapshot_dir(dir: &Path) -> Result<Option<PathBuf>> {
    if let Some(name) = current_generation(dir).await? {
        if parse_generation(&name).is_none() {
            return Err(RagError::IndexInconsistency(format!(
                "{} names an invalid snapshot {:?}",
                dir.join(CURRENT_FILE).display(),
                name
            )));
        }
        return Ok(Some(dir.join(name)));
    }
    if tokio::fs::try_exists(dir.join(MANIFEST_FILE)).await? {
        return Ok(Some(dir.to_path_buf()));
    }
    Ok(None)
}

async fn current_generation(dir: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(dir.join(CURRENT_FILE)).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Best-effort removal of every generation but `active`, and of flat snapshot files
async fn prune_snapshots(dir: &Path, active: &str) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list snapshots in {}: {}", dir.display(), e);
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to list snapshots in {}: {}", dir.display(), e);
                return;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let removed = if parse_generation(&name).is_some() && name != active {
            tokio::fs::remove_dir_all(&path).await
        } else if [MANIFEST_FILE, VECTORS_FILE, ID_MAP_FILE, METADATA_FILE, RAW_VECTORS_FILE]
            .contains(&name.as_str())
        {
            tokio::fs::remove_file(&path).await
        } else {
            continue;
        };
        match removed {
            Ok(()) => debug!("Removed stale snapshot entry {}", path.display()),
            Err(e) => warn!("Failed to remove stale snapshot {}: {}", path.display(), e),
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        RagError::IndexInconsistency(format!("Malformed snapshot file {}: {}", path.display(), e))
    })
}

/// L2-normalize a vector; `None` for zero-norm or non-finite input
#[inline]
pub fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    if vector.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|v| v / norm).collect())
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
