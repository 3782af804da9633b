use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::clients::{LLMClient, LLMError};
use crate::prompts::RAG_CONTEXT_SEPARATOR;

pub mod chunks;

pub use chunks::{
    chunk_document, chunk_text, chunk_xml, split_markdown_by_level, split_markdown_by_sections,
};

/// Version written into every snapshot. Snapshots with any other version are rejected.
pub const STORE_FORMAT_VERSION: u32 = 1;

pub const DEFAULT_MIN_SIMILARITY: f32 = 0.6;
pub const DEFAULT_TOP_N: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Vector store not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid vector store format: {0}")]
    Format(String),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] LLMError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    fn new(text: String, vector: Vec<f32>, seq: usize) -> Self {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Self {
            id: format!("{}-{}", &digest[..16], seq),
            text,
            vector,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format_version: u32,
    model: &'a str,
    dimension: usize,
    records: &'a [EmbeddingRecord],
}

#[derive(Deserialize)]
struct Snapshot {
    format_version: u32,
    model: String,
    dimension: usize,
    records: Vec<EmbeddingRecord>,
}

/// Cosine similarity computed in f64. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Joins retrieved passages into the block injected ahead of a question.
pub fn format_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join(RAG_CONTEXT_SEPARATOR)
}

/// Timing and volume counters for embedding and search work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RagMetrics {
    pub embeddings: u64,
    pub total_dimensions: u64,
    pub total_characters: u64,
    pub embedding_time: Duration,
    pub searches: u64,
    pub search_time: Duration,
}

impl RagMetrics {
    pub fn record_embedding(&mut self, content: &str, dimensions: usize, elapsed: Duration) {
        self.embeddings += 1;
        self.total_dimensions += dimensions as u64;
        self.total_characters += content.chars().count() as u64;
        self.embedding_time += elapsed;
    }

    pub fn record_search(&mut self, elapsed: Duration) {
        self.searches += 1;
        self.search_time += elapsed;
    }

    pub fn avg_dimensions(&self) -> f64 {
        ratio(self.total_dimensions as f64, self.embeddings)
    }

    pub fn avg_embedding_time(&self) -> Duration {
        average(self.embedding_time, self.embeddings)
    }

    pub fn avg_chars_per_document(&self) -> f64 {
        ratio(self.total_characters as f64, self.embeddings)
    }

    pub fn avg_search_time(&self) -> Duration {
        average(self.search_time, self.searches)
    }

    pub fn total_operations(&self) -> u64 {
        self.embeddings + self.searches
    }

    pub fn total_time(&self) -> Duration {
        self.embedding_time + self.search_time
    }

    /// Mean duration of one embedding or search.
    pub fn avg_operation_time(&self) -> Duration {
        average(self.total_time(), self.total_operations())
    }

    /// Embedding cost for the characters embedded so far, priced per 1000
    /// characters.
    pub fn estimate_cost(&self, cost_per_thousand_chars: f64) -> f64 {
        self.total_characters as f64 / 1000.0 * cost_per_thousand_chars
    }

    pub fn cost_per_document(&self, cost_per_thousand_chars: f64) -> f64 {
        ratio(self.estimate_cost(cost_per_thousand_chars), self.embeddings)
    }

    /// Operations per second over the recorded time.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_time().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_operations() as f64 / secs
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn ratio(total: f64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { total / count as f64 }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// In-memory embedding store with JSON snapshots.
///
/// The vector dimension is fixed by the first record. Records are never
/// updated in place; identical chunks ingested twice become two records.
#[derive(Debug, Default)]
pub struct VectorStore {
    model: String,
    dimension: Option<usize>,
    records: Vec<EmbeddingRecord>,
    next_seq: usize,
    metrics: Mutex<RagMetrics>,
}

impl VectorStore {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn metrics(&self) -> RagMetrics {
        self.metrics.lock().clone()
    }

    /// Drops every record. The dimension is released as well.
    pub fn reset(&mut self) {
        self.records.clear();
        self.dimension = None;
        self.next_seq = 0;
        self.metrics.lock().reset();
    }

    /// Stores an already computed embedding.
    pub fn add(&mut self, text: impl Into<String>, vector: Vec<f32>) -> Result<&EmbeddingRecord, StoreError> {
        if vector.is_empty() {
            return Err(StoreError::InvalidArgument("empty embedding vector".to_string()));
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }

        let record = EmbeddingRecord::new(text.into(), vector, self.next_seq);
        self.next_seq += 1;
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }

    /// Embeds and stores each chunk in order, stopping at the first failure.
    /// Records added before the failure stay in memory; nothing is written to disk.
    pub async fn ingest<S>(&mut self, embedder: &dyn LLMClient, chunks: &[S]) -> Result<usize, StoreError>
    where
        S: AsRef<str> + Sync,
    {
        let mut added = 0;
        for chunk in chunks {
            let text = chunk.as_ref();
            let started = Instant::now();
            let vector = embedder.embed(&self.model, text).await?;
            self.metrics
                .lock()
                .record_embedding(text, vector.len(), started.elapsed());
            let record = self.add(text, vector)?;
            debug!(id = %record.id, chars = text.len(), "stored embedding");
            added += 1;
        }
        info!(added, total = self.records.len(), model = %self.model, "ingestion finished");
        Ok(added)
    }

    /// Embeds `query` and returns at most `n` records scoring at least `min_similarity`.
    pub async fn search_top_n(
        &self,
        embedder: &dyn LLMClient,
        query: &str,
        min_similarity: f32,
        n: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if n == 0 {
            return Err(StoreError::InvalidArgument("n must be positive".to_string()));
        }
        let vector = embedder.embed(&self.model, query).await?;
        self.search_top_n_by_vector(&vector, min_similarity, n)
    }

    pub fn search_top_n_by_vector(
        &self,
        vector: &[f32],
        min_similarity: f32,
        n: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if n == 0 {
            return Err(StoreError::InvalidArgument("n must be positive".to_string()));
        }
        let mut results = self.search_similarities(vector, min_similarity)?;
        results.truncate(n);
        Ok(results)
    }

    /// Every record scoring at least `min_similarity`, best first. Equal
    /// scores keep insertion order.
    pub fn search_similarities(
        &self,
        vector: &[f32],
        min_similarity: f32,
    ) -> Result<Vec<SearchResult>, StoreError> {
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            _ => {}
        }

        let started = Instant::now();
        let min = f64::from(min_similarity);
        let mut results: Vec<SearchResult> = self
            .records
            .iter()
            .filter_map(|record| {
                let score = cosine_similarity(vector, &record.vector);
                (score >= min).then(|| SearchResult {
                    id: record.id.clone(),
                    text: record.text.clone(),
                    score,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.metrics.lock().record_search(started.elapsed());

        debug!(matches = results.len(), min_similarity, "similarity search");
        Ok(results)
    }

    pub async fn exists(path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Writes the snapshot next to `path` and renames it into place.
    pub async fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = SnapshotRef {
            format_version: STORE_FORMAT_VERSION,
            model: &self.model,
            dimension: self.dimension.unwrap_or(0),
            records: &self.records,
        };
        let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| StoreError::Format(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        info!(path = %path.display(), records = self.records.len(), "vector store saved");
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&body).map_err(|e| StoreError::Format(e.to_string()))?;
        if snapshot.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::Format(format!(
                "unsupported format version {}",
                snapshot.format_version
            )));
        }
        if let Some(bad) = snapshot
            .records
            .iter()
            .find(|r| r.vector.len() != snapshot.dimension)
        {
            return Err(StoreError::Format(format!(
                "record {} has {} dimensions, expected {}",
                bad.id,
                bad.vector.len(),
                snapshot.dimension
            )));
        }

        info!(path = %path.display(), records = snapshot.records.len(), "vector store loaded");
        Ok(Self {
            model: snapshot.model,
            dimension: (!snapshot.records.is_empty()).then_some(snapshot.dimension),
            next_seq: snapshot.records.len(),
            records: snapshot.records,
            metrics: Mutex::default(),
        })
    }
}
