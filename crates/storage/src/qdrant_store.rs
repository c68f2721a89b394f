//! Index store backed by Qdrant
//!
//! One point per segment, keyed by a hash of `(video_id, start_ms)`, with a
//! named vector per modality and the entry metadata in the payload. Lexical
//! queries use Qdrant's full-text payload index to pre-filter candidates and
//! score them with BM25 on the client.

use crate::{
    lexical, IndexStore, ScoredEntry, StorageError, StorageResult, VideoSummary, WriteAck,
};
use chrono::{DateTime, Utc};
use qdrant_client::{
    qdrant::{
        value::Kind, vectors_config::Config, Condition, CountPointsBuilder,
        CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance,
        FieldType, Filter, GetPointsBuilder, PointId, PointStruct, PointsIdsList,
        ScrollPointsBuilder, SearchPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder,
        Value, VectorParams, VectorParamsMap, VectorsConfig,
    },
    Qdrant,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use video_search_common::{IndexEntry, Modality, SegmentKey};

const SCROLL_PAGE: u32 = 256;
const LEXICAL_PREFETCH_FACTOR: usize = 4;

/// Qdrant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    /// Qdrant URL (e.g., "<http://localhost:6334>")
    pub url: String,

    /// API key (optional, for cloud deployment)
    pub api_key: Option<String>,

    /// Collection name
    pub collection: String,

    /// Dimension of every modality vector
    pub vector_dim: u64,

    /// Distance metric (Cosine, Euclidean, Dot)
    pub distance: VectorDistance,
}

/// Vector distance metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorDistance {
    /// Cosine similarity (default for most embeddings)
    Cosine,
    /// Euclidean distance (L2)
    Euclidean,
    /// Dot product
    Dot,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("QDRANT_URL")
                .unwrap_or_else(|_| "http://localhost:6334".to_string()),
            api_key: std::env::var("QDRANT_API_KEY").ok(),
            collection: std::env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "video_clips".to_string()),
            vector_dim: std::env::var("QDRANT_VECTOR_DIM")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(1024),
            distance: VectorDistance::Cosine,
        }
    }
}

impl VectorDistance {
    fn to_qdrant_distance(self) -> Distance {
        match self {
            VectorDistance::Cosine => Distance::Cosine,
            VectorDistance::Euclidean => Distance::Euclid,
            VectorDistance::Dot => Distance::Dot,
        }
    }

    /// Similarity between two vectors, higher is closer
    ///
    /// Returns `None` when the dimensions differ.
    #[must_use]
    pub fn similarity(self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self {
            VectorDistance::Dot => Some(dot),
            VectorDistance::Cosine => {
                let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    Some(0.0)
                } else {
                    Some(dot / (norm_a * norm_b))
                }
            }
            VectorDistance::Euclidean => {
                let dist = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                Some(Self::euclidean_similarity(dist))
            }
        }
    }

    fn euclidean_similarity(distance: f32) -> f32 {
        1.0 / (1.0 + distance)
    }

    /// Turn a score reported by Qdrant into a higher-is-closer similarity
    fn similarity_from_score(self, score: f32) -> f32 {
        match self {
            VectorDistance::Euclidean => Self::euclidean_similarity(score),
            VectorDistance::Cosine | VectorDistance::Dot => score,
        }
    }
}

/// Qdrant index store implementation
pub struct QdrantIndexStore {
    client: Qdrant,
    collection: String,
    vector_dim: u64,
    distance: VectorDistance,
}

impl QdrantIndexStore {
    /// Create a new Qdrant index store client
    pub async fn new(config: QdrantConfig) -> StorageResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        Ok(Self {
            client,
            collection: config.collection,
            vector_dim: config.vector_dim,
            distance: config.distance,
        })
    }

    fn video_filter(video_id: &str) -> Filter {
        Filter {
            must: vec![Condition::matches("video_id", video_id.to_string())],
            ..Default::default()
        }
    }

    async fn scroll_all(&self, filter: Option<Filter>) -> StorageResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut offset: Option<PointId> = None;
        loop {
            let mut request = ScrollPointsBuilder::new(&self.collection)
                .limit(SCROLL_PAGE)
                .with_payload(true);
            if let Some(filter) = filter.clone() {
                request = request.filter(filter);
            }
            if let Some(offset) = offset.take() {
                request = request.offset(offset);
            }
            let page = self
                .client
                .scroll(request)
                .await
                .map_err(|e| StorageError::QdrantError(e.to_string()))?;
            entries.extend(page.result.iter().filter_map(|p| entry_from_payload(&p.payload)));
            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }
}

/// Stable point id for an index key
fn point_id(key: &SegmentKey) -> u64 {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn to_payload(entry: &IndexEntry) -> HashMap<String, Value> {
    let mut payload: HashMap<String, Value> = HashMap::with_capacity(8 + entry.vectors.len());
    payload.insert("video_id".to_string(), Value::from(entry.key.video_id.clone()));
    payload.insert("start_ms".to_string(), Value::from(entry.key.start_ms as i64));
    payload.insert("start".to_string(), Value::from(entry.start));
    payload.insert("end".to_string(), Value::from(entry.end));
    payload.insert("clip_id".to_string(), Value::from(entry.clip_id.clone()));
    payload.insert("clip_text".to_string(), Value::from(entry.text.clone()));
    payload.insert("video_uri".to_string(), Value::from(entry.video_uri.clone()));
    payload.insert(
        "indexed_at".to_string(),
        Value::from(entry.indexed_at.to_rfc3339()),
    );
    for (modality, record) in &entry.vectors {
        payload.insert(
            format!("model_version_{}", modality.name()),
            Value::from(record.model_version.clone()),
        );
    }
    payload
}

fn string_field(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn number_field(payload: &HashMap<String, Value>, key: &str) -> Option<f64> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::DoubleValue(v) => Some(*v),
        Kind::IntegerValue(v) => Some(*v as f64),
        _ => None,
    }
}

/// Rebuild an entry from its payload; vectors are not fetched back
fn entry_from_payload(payload: &HashMap<String, Value>) -> Option<IndexEntry> {
    let video_id = string_field(payload, "video_id")?;
    let start_ms = number_field(payload, "start_ms")? as u64;
    let indexed_at = string_field(payload, "indexed_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(IndexEntry {
        key: SegmentKey { video_id, start_ms },
        clip_id: string_field(payload, "clip_id").unwrap_or_default(),
        start: number_field(payload, "start")?,
        end: number_field(payload, "end")?,
        video_uri: string_field(payload, "video_uri").unwrap_or_default(),
        text: string_field(payload, "clip_text").unwrap_or_default(),
        vectors: BTreeMap::new(),
        indexed_at,
    })
}

#[async_trait::async_trait]
impl IndexStore for QdrantIndexStore {
    async fn init(&self) -> StorageResult<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if exists {
            return Ok(());
        }

        let map: HashMap<String, VectorParams> = Modality::ALL
            .iter()
            .map(|m| {
                (
                    m.name().to_string(),
                    VectorParams {
                        size: self.vector_dim,
                        distance: self.distance.to_qdrant_distance().into(),
                        ..Default::default()
                    },
                )
            })
            .collect();

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(VectorsConfig {
                    config: Some(Config::ParamsMap(VectorParamsMap { map })),
                }),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        for (field, field_type) in [
            ("video_id", FieldType::Keyword),
            ("clip_text", FieldType::Text),
        ] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    field_type,
                ))
                .await
                .map_err(|e| StorageError::QdrantError(e.to_string()))?;
        }

        tracing::info!("Created Qdrant collection: {}", self.collection);
        Ok(())
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> StorageResult<Vec<WriteAck>> {
        let mut acks = Vec::with_capacity(entries.len());
        let mut points = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.vectors.is_empty() {
                acks.push(WriteAck::failed(entry.key.clone(), "entry has no vectors"));
                continue;
            }
            if let Some((modality, _)) = entry
                .vectors
                .iter()
                .find(|(_, r)| r.vector.len() as u64 != self.vector_dim)
            {
                acks.push(WriteAck::failed(
                    entry.key.clone(),
                    format!("{modality} vector dimension differs from {}", self.vector_dim),
                ));
                continue;
            }
            let vectors: HashMap<String, Vec<f32>> = entry
                .vectors
                .iter()
                .map(|(m, r)| (m.name().to_string(), r.vector.clone()))
                .collect();
            points.push(PointStruct::new(
                point_id(&entry.key),
                vectors,
                to_payload(entry),
            ));
            acks.push(WriteAck::ok(entry.key.clone()));
        }

        if points.is_empty() {
            return Ok(acks);
        }

        // A batch is applied atomically, so its keys share one outcome
        if let Err(e) = self
            .client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
        {
            let reason = e.to_string();
            tracing::warn!("Qdrant upsert failed: {}", reason);
            for ack in acks.iter_mut().filter(|a| a.is_ok()) {
                ack.error = Some(reason.clone());
            }
        }
        Ok(acks)
    }

    async fn vector_knn(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> StorageResult<Vec<ScoredEntry>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query, k as u64)
                    .vector_name(modality.name())
                    .with_payload(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                entry_from_payload(&point.payload).map(|entry| ScoredEntry {
                    entry,
                    score: self.distance.similarity_from_score(point.score),
                })
            })
            .collect())
    }

    /// Full-text prefilter on `clip_text`, then BM25 over the candidates
    ///
    /// Document frequencies and average length come from the prefiltered
    /// candidate set, not the whole collection, so a term's IDF is local to
    /// the documents that matched at least one query term. Ranking among
    /// candidates is unaffected by non-matching documents; absolute scores
    /// differ from the in-memory store's.
    async fn lexical_match(&self, text: &str, k: usize) -> StorageResult<Vec<ScoredEntry>> {
        let terms = lexical::query_terms(text);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let prefetch = (k * LEXICAL_PREFETCH_FACTOR).max(SCROLL_PAGE as usize) as u32;
        let filter = Filter {
            should: terms
                .into_iter()
                .map(|term| Condition::matches_text("clip_text", term))
                .collect(),
            ..Default::default()
        };
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .filter(filter)
                    .limit(prefetch)
                    .with_payload(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;

        let candidates: Vec<IndexEntry> = response
            .result
            .iter()
            .filter_map(|p| entry_from_payload(&p.payload))
            .collect();
        let docs: Vec<&str> = candidates.iter().map(|e| e.text.as_str()).collect();
        let scores = lexical::bm25_scores(text, &docs);

        let mut scored: Vec<ScoredEntry> = candidates
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0)
            .map(|(entry, score)| ScoredEntry { entry, score })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.entry.key.cmp(&b.entry.key)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn get(&self, key: &SegmentKey) -> StorageResult<Option<IndexEntry>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![PointId::from(point_id(key))])
                    .with_payload(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;
        Ok(response
            .result
            .first()
            .and_then(|p| entry_from_payload(&p.payload)))
    }

    async fn update_text(&self, key: &SegmentKey, text: &str) -> StorageResult<bool> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        let mut payload: HashMap<String, Value> = HashMap::with_capacity(1);
        payload.insert("clip_text".to_string(), Value::from(text.to_string()));
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points_selector(PointsIdsList {
                        ids: vec![PointId::from(point_id(key))],
                    })
                    .wait(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;
        Ok(true)
    }

    async fn count_for_video(&self, video_id: &str) -> StorageResult<usize> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(Self::video_filter(video_id))
                    .exact(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;
        Ok(response.result.map_or(0, |r| r.count as usize))
    }

    async fn list_videos(&self) -> StorageResult<Vec<VideoSummary>> {
        let mut videos: BTreeMap<String, VideoSummary> = BTreeMap::new();
        for entry in self.scroll_all(None).await? {
            videos
                .entry(entry.key.video_id.clone())
                .or_insert_with(|| VideoSummary {
                    video_id: entry.key.video_id.clone(),
                    video_uri: entry.video_uri.clone(),
                    clip_count: 0,
                })
                .clip_count += 1;
        }
        Ok(videos.into_values().collect())
    }

    async fn delete_video(&self, video_id: &str) -> StorageResult<usize> {
        let count = self.count_for_video(video_id).await?;
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Self::video_filter(video_id))
                    .wait(true),
            )
            .await
            .map_err(|e| StorageError::QdrantError(e.to_string()))?;
        Ok(count)
    }
}
