//! Index store trait and the process-local implementation

use crate::{lexical, ScoredEntry, StorageResult, VectorDistance, VideoSummary, WriteAck};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use video_search_common::{IndexEntry, Modality, SegmentKey};

/// Segment index queried by the search engine and written by the index writer
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    /// Create collections and indexes if missing
    async fn init(&self) -> StorageResult<()>;

    /// Insert or overwrite entries by key, acknowledging each key separately
    ///
    /// Writing an existing key replaces it; vectors of modalities the new
    /// entry does not carry are kept where the backend supports it.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> StorageResult<Vec<WriteAck>>;

    /// Nearest entries to `query` in one modality space, most similar first
    async fn vector_knn(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> StorageResult<Vec<ScoredEntry>>;

    /// Entries whose text matches `text`, most relevant first
    async fn lexical_match(&self, text: &str, k: usize) -> StorageResult<Vec<ScoredEntry>>;

    async fn get(&self, key: &SegmentKey) -> StorageResult<Option<IndexEntry>>;

    /// Replace the lexical text of an existing entry, leaving its vectors
    ///
    /// Returns false when no entry has `key`.
    async fn update_text(&self, key: &SegmentKey, text: &str) -> StorageResult<bool>;

    async fn count_for_video(&self, video_id: &str) -> StorageResult<usize>;

    /// Indexed videos with their clip counts, ordered by video id
    async fn list_videos(&self) -> StorageResult<Vec<VideoSummary>>;

    /// Remove every entry of a video, returning how many were removed
    async fn delete_video(&self, video_id: &str) -> StorageResult<usize>;
}

/// In-memory index store
///
/// Exact kNN by full scan and BM25 over all entries. Suited to tests and
/// single-process deployments.
pub struct InMemoryIndexStore {
    entries: RwLock<BTreeMap<SegmentKey, IndexEntry>>,
    distance: VectorDistance,
    vector_dim: Option<usize>,
}

impl InMemoryIndexStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_distance(VectorDistance::Cosine)
    }

    #[must_use]
    pub fn with_distance(distance: VectorDistance) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            distance,
            vector_dim: None,
        }
    }

    /// Reject writes whose vectors are not of `dim` components
    #[must_use]
    pub fn with_dimension(mut self, dim: usize) -> Self {
        self.vector_dim = Some(dim);
        self
    }

    fn check(&self, entry: &IndexEntry) -> Result<(), String> {
        if entry.vectors.is_empty() {
            return Err("entry has no vectors".to_string());
        }
        if let Some(dim) = self.vector_dim {
            if let Some((modality, record)) =
                entry.vectors.iter().find(|(_, r)| r.vector.len() != dim)
            {
                return Err(format!(
                    "{modality} vector has {} components, expected {dim}",
                    record.vector.len()
                ));
            }
        }
        Ok(())
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

fn rank(mut scored: Vec<ScoredEntry>, k: usize) -> Vec<ScoredEntry> {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entry.key.cmp(&b.entry.key))
    });
    scored.truncate(k);
    scored
}

#[async_trait::async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> StorageResult<Vec<WriteAck>> {
        let mut stored = self.entries.write().await;
        let mut acks = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if let Err(reason) = self.check(&entry) {
                acks.push(WriteAck::failed(entry.key.clone(), reason));
                continue;
            }
            if let Some(previous) = stored.get(&entry.key) {
                entry.retain_missing_from(previous);
            }
            acks.push(WriteAck::ok(entry.key.clone()));
            stored.insert(entry.key.clone(), entry);
        }
        Ok(acks)
    }

    async fn vector_knn(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> StorageResult<Vec<ScoredEntry>> {
        let stored = self.entries.read().await;
        let scored = stored
            .values()
            .filter_map(|entry| {
                let record = entry.vectors.get(&modality)?;
                let score = self.distance.similarity(query, &record.vector)?;
                Some(ScoredEntry {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn lexical_match(&self, text: &str, k: usize) -> StorageResult<Vec<ScoredEntry>> {
        let stored = self.entries.read().await;
        let docs: Vec<&str> = stored.values().map(|e| e.text.as_str()).collect();
        let scores = lexical::bm25_scores(text, &docs);
        let scored = stored
            .values()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0)
            .map(|(entry, score)| ScoredEntry {
                entry: entry.clone(),
                score,
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn get(&self, key: &SegmentKey) -> StorageResult<Option<IndexEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn update_text(&self, key: &SegmentKey, text: &str) -> StorageResult<bool> {
        let mut stored = self.entries.write().await;
        let Some(entry) = stored.get_mut(key) else {
            return Ok(false);
        };
        entry.text = text.to_string();
        Ok(true)
    }

    async fn count_for_video(&self, video_id: &str) -> StorageResult<usize> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.video_id == video_id)
            .count())
    }

    async fn list_videos(&self) -> StorageResult<Vec<VideoSummary>> {
        let stored = self.entries.read().await;
        let mut videos: BTreeMap<&str, VideoSummary> = BTreeMap::new();
        for entry in stored.values() {
            videos
                .entry(entry.key.video_id.as_str())
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
        let mut stored = self.entries.write().await;
        let before = stored.len();
        stored.retain(|key, _| key.video_id != video_id);
        Ok(before - stored.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use video_search_common::{clip_id, VectorRecord};

    fn entry(video_id: &str, start: f64, visual: Vec<f32>, text: &str) -> IndexEntry {
        let mut vectors = BTreeMap::new();
        vectors.insert(
            Modality::Visual,
            VectorRecord {
                vector: visual,
                model_version: "m1".to_string(),
            },
        );
        IndexEntry {
            key: SegmentKey::new(video_id, start),
            clip_id: clip_id(video_id, start, start + 5.0),
            start,
            end: start + 5.0,
            video_uri: format!("s3://bucket/{video_id}.mp4"),
            text: text.to_string(),
            vectors,
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_same_key_overwrites() {
        let store = InMemoryIndexStore::new();
        store
            .upsert(vec![entry("v1", 0.0, vec![1.0, 0.0], "first")])
            .await
            .unwrap();
        let acks = store
            .upsert(vec![entry("v1", 0.0, vec![0.0, 1.0], "second")])
            .await
            .unwrap();
        assert!(acks.iter().all(WriteAck::is_ok));

        assert_eq!(store.count_for_video("v1").await.unwrap(), 1);
        let stored = store.get(&SegmentKey::new("v1", 0.0)).await.unwrap().unwrap();
        assert_eq!(stored.vectors[&Modality::Visual].vector, vec![0.0, 1.0]);
        assert_eq!(stored.text, "second");
    }

    #[tokio::test]
    async fn test_upsert_reports_per_key_failures() {
        let store = InMemoryIndexStore::new().with_dimension(2);
        let mut empty = entry("v1", 5.0, vec![1.0, 0.0], "no vectors");
        empty.vectors.clear();
        let acks = store
            .upsert(vec![
                entry("v1", 0.0, vec![1.0, 0.0], "ok"),
                entry("v1", 10.0, vec![1.0, 0.0, 0.0], "wrong dim"),
                empty,
            ])
            .await
            .unwrap();

        assert!(acks[0].is_ok());
        assert!(!acks[1].is_ok());
        assert!(!acks[2].is_ok());
        assert_eq!(store.count_for_video("v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vector_knn_orders_by_similarity() {
        let store = InMemoryIndexStore::new();
        store
            .upsert(vec![
                entry("v1", 0.0, vec![1.0, 0.0], "a"),
                entry("v1", 5.0, vec![0.7, 0.7], "b"),
                entry("v1", 10.0, vec![0.0, 1.0], "c"),
            ])
            .await
            .unwrap();

        let hits = store.vector_knn(&[1.0, 0.1], Modality::Visual, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.start, 0.0);
        assert_eq!(hits[1].entry.start, 5.0);

        let audio = store.vector_knn(&[1.0, 0.0], Modality::Audio, 5).await.unwrap();
        assert!(audio.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_match_skips_non_matching() {
        let store = InMemoryIndexStore::new();
        store
            .upsert(vec![
                entry("v1", 0.0, vec![1.0], "person walking in park"),
                entry("v1", 5.0, vec![1.0], "car on highway"),
            ])
            .await
            .unwrap();

        let hits = store.lexical_match("walking person", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.text, "person walking in park");
        assert!(store.lexical_match("submarine", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_text_changes_lexical_matches() {
        let store = InMemoryIndexStore::new();
        store
            .upsert(vec![entry("v1", 0.0, vec![1.0], "park.mp4")])
            .await
            .unwrap();
        assert!(store.lexical_match("dog running", 5).await.unwrap().is_empty());

        let key = SegmentKey::new("v1", 0.0);
        assert!(store.update_text(&key, "a dog running on grass").await.unwrap());

        let hits = store.lexical_match("dog running", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.vectors[&Modality::Visual].vector, vec![1.0]);

        let missing = SegmentKey::new("v1", 99.0);
        assert!(!store.update_text(&missing, "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_delete_videos() {
        let store = InMemoryIndexStore::new();
        store
            .upsert(vec![
                entry("v1", 0.0, vec![1.0], "a"),
                entry("v1", 5.0, vec![1.0], "b"),
                entry("v2", 0.0, vec![1.0], "c"),
            ])
            .await
            .unwrap();

        let videos = store.list_videos().await.unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].video_id, "v1");
        assert_eq!(videos[0].clip_count, 2);

        assert_eq!(store.delete_video("v1").await.unwrap(), 2);
        assert_eq!(store.count_for_video("v1").await.unwrap(), 0);
        assert_eq!(store.count_for_video("v2").await.unwrap(), 1);
    }
}
