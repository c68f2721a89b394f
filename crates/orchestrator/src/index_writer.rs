//! Turns a run's segments and embeddings into index upserts

use crate::events::EmbeddingSet;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use video_search_common::{IndexEntry, Modality, PipelineError, Result, Segment, VectorRecord};
use video_search_storage::{IndexStore, WriteAck};

/// Acknowledgements of one indexing attempt
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub acks: Vec<WriteAck>,
}

impl IndexReport {
    #[must_use]
    pub fn written(&self) -> usize {
        self.acks.iter().filter(|a| a.is_ok()).count()
    }

    #[must_use]
    pub fn failures(&self) -> Vec<&WriteAck> {
        self.acks.iter().filter(|a| !a.is_ok()).collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.acks.iter().all(WriteAck::is_ok)
    }
}

/// Writes one entry per segment, keyed by `(video_id, segment_start)`
#[derive(Clone)]
pub struct IndexWriter {
    store: Arc<dyn IndexStore>,
}

impl IndexWriter {
    #[must_use]
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    /// Text indexed for segments without a summary: the source file name
    #[must_use]
    pub fn fallback_text(video_uri: &str) -> String {
        video_uri.rsplit('/').next().unwrap_or(video_uri).to_string()
    }

    /// Build entries for `segments` from the embeddings of `modalities`
    ///
    /// Fails when a segment lacks one of the modalities.
    pub fn build_entries(
        video_uri: &str,
        segments: &[Segment],
        embeddings: &EmbeddingSet,
        modalities: &[Modality],
    ) -> Result<Vec<IndexEntry>> {
        let fallback = Self::fallback_text(video_uri);
        let indexed_at = Utc::now();
        segments
            .iter()
            .map(|segment| {
                let mut vectors = BTreeMap::new();
                for modality in modalities {
                    let embedding = embeddings.get(segment.index, *modality).ok_or_else(|| {
                        PipelineError::PartialModality {
                            segment_index: segment.index,
                            modality: *modality,
                            reason: "no embedding to index".to_string(),
                        }
                    })?;
                    vectors.insert(
                        *modality,
                        VectorRecord {
                            vector: embedding.vector.clone(),
                            model_version: embedding.model_version.clone(),
                        },
                    );
                }
                Ok(IndexEntry {
                    key: segment.key(),
                    clip_id: segment.clip_id(),
                    start: segment.start,
                    end: segment.end,
                    video_uri: video_uri.to_string(),
                    text: segment
                        .summary
                        .clone()
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or_else(|| fallback.clone()),
                    vectors,
                    indexed_at,
                })
            })
            .collect()
    }

    /// Upsert every segment of a run and report per-key acks
    pub async fn write(
        &self,
        video_uri: &str,
        segments: &[Segment],
        embeddings: &EmbeddingSet,
        modalities: &[Modality],
    ) -> Result<IndexReport> {
        let entries = Self::build_entries(video_uri, segments, embeddings, modalities)?;
        let acks = self.store.upsert(entries).await?;
        let report = IndexReport { acks };

        if report.is_complete() {
            info!("Indexed {} segments of {}", report.written(), video_uri);
        } else {
            warn!(
                "Indexed {} of {} segments of {}",
                report.written(),
                report.acks.len(),
                video_uri
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_search_common::{Embedding, SegmentKey};
    use video_search_storage::InMemoryIndexStore;

    fn segments() -> Vec<Segment> {
        vec![
            Segment::new("v", 0, 0.0, 6.0, Some("kids playing soccer".to_string())).unwrap(),
            Segment::new("v", 1, 6.0, 12.0, None).unwrap(),
        ]
    }

    fn embeddings(version: &str, value: f32) -> EmbeddingSet {
        let mut set = EmbeddingSet::new();
        for index in 0..2 {
            for modality in Modality::ALL {
                set.insert(Embedding {
                    segment_index: index,
                    modality,
                    vector: vec![value, 1.0],
                    model_version: version.to_string(),
                });
            }
        }
        set
    }

    #[test]
    fn test_build_entries_uses_summary_or_file_name() {
        let entries = IndexWriter::build_entries(
            "s3://uploads/match.mp4",
            &segments(),
            &embeddings("m1", 0.5),
            &Modality::ALL,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "kids playing soccer");
        assert_eq!(entries[1].text, "match.mp4");
        assert_eq!(entries[1].key, SegmentKey::new("v", 6.0));
        assert_eq!(entries[0].vectors.len(), 2);
    }

    #[test]
    fn test_build_entries_requires_every_modality() {
        let mut set = EmbeddingSet::new();
        set.insert(Embedding {
            segment_index: 0,
            modality: Modality::Visual,
            vector: vec![1.0],
            model_version: "m1".to_string(),
        });
        let result = IndexWriter::build_entries("s3://u/a.mp4", &segments(), &set, &Modality::ALL);
        assert!(matches!(result, Err(PipelineError::PartialModality { .. })));
    }

    #[tokio::test]
    async fn test_rewrite_overwrites_entries() {
        let store = Arc::new(InMemoryIndexStore::new());
        let writer = IndexWriter::new(store.clone());

        let first = writer
            .write("s3://u/v.mp4", &segments(), &embeddings("m1", 0.1), &Modality::ALL)
            .await
            .unwrap();
        assert!(first.is_complete());

        let second = writer
            .write("s3://u/v.mp4", &segments(), &embeddings("m2", 0.9), &Modality::ALL)
            .await
            .unwrap();
        assert_eq!(second.written(), 2);

        assert_eq!(store.count_for_video("v").await.unwrap(), 2);
        let entry = store.get(&SegmentKey::new("v", 0.0)).await.unwrap().unwrap();
        assert_eq!(entry.vectors[&Modality::Visual].model_version, "m2");
        assert_eq!(entry.vectors[&Modality::Visual].vector, vec![0.9, 1.0]);
    }

    #[tokio::test]
    async fn test_partial_acks_are_reported() {
        let store = Arc::new(InMemoryIndexStore::new().with_dimension(3));
        let writer = IndexWriter::new(store);
        let report = writer
            .write("s3://u/v.mp4", &segments(), &embeddings("m1", 0.1), &Modality::ALL)
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failures().len(), 2);
    }
}
