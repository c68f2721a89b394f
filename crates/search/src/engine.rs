//! Hybrid search engine

use crate::encoder::{QueryEncoder, QueryInput};
use crate::fusion::{fuse, FusionConfig};
use crate::query::SearchQuery;
use crate::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use video_search_common::{validate_vector, IndexEntry, Modality};
use video_search_storage::{IndexStore, ScoredEntry};

/// One ranked clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub video_id: String,
    pub clip_id: String,
    pub start: f64,
    pub end: f64,
    /// Fused relevance in [0, 1]
    pub score: f32,
    /// 1-based position in the result list
    pub rank: usize,
    pub clip_text: String,
    pub video_uri: String,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
}

/// Ranking order of candidates with equal fused scores: earliest start, then video id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    start_ms: u64,
    video_id: String,
}

impl RankKey {
    fn of(entry: &IndexEntry) -> Self {
        Self {
            start_ms: entry.key.start_ms,
            video_id: entry.key.video_id.clone(),
        }
    }
}

/// Vector kNN plus lexical matching over one index store
pub struct HybridSearchEngine {
    index: Arc<dyn IndexStore>,
    encoder: Arc<dyn QueryEncoder>,
    config: FusionConfig,
}

impl HybridSearchEngine {
    #[must_use]
    pub fn new(
        index: Arc<dyn IndexStore>,
        encoder: Arc<dyn QueryEncoder>,
        config: FusionConfig,
    ) -> Self {
        Self {
            index,
            encoder,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Rank clips for `query`
    ///
    /// Identical index contents and query always produce the same order.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        query.validate()?;
        let pool = self.config.pool_size(query.k);

        let (vector, lexical) = tokio::try_join!(
            self.vector_candidates(query, pool),
            self.lexical_candidates(query, pool)
        )?;
        debug!(
            "Search candidates: {} vector, {} lexical",
            vector.len(),
            lexical.len()
        );

        let mut entries: BTreeMap<RankKey, IndexEntry> = BTreeMap::new();
        let vector_scores = Self::keyed(vector, &mut entries);
        let lexical_scores = Self::keyed(lexical, &mut entries);

        let results: Vec<SearchResult> = fuse(&vector_scores, &lexical_scores, &self.config)
            .into_iter()
            .take(query.k)
            .enumerate()
            .filter_map(|(i, fused)| {
                let entry = entries.remove(&fused.key)?;
                Some(SearchResult {
                    video_id: entry.key.video_id,
                    clip_id: entry.clip_id,
                    start: entry.start,
                    end: entry.end,
                    score: fused.score,
                    rank: i + 1,
                    clip_text: entry.text,
                    video_uri: entry.video_uri,
                    vector_score: fused.vector,
                    lexical_score: fused.lexical,
                })
            })
            .collect();

        info!(
            "Search ({:?}, k={}) returned {} results",
            query.modality,
            query.k,
            results.len()
        );
        Ok(results)
    }

    fn keyed(
        candidates: Vec<ScoredEntry>,
        entries: &mut BTreeMap<RankKey, IndexEntry>,
    ) -> Vec<(RankKey, f32)> {
        candidates
            .into_iter()
            .map(|scored| {
                let key = RankKey::of(&scored.entry);
                entries.entry(key.clone()).or_insert(scored.entry);
                (key, scored.score)
            })
            .collect()
    }

    /// What to embed for `modality`: the image for the visual space when
    /// given, otherwise the text
    fn input_for<'a>(query: &'a SearchQuery, modality: Modality) -> Option<QueryInput<'a>> {
        match (modality, query.image_value(), query.text_value()) {
            (Modality::Visual, Some(image), _) => Some(QueryInput::Image(image)),
            (_, _, Some(text)) => Some(QueryInput::Text(text)),
            _ => None,
        }
    }

    /// kNN in each selected space, keeping the best similarity per segment
    async fn vector_candidates(
        &self,
        query: &SearchQuery,
        pool: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let mut best: BTreeMap<RankKey, ScoredEntry> = BTreeMap::new();
        for modality in query.modality.modalities() {
            let Some(input) = Self::input_for(query, *modality) else {
                continue;
            };
            let vector = self.encoder.encode(input, *modality).await?;
            validate_vector(&vector, None).map_err(|e| SearchError::Encoder(e.to_string()))?;

            for scored in self.index.vector_knn(&vector, *modality, pool).await? {
                let key = RankKey::of(&scored.entry);
                match best.get(&key) {
                    Some(existing) if existing.score >= scored.score => {}
                    _ => {
                        best.insert(key, scored);
                    }
                }
            }
        }
        Ok(best.into_values().collect())
    }

    async fn lexical_candidates(
        &self,
        query: &SearchQuery,
        pool: usize,
    ) -> Result<Vec<ScoredEntry>> {
        match query.text_value() {
            Some(text) => Ok(self.index.lexical_match(text, pool).await?),
            None => Ok(Vec::new()),
        }
    }
}
