//! Score normalization and weighted fusion of vector and lexical candidates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// How raw branch scores are mapped into [0, 1] before fusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `(s - min) / (max - min)`; all-equal scores map to 1.0
    #[default]
    MinMax,
    /// `s / max`
    MaxScale,
    /// Raw scores clamped to [0, 1]
    None,
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "min_max" | "minmax" => Ok(Normalization::MinMax),
            "max_scale" | "max" => Ok(Normalization::MaxScale),
            "none" => Ok(Normalization::None),
            other => Err(format!("unknown normalization: {other}")),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Fusion weights and candidate selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    pub vector_weight: f32,
    pub lexical_weight: f32,
    pub normalization: Normalization,
    /// Candidates fetched per branch, at least `k`
    pub candidate_pool: usize,
    /// Vector candidates at or below this raw similarity are dropped
    pub min_similarity: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vector_weight: env_or("SEARCH_VECTOR_WEIGHT", 0.5),
            lexical_weight: env_or("SEARCH_LEXICAL_WEIGHT", 0.5),
            normalization: env_or("SEARCH_NORMALIZATION", Normalization::MinMax),
            candidate_pool: env_or("SEARCH_CANDIDATE_POOL", 100).max(1),
            min_similarity: env_or("SEARCH_MIN_SIMILARITY", 0.0),
        }
    }
}

impl FusionConfig {
    /// Candidates to fetch from each branch for a query asking for `k`
    #[must_use]
    pub fn pool_size(&self, k: usize) -> usize {
        k.max(self.candidate_pool)
    }
}

/// Normalize one branch's scores, preserving order
#[must_use]
pub fn normalize(scores: &[f32], method: Normalization) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);

    match method {
        Normalization::MinMax => {
            let range = max - min;
            if range <= f32::EPSILON {
                return vec![1.0; scores.len()];
            }
            scores.iter().map(|s| (s - min) / range).collect()
        }
        Normalization::MaxScale => {
            if max <= 0.0 {
                return vec![0.0; scores.len()];
            }
            scores.iter().map(|s| (s / max).clamp(0.0, 1.0)).collect()
        }
        Normalization::None => scores.iter().map(|s| s.clamp(0.0, 1.0)).collect(),
    }
}

/// Fused score of one candidate with its normalized components
#[derive(Debug, Clone, PartialEq)]
pub struct Fused<K> {
    pub key: K,
    pub score: f32,
    pub vector: Option<f32>,
    pub lexical: Option<f32>,
}

/// Combine vector and lexical candidates into one ranking
///
/// Candidates found by both branches score `w_v·v + w_l·l`; a candidate
/// found by one branch keeps that branch's normalized score. Candidates are
/// kept or dropped on their raw branch scores only: a real match that
/// min-max maps to 0 is still returned. The result is ordered by score
/// descending, then by key.
#[must_use]
pub fn fuse<K: Ord + Clone>(
    vector: &[(K, f32)],
    lexical: &[(K, f32)],
    config: &FusionConfig,
) -> Vec<Fused<K>> {
    let vector: Vec<&(K, f32)> = vector
        .iter()
        .filter(|(_, s)| s.is_finite() && *s > config.min_similarity)
        .collect();
    let lexical: Vec<&(K, f32)> = lexical
        .iter()
        .filter(|(_, s)| s.is_finite() && *s > 0.0)
        .collect();

    let vector_scores: Vec<f32> = vector.iter().map(|(_, s)| *s).collect();
    let lexical_scores: Vec<f32> = lexical.iter().map(|(_, s)| *s).collect();

    let mut merged: BTreeMap<K, (Option<f32>, Option<f32>)> = BTreeMap::new();
    for ((key, _), norm) in vector
        .iter()
        .copied()
        .zip(normalize(&vector_scores, config.normalization))
    {
        merged.entry(key.clone()).or_default().0 = Some(norm);
    }
    for ((key, _), norm) in lexical
        .iter()
        .copied()
        .zip(normalize(&lexical_scores, config.normalization))
    {
        merged.entry(key.clone()).or_default().1 = Some(norm);
    }

    let mut fused: Vec<Fused<K>> = merged
        .into_iter()
        .map(|(key, (v, l))| {
            let score = match (v, l) {
                (Some(v), Some(l)) => config.vector_weight * v + config.lexical_weight * l,
                (Some(v), None) => v,
                (None, Some(l)) => l,
                (None, None) => 0.0,
            };
            Fused {
                key,
                score: score.clamp(0.0, 1.0),
                vector: v,
                lexical: l,
            }
        })
        .collect();

    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(normalization: Normalization) -> FusionConfig {
        FusionConfig {
            vector_weight: 0.5,
            lexical_weight: 0.5,
            normalization,
            candidate_pool: 100,
            min_similarity: 0.0,
        }
    }

    #[test]
    fn test_min_max_normalization() {
        let normalized = normalize(&[0.2, 0.6, 1.0], Normalization::MinMax);
        assert!((normalized[0] - 0.0).abs() < 1e-6);
        assert!((normalized[1] - 0.5).abs() < 1e-6);
        assert!((normalized[2] - 1.0).abs() < 1e-6);

        assert_eq!(normalize(&[3.0, 3.0], Normalization::MinMax), vec![1.0, 1.0]);
        assert!(normalize(&[], Normalization::MinMax).is_empty());
    }

    #[test]
    fn test_max_scale_and_none() {
        assert_eq!(normalize(&[2.0, 4.0], Normalization::MaxScale), vec![0.5, 1.0]);
        assert_eq!(normalize(&[-1.0, 0.0], Normalization::MaxScale), vec![0.0, 0.0]);
        assert_eq!(normalize(&[7.5, 0.3], Normalization::None), vec![1.0, 0.3]);
    }

    #[test]
    fn test_equal_weights_average_dual_matches() {
        let vector = vec![("a", 0.8), ("b", 0.4)];
        let lexical = vec![("a", 2.0), ("c", 1.0)];
        let fused = fuse(&vector, &lexical, &config(Normalization::MaxScale));

        let a = fused.iter().find(|f| f.key == "a").unwrap();
        assert!((a.score - (0.5 * 1.0 + 0.5 * 1.0)).abs() < 1e-6);

        // Single-branch candidates keep their normalized score
        let b = fused.iter().find(|f| f.key == "b").unwrap();
        assert!((b.score - 0.5).abs() < 1e-6);
        assert_eq!(b.lexical, None);
        let c = fused.iter().find(|f| f.key == "c").unwrap();
        assert!((c.score - 0.5).abs() < 1e-6);
        assert_eq!(c.vector, None);
    }

    #[test]
    fn test_ties_broken_by_key() {
        let vector = vec![("b", 0.5), ("a", 0.5), ("c", 0.9)];
        let fused = fuse(&vector, &[], &config(Normalization::None));
        let keys: Vec<&str> = fused.iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_weakest_min_max_match_kept() {
        let vector = vec![("a", 1.0), ("b", 0.8)];
        let fused = fuse(&vector, &[], &config(Normalization::MinMax));
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].key, "a");
        assert_eq!(fused[1].key, "b");
        assert_eq!(fused[1].score, 0.0);
        assert_eq!(fused[1].vector, Some(0.0));
    }

    #[test]
    fn test_raw_non_matches_dropped() {
        let vector = vec![("a", 0.9), ("b", 0.0), ("c", f32::NAN)];
        let lexical = vec![("d", 0.0)];
        let fused = fuse(&vector, &lexical, &config(Normalization::MinMax));
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].key, "a");
    }

    #[test]
    fn test_min_similarity_filters_vector_branch() {
        let mut config = config(Normalization::None);
        config.min_similarity = 0.3;
        let fused = fuse(&[("a", 0.2), ("b", 0.6)], &[("a", 0.4)], &config);
        let a = fused.iter().find(|f| f.key == "a").unwrap();
        assert_eq!(a.vector, None);
        assert!((a.score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_one_empty_branch_uses_the_other() {
        let fused = fuse::<&str>(&[], &[("x", 3.0), ("y", 1.0)], &config(Normalization::MaxScale));
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].key, "x");
        assert!(fuse::<&str>(&[], &[], &config(Normalization::MinMax)).is_empty());
    }

    #[test]
    fn test_normalization_parse() {
        assert_eq!("min_max".parse(), Ok(Normalization::MinMax));
        assert_eq!("MAX_SCALE".parse(), Ok(Normalization::MaxScale));
        assert_eq!("none".parse(), Ok(Normalization::None));
        assert!("zscore".parse::<Normalization>().is_err());
    }

    #[test]
    fn test_pool_size() {
        let config = config(Normalization::MinMax);
        assert_eq!(config.pool_size(5), 100);
        assert_eq!(config.pool_size(250), 250);
    }
}
