//! Keyword relevance over entry text
//!
//! Scoring is BM25 from the `bm25` crate with its English language mode
//! (stopwords, stemming). Corpus statistics are taken from the documents
//! passed in, so the in-memory store scores the whole index while the Qdrant
//! store scores its pre-filtered candidate set.

use bm25::{DefaultTokenizer, Document, Language, SearchEngineBuilder, Tokenizer};

/// Lowercased query terms with stopwords removed and no stemming
///
/// Used to pre-filter candidates on a backend's own full-text index, which
/// stores whole words.
#[must_use]
pub fn query_terms(text: &str) -> Vec<String> {
    let tokenizer = DefaultTokenizer::builder()
        .language_mode(Language::English)
        .normalization(true)
        .stopwords(true)
        .stemming(false)
        .build();
    let mut terms = tokenizer.tokenize(text);
    terms.sort();
    terms.dedup();
    terms
}

/// BM25 score of every document against `query`, in input order
///
/// Documents sharing no term with the query score 0.
#[must_use]
pub fn bm25_scores(query: &str, documents: &[&str]) -> Vec<f32> {
    let mut scores = vec![0.0; documents.len()];
    if documents.is_empty() || query_terms(query).is_empty() {
        return scores;
    }

    let corpus: Vec<Document<usize>> = documents
        .iter()
        .enumerate()
        .map(|(id, text)| Document {
            id,
            contents: (*text).to_string(),
        })
        .collect();
    let engine = SearchEngineBuilder::<usize>::with_documents(Language::English, corpus).build();

    for result in engine.search(query, documents.len()) {
        if let Some(score) = scores.get_mut(result.document.id) {
            *score = result.score.max(0.0);
        }
    }
    scores
}
