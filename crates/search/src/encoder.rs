//! Query embedding contract

use crate::Result;
use video_search_common::Modality;

/// What gets embedded for one modality space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryInput<'a> {
    Text(&'a str),
    Image(&'a [u8]),
}

/// Embeds queries with the same model family the index was built with
#[async_trait::async_trait]
pub trait QueryEncoder: Send + Sync {
    async fn encode(&self, input: QueryInput<'_>, modality: Modality) -> Result<Vec<f32>>;
}
