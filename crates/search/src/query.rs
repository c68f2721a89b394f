//! Search query model

use crate::{Result, SearchError};
use serde::{Deserialize, Serialize};
use video_search_common::ModalitySelector;

/// Largest result count a query may ask for
pub const MAX_RESULTS: usize = 100;

/// Text and/or image query against the segment index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    /// Encoded image bytes (PNG/JPEG), passed through to the encoder
    #[serde(default)]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub modality: ModalitySelector,
    pub k: usize,
}

impl SearchQuery {
    #[must_use]
    pub fn text(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
            modality: ModalitySelector::Combined,
            k,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    #[must_use]
    pub fn with_modality(mut self, modality: ModalitySelector) -> Self {
        self.modality = modality;
        self
    }

    /// Query text with surrounding whitespace removed, `None` when blank
    #[must_use]
    pub fn text_value(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    #[must_use]
    pub fn image_value(&self) -> Option<&[u8]> {
        self.image.as_deref().filter(|i| !i.is_empty())
    }

    /// Reject queries that cannot be answered before touching the index
    pub fn validate(&self) -> Result<()> {
        let text = self.text_value();
        let image = self.image_value();
        if text.is_none() && image.is_none() {
            return Err(SearchError::Validation(
                "query needs text or an image".to_string(),
            ));
        }
        if text.is_none() && self.modality == ModalitySelector::Audio {
            return Err(SearchError::Validation(
                "image queries cannot search the audio space".to_string(),
            ));
        }
        if self.k == 0 || self.k > MAX_RESULTS {
            return Err(SearchError::Validation(format!(
                "k must be between 1 and {MAX_RESULTS}, got {}",
                self.k
            )));
        }
        Ok(())
    }
}
