//! FastEmbed-based embedder (ONNX, local inference).

use super::Embedder;
use crate::{Error, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Mutex;

/// FastEmbed embedder using all-MiniLM-L6-v2.
pub struct FastEmbedEmbedder {
    model: Mutex<TextEmbedding>,
    dimensions: usize,
}

impl FastEmbedEmbedder {
    /// Embedding dimensions for all-MiniLM-L6-v2.
    pub const DEFAULT_DIMENSIONS: usize = 384;

    /// Model name recorded on embedded observations.
    pub const MODEL_NAME: &'static str = "all-MiniLM-L6-v2";

    /// Loads the model, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if the model cannot be loaded.
    pub fn load() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::AdapterUnavailable {
            adapter: "fastembed".to_string(),
            cause: e.to_string(),
        })?;
        Ok(Self {
            model: Mutex::new(model),
            dimensions: Self::DEFAULT_DIMENSIONS,
        })
    }
}

impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text]).and_then(|mut batch| {
            batch.pop().ok_or_else(|| Error::AdapterUnavailable {
                adapter: "fastembed".to_string(),
                cause: "empty embedding batch".to_string(),
            })
        })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut model = match self.model.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::AdapterUnavailable {
                adapter: "fastembed".to_string(),
                cause: e.to_string(),
            })
    }
}
