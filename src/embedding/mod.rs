//! Embedding generation and vector math.
//!
//! The model runs on a dedicated worker thread (see [`worker`]); the rest of
//! the engine talks to it through an [`EmbeddingHandle`] and treats `None`
//! responses as "not available right now". Without the
//! `fastembed-embeddings` feature the handle reports not-ready and the
//! pipeline runs keyword-only.

// Allow cast precision loss for vector math on observation-scale data.
#![allow(clippy::cast_precision_loss)]

#[cfg(feature = "fastembed-embeddings")]
mod fastembed;
mod worker;

pub use worker::{EmbeddingHandle, WorkerStatus};

use crate::Result;
use std::sync::{Mutex, MutexGuard};

/// Poison-recovering lock helper for handle-internal state.
pub(crate) fn acquire_handle_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("embedding handle mutex was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Trait for embedding generators.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Returns the model name recorded on embedded observations.
    fn model_name(&self) -> &str;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched dimensions or zero-magnitude inputs, which
/// ranks such pairs as maximally distant rather than erroring in the middle
/// of a search.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance: `1 - cosine_similarity`.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Element-wise mean of a set of equal-dimension vectors.
///
/// Returns `None` when the set is empty or dimensions disagree.
#[must_use]
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dims = first.len();
    if vectors.iter().any(|v| v.len() != dims) {
        return None;
    }
    let mut sum = vec![0.0f32; dims];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    for acc in &mut sum {
        *acc /= n;
    }
    Some(sum)
}

/// Encodes a vector as little-endian f32 bytes for BLOB storage.
#[must_use]
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        blob.extend_from_slice(&x.to_le_bytes());
    }
    blob
}

/// Decodes a BLOB back into a vector; `None` on ragged length.
#[must_use]
pub fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0];
        let c = [0.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn distance_complements_similarity() {
        let a = [0.6, 0.8];
        let b = [0.8, 0.6];
        let d = cosine_distance(&a, &b);
        assert!((d + cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob_to_vector(&blob), Some(v));
        assert_eq!(blob_to_vector(&[1, 2, 3]), None);
    }

    #[test]
    fn mean_vector_averages() {
        let vs = vec![vec![1.0, 3.0], vec![3.0, 5.0]];
        assert_eq!(mean_vector(&vs), Some(vec![2.0, 4.0]));
        assert_eq!(mean_vector(&[]), None);
        assert_eq!(mean_vector(&[vec![1.0], vec![1.0, 2.0]]), None);
    }
}
