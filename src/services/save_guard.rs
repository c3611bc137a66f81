//! Save guard: the dedup gate every save passes through.
//!
//! Three tiers with short-circuit evaluation:
//!
//! 1. **Recent capture**: in-memory LRU of content hashes from this process.
//! 2. **Exact match**: byte-identical content within the project.
//! 3. **Semantic**: embedding cosine similarity above the configured
//!    threshold, when the embedding worker is available.

use crate::embedding::{EmbeddingHandle, cosine_similarity};
use crate::models::ObservationId;
use crate::storage::{EmbeddingStore, ObservationStore};
use crate::{Error, Result};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Recent-capture cache capacity.
const RECENT_CACHE_SIZE: usize = 256;

/// Dedup gate shared by hook capture and explicit saves.
pub struct SaveGuard {
    embeddings: EmbeddingStore,
    handle: Arc<EmbeddingHandle>,
    recent: Mutex<LruCache<String, String>>,
    near_duplicate_threshold: f32,
}

impl SaveGuard {
    /// Creates a save guard.
    #[must_use]
    pub fn new(
        embeddings: EmbeddingStore,
        handle: Arc<EmbeddingHandle>,
        near_duplicate_threshold: f32,
    ) -> Self {
        let capacity = NonZeroUsize::new(RECENT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            embeddings,
            handle,
            recent: Mutex::new(LruCache::new(capacity)),
            near_duplicate_threshold,
        }
    }

    /// Checks content against all three tiers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Duplicate`] naming the existing observation on any
    /// match, or a storage error if lookups fail.
    pub fn check(&self, store: &ObservationStore, content: &str) -> Result<()> {
        let key = cache_key(store.project_hash(), content);
        if let Some(existing) = self.recent_hit(&key) {
            metrics::counter!("laminark_save_guard_rejections_total", "tier" => "recent")
                .increment(1);
            return Err(Error::Duplicate { existing_id: existing });
        }

        if let Some(existing) = store.find_exact(content)? {
            metrics::counter!("laminark_save_guard_rejections_total", "tier" => "exact")
                .increment(1);
            return Err(Error::Duplicate {
                existing_id: existing.to_string(),
            });
        }

        if let Some((existing, similarity)) = self.semantic_hit(store, content)? {
            tracing::debug!(
                existing = %existing,
                similarity,
                "save rejected as semantic near-duplicate"
            );
            metrics::counter!("laminark_save_guard_rejections_total", "tier" => "semantic")
                .increment(1);
            return Err(Error::Duplicate {
                existing_id: existing.to_string(),
            });
        }

        Ok(())
    }

    /// Records a successful save so immediate repeats hit the recent tier.
    pub fn remember(&self, store: &ObservationStore, content: &str, id: &ObservationId) {
        let key = cache_key(store.project_hash(), content);
        if let Ok(mut cache) = self.recent.lock() {
            cache.put(key, id.to_string());
        }
    }

    fn recent_hit(&self, key: &str) -> Option<String> {
        self.recent.lock().ok()?.get(key).cloned()
    }

    /// Nearest-neighbour check; silently absent when embeddings are down.
    fn semantic_hit(
        &self,
        store: &ObservationStore,
        content: &str,
    ) -> Result<Option<(ObservationId, f32)>> {
        if !self.handle.is_ready() {
            return Ok(None);
        }
        let Some(query) = self.handle.embed(content) else {
            return Ok(None);
        };
        let neighbours = self.embeddings.search(store.project_hash(), &query, 1)?;
        for (id, _distance) in neighbours {
            let Some(vector) = self.embeddings.get(&id)? else {
                continue;
            };
            let similarity = cosine_similarity(&query, &vector);
            if similarity >= self.near_duplicate_threshold {
                return Ok(Some((id, similarity)));
            }
        }
        Ok(None)
    }
}

fn cache_key(project_hash: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_hash.as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
