//! Text embedding for queries and records
//!
//! `TextEncoder` is the seam to the neural model; `BertEncoder` is the Candle
//! implementation used in production. `Embedder` wraps an encoder with
//! optional L2 normalization and a bounded per-session cache keyed by
//! `(text, normalize)`.

pub mod bert;
mod cache;

pub use bert::{BertEncoder, EncoderConfig};

use std::sync::{Arc, Mutex};

use crate::error::{PriorArtError, Result};
use cache::EmbeddingCache;

/// A model that turns text into a fixed-length vector
pub trait TextEncoder: Send + Sync {
    /// Length of every vector returned by `encode_raw`
    fn dimension(&self) -> usize;

    /// Device the model runs on, for reporting
    fn device_label(&self) -> String {
        "cpu".to_string()
    }

    /// Encode text without normalization
    fn encode_raw(&self, text: &str) -> Result<Vec<f32>>;
}

/// Rescale a vector to unit L2 norm in place. Zero vectors are left unchanged.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm = vector
        .iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

/// Session-scoped embedding service
pub struct Embedder {
    encoder: Arc<dyn TextEncoder>,
    cache: Mutex<EmbeddingCache>,
}

impl Embedder {
    /// Wrap an encoder; `cache_capacity` of 0 disables memoization
    pub fn new(encoder: Arc<dyn TextEncoder>, cache_capacity: usize) -> Self {
        Self {
            encoder,
            cache: Mutex::new(EmbeddingCache::new(cache_capacity)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    pub fn device_label(&self) -> String {
        self.encoder.device_label()
    }

    /// Encode text, reusing a cached vector for the same `(text, normalize)`
    pub fn encode(&self, text: &str, normalize: bool) -> Result<Vec<f32>> {
        let key = (text.to_string(), normalize);

        // A poisoned lock only means a previous panic mid-update; treat as a miss
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(vector) = cache.get(&key) {
                tracing::debug!("Embedding cache hit ({} chars)", text.len());
                return Ok(vector);
            }
        }

        let vector = self.encode_uncached(text, normalize)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, vector.clone());
        }
        Ok(vector)
    }

    /// Encode text without consulting or filling the cache
    pub fn encode_uncached(&self, text: &str, normalize: bool) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(PriorArtError::Encoding("text is empty".to_string()));
        }

        let mut vector = self.encoder.encode_raw(text)?;
        if vector.len() != self.encoder.dimension() {
            return Err(PriorArtError::Encoding(format!(
                "encoder returned {} values, expected {}",
                vector.len(),
                self.encoder.dimension()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(PriorArtError::Encoding(
                "encoder returned non-finite values".to_string(),
            ));
        }

        if normalize {
            normalize_l2(&mut vector);
        }
        Ok(vector)
    }

    /// Number of cached vectors
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}
