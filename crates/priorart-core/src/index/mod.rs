//! Exact flat vector index
//!
//! Vectors are stored row-major in one contiguous buffer. Search scans every
//! row and keeps the best `k` in a bounded min-heap, so results are exact.
//!
//! # Scores
//!
//! - `Metric::InnerProduct`: dot product. On unit vectors this is cosine
//!   similarity in [-1, 1].
//! - `Metric::L2`: negative squared Euclidean distance, so that for both
//!   metrics a higher score means a closer vector.
//!
//! # Ordering
//!
//! Hits are sorted by descending score. Equal scores keep insertion order
//! (lower position first), which makes results deterministic.

mod format;

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::{PriorArtError, Result};
use crate::record::RecordId;

/// Similarity metric of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    InnerProduct,
    L2,
}

impl Metric {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::InnerProduct => dot(a, b),
            Metric::L2 => -squared_l2(a, b),
        }
    }
}

/// One search result: score and 0-based index position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: f32,
    pub position: usize,
}

impl SearchHit {
    /// Id of the record whose vector sits at this position
    pub fn record_id(&self) -> RecordId {
        RecordId::from_position(self.position)
    }
}

/// Heap entry; `Ord` puts the better hit last
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    position: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            // earlier insertion wins ties
            .then_with(|| other.position.cmp(&self.position))
    }
}

/// Exact nearest-neighbour index over equal-dimension vectors
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    metric: Metric,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            data: Vec::new(),
        }
    }

    /// Bulk-load vectors; positions follow iteration order
    pub fn build<I, V>(dimension: usize, metric: Metric, vectors: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[f32]>,
    {
        let mut index = Self::new(dimension, metric);
        for vector in vectors {
            index.add(vector.as_ref())?;
        }
        tracing::info!(
            "Built flat index: {} vectors, {} dimensions, {:?}",
            index.len(),
            dimension,
            metric
        );
        Ok(index)
    }

    /// Build from an already flattened row-major buffer
    pub fn from_flat(dimension: usize, metric: Metric, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 {
            return Err(PriorArtError::IndexFormat("dimension must be positive".to_string()));
        }
        if data.len() % dimension != 0 {
            return Err(PriorArtError::IndexFormat(format!(
                "{} values is not a multiple of dimension {}",
                data.len(),
                dimension
            )));
        }
        Ok(Self {
            dimension,
            metric,
            data,
        })
    }

    /// Append one vector at the next position
    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dimension(vector)?;
        let position = self.len();
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector stored at `position`
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Exact top-k search
    ///
    /// Returns at most `min(k, len)` hits ordered by descending score, ties
    /// broken by ascending position.
    ///
    /// # Errors
    ///
    /// - `EmptyIndex` if no vectors are loaded
    /// - `DimensionMismatch` if the query length differs from the index dimension
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() {
            return Err(PriorArtError::EmptyIndex);
        }
        self.check_dimension(query)?;

        let limit = k.min(self.len());
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut heap = BinaryHeap::with_capacity(limit.saturating_add(1));
        for (position, row) in self.data.chunks_exact(self.dimension).enumerate() {
            let candidate = Candidate {
                score: self.metric.score(row, query),
                position,
            };
            if heap.len() < limit {
                heap.push(Reverse(candidate));
            } else if let Some(Reverse(worst)) = heap.peek() {
                if candidate > *worst {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }
        }

        let hits: Vec<SearchHit> = heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(c)| SearchHit {
                score: c.score,
                position: c.position,
            })
            .collect();

        tracing::debug!(
            "Flat search over {} vectors returned {} hits",
            self.len(),
            hits.len()
        );
        Ok(hits)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(PriorArtError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Inner product of two equal-length slices
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
