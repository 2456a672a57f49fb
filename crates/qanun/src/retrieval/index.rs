//! Flat inner-product vector index with a JSON document store.
//!
//! The corpora are small (one collection per language), so exact search over
//! unit-normalized vectors is used instead of an approximate structure.
//! Scores are raw inner products; ordering is descending score with ties
//! broken by ascending document index, so results are fully deterministic.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if dimension == 0 {
            return Err(anyhow!("index dimension must be > 0"));
        }
        for (i, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(anyhow!(
                    "vector {} has dimension {}, index expects {}",
                    i,
                    vector.len(),
                    dimension
                ));
            }
        }
        Ok(Self { dimension, vectors })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index file {}", path.display()))?;
        let file: IndexFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse index file {}", path.display()))?;
        Self::new(file.dimension, file.vectors)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Exact top-k search by inner product. Returns `(document_index, score)`
    /// pairs, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(anyhow!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            ));
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| {
                let score: f32 = vector.iter().zip(query).map(|(a, b)| a * b).sum();
                (i, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Document collection backing an index: a JSON array of corpus records,
/// positionally aligned with the index vectors. Records keep their original
/// corpus schema; field extraction happens in the prompt builder's field map.
pub struct DocStore {
    records: Vec<serde_json::Value>,
}

impl DocStore {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document store {}", path.display()))?;
        let records: Vec<serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse document store {}", path.display()))?;
        Ok(Self { records })
    }

    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&serde_json::Value> {
        self.records.get(index)
    }
}
