pub mod onnx;

use anyhow::Result;

pub use onnx::{OnnxEncoder, OnnxEncoderConfig};

/// Unified sentence-embedding trait. One implementation exists per language
/// profile plus the shared multilingual fallback; the pipeline never touches
/// model internals beyond this boundary.
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query into a unit-length vector.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding vector dimension.
    fn dimension(&self) -> usize;
}
