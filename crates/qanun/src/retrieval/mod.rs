//! Per-language semantic retrieval.
//!
//! Each language owns an (embedder, index, document store) triple, loaded
//! lazily on first use and cached for the process lifetime. When a triple is
//! unavailable the service degrades to a shared multilingual triple, and any
//! remaining failure degrades to zero documents: retrieval never aborts a
//! request, since generation can still answer with a caveat.

pub mod index;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::QaConfig;
use crate::embeddings::{EmbeddingModel, OnnxEncoder, OnnxEncoderConfig};
use crate::error::QaError;
use crate::language::Language;
use index::{DocStore, FlatIndex};

/// One ranked retrieval hit. `record` keeps the corpus's original schema;
/// the prompt builder's field map extracts title/body per source language.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub id: String,
    pub similarity: f32,
    pub source_language: Language,
    pub record: serde_json::Value,
}

/// An embedder bound to its index and documents.
pub struct LoadedIndex {
    embedder: Arc<dyn EmbeddingModel>,
    index: FlatIndex,
    docs: DocStore,
}

impl LoadedIndex {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, index: FlatIndex, docs: DocStore) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(anyhow!(
                "embedder dimension {} does not match index dimension {}",
                embedder.dimension(),
                index.dimension()
            ));
        }
        if index.len() != docs.len() {
            tracing::warn!(
                vectors = index.len(),
                documents = docs.len(),
                "Index and document store sizes differ"
            );
        }
        Ok(Self {
            embedder,
            index,
            docs,
        })
    }
}

type Slot = OnceCell<Option<Arc<LoadedIndex>>>;

pub struct RetrievalService {
    config: Arc<QaConfig>,
    french: Slot,
    arabic: Slot,
    multilingual: Slot,
}

impl RetrievalService {
    pub fn new(config: Arc<QaConfig>) -> Self {
        Self {
            config,
            french: OnceCell::new(),
            arabic: OnceCell::new(),
            multilingual: OnceCell::new(),
        }
    }

    /// Pre-fill a language slot, bypassing the on-disk load. Used by hosts
    /// that construct their own embedders and by tests.
    pub fn preload(&self, language: Language, loaded: Option<LoadedIndex>) {
        let _ = self.slot(language).set(loaded.map(Arc::new));
    }

    /// Pre-fill the multilingual fallback slot.
    pub fn preload_fallback(&self, loaded: Option<LoadedIndex>) {
        let _ = self.multilingual.set(loaded.map(Arc::new));
    }

    fn slot(&self, language: Language) -> &Slot {
        match language {
            Language::Fr => &self.french,
            Language::Ar => &self.arabic,
        }
    }

    /// Retrieve the `top_k` most similar documents for `query` in `language`.
    ///
    /// Infallible by contract: every failure path degrades to an empty list
    /// after logging, so the caller can proceed to ungrounded generation.
    pub async fn retrieve(
        &self,
        query: &str,
        language: Language,
        top_k: usize,
    ) -> Vec<RetrievedDocument> {
        let budget = std::time::Duration::from_secs_f64(self.config.retrieval_timeout_seconds);
        match tokio::time::timeout(budget, self.try_retrieve(query, language, top_k)).await {
            Ok(Ok(documents)) => documents,
            Ok(Err(err)) => {
                tracing::warn!(
                    language = %language,
                    error = %err,
                    "Retrieval degraded to zero documents"
                );
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    language = %language,
                    budget_secs = self.config.retrieval_timeout_seconds,
                    "Retrieval timed out, degrading to zero documents"
                );
                Vec::new()
            }
        }
    }

    async fn try_retrieve(
        &self,
        query: &str,
        language: Language,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, QaError> {
        if let Some(primary) = self.primary(language).await {
            match self.search(&primary, query, language, top_k).await {
                Ok(documents) => return Ok(documents),
                Err(err) => {
                    tracing::warn!(
                        language = %language,
                        error = %err,
                        "Primary index search failed, trying multilingual fallback"
                    );
                }
            }
        } else {
            tracing::warn!(
                language = %language,
                "Language index unavailable, trying multilingual fallback"
            );
        }

        let fallback = self
            .fallback()
            .await
            .ok_or(QaError::RetrievalUnavailable(language))?;
        self.search(&fallback, query, language, top_k)
            .await
            .map_err(|err| {
                tracing::warn!(language = %language, error = %err, "Fallback search failed");
                QaError::RetrievalUnavailable(language)
            })
    }

    async fn primary(&self, language: Language) -> Option<Arc<LoadedIndex>> {
        let config = self.config.clone();
        self.slot(language)
            .get_or_init(|| async move {
                let profile = config.profile(language).clone();
                match load_triple(&profile.embed_model_dir, &profile.index_path, &profile.docs_path)
                    .await
                {
                    Ok(loaded) => {
                        tracing::info!(
                            language = %language,
                            vectors = loaded.index.len(),
                            "Language index loaded"
                        );
                        Some(Arc::new(loaded))
                    }
                    Err(err) => {
                        tracing::warn!(language = %language, error = %err, "Failed to load language index");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn fallback(&self) -> Option<Arc<LoadedIndex>> {
        let config = self.config.clone();
        self.multilingual
            .get_or_init(|| async move {
                let fb = config.multilingual.clone();
                match load_triple(&fb.embed_model_dir, &fb.index_path, &fb.docs_path).await {
                    Ok(loaded) => {
                        tracing::info!(vectors = loaded.index.len(), "Multilingual fallback index loaded");
                        Some(Arc::new(loaded))
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to load multilingual fallback index");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn search(
        &self,
        loaded: &Arc<LoadedIndex>,
        query: &str,
        language: Language,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        // Embedding is CPU-bound; keep it off the async workers.
        let embedder = loaded.embedder.clone();
        let text = query.to_string();
        let vector = tokio::task::spawn_blocking(move || embedder.embed_query(&text))
            .await
            .map_err(|e| anyhow!("Embedding task panicked: {}", e))??;

        let hits = loaded.index.search(&vector, top_k)?;

        let mut documents = Vec::with_capacity(hits.len());
        for (doc_index, score) in hits {
            let Some(record) = loaded.docs.get(doc_index) else {
                tracing::warn!(doc_index, "Index hit has no matching document record");
                continue;
            };
            documents.push(materialize(doc_index, score, language, record));
        }

        tracing::debug!(
            language = %language,
            results = documents.len(),
            "Retrieval complete"
        );
        Ok(documents)
    }
}

/// Build a `RetrievedDocument` from a raw corpus record. The record's own
/// `language` tag wins over the requested language (fallback corpora mix
/// languages); missing ids fall back to the positional index.
fn materialize(
    doc_index: usize,
    score: f32,
    requested: Language,
    record: &serde_json::Value,
) -> RetrievedDocument {
    let id = match record.get("id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => doc_index.to_string(),
    };
    let source_language = record
        .get("language")
        .and_then(|v| v.as_str())
        .and_then(Language::parse)
        .unwrap_or(requested);

    RetrievedDocument {
        id,
        similarity: score,
        source_language,
        record: record.clone(),
    }
}

async fn load_triple(
    model_dir: &std::path::Path,
    index_path: &std::path::Path,
    docs_path: &std::path::Path,
) -> Result<LoadedIndex> {
    let index = FlatIndex::from_file(index_path)?;
    let docs = DocStore::from_file(docs_path)?;

    // The encoder's output dimension must match the index it serves.
    let encoder_config = OnnxEncoderConfig::from_model_dir(model_dir, index.dimension());
    let model_dir = model_dir.to_path_buf();
    let encoder = tokio::task::spawn_blocking(move || {
        OnnxEncoder::new(encoder_config)
            .map_err(|e| anyhow!("Failed to load encoder from {}: {}", model_dir.display(), e))
    })
    .await
    .map_err(|e| anyhow!("Encoder load task panicked: {}", e))??;

    LoadedIndex::new(Arc::new(encoder), index, docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubEmbedder {
        vector: Vec<f32>,
    }

    impl EmbeddingModel for StubEmbedder {
        fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.vector.clone())
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }
    }

    fn service_with_french(vectors: Vec<Vec<f32>>, records: Vec<serde_json::Value>) -> RetrievalService {
        let service = RetrievalService::new(Arc::new(QaConfig::default()));
        let embedder = Arc::new(StubEmbedder {
            vector: vec![1.0, 0.0],
        });
        let loaded = LoadedIndex::new(
            embedder,
            FlatIndex::new(2, vectors).unwrap(),
            DocStore::new(records),
        )
        .unwrap();
        service.preload(Language::Fr, Some(loaded));
        service.preload(Language::Ar, None);
        service.preload_fallback(None);
        service
    }

    #[tokio::test]
    async fn returns_top_k_sorted() {
        let service = service_with_french(
            vec![vec![0.1, 0.0], vec![0.9, 0.0], vec![0.5, 0.0]],
            vec![
                json!({"id": "a", "header": "A", "content": "..."}),
                json!({"id": "b", "header": "B", "content": "..."}),
                json!({"id": "c", "header": "C", "content": "..."}),
            ],
        );

        let documents = service.retrieve("question", Language::Fr, 2).await;
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].id, "b");
        assert_eq!(documents[1].id, "c");
        assert!(documents[0].similarity >= documents[1].similarity);
        assert_eq!(documents[0].source_language, Language::Fr);
    }

    #[tokio::test]
    async fn equal_scores_break_ties_by_index() {
        let service = service_with_french(
            vec![vec![0.5, 0.0], vec![0.5, 0.0]],
            vec![json!({"id": "first"}), json!({"id": "second"})],
        );

        let documents = service.retrieve("question", Language::Fr, 2).await;
        assert_eq!(documents[0].id, "first");
        assert_eq!(documents[1].id, "second");
    }

    #[tokio::test]
    async fn missing_index_degrades_to_empty() {
        let service = RetrievalService::new(Arc::new(QaConfig::default()));
        service.preload(Language::Ar, None);
        service.preload_fallback(None);

        let documents = service.retrieve("سؤال", Language::Ar, 3).await;
        assert!(documents.is_empty());
    }

    #[tokio::test]
    async fn fallback_serves_when_primary_missing() {
        let service = RetrievalService::new(Arc::new(QaConfig::default()));
        service.preload(Language::Ar, None);
        let embedder = Arc::new(StubEmbedder {
            vector: vec![0.0, 1.0],
        });
        let loaded = LoadedIndex::new(
            embedder,
            FlatIndex::new(2, vec![vec![0.0, 0.8]]).unwrap(),
            DocStore::new(vec![json!({"id": "m1", "language": "fr", "title": "t", "text": "b"})]),
        )
        .unwrap();
        service.preload_fallback(Some(loaded));

        let documents = service.retrieve("سؤال", Language::Ar, 3).await;
        assert_eq!(documents.len(), 1);
        // The fallback corpus's own language tag is kept
        assert_eq!(documents[0].source_language, Language::Fr);
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(StubEmbedder {
            vector: vec![1.0, 0.0, 0.0],
        });
        let result = LoadedIndex::new(
            embedder,
            FlatIndex::new(2, vec![vec![1.0, 0.0]]).unwrap(),
            DocStore::new(vec![]),
        );
        assert!(result.is_err());
    }
}
