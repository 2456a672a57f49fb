//! End-to-end query pipeline and recovery controller.
//!
//! Wires the full flow: resolve the response language, retrieve documents
//! for it, build the grounded prompt, persist the user message, stream
//! generation through a session, and persist the answer. The whole flow is
//! wrapped once by the recovery controller: a stale conversation reference
//! is retried exactly once under a fresh conversation, never more.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::QaConfig;
use crate::error::QaError;
use crate::language::{self, LanguageDecision, LanguagePreference};
use crate::llm::BackendRegistry;
use crate::orchestrator::GenerationOrchestrator;
use crate::persistence::{ConversationStore, Role, StoreError};
use crate::prompt::PromptBuilder;
use crate::retrieval::RetrievalService;
use crate::session::{CloseReason, Frame, StreamSession};

/// Pipeline entry point: one user query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub language: LanguagePreference,
}

/// What one completed request produced.
#[derive(Debug)]
pub struct AskOutcome {
    pub conversation_id: i64,
    pub decision: LanguageDecision,
    pub documents_retrieved: usize,
    pub answer: String,
    pub close_reason: CloseReason,
    /// True when the request was replayed under a fresh conversation after a
    /// stale reference.
    pub recovered: bool,
}

pub struct QaPipeline {
    config: Arc<QaConfig>,
    retrieval: Arc<RetrievalService>,
    prompts: PromptBuilder,
    orchestrator: GenerationOrchestrator,
    store: Arc<dyn ConversationStore>,
}

impl QaPipeline {
    pub fn new(config: Arc<QaConfig>, store: Arc<dyn ConversationStore>) -> Self {
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let retrieval = Arc::new(RetrievalService::new(config.clone()));
        Self::with_components(config, retrieval, registry, store)
    }

    /// Assemble from pre-built components (host-provided backends, test
    /// doubles).
    pub fn with_components(
        config: Arc<QaConfig>,
        retrieval: Arc<RetrievalService>,
        registry: Arc<BackendRegistry>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            prompts: PromptBuilder::new(config.clone()),
            orchestrator: GenerationOrchestrator::new(config.clone(), registry),
            config,
            retrieval,
            store,
        }
    }

    /// Answer one query, streaming frames to `transport`.
    ///
    /// Recovery controller: a `ConversationNotFound` from the first attempt
    /// clears the conversation reference, notifies the caller, and replays
    /// the pipeline once. A second occurrence is terminal.
    pub async fn ask(
        &self,
        request: AskRequest,
        transport: mpsc::Sender<Frame>,
    ) -> Result<AskOutcome, QaError> {
        match self.run_once(&request, &transport).await {
            Ok(outcome) => Ok(outcome),
            Err(QaError::ConversationNotFound) => {
                tracing::info!(
                    conversation_id = ?request.conversation_id,
                    "Stale conversation reference, replaying under a fresh conversation"
                );
                let _ = transport
                    .send(Frame::Notice {
                        notice: "La conversation référencée n'existe plus ; une nouvelle \
                                 conversation a été créée."
                            .to_string(),
                    })
                    .await;

                let mut retry = request;
                retry.conversation_id = None;
                match self.run_once(&retry, &transport).await {
                    Ok(mut outcome) => {
                        outcome.recovered = true;
                        Ok(outcome)
                    }
                    Err(err) => {
                        self.send_terminal_error(&transport, &err).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.send_terminal_error(&transport, &err).await;
                Err(err)
            }
        }
    }

    /// Generation failures already produced an error frame inside the
    /// session; store-level failures happen before any frame went out.
    async fn send_terminal_error(&self, transport: &mpsc::Sender<Frame>, err: &QaError) {
        if matches!(err, QaError::ConversationNotFound | QaError::Store(_)) {
            let _ = transport
                .send(Frame::Error {
                    error: err.user_message(),
                })
                .await;
        }
    }

    async fn run_once(
        &self,
        request: &AskRequest,
        transport: &mpsc::Sender<Frame>,
    ) -> Result<AskOutcome, QaError> {
        let decision = language::resolve(
            &request.message,
            request.language.as_override(),
            self.config.fallback_language,
        );
        tracing::info!(
            language = %decision.language,
            method = ?decision.method,
            "Response language resolved"
        );

        let documents = self
            .retrieval
            .retrieve(&request.message, decision.language, self.config.top_k_retrieval)
            .await;
        let context = self
            .prompts
            .build(decision.language, &request.message, documents);

        let conversation_id = match request.conversation_id {
            Some(id) => {
                // Validate the reference before any generation work; this is
                // where a stale id usually surfaces
                let history = self.store.read_messages(id).await.map_err(map_store_err)?;
                tracing::debug!(
                    conversation_id = id,
                    messages = history.len(),
                    "Continuing existing conversation"
                );
                id
            }
            None => self
                .store
                .start_conversation()
                .await
                .map_err(map_store_err)?,
        };
        self.store
            .append_message(conversation_id, Role::User, &request.message)
            .await
            .map_err(map_store_err)?;

        let stream = self.orchestrator.generate(&context);
        let session = StreamSession::new(
            decision.language,
            Some(conversation_id),
            transport.clone(),
            self.store.clone(),
        );
        let outcome = session.run(stream).await?;

        Ok(AskOutcome {
            conversation_id,
            decision,
            documents_retrieved: context.documents.len(),
            answer: outcome.text,
            close_reason: outcome.close_reason,
            recovered: false,
        })
    }
}

fn map_store_err(err: StoreError) -> QaError {
    match err {
        StoreError::NotFound => QaError::ConversationNotFound,
        StoreError::Backend(err) => QaError::Store(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingModel;
    use crate::language::{Language, RouteMethod};
    use crate::llm::{
        BackendInfo, BackendKind, GenerationBackend, GenerationParams, TokenStream,
    };
    use crate::persistence::{InMemoryStore, StoredMessage};
    use crate::retrieval::index::{DocStore, FlatIndex};
    use crate::retrieval::LoadedIndex;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    impl EmbeddingModel for FixedEmbedder {
        fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.vector.clone())
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }
    }

    struct ScriptedBackend {
        chunks: Vec<String>,
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn stream(&self, _prompt: &str, _params: &GenerationParams) -> Result<TokenStream> {
            let (tx, rx) = mpsc::channel(16);
            let chunks = self.chunks.clone();
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(TokenStream::new(rx))
        }

        fn info(&self) -> BackendInfo {
            BackendInfo {
                name: "scripted".into(),
                model: "test".into(),
                is_local: false,
            }
        }
    }

    /// Streams the prompt back, so tests can observe what generation saw.
    struct EchoBackend;

    #[async_trait]
    impl GenerationBackend for EchoBackend {
        async fn stream(&self, prompt: &str, _params: &GenerationParams) -> Result<TokenStream> {
            let (tx, rx) = mpsc::channel(16);
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                let _ = tx.send(Ok(prompt)).await;
            });
            Ok(TokenStream::new(rx))
        }

        fn info(&self) -> BackendInfo {
            BackendInfo {
                name: "echo".into(),
                model: "test".into(),
                is_local: false,
            }
        }
    }

    /// Every conversation operation reports the conversation as missing.
    struct AlwaysMissingStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ConversationStore for AlwaysMissingStore {
        async fn start_conversation(&self) -> Result<i64, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound)
        }

        async fn append_message(
            &self,
            _conversation_id: i64,
            _role: Role,
            _content: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::NotFound)
        }

        async fn read_messages(
            &self,
            _conversation_id: i64,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound)
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn pipeline_with(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn GenerationBackend>,
        french_docs: bool,
    ) -> QaPipeline {
        let config = Arc::new(QaConfig::default());
        let retrieval = Arc::new(RetrievalService::new(config.clone()));
        if french_docs {
            let embedder = Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            });
            let loaded = LoadedIndex::new(
                embedder,
                FlatIndex::new(2, vec![vec![0.95, 0.0], vec![0.2, 0.1]]).unwrap(),
                DocStore::new(vec![
                    json!({
                        "id": "civ-15",
                        "source_document_type": "code",
                        "header": "Article 15 du code civil",
                        "content": "Les lois de police et de sûreté obligent..."
                    }),
                    json!({
                        "id": "civ-16",
                        "source_document_type": "code",
                        "header": "Article 16",
                        "content": "..."
                    }),
                ]),
            )
            .unwrap();
            retrieval.preload(Language::Fr, Some(loaded));
        } else {
            retrieval.preload(Language::Fr, None);
        }
        retrieval.preload(Language::Ar, None);
        retrieval.preload_fallback(None);

        let registry = Arc::new(BackendRegistry::new(config.clone()));
        for lang in [Language::Fr, Language::Ar] {
            registry.install(lang, BackendKind::Remote, backend.clone());
        }
        QaPipeline::with_components(config, retrieval, registry, store)
    }

    async fn drain(mut rx: mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn french_query_end_to_end() {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(ScriptedBackend {
                chunks: vec!["L'article 15 ".to_string(), "dispose que...".to_string()],
            }),
            true,
        );

        let (tx, rx) = mpsc::channel(64);
        let outcome = pipeline
            .ask(
                AskRequest {
                    message: "Résumé l'article 15".to_string(),
                    conversation_id: None,
                    language: LanguagePreference::Auto,
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision.language, Language::Fr);
        assert_eq!(outcome.decision.method, RouteMethod::ScriptDetection);
        assert!(outcome.documents_retrieved >= 1);
        assert_eq!(outcome.answer, "L'article 15 dispose que...");
        assert_eq!(outcome.close_reason, CloseReason::Success);
        assert!(!outcome.recovered);

        // Exactly one user and one assistant message were persisted
        let messages = store.read_messages(outcome.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Résumé l'article 15");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(!messages[1].content.is_empty());

        let frames = drain(rx).await;
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::Chunk { chunk } if chunk.contains("article 15"))));
        assert!(matches!(frames.last(), Some(Frame::Done { done: true })));
    }

    #[tokio::test]
    async fn explicit_override_beats_arabic_script() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline_with(
            store,
            Arc::new(ScriptedBackend {
                chunks: vec!["réponse".to_string()],
            }),
            true,
        );

        let (tx, _rx) = mpsc::channel(64);
        let outcome = pipeline
            .ask(
                AskRequest {
                    message: "ما هي شروط عقد الإيجار؟".to_string(),
                    conversation_id: None,
                    language: LanguagePreference::Fr,
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision.language, Language::Fr);
        assert_eq!(outcome.decision.method, RouteMethod::Explicit);
    }

    #[tokio::test]
    async fn missing_index_still_answers_with_caveat() {
        let store = Arc::new(InMemoryStore::new());
        // EchoBackend streams the prompt back, exposing the caveat text
        let pipeline = pipeline_with(store, Arc::new(EchoBackend), false);

        let (tx, _rx) = mpsc::channel(64);
        let outcome = pipeline
            .ask(
                AskRequest {
                    message: "Quelle est la procédure de divorce ?".to_string(),
                    conversation_id: None,
                    language: LanguagePreference::Auto,
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(outcome.documents_retrieved, 0);
        assert!(!outcome.answer.is_empty());
        assert!(outcome.answer.contains("Aucun contexte juridique disponible"));
    }

    #[tokio::test]
    async fn stale_conversation_recovers_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(ScriptedBackend {
                chunks: vec!["réponse".to_string()],
            }),
            true,
        );

        // Conversation 777 was never created: first attempt hits NotFound
        let (tx, rx) = mpsc::channel(64);
        let outcome = pipeline
            .ask(
                AskRequest {
                    message: "Résumé l'article 15".to_string(),
                    conversation_id: Some(777),
                    language: LanguagePreference::Auto,
                },
                tx,
            )
            .await
            .unwrap();

        assert!(outcome.recovered);
        assert_ne!(outcome.conversation_id, 777);
        let messages = store.read_messages(outcome.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);

        // The caller was told a new conversation was started
        let frames = drain(rx).await;
        assert!(frames.iter().any(|f| matches!(f, Frame::Notice { .. })));
    }

    #[tokio::test]
    async fn second_not_found_is_terminal() {
        let store = Arc::new(AlwaysMissingStore {
            attempts: AtomicUsize::new(0),
        });
        let attempts_handle = store.clone();
        let pipeline = pipeline_with(
            store,
            Arc::new(ScriptedBackend {
                chunks: vec!["réponse".to_string()],
            }),
            true,
        );

        let (tx, rx) = mpsc::channel(64);
        let result = pipeline
            .ask(
                AskRequest {
                    message: "Résumé l'article 15".to_string(),
                    conversation_id: Some(777),
                    language: LanguagePreference::Auto,
                },
                tx,
            )
            .await;

        assert!(matches!(result, Err(QaError::ConversationNotFound)));
        // One original attempt plus exactly one retry, never more
        assert_eq!(attempts_handle.attempts.load(Ordering::SeqCst), 2);

        let frames = drain(rx).await;
        assert!(matches!(frames.last(), Some(Frame::Error { .. })));
    }
}
