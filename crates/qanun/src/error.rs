//! Pipeline failure taxonomy.
//!
//! Only conditions with no remaining fallback reach the caller: both
//! generation backends exhausted, a second stale conversation reference, or
//! a broken store. Ambiguous language, a missing retrieval index, and a
//! client disconnect are absorbed locally and never surface here.

use thiserror::Error;

use crate::language::Language;

#[derive(Debug, Error)]
pub enum QaError {
    /// The per-language index (or its fallback) could not be used. Absorbed
    /// by the retrieval service, which degrades to zero documents.
    #[error("no retrieval index available for {0}")]
    RetrievalUnavailable(Language),

    /// Every configured generation backend failed for this request.
    #[error("generation failed: all configured backends were exhausted")]
    GenerationFailed(#[source] anyhow::Error),

    /// Generation exceeded its wall-clock budget on every backend tried.
    #[error("generation exceeded the {0:.0}s time budget")]
    GenerationTimeout(f64),

    /// The conversation reference no longer exists and recovery was already
    /// attempted once.
    #[error("conversation reference no longer exists")]
    ConversationNotFound,

    /// The conversation store failed in a non-recoverable way.
    #[error("conversation store failure")]
    Store(#[source] anyhow::Error),
}

impl QaError {
    /// Message safe to put on the wire: explains degradation without leaking
    /// endpoints, file paths, or key material.
    pub fn user_message(&self) -> String {
        match self {
            Self::RetrievalUnavailable(language) => {
                format!("document retrieval is unavailable for '{language}'")
            }
            Self::GenerationFailed(_) => {
                "the answer could not be generated; the service is degraded".to_string()
            }
            Self::GenerationTimeout(_) => {
                "the answer took too long to generate; please retry".to_string()
            }
            Self::ConversationNotFound => "the referenced conversation no longer exists".to_string(),
            Self::Store(_) => "conversation history is temporarily unavailable".to_string(),
        }
    }
}
