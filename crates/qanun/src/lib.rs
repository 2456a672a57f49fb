//! Bilingual legal question answering.
//!
//! Routes a natural-language query to a response language (French or
//! Arabic), retrieves the most relevant legal documents from that
//! language's index, builds a grounded prompt, and streams a generated
//! answer from a local model or a remote API with transparent fallback.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod language;
pub mod llm;
pub mod orchestrator;
pub mod persistence;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod session;

// Re-export primary types for convenience
pub use config::QaConfig;
pub use error::QaError;
pub use language::{Language, LanguageDecision, LanguagePreference, RouteMethod};
pub use persistence::{ConversationStore, InMemoryStore, Role, StoreError};
pub use pipeline::{AskOutcome, AskRequest, QaPipeline};
pub use session::{CloseReason, Frame};

// Re-export common types
pub use anyhow::{Error, Result};
pub use uuid::Uuid;
