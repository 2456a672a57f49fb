//! Generation backends: local llama.cpp models and the remote
//! OpenAI-compatible API, behind one streaming trait.

pub mod local;
pub mod registry;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub use local::LocalModelBackend;
pub use registry::BackendRegistry;
pub use remote::RemoteBackend;

/// Per-request generation parameters. Values come from the per-language
/// configuration, never from constants.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Which kind of backend serves a (language, mode) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: String,
    pub model: String,
    pub is_local: bool,
}

/// A generation provider. Implementations stream text fragments in
/// production order; a mid-stream failure is delivered as an `Err` item so
/// the orchestrator can decide whether a fallback applies.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream>;

    fn info(&self) -> BackendInfo;
}

/// Ordered fragment stream from one backend invocation.
pub struct TokenStream {
    receiver: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    pub fn new(receiver: mpsc::Receiver<Result<String>>) -> Self {
        Self { receiver }
    }

    /// Next fragment, or `None` once the backend is done.
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.receiver.recv().await
    }

    /// Drain the stream into the full text, stopping at the first failure.
    pub async fn collect(mut self) -> Result<String> {
        let mut result = String::new();
        while let Some(item) = self.next().await {
            result.push_str(&item?);
        }
        Ok(result)
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
