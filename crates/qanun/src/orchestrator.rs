//! Generation orchestration.
//!
//! Drives one generation per request through an explicit state machine:
//! `SelectingBackend → Streaming → Completed`, with a single
//! `Failed → RetryingRemote` transition when the local backend breaks before
//! any output has been emitted. Once a fragment has reached the caller the
//! request can no longer switch backends (a restart would re-emit text and
//! violate the ordering guarantee), so later failures are terminal.

use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::QaConfig;
use crate::error::QaError;
use crate::llm::{BackendKind, BackendRegistry, GenerationBackend, GenerationParams};
use crate::prompt::PromptContext;

/// One item of the orchestrated output stream.
#[derive(Debug)]
pub enum GenerationEvent {
    Delta(String),
    Done,
    Error(QaError),
}

/// Ordered event stream for one request. Ends after `Done` or `Error`.
pub struct GenerationStream {
    receiver: mpsc::Receiver<GenerationEvent>,
}

impl GenerationStream {
    pub fn new(receiver: mpsc::Receiver<GenerationEvent>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<GenerationEvent> {
        self.receiver.recv().await
    }
}

enum AttemptOutcome {
    Completed,
    /// Failed before any fragment was emitted; a fallback may still run.
    Retryable(QaError),
    /// Failed after output reached the caller, or nothing can follow.
    Fatal(QaError),
}

pub struct GenerationOrchestrator {
    config: Arc<QaConfig>,
    registry: Arc<BackendRegistry>,
}

impl GenerationOrchestrator {
    pub fn new(config: Arc<QaConfig>, registry: Arc<BackendRegistry>) -> Self {
        Self { config, registry }
    }

    /// Start generation for a built prompt. Returns immediately; fragments
    /// arrive on the stream in backend production order.
    pub fn generate(&self, context: &PromptContext) -> GenerationStream {
        let profile = self.config.profile(context.language);
        let params = GenerationParams {
            max_tokens: profile.max_output_tokens,
            temperature: profile.temperature,
        };
        let attempts: Vec<BackendKind> = if self.config.use_local_generation {
            vec![BackendKind::Local, BackendKind::Remote]
        } else {
            vec![BackendKind::Remote]
        };
        let budget = Duration::from_secs_f64(self.config.generation_timeout_seconds);

        let (tx, rx) = mpsc::channel(256);
        let registry = self.registry.clone();
        let language = context.language;
        let prompt = context.prompt.clone();

        tokio::spawn(async move {
            drive(registry, language, prompt, params, attempts, budget, tx).await;
        });

        GenerationStream::new(rx)
    }
}

async fn drive(
    registry: Arc<BackendRegistry>,
    language: crate::language::Language,
    prompt: String,
    params: GenerationParams,
    attempts: Vec<BackendKind>,
    budget: Duration,
    tx: mpsc::Sender<GenerationEvent>,
) {
    let total = attempts.len();
    let mut last_error: Option<QaError> = None;

    for (i, kind) in attempts.into_iter().enumerate() {
        let is_last = i + 1 == total;
        if i > 0 {
            tracing::info!(language = %language, backend = %kind, "Retrying on fallback backend");
        }
        tracing::debug!(language = %language, backend = %kind, phase = "selecting_backend", "Generation attempt");

        let backend = match registry.acquire(language, kind).await {
            Ok(backend) => backend,
            Err(err) => {
                // Unavailable backend (model missing, resources exhausted):
                // fall through to the next attempt without failing the request
                tracing::warn!(language = %language, backend = %kind, error = %err, "Backend unavailable");
                last_error = Some(QaError::GenerationFailed(err));
                continue;
            }
        };

        match run_attempt(&backend, &prompt, &params, budget, is_last, &tx).await {
            AttemptOutcome::Completed => {
                let _ = tx.send(GenerationEvent::Done).await;
                return;
            }
            AttemptOutcome::Retryable(err) => {
                tracing::warn!(language = %language, backend = %kind, error = %err, "Backend failed before output");
                last_error = Some(err);
            }
            AttemptOutcome::Fatal(err) => {
                let _ = tx.send(GenerationEvent::Error(err)).await;
                return;
            }
        }
    }

    let err = last_error
        .unwrap_or_else(|| QaError::GenerationFailed(anyhow!("no generation backend configured")));
    let _ = tx.send(GenerationEvent::Error(err)).await;
}

async fn run_attempt(
    backend: &Arc<dyn GenerationBackend>,
    prompt: &str,
    params: &GenerationParams,
    budget: Duration,
    is_last: bool,
    tx: &mpsc::Sender<GenerationEvent>,
) -> AttemptOutcome {
    let deadline = Instant::now() + budget;
    let budget_secs = budget.as_secs_f64();

    let mut stream = match tokio::time::timeout(budget, backend.stream(prompt, params)).await {
        Err(_) => return AttemptOutcome::Retryable(QaError::GenerationTimeout(budget_secs)),
        Ok(Err(err)) => return AttemptOutcome::Retryable(QaError::GenerationFailed(err)),
        Ok(Ok(stream)) => stream,
    };

    tracing::debug!(backend = %backend.info().name, phase = "streaming", "Backend stream open");

    let mut emitted = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, stream.next()).await {
            // Wall-clock budget exhausted: timeout-class failure, same
            // fallback rules as a crash
            Err(_) => {
                let err = QaError::GenerationTimeout(budget_secs);
                return if emitted || is_last {
                    AttemptOutcome::Fatal(err)
                } else {
                    AttemptOutcome::Retryable(err)
                };
            }
            Ok(None) => return AttemptOutcome::Completed,
            Ok(Some(Ok(chunk))) => {
                emitted = true;
                if tx.send(GenerationEvent::Delta(chunk)).await.is_err() {
                    // Downstream session is gone; nothing left to drive
                    return AttemptOutcome::Completed;
                }
            }
            Ok(Some(Err(err))) => {
                let err = QaError::GenerationFailed(err);
                return if emitted || is_last {
                    AttemptOutcome::Fatal(err)
                } else {
                    AttemptOutcome::Retryable(err)
                };
            }
        }
    }
}
