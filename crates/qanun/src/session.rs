//! Streaming session management.
//!
//! One `StreamSession` exists per in-flight request. It forwards fragments
//! to the transport as self-contained JSON frames, accumulates the full
//! text, and hands the result to the conversation store exactly once. A
//! client disconnect is a designed partial-success path, not an error: the
//! session keeps draining the generator (backend inference is not cleanly
//! cancellable mid-token) and still persists what was generated.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::QaError;
use crate::language::Language;
use crate::orchestrator::{GenerationEvent, GenerationStream};
use crate::persistence::{ConversationStore, Role, StoreError};

/// One wire frame. Every variant serializes to a single self-contained JSON
/// object (`{"chunk": ...}`, `{"notice": ...}`, ...) so a partial read never
/// splits a frame boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Chunk { chunk: String },
    Notice { notice: String },
    Error { error: String },
    Done { done: bool },
}

/// Why the session closed. Forward-only: a session never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Success,
    ClientDisconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Emitting,
    Closed(CloseReason),
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub text: String,
    pub close_reason: CloseReason,
}

pub struct StreamSession {
    id: Uuid,
    language: Language,
    conversation_id: Option<i64>,
    transport: mpsc::Sender<Frame>,
    store: Arc<dyn ConversationStore>,
    state: SessionState,
    buffer: String,
    client_connected: bool,
}

impl StreamSession {
    pub fn new(
        language: Language,
        conversation_id: Option<i64>,
        transport: mpsc::Sender<Frame>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            conversation_id,
            transport,
            store,
            state: SessionState::Open,
            buffer: String::new(),
            client_connected: true,
        }
    }

    /// Drive the generation stream to completion. Consumes the session: the
    /// state machine runs Open → Emitting → Closed exactly once.
    pub async fn run(mut self, mut stream: GenerationStream) -> Result<SessionOutcome, QaError> {
        let mut failure: Option<QaError> = None;

        while let Some(event) = stream.next().await {
            match event {
                GenerationEvent::Delta(chunk) => {
                    if self.state == SessionState::Open {
                        self.state = SessionState::Emitting;
                    }
                    self.buffer.push_str(&chunk);
                    if self.client_connected
                        && self.transport.send(Frame::Chunk { chunk }).await.is_err()
                    {
                        // Keep draining so backend state stays consistent and
                        // the partial answer can still be persisted
                        self.client_connected = false;
                        tracing::debug!(session = %self.id, "Client disconnected mid-stream");
                    }
                }
                GenerationEvent::Done => break,
                GenerationEvent::Error(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if self.client_connected {
            let terminal = match &failure {
                Some(err) => Frame::Error {
                    error: err.user_message(),
                },
                None => Frame::Done { done: true },
            };
            let _ = self.transport.send(terminal).await;
        }

        let close_reason = match (&failure, self.client_connected) {
            (Some(_), _) => CloseReason::Error,
            (None, false) => CloseReason::ClientDisconnected,
            (None, true) => CloseReason::Success,
        };
        self.state = SessionState::Closed(close_reason);
        tracing::info!(
            session = %self.id,
            language = %self.language,
            reason = ?close_reason,
            chars = self.buffer.len(),
            "Stream session closed"
        );

        // Hand the accumulated text to the store exactly once. Partial text
        // from a disconnect or a mid-stream failure counts; an answer that
        // never produced anything does not.
        if !self.buffer.is_empty() {
            if let Some(conversation_id) = self.conversation_id {
                match self
                    .store
                    .append_message(conversation_id, Role::Assistant, &self.buffer)
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::NotFound) => return Err(QaError::ConversationNotFound),
                    Err(StoreError::Backend(err)) => return Err(QaError::Store(err)),
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(SessionOutcome {
                text: self.buffer,
                close_reason,
            }),
        }
    }
}
