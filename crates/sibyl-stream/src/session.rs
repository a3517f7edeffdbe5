//! Stream session: one query's lifecycle from submit to finalized message.
//!
//! The session owns the in-memory conversation for one chat view and is
//! the single writer of its assistant draft. Decoded events are applied
//! strictly in arrival order; the draft becomes an immutable persisted
//! message only at the Finalizing transition. Cancellation is cooperative:
//! the abort signal is observed at every transport read, and a persistence
//! write that already started is allowed to complete.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sibyl_core::config::QueryConfig;
use sibyl_core::types::{Message, Reference, Role, Turn};
use sibyl_storage::ChatRepository;

use crate::decoder::FrameDecoder;
use crate::error::StreamError;
use crate::event::{DonePayload, RawReference, StreamEvent};
use crate::sources::{extract_sources, ExtractedSource};
use crate::transport::{QueryRequest, StreamTransport};

// =============================================================================
// State machine types
// =============================================================================

/// Lifecycle of one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Finalizing,
    Closed(CloseReason),
}

/// Why a session closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    Aborted,
    Failed(String),
}

/// Result of a completed submit.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// The finalized, persisted assistant message.
    Completed(Message),
    Aborted,
}

/// Best-effort live notifications for a UI or CLI consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    /// A fragment was appended to the assistant draft.
    Token(String),
    /// Ephemeral progress text, superseded by the next status.
    Status(String),
    /// The draft was finalized and persisted.
    Completed(Message),
    Closed(CloseReason),
}

/// Cooperative abort signal for an in-flight stream.
///
/// Cloned out of the session before `submit`; aborting moves the session to
/// `Closed(Aborted)` at its next suspension point.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Per-session request parameters.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub model: String,
    pub top_k: u32,
    pub user_id: String,
}

impl SessionOptions {
    pub fn from_config(config: &QueryConfig, user_id: impl Into<String>) -> Self {
        Self {
            model: config.model.clone(),
            top_k: config.top_k,
            user_id: user_id.into(),
        }
    }
}

// =============================================================================
// StreamSession
// =============================================================================

/// Orchestrates one chat view's query lifecycle.
pub struct StreamSession {
    transport: Arc<dyn StreamTransport>,
    chats: Arc<dyn ChatRepository>,
    chat_id: String,
    options: SessionOptions,
    messages: Vec<Message>,
    staged: Vec<RawReference>,
    status: Option<String>,
    state: SessionState,
    cancel: CancellationToken,
    updates: Option<UnboundedSender<SessionUpdate>>,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        chats: Arc<dyn ChatRepository>,
        chat_id: impl Into<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            transport,
            chats,
            chat_id: chat_id.into(),
            options,
            messages: Vec::new(),
            staged: Vec::new(),
            status: None,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            updates: None,
        }
    }

    /// Seed the in-memory conversation with previously persisted messages.
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Attach a live-update sink. Sends are best-effort and never block.
    pub fn with_updates(mut self, updates: UnboundedSender<SessionUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The in-memory conversation, including any unfinalized draft.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Current ephemeral progress text, if any.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Handle for aborting the next (or current) stream.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    /// Submit a query and drive the stream to a terminal state.
    ///
    /// At most one stream is active per session: a submit while a previous
    /// stream is unfinished abandons it first. The user turn is appended
    /// and persisted immediately; the draft is only appended after the
    /// request payload is built so the payload ends with the user turn.
    pub async fn submit(&mut self, query: &str) -> Result<SessionOutcome, StreamError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StreamError::EmptyQuery);
        }
        self.prepare();

        let stored_user = self
            .chats
            .append_message(&self.chat_id, &Message::user(query))?;
        self.messages.push(stored_user);

        self.stream_answer(query.to_string()).await
    }

    /// Drive a stream for a user turn that is already persisted, e.g. the
    /// seed message of a freshly created chat.
    pub async fn answer_pending(&mut self) -> Result<SessionOutcome, StreamError> {
        let query = match self.messages.last() {
            Some(m) if m.role == Role::User => m.content.clone(),
            _ => {
                return Err(StreamError::Session(
                    "no pending user turn to answer".to_string(),
                ))
            }
        };
        self.prepare();
        self.stream_answer(query).await
    }

    /// Reset per-query state, abandoning any unfinished stream.
    fn prepare(&mut self) {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Streaming | SessionState::Finalizing
        ) {
            debug!("Abandoning unfinished stream before new submit");
            self.close(CloseReason::Aborted);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.status = None;
        self.staged.clear();
    }

    async fn stream_answer(&mut self, query: String) -> Result<SessionOutcome, StreamError> {
        let request = QueryRequest {
            query,
            top_k: self.options.top_k,
            model: self.options.model.clone(),
            user_id: self.options.user_id.clone(),
            previous_messages: self.messages.iter().map(Turn::from).collect(),
        };

        self.messages.push(Message::assistant_placeholder());
        self.state = SessionState::Connecting;

        let cancel = self.cancel.clone();
        let transport = Arc::clone(&self.transport);
        let open = async move { transport.open(&request).await };
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => {
                self.close(CloseReason::Aborted);
                return Ok(SessionOutcome::Aborted);
            }
            opened = open => match opened {
                Ok(stream) => stream,
                Err(e) => {
                    self.close(CloseReason::Failed(e.to_string()));
                    return Err(e);
                }
            }
        };
        self.state = SessionState::Streaming;

        let mut decoder = FrameDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    self.close(CloseReason::Aborted);
                    return Ok(SessionOutcome::Aborted);
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                None => {
                    let err = StreamError::TruncatedStream;
                    self.close(CloseReason::Failed(err.to_string()));
                    return Err(err);
                }
                Some(Err(e)) => {
                    self.close(CloseReason::Failed(e.to_string()));
                    return Err(e);
                }
                Some(Ok(bytes)) => {
                    for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                        if let Some(outcome) = self.apply_event(event)? {
                            return Ok(outcome);
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Event application
    // -----------------------------------------------------------------

    fn apply_event(&mut self, event: StreamEvent) -> Result<Option<SessionOutcome>, StreamError> {
        match event {
            StreamEvent::Connected => {
                debug!("Producer connected");
                Ok(None)
            }
            StreamEvent::Token(fragment) => {
                self.draft_mut()?.content.push_str(&fragment);
                self.emit(SessionUpdate::Token(fragment));
                Ok(None)
            }
            StreamEvent::Status(status) => {
                self.status = Some(status.clone());
                self.emit(SessionUpdate::Status(status));
                Ok(None)
            }
            StreamEvent::References(refs) => {
                debug!(count = refs.len(), "References staged");
                self.staged.extend(refs);
                Ok(None)
            }
            StreamEvent::Error(message) => {
                self.close(CloseReason::Failed(message.clone()));
                Err(StreamError::Upstream(message))
            }
            StreamEvent::Done(payload) => {
                self.state = SessionState::Finalizing;
                let stored = self.finalize(payload)?;
                self.close(CloseReason::Completed);
                self.emit(SessionUpdate::Completed(stored.clone()));
                Ok(Some(SessionOutcome::Completed(stored)))
            }
            StreamEvent::Ignored(tag) => {
                debug!(tag = %tag, "Ignoring unrecognized event");
                Ok(None)
            }
        }
    }

    /// Resolve final content and references, apply them to the draft, and
    /// persist it exactly once. The in-memory draft keeps the finalized
    /// content even when the persistence write fails.
    fn finalize(&mut self, payload: DonePayload) -> Result<Message, StreamError> {
        let accumulated = self.draft_mut()?.content.clone();
        let (content, references) = self.resolve_final(payload, &accumulated);

        self.status = None;
        let draft = self.draft_mut()?;
        draft.content = content;
        draft.source_docs = if references.is_empty() {
            None
        } else {
            Some(references)
        };

        let finalized = self.draft_mut()?.clone();
        let stored = match self.chats.append_message(&self.chat_id, &finalized) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to persist finalized message");
                self.close(CloseReason::Failed(e.to_string()));
                return Err(e.into());
            }
        };
        *self.draft_mut()? = stored.clone();
        Ok(stored)
    }

    /// Reference-resolution policy for the terminal event.
    fn resolve_final(&self, payload: DonePayload, accumulated: &str) -> (String, Vec<Reference>) {
        // Server-finalized text and references win outright.
        if let (Some(content), Some(refs)) = (&payload.content, &payload.references) {
            if !refs.is_empty() {
                return (content.clone(), display_staged(refs));
            }
        }

        let basis = payload.content.as_deref().unwrap_or(accumulated);
        let extraction = extract_sources(basis);

        if extraction.sources.is_empty() {
            if self.staged.is_empty() {
                return (extraction.text, Vec::new());
            }
            // No inline markers: staged references, deduplicated by key in
            // arrival order.
            return (extraction.text, display_staged(&self.staged));
        }

        let references = reconcile(&extraction.sources, &self.staged);
        (extraction.text, references)
    }

    fn draft_mut(&mut self) -> Result<&mut Message, StreamError> {
        match self.messages.last_mut() {
            Some(message) if message.role == Role::Assistant => Ok(message),
            _ => Err(StreamError::Session("assistant draft missing".to_string())),
        }
    }

    fn close(&mut self, reason: CloseReason) {
        self.state = SessionState::Closed(reason.clone());
        self.emit(SessionUpdate::Closed(reason));
    }

    fn emit(&self, update: SessionUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }
}

// =============================================================================
// Reference resolution helpers
// =============================================================================

/// Staged descriptors to display references, deduplicated by identity key
/// in arrival order.
fn display_staged(refs: &[RawReference]) -> Vec<Reference> {
    let mut seen = HashSet::new();
    let mut out: Vec<Reference> = Vec::new();
    for raw in refs {
        if !seen.insert(raw.identity_key()) {
            continue;
        }
        let index = out.len() + 1;
        out.push(Reference {
            title: raw
                .title
                .clone()
                .unwrap_or_else(|| format!("Reference [{}]", index)),
            url: raw.url.clone(),
            pages: raw.pages.clone(),
        });
    }
    out
}

/// Merge extractor output with staged descriptors: the extractor's
/// first-appearance order is the display order; a staged descriptor matched
/// by `(url, pages)` contributes its field values.
fn reconcile(extracted: &[ExtractedSource], staged: &[RawReference]) -> Vec<Reference> {
    extracted
        .iter()
        .enumerate()
        .map(|(i, src)| {
            let matched = staged
                .iter()
                .find(|raw| {
                    !raw.url.is_empty()
                        && raw.url == src.url
                        && raw.pages.as_deref().unwrap_or_default() == src.pages
                })
                .or_else(|| staged.iter().find(|raw| !raw.url.is_empty() && raw.url == src.url));

            let url = matched
                .map(|m| m.url.clone())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| src.url.clone());
            let pages = matched
                .and_then(|m| m.pages.clone())
                .or_else(|| (!src.pages.is_empty()).then(|| src.pages.clone()));

            Reference {
                title: format!("Reference [{}]", i + 1),
                url,
                pages,
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
