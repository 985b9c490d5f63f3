//! Conversation state for one report's chat panel.

use crate::ndjson::DecodeOutcome;
use crate::protocol::{ChatContext, ChatMessage, ChatRequest, Role, StreamEvent};

/// Appended to the partial reply when the user stops a response mid-stream.
pub const CANCELLED_SUFFIX: &str = "\n\n(cancelled)";

/// What an applied event changed, so the UI knows what to redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    Chunk,
    Status,
    Completed,
    Failed,
    Ignored,
}

#[derive(Debug)]
pub struct ChatSession {
    context: ChatContext,
    messages: Vec<ChatMessage>,
    partial: String,
    status: Option<String>,
    error: Option<String>,
    streaming: bool,
    turn: u64,
}

impl ChatSession {
    pub fn new(context: ChatContext, messages: Vec<ChatMessage>) -> Self {
        Self {
            context,
            messages,
            partial: String::new(),
            status: None,
            error: None,
            streaming: false,
            turn: 0,
        }
    }

    pub fn report_id(&self) -> &str {
        &self.context.report_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Assistant text received so far for the in-flight reply.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Identifies the in-flight turn. Every new or retried request bumps it,
    /// so events still draining from an abandoned stream can be told apart.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Records the user's message and builds the request carrying the full
    /// history.
    pub fn begin_user_turn(&mut self, text: impl Into<String>) -> ChatRequest {
        self.messages.push(ChatMessage::user(text));
        self.start_streaming();
        self.request()
    }

    /// Rebuilds the last request after a failed turn.
    pub fn retry_request(&mut self) -> Option<ChatRequest> {
        if self.streaming || self.error.is_none() {
            return None;
        }
        if self.messages.last().map(|m| m.role) != Some(Role::User) {
            return None;
        }

        self.start_streaming();
        Some(self.request())
    }

    pub fn apply(&mut self, turn: u64, event: &StreamEvent) -> SessionUpdate {
        if !self.accepts(turn) {
            return SessionUpdate::Ignored;
        }

        match event {
            StreamEvent::MessageChunk { content } => {
                self.partial.push_str(content);
                SessionUpdate::Chunk
            }
            StreamEvent::ToolCall { active_form } => {
                self.status = Some(active_form.clone());
                SessionUpdate::Status
            }
            StreamEvent::Done { message } => {
                let partial = self.end_streaming();
                let content = if message.is_empty() {
                    partial
                } else {
                    message.clone()
                };
                if !content.is_empty() {
                    self.messages.push(ChatMessage::assistant(content));
                }
                SessionUpdate::Completed
            }
            StreamEvent::Error { message } => {
                self.end_streaming();
                self.error = Some(message.clone());
                SessionUpdate::Failed
            }
            StreamEvent::Actions { .. } | StreamEvent::Unknown => {
                tracing::debug!(?event, "ignoring stream event");
                SessionUpdate::Ignored
            }
        }
    }

    /// Settles the turn once the stream has ended without a terminal event.
    ///
    /// A cancelled reply keeps the text received so far, marked with
    /// [`CANCELLED_SUFFIX`].
    pub fn finish(&mut self, turn: u64, outcome: DecodeOutcome) {
        if !self.accepts(turn) {
            return;
        }

        let partial = self.end_streaming();
        if partial.is_empty() {
            return;
        }

        let content = match outcome {
            DecodeOutcome::Cancelled => format!("{partial}{CANCELLED_SUFFIX}"),
            DecodeOutcome::Completed => partial,
        };
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Records a transport failure. History is left intact for a retry.
    pub fn fail(&mut self, turn: u64, message: impl Into<String>) {
        if !self.accepts(turn) {
            return;
        }
        self.end_streaming();
        self.error = Some(message.into());
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.end_streaming();
        self.error = None;
    }

    fn request(&self) -> ChatRequest {
        ChatRequest {
            messages: self.messages.clone(),
            context: self.context.clone(),
        }
    }

    fn accepts(&self, turn: u64) -> bool {
        if turn != self.turn {
            tracing::debug!(turn, current = self.turn, "ignoring event from a stale turn");
            return false;
        }
        self.streaming
    }

    fn start_streaming(&mut self) {
        self.turn += 1;
        self.partial.clear();
        self.status = None;
        self.error = None;
        self.streaming = true;
    }

    fn end_streaming(&mut self) -> String {
        self.streaming = false;
        self.status = None;
        std::mem::take(&mut self.partial)
    }
}
