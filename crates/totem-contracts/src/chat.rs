use serde::{Deserialize, Serialize};

use crate::errors::TotemError;

/// Provisional transcript entry shown while an answer is pending. Always
/// replaced in place, never left behind.
pub const THINKING_PLACEHOLDER: &str = "The spirits are deliberating…";

/// Fixed line substituted for the placeholder when a follow-up call fails.
pub const ANSWER_FALLBACK: &str =
    "The connection to the spirit realm wavered. Ask again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    System,
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
        }
    }
}

/// Ordered follow-up conversation.
///
/// The sequence only ever grows, except for the pending placeholder (replaced
/// in place) and a full reset. At most one turn may be pending at a time;
/// `begin_turn` rejects a second question while the first placeholder is
/// unresolved, so the "placeholder is the last element" invariant holds by
/// construction.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    pending: bool,
}

impl Transcript {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::new(Sender::System, greeting)],
            pending: false,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_pending_turn(&self) -> bool {
        self.pending
    }

    /// Appends the user question and the thinking placeholder. The transcript
    /// grows by exactly two entries per accepted turn.
    pub fn begin_turn(&mut self, question: impl Into<String>) -> Result<(), TotemError> {
        if self.pending {
            return Err(TotemError::Rejected(
                "a follow-up question is already pending",
            ));
        }
        self.messages.push(ChatMessage::new(Sender::User, question));
        self.messages
            .push(ChatMessage::new(Sender::Bot, THINKING_PLACEHOLDER));
        self.pending = true;
        Ok(())
    }

    /// Replaces the pending placeholder (always the last element) with the
    /// real answer, or with the fixed fallback line on failure.
    pub fn resolve_turn(&mut self, answer: impl Into<String>) {
        if !self.pending {
            return;
        }
        if let Some(last) = self.messages.last_mut() {
            last.text = answer.into();
        }
        self.pending = false;
    }

    /// Drops every entry and reseeds the system greeting.
    pub fn reset(&mut self, greeting: impl Into<String>) {
        self.messages.clear();
        self.messages
            .push(ChatMessage::new(Sender::System, greeting));
        self.pending = false;
    }
}
