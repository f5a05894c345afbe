//! Conversation messages and live transcription
//!
//! [`TranscriptionAggregator`] keeps one buffer per speaker. Every inbound
//! transcript replaces the buffer and the speaker's trailing partial message;
//! turn completion turns non-empty buffers into final messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::assistant::{GeneratedImage, Source};
use crate::realtime::Speaker;

/// Who a message is from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The person using the assistant
    User,
    /// The assistant
    Agent,
    /// Status and error notices
    System,
}

impl From<Speaker> for Sender {
    fn from(speaker: Speaker) -> Self {
        match speaker {
            Speaker::User => Self::User,
            Speaker::Agent => Self::Agent,
        }
    }
}

/// One entry in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Unique id
    pub id: Uuid,
    /// Message text
    pub text: String,
    /// Author
    pub sender: Sender,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Sources backing the text
    pub sources: Vec<Source>,
    /// Attached image
    pub image: Option<GeneratedImage>,
    /// Whether the text may still change
    pub partial: bool,
}

impl Message {
    /// Create a final message
    #[must_use]
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            sender,
            timestamp: Utc::now(),
            sources: Vec::new(),
            image: None,
            partial: false,
        }
    }

    /// Shorthand for a system message
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Sender::System, text)
    }

    /// Attach sources
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    /// Attach an image
    #[must_use]
    pub fn with_image(mut self, image: GeneratedImage) -> Self {
        self.image = Some(image);
        self
    }
}

/// Ordered conversation log
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a final message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn partial_index(&self, sender: Sender) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.partial && m.sender == sender)
    }

    /// Replace the sender's partial message text, creating it if needed
    pub fn upsert_partial(&mut self, sender: Sender, text: &str) {
        match self.partial_index(sender) {
            Some(index) => text.clone_into(&mut self.messages[index].text),
            None => {
                let mut message = Message::new(sender, text);
                message.partial = true;
                self.messages.push(message);
            }
        }
    }

    /// Finalize the sender's partial message with `text`, or append it
    pub fn finalize(&mut self, sender: Sender, text: &str) {
        match self.partial_index(sender) {
            Some(index) => {
                let message = &mut self.messages[index];
                text.clone_into(&mut message.text);
                message.partial = false;
            }
            None => self.push(Message::new(sender, text)),
        }
    }

    /// Drop the sender's partial message
    pub fn remove_partial(&mut self, sender: Sender) {
        if let Some(index) = self.partial_index(sender) {
            self.messages.remove(index);
        }
    }

    /// Drop every partial message
    pub fn clear_partials(&mut self) {
        self.messages.retain(|m| !m.partial);
    }

    /// The sender's partial message, if any
    #[must_use]
    pub fn partial(&self, sender: Sender) -> Option<&Message> {
        self.partial_index(sender).map(|i| &self.messages[i])
    }

    /// All messages in order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Utterances finalized by a turn completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedTurn {
    /// What the user said, if anything
    pub user: Option<String>,
    /// What the agent said, if anything
    pub agent: Option<String>,
}

/// Per-speaker transcript buffers for the current turn
#[derive(Debug, Clone, Default)]
pub struct TranscriptionAggregator {
    user: String,
    agent: String,
}

impl TranscriptionAggregator {
    /// Create empty buffers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Agent => &mut self.agent,
        }
    }

    /// Current buffer for a speaker
    #[must_use]
    pub fn buffer(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Agent => &self.agent,
        }
    }

    /// Apply a transcript snapshot
    ///
    /// The snapshot replaces the buffer; it is never appended to it.
    pub fn apply(&mut self, speaker: Speaker, snapshot: &str, log: &mut MessageLog) {
        snapshot.clone_into(self.buffer_mut(speaker));

        let sender = Sender::from(speaker);
        if snapshot.trim().is_empty() {
            log.remove_partial(sender);
        } else {
            log.upsert_partial(sender, snapshot.trim());
        }
    }

    /// Finalize the turn: user first, then agent; clears both buffers
    pub fn complete_turn(&mut self, log: &mut MessageLog) -> CompletedTurn {
        let mut turn = CompletedTurn::default();

        for speaker in [Speaker::User, Speaker::Agent] {
            let text = std::mem::take(self.buffer_mut(speaker));
            let text = text.trim();
            let sender = Sender::from(speaker);

            if text.is_empty() {
                log.remove_partial(sender);
                continue;
            }

            log.finalize(sender, text);
            match speaker {
                Speaker::User => turn.user = Some(text.to_string()),
                Speaker::Agent => turn.agent = Some(text.to_string()),
            }
        }

        turn
    }

    /// Forget both buffers without touching the log
    pub fn reset(&mut self) {
        self.user.clear();
        self.agent.clear();
    }
}
