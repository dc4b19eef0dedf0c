//! The collaborator that proposes commands and reads their results.

mod chat_completions;
mod reply;
mod transcript;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use chat_completions::ChatCompletionsConversation;
pub use reply::extract_command;
pub use reply::is_completion;
pub use transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Position in a conversation's message log. Callers keep the cursor they
/// were handed and pass it back to read only what is new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageCursor(usize);

impl MessageCursor {
    pub fn start() -> Self {
        Self(0)
    }

    pub fn position(self) -> usize {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,
    #[error("request to model endpoint failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned no reply")]
    EmptyReply,
}

#[async_trait]
pub trait Conversation: Send {
    /// Appends a user message.
    async fn post(&mut self, text: &str) -> Result<(), ConversationError>;

    /// Obtains the next assistant message and appends it to the log.
    async fn respond(&mut self) -> Result<Message, ConversationError>;

    /// Messages after `cursor`, oldest first, plus the cursor past them.
    fn messages_since(&self, cursor: MessageCursor) -> (Vec<Message>, MessageCursor);
}
