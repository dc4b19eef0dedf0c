use super::Message;
use super::MessageCursor;

/// In-memory, append-only message log.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn since(&self, cursor: MessageCursor) -> (Vec<Message>, MessageCursor) {
        let start = cursor.position().min(self.messages.len());
        (
            self.messages[start..].to_vec(),
            MessageCursor(self.messages.len()),
        )
    }
}
