use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use intrusion_core::config::Config;
use intrusion_core::config::ConfigOverrides;
use intrusion_core::config::ConfigToml;
use intrusion_core::conversation::Conversation;
use intrusion_core::conversation::ConversationError;
use intrusion_core::conversation::Message;
use intrusion_core::conversation::MessageCursor;
use intrusion_core::conversation::Role;
use intrusion_core::conversation::Transcript;

pub const PTY_DEVICE: &str = "/dev/ptmx";

pub fn pty_available() -> bool {
    Path::new(PTY_DEVICE).exists()
}

/// Returns `$ret` early from the enclosing test when no pseudo-terminal
/// device is available.
#[macro_export]
macro_rules! skip_if_no_pty {
    () => {
        $crate::skip_if_no_pty!(())
    };
    ($ret:expr) => {
        if !$crate::pty_available() {
            eprintln!(
                "{} is unavailable, skipping test that needs a pseudo-terminal.",
                $crate::PTY_DEVICE
            );
            return $ret;
        }
    };
}

/// Conversation that replays canned assistant replies and records what was
/// posted to it.
#[derive(Debug, Default)]
pub struct ScriptedConversation {
    replies: VecDeque<String>,
    transcript: Transcript,
}

impl ScriptedConversation {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            transcript: Transcript::new(),
        }
    }

    /// User messages in the order they were posted.
    pub fn posted(&self) -> Vec<String> {
        self.transcript
            .messages()
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .collect()
    }

    pub fn remaining_replies(&self) -> usize {
        self.replies.len()
    }
}

#[async_trait]
impl Conversation for ScriptedConversation {
    async fn post(&mut self, text: &str) -> Result<(), ConversationError> {
        self.transcript.push(Message::user(text));
        Ok(())
    }

    async fn respond(&mut self) -> Result<Message, ConversationError> {
        let reply = self.replies.pop_front().ok_or(ConversationError::EmptyReply)?;
        let message = Message::assistant(reply);
        self.transcript.push(message.clone());
        Ok(message)
    }

    fn messages_since(&self, cursor: MessageCursor) -> (Vec<Message>, MessageCursor) {
        self.transcript.since(cursor)
    }
}

/// Defaults with short timeouts suited to tests.
pub fn test_config() -> Config {
    let cfg = ConfigToml {
        idle_timeout_ms: Some(2_000),
        poll_interval_ms: Some(20),
        kill_grace_ms: Some(100),
        ..Default::default()
    };
    Config::load_from_base_config_with_overrides(cfg, ConfigOverrides::default())
        .expect("test config is valid")
}
