use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::Conversation;
use super::ConversationError;
use super::Message;
use super::MessageCursor;
use super::Role;
use super::transcript::Transcript;
use crate::config::Config;
use crate::config::OPENAI_API_KEY_ENV;

const ERROR_BODY_MAX_BYTES: usize = 2048;

/// A conversation backed by an OpenAI-compatible `/chat/completions`
/// endpoint. The full history is sent on every turn.
#[derive(Debug, Clone)]
pub struct ChatCompletionsConversation {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    transcript: Transcript,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsConversation {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        system_prompt: Option<String>,
    ) -> Result<Self, ConversationError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConversationError::MissingApiKey)?;
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
            system_prompt: system_prompt.filter(|prompt| !prompt.trim().is_empty()),
            transcript: Transcript::new(),
        })
    }

    /// Uses the configured endpoint and model with the key from
    /// `OPENAI_API_KEY`.
    pub fn from_config(config: &Config) -> Result<Self, ConversationError> {
        Self::new(
            &config.base_url,
            config.model.clone(),
            std::env::var(OPENAI_API_KEY_ENV).ok(),
            Some(config.system_prompt.clone()),
        )
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    fn request_body(&self) -> ChatRequest<'_> {
        let system = self.system_prompt.as_deref().map(|content| WireMessage {
            role: Role::System,
            content,
        });
        let history = self.transcript.messages().iter().map(|message| WireMessage {
            role: message.role,
            content: &message.content,
        });
        ChatRequest {
            model: &self.model,
            messages: system.into_iter().chain(history).collect(),
        }
    }
}

#[async_trait]
impl Conversation for ChatCompletionsConversation {
    async fn post(&mut self, text: &str) -> Result<(), ConversationError> {
        self.transcript.push(Message::user(text));
        Ok(())
    }

    async fn respond(&mut self) -> Result<Message, ConversationError> {
        debug!(
            model = %self.model,
            messages = self.transcript.len(),
            "requesting completion"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (body, _) = intrusion_utils_string::truncate_middle(&body, ERROR_BODY_MAX_BYTES);
            return Err(ConversationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ConversationError::EmptyReply)?;

        let message = Message::assistant(content);
        self.transcript.push(message.clone());
        Ok(message)
    }

    fn messages_since(&self, cursor: MessageCursor) -> (Vec<Message>, MessageCursor) {
        self.transcript.since(cursor)
    }
}
