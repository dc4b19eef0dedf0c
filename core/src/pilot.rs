//! Drives an engagement: ask the conversation for a command, run it, report
//! the result back, repeat until the conversation declares completion.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::conversation::Conversation;
use crate::conversation::ConversationError;
use crate::conversation::MessageCursor;
use crate::conversation::Role;
use crate::conversation::extract_command;
use crate::conversation::is_completion;
use crate::exec_command::CommandSession;
use crate::exec_command::Completion;
use crate::exec_command::ExecutionResult;
use intrusion_utils_string::truncate_middle;

pub const COMPLETION_PHRASE: &str = "Penetration test is complete.";
pub const COMMAND_ONLY_NUDGE: &str = "Please reply with a single command only.";
pub const COMPLETED_WITHOUT_OUTPUT: &str = "Command has completed.";
pub const TIMED_OUT_NOTICE: &str = "Command has timed out.";
pub const NOT_EXECUTABLE_NOTICE: &str =
    "Command was not found or was not executable. Please provide commands only.";

pub fn engagement_brief(target: &str) -> String {
    format!("The IP of the client's machine is {target}. Begin!")
}

#[derive(Debug, Error)]
pub enum PilotError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PilotOutcome {
    Completed { turns: usize },
    TurnLimitReached { turns: usize },
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PilotEvent {
    AssistantReply { text: String },
    CommandStarted { command: String },
    InputSent { line: String },
    CommandFinished {
        command: String,
        result: ExecutionResult,
    },
}

enum CommandStep {
    Finished(ExecutionResult),
    EngagementComplete,
    TurnLimitReached,
}

pub struct Pilot<C> {
    conversation: C,
    config: Config,
    cursor: MessageCursor,
    turns: usize,
    events: Option<UnboundedSender<PilotEvent>>,
}

impl<C: Conversation> Pilot<C> {
    pub fn new(conversation: C, config: Config) -> Self {
        Self {
            conversation,
            config,
            cursor: MessageCursor::start(),
            turns: 0,
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<PilotEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn conversation(&self) -> &C {
        &self.conversation
    }

    /// Runs the engagement against `target` until the conversation declares
    /// completion or the turn limit is hit. Every assistant reply is a turn.
    pub async fn run(&mut self, target: &str) -> Result<PilotOutcome, PilotError> {
        info!(target, model = %self.config.model, "engagement started");
        self.conversation.post(&engagement_brief(target)).await?;

        loop {
            let Some(reply) = self.next_reply().await? else {
                return Ok(self.turn_limit_reached());
            };
            let Some(command) = extract_command(&reply) else {
                debug!("reply contained no command");
                self.conversation.post(COMMAND_ONLY_NUDGE).await?;
                continue;
            };
            if is_completion(&command, &self.config.completion_phrase) {
                return Ok(self.completed());
            }

            match self.run_command(command).await? {
                CommandStep::Finished(result) => {
                    let feedback = self.cap(feedback_for(&result));
                    self.conversation.post(&feedback).await?;
                }
                CommandStep::EngagementComplete => return Ok(self.completed()),
                CommandStep::TurnLimitReached => return Ok(self.turn_limit_reached()),
            }
        }
    }

    async fn run_command(&mut self, command: String) -> Result<CommandStep, PilotError> {
        let request = self.config.execution_request(command.as_str());
        self.emit(PilotEvent::CommandStarted {
            command: command.clone(),
        });

        let mut session =
            match CommandSession::start(request, self.config.patterns.clone()).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(command = %command, error = %err, "command did not start");
                    let result = ExecutionResult::from_error(&err);
                    self.emit(PilotEvent::CommandFinished { command, result: result.clone() });
                    return Ok(CommandStep::Finished(result));
                }
            };

        let mut result = session.wait().await;
        while result.completion == Completion::AwaitingInput {
            let prompt = self.cap(result.output.clone());
            if let Err(err) = self.conversation.post(&prompt).await {
                session.close().await;
                return Err(err.into());
            }
            let reply = match self.next_reply().await {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    session.close().await;
                    return Ok(CommandStep::TurnLimitReached);
                }
                Err(err) => {
                    session.close().await;
                    return Err(err);
                }
            };
            match extract_command(&reply) {
                Some(line) if is_completion(&line, &self.config.completion_phrase) => {
                    session.close().await;
                    return Ok(CommandStep::EngagementComplete);
                }
                Some(line) => {
                    self.emit(PilotEvent::InputSent { line: line.clone() });
                    result = session.send_line(&line).await;
                }
                None => {
                    debug!("no input line in reply; closing interactive session");
                    let code = session.close().await;
                    result = ExecutionResult::completed(String::new(), code);
                }
            }
        }

        self.emit(PilotEvent::CommandFinished {
            command,
            result: result.clone(),
        });
        Ok(CommandStep::Finished(result))
    }

    /// Asks for the next assistant message and reads it through the cursor.
    /// `None` when the turn budget is spent.
    async fn next_reply(&mut self) -> Result<Option<String>, PilotError> {
        if self.config.max_turns.is_some_and(|max| self.turns >= max) {
            return Ok(None);
        }
        self.turns += 1;
        self.conversation.respond().await?;
        let (messages, cursor) = self.conversation.messages_since(self.cursor);
        self.cursor = cursor;
        let reply = messages
            .into_iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
            .map(|message| message.content)
            .ok_or(ConversationError::EmptyReply)?;
        self.emit(PilotEvent::AssistantReply {
            text: reply.clone(),
        });
        Ok(Some(reply))
    }

    fn cap(&self, text: String) -> String {
        match truncate_middle(&text, self.config.max_feedback_bytes) {
            (capped, Some(removed)) => {
                debug!(removed, "feedback truncated");
                capped
            }
            (_, None) => text,
        }
    }

    fn emit(&self, event: PilotEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn completed(&self) -> PilotOutcome {
        info!(turns = self.turns, "engagement complete");
        PilotOutcome::Completed { turns: self.turns }
    }

    fn turn_limit_reached(&self) -> PilotOutcome {
        warn!(turns = self.turns, "turn limit reached");
        PilotOutcome::TurnLimitReached { turns: self.turns }
    }
}

/// The message reported back to the conversation for a finished command.
pub fn feedback_for(result: &ExecutionResult) -> String {
    let output = result.output.trim_end();
    match result.completion {
        Completion::Completed | Completion::AwaitingInput => {
            if output.trim().is_empty() {
                COMPLETED_WITHOUT_OUTPUT.to_string()
            } else {
                result.output.clone()
            }
        }
        Completion::TimedOut => with_partial(TIMED_OUT_NOTICE.to_string(), output),
        Completion::Failed if result.is_spawn_failure() => NOT_EXECUTABLE_NOTICE.to_string(),
        Completion::Failed => {
            let detail = result
                .error
                .as_ref()
                .map(|failure| failure.detail.as_str())
                .unwrap_or("unknown error");
            with_partial(format!("Command failed: {detail}"), output)
        }
    }
}

fn with_partial(headline: String, output: &str) -> String {
    if output.trim().is_empty() {
        headline
    } else {
        format!("{headline}\n{output}")
    }
}
