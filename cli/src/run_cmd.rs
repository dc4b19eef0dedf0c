use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use intrusion_core::ChatCompletionsConversation;
use intrusion_core::ConfigOverrides;
use intrusion_core::Pilot;
use intrusion_core::PilotEvent;
use intrusion_core::PilotOutcome;
use intrusion_core::exec_command::Completion;
use owo_colors::OwoColorize;
use owo_colors::Style;
use tokio::sync::mpsc;

/// Run an engagement against TARGET, letting the model choose each command.
#[derive(Debug, Parser)]
pub struct RunCli {
    /// Address of the machine under test, passed to the model in the brief.
    #[arg(value_name = "TARGET")]
    target: String,

    /// Model name (overrides the config file).
    #[arg(long = "model", short = 'm', value_name = "MODEL")]
    model: Option<String>,

    /// Stop after this many model replies.
    #[arg(long = "max-turns", value_name = "N")]
    max_turns: Option<usize>,

    /// Idle timeout in milliseconds for each command.
    #[arg(long = "idle-timeout-ms", value_name = "MS")]
    idle_timeout_ms: Option<u64>,
}

struct Palette {
    reply: Style,
    command: Style,
    status: Style,
    warning: Style,
}

impl Palette {
    fn detect() -> Self {
        if supports_color::on(supports_color::Stream::Stdout).is_some() {
            Self {
                reply: Style::new().cyan(),
                command: Style::new().bold().green(),
                status: Style::new().dimmed(),
                warning: Style::new().yellow(),
            }
        } else {
            Self {
                reply: Style::new(),
                command: Style::new(),
                status: Style::new(),
                warning: Style::new(),
            }
        }
    }
}

pub async fn run(cli: RunCli, config_path: Option<&Path>) -> Result<()> {
    let overrides = ConfigOverrides {
        model: cli.model,
        idle_timeout_ms: cli.idle_timeout_ms,
        max_turns: cli.max_turns,
        ..Default::default()
    };
    let config = crate::load_config(config_path, overrides)?;
    let conversation = ChatCompletionsConversation::from_config(&config)
        .context("failed to set up the model conversation")?;

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx, Palette::detect()));

    let mut pilot = Pilot::new(conversation, config).with_events(tx);
    let outcome = pilot.run(&cli.target).await;
    // Dropping the pilot closes the event channel so the printer can finish.
    drop(pilot);
    if let Err(err) = printer.await {
        tracing::warn!(error = %err, "event printer stopped unexpectedly");
    }

    match outcome.context("engagement aborted")? {
        PilotOutcome::Completed { turns } => {
            println!("Engagement complete after {turns} turns.");
        }
        PilotOutcome::TurnLimitReached { turns } => {
            println!("Stopped after reaching the turn limit ({turns} turns).");
        }
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<PilotEvent>, palette: Palette) {
    while let Some(event) = rx.recv().await {
        match event {
            PilotEvent::AssistantReply { text } => {
                println!("{}", text.trim_end().style(palette.reply));
            }
            PilotEvent::CommandStarted { command } => {
                println!("{} {}", "$".style(palette.status), command.style(palette.command));
            }
            PilotEvent::InputSent { line } => {
                println!("{} {}", ">".style(palette.status), line.style(palette.command));
            }
            PilotEvent::CommandFinished { result, .. } => {
                if !result.output.is_empty() {
                    println!("{}", result.output.trim_end());
                }
                let summary = match result.exit_code {
                    Some(code) => format!("[{} exit={code}]", result.completion),
                    None => format!("[{}]", result.completion),
                };
                let style = match result.completion {
                    Completion::Completed | Completion::AwaitingInput => palette.status,
                    Completion::TimedOut | Completion::Failed => palette.warning,
                };
                println!("{}", summary.style(style));
                if let Some(error) = result.error {
                    println!("{}", format!("{}: {}", error.kind, error.detail).style(palette.warning));
                }
            }
        }
    }
}
