use std::collections::VecDeque;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use intrusion_core::CommandSession;
use intrusion_core::ConfigOverrides;
use intrusion_core::ExecutionResult;
use intrusion_core::config::LaunchKind;
use intrusion_core::exec_command::Completion;
use intrusion_core::exec_command::Pattern;
use intrusion_core::exec_command::PatternSet;

/// Run one command through the prompt-aware session loop and print the
/// results as JSON.
#[derive(Debug, Parser)]
pub struct ExecCli {
    /// Idle timeout in milliseconds (overrides the config file).
    #[arg(long = "idle-timeout-ms", value_name = "MS")]
    idle_timeout_ms: Option<u64>,

    /// Literal text that marks a prompt. Repeatable; replaces configured patterns.
    #[arg(long = "literal", value_name = "TEXT")]
    literals: Vec<String>,

    /// Regular expression that marks a prompt. Repeatable; replaces configured patterns.
    #[arg(long = "regex", value_name = "RE")]
    regexes: Vec<String>,

    /// Written to the terminal right after the process starts.
    #[arg(long = "input", value_name = "TEXT")]
    input: Option<String>,

    /// Answers the next prompt. Repeatable; the session is closed once these run out.
    #[arg(long = "respond", value_name = "LINE")]
    respond: Vec<String>,

    /// Run through `<shell> -c` instead of executing the program directly.
    #[arg(long = "shell", default_value_t = false)]
    shell: bool,

    /// Command and arguments.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

pub async fn run(cli: ExecCli, config_path: Option<&Path>) -> Result<()> {
    let overrides = ConfigOverrides {
        idle_timeout_ms: cli.idle_timeout_ms,
        launch: cli.shell.then_some(LaunchKind::Shell),
        ..Default::default()
    };
    let config = crate::load_config(config_path, overrides)?;

    let patterns = if cli.literals.is_empty() && cli.regexes.is_empty() {
        config.patterns.clone()
    } else {
        patterns_from_flags(&cli.literals, &cli.regexes)?
    };

    let command = command_line(&cli.command)?;
    let mut request = config.execution_request(command);
    if let Some(input) = cli.input {
        request = request.with_initial_input(input);
    }

    let results = drive(request, patterns, cli.respond.into()).await;
    let json = serde_json::to_string_pretty(&results).context("failed to encode results")?;
    println!("{json}");
    Ok(())
}

async fn drive(
    request: intrusion_core::ExecutionRequest,
    patterns: PatternSet,
    mut responses: VecDeque<String>,
) -> Vec<ExecutionResult> {
    let mut session = match CommandSession::start(request, patterns).await {
        Ok(session) => session,
        Err(err) => return vec![ExecutionResult::from_error(&err)],
    };

    let mut results = vec![session.wait().await];
    while results
        .last()
        .is_some_and(|result| result.completion == Completion::AwaitingInput)
    {
        match responses.pop_front() {
            Some(line) => results.push(session.send_line(&line).await),
            None => {
                session.close().await;
                break;
            }
        }
    }
    results
}

/// A single argument is taken verbatim so shell snippets survive `--shell`;
/// several arguments are re-quoted into one command line.
fn command_line(args: &[String]) -> Result<String> {
    match args {
        [single] => Ok(single.clone()),
        _ => shlex::try_join(args.iter().map(String::as_str))
            .context("command contains a NUL byte"),
    }
}

fn patterns_from_flags(literals: &[String], regexes: &[String]) -> Result<PatternSet> {
    let mut patterns = Vec::with_capacity(literals.len() + regexes.len());
    for (idx, literal) in literals.iter().enumerate() {
        patterns.push(Pattern::literal(format!("literal-{}", idx + 1), literal.clone())?);
    }
    for (idx, regex) in regexes.iter().enumerate() {
        patterns.push(Pattern::regex(format!("regex-{}", idx + 1), regex)?);
    }
    Ok(PatternSet::new(patterns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_line_quotes_multiple_arguments() {
        let args = vec!["printf".to_string(), "hello world".to_string()];
        assert_eq!(command_line(&args).ok(), Some("printf 'hello world'".to_string()));
        let single = vec!["echo a | tr a b".to_string()];
        assert_eq!(command_line(&single).ok(), Some("echo a | tr a b".to_string()));
    }

    #[test]
    fn flag_patterns_get_positional_ids() {
        let set = patterns_from_flags(&["READY> ".to_string()], &[r"msf\d* >".to_string()])
            .ok()
            .map(|set| set.ids().map(str::to_string).collect::<Vec<_>>());
        assert_eq!(
            set,
            Some(vec!["literal-1".to_string(), "regex-1".to_string()])
        );
    }

    #[test]
    fn invalid_regex_flag_is_an_error() {
        assert!(patterns_from_flags(&[], &["(".to_string()]).is_err());
    }
}
