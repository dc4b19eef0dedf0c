use serde::Deserialize;
use serde::Serialize;
use shlex::Shlex;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use super::errors::ExecError;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
const MAX_KILL_GRACE: Duration = Duration::from_secs(60);
const PREVIEW_MAX_CHARS: usize = 120;

/// How a command string is turned into a process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LaunchMode {
    /// Split with POSIX quoting rules and exec the program without a shell.
    #[default]
    Direct,
    /// Run through `<shell> -c <command>`.
    Shell { shell: String },
}

impl LaunchMode {
    pub fn shell(shell: impl Into<String>) -> Self {
        Self::Shell {
            shell: shell.into(),
        }
    }
}

/// One command to run, plus the knobs for observing it.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    /// Maximum gap between output bytes before the process counts as stalled.
    pub idle_timeout: Duration,
    /// Written to the terminal right after the process starts.
    pub initial_input: Option<String>,
    pub launch: LaunchMode,
    /// Upper bound on a single wait for output.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when terminating.
    pub kill_grace: Duration,
    /// Working directory; the current directory when unset.
    pub cwd: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            idle_timeout,
            initial_input: None,
            launch: LaunchMode::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            cwd: None,
        }
    }

    pub fn with_initial_input(mut self, input: impl Into<String>) -> Self {
        self.initial_input = Some(input.into());
        self
    }

    pub fn with_launch(mut self, launch: LaunchMode) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ExecError> {
        if self.command.trim().is_empty() {
            return Err(ExecError::invalid_request("command must not be empty"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ExecError::invalid_request("idle timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(ExecError::invalid_request("poll interval must be positive"));
        }
        if self.kill_grace > MAX_KILL_GRACE {
            return Err(ExecError::invalid_request(format!(
                "kill grace must be at most {}s",
                MAX_KILL_GRACE.as_secs()
            )));
        }
        if let LaunchMode::Shell { shell } = &self.launch
            && shell.trim().is_empty()
        {
            return Err(ExecError::invalid_request("shell must not be empty"));
        }
        Ok(())
    }

    /// Program and arguments for the process, per the launch mode.
    pub(crate) fn argv(&self) -> Result<Vec<String>, ExecError> {
        match &self.launch {
            LaunchMode::Direct => {
                let mut lexer = Shlex::new(self.command.trim());
                let argv: Vec<String> = lexer.by_ref().collect();
                if lexer.had_error {
                    return Err(ExecError::invalid_request(format!(
                        "unbalanced quoting in `{}`",
                        self.preview()
                    )));
                }
                if argv.is_empty() {
                    return Err(ExecError::invalid_request("command must not be empty"));
                }
                Ok(argv)
            }
            LaunchMode::Shell { shell } => Ok(vec![
                shell.clone(),
                "-c".to_string(),
                self.command.clone(),
            ]),
        }
    }

    /// Short single-line rendering of the command for logs.
    pub fn preview(&self) -> String {
        let tokens: Vec<String> = Shlex::new(&self.command).collect();
        let slice = if tokens.len() > 2 && is_shell_wrapper(&tokens[0], &tokens[1]) {
            &tokens[2..]
        } else {
            &tokens[..]
        };
        let joined = if slice.is_empty() {
            self.command.trim().to_string()
        } else {
            slice.join(" ")
        };
        preview_command(&joined, PREVIEW_MAX_CHARS)
    }
}

fn is_shell_wrapper(first: &str, flag: &str) -> bool {
    matches!(flag, "-c" | "-lc")
        && Path::new(first)
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| matches!(name, "bash" | "sh" | "zsh"))
            .unwrap_or(false)
}

fn preview_command(cmd: &str, max: usize) -> String {
    let single_line = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
    let count = single_line.chars().count();
    if count <= max {
        return single_line;
    }
    let keep = max / 2;
    let head: String = single_line.chars().take(keep).collect();
    let tail: String = single_line.chars().skip(count - keep).collect();
    format!("{head}…{tail}")
}
