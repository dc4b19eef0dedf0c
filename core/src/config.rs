//! Runtime configuration, loaded from `config.toml` and merged with
//! command-line overrides.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::exec_command::ExecError;
use crate::exec_command::ExecutionRequest;
use crate::exec_command::LaunchMode;
use crate::exec_command::Pattern;
use crate::exec_command::PatternSet;
use crate::pilot::COMPLETION_PHRASE;

pub const CONFIG_TOML_FILE: &str = "config.toml";
pub const INTRUSION_HOME_ENV: &str = "INTRUSION_HOME";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 200_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_KILL_GRACE_MS: u64 = 500;
const MAX_KILL_GRACE_MS: u64 = 60_000;
const DEFAULT_MAX_FEEDBACK_BYTES: usize = 16 * 1024;
const DEFAULT_SHELL: &str = "/bin/sh";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are assisting with an authorized penetration test \
of a single client machine. Reply with exactly one shell command per message and nothing else. \
You will receive the command output in the next message. When a command opens an interactive \
console, reply with the next line to type into it. When the engagement is finished, reply with \
exactly: Penetration test is complete.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not determine home directory; set {INTRUSION_HOME_ENV}")]
    NoHome,
}

impl From<ExecError> for ConfigError {
    fn from(err: ExecError) -> Self {
        Self::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    #[default]
    Direct,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternToml {
    pub id: String,
    pub literal: Option<String>,
    pub regex: Option<String>,
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigToml {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub max_turns: Option<usize>,
    pub max_feedback_bytes: Option<usize>,
    pub completion_phrase: Option<String>,
    pub system_prompt: Option<String>,
    pub launch: Option<LaunchKind>,
    pub shell: Option<String>,
    pub patterns: Option<Vec<PatternToml>>,
}

/// Values supplied on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub max_turns: Option<usize>,
    pub launch: Option<LaunchKind>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub base_url: String,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    /// Unlimited when unset.
    pub max_turns: Option<usize>,
    pub max_feedback_bytes: usize,
    pub completion_phrase: String,
    pub system_prompt: String,
    pub launch: LaunchMode,
    pub patterns: PatternSet,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            max_turns: None,
            max_feedback_bytes: DEFAULT_MAX_FEEDBACK_BYTES,
            completion_phrase: COMPLETION_PHRASE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            launch: LaunchMode::Direct,
            patterns: PatternSet::defaults(),
        }
    }
}

impl Config {
    /// Loads `config_path` when given, otherwise `$INTRUSION_HOME/config.toml`.
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load_with_cli_overrides(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let cfg = match config_path {
            Some(path) => load_config_toml(path)?,
            None => {
                let path = find_intrusion_home()?.join(CONFIG_TOML_FILE);
                if path.exists() {
                    load_config_toml(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "no config file; using defaults");
                    ConfigToml::default()
                }
            }
        };
        Self::load_from_base_config_with_overrides(cfg, overrides)
    }

    pub fn load_from_base_config_with_overrides(
        cfg: ConfigToml,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let idle_timeout_ms = overrides.idle_timeout_ms.or(cfg.idle_timeout_ms);
        let idle_timeout = positive_millis("idle_timeout_ms", idle_timeout_ms)?
            .unwrap_or(defaults.idle_timeout);
        let poll_interval = positive_millis("poll_interval_ms", cfg.poll_interval_ms)?
            .unwrap_or(defaults.poll_interval);
        let kill_grace = match cfg.kill_grace_ms {
            Some(ms) if ms > MAX_KILL_GRACE_MS => {
                return Err(ConfigError::Invalid(format!(
                    "kill_grace_ms must be at most {MAX_KILL_GRACE_MS}"
                )));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.kill_grace,
        };

        let max_turns = overrides.max_turns.or(cfg.max_turns);
        if max_turns == Some(0) {
            return Err(ConfigError::Invalid("max_turns must be positive".to_string()));
        }
        let max_feedback_bytes = cfg
            .max_feedback_bytes
            .unwrap_or(defaults.max_feedback_bytes);
        if max_feedback_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_feedback_bytes must be positive".to_string(),
            ));
        }

        let launch = match overrides.launch.or(cfg.launch).unwrap_or_default() {
            LaunchKind::Direct => LaunchMode::Direct,
            LaunchKind::Shell => {
                LaunchMode::shell(cfg.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()))
            }
        };

        let patterns = match cfg.patterns {
            Some(patterns) => build_patterns(patterns)?,
            None => defaults.patterns,
        };

        let completion_phrase = non_empty(cfg.completion_phrase)
            .unwrap_or(defaults.completion_phrase);

        Ok(Self {
            model: non_empty(overrides.model.or(cfg.model)).unwrap_or(defaults.model),
            base_url: non_empty(overrides.base_url.or(cfg.base_url))
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            idle_timeout,
            poll_interval,
            kill_grace,
            max_turns,
            max_feedback_bytes,
            completion_phrase,
            system_prompt: cfg.system_prompt.unwrap_or(defaults.system_prompt),
            launch,
            patterns,
        })
    }

    /// Builds an execution request for `command` using the configured
    /// timeouts and launch mode.
    pub fn execution_request(&self, command: impl Into<String>) -> ExecutionRequest {
        ExecutionRequest::new(command, self.idle_timeout)
            .with_launch(self.launch.clone())
            .with_poll_interval(self.poll_interval)
            .with_kill_grace(self.kill_grace)
    }
}

/// Returns `$INTRUSION_HOME` if set, otherwise `~/.intrusion`. The directory
/// is not required to exist.
pub fn find_intrusion_home() -> Result<PathBuf, ConfigError> {
    if let Ok(val) = std::env::var(INTRUSION_HOME_ENV)
        && !val.is_empty()
    {
        return Ok(PathBuf::from(val));
    }
    let mut home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    home.push(".intrusion");
    Ok(home)
}

pub fn load_config_toml(path: &Path) -> Result<ConfigToml, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn build_patterns(entries: Vec<PatternToml>) -> Result<PatternSet, ConfigError> {
    let mut patterns = Vec::with_capacity(entries.len());
    for entry in entries {
        let pattern = match (entry.literal, entry.regex) {
            (Some(literal), None) => Pattern::literal(entry.id, literal)?,
            (None, Some(regex)) => Pattern::regex(entry.id, &regex)?,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "pattern `{}` needs exactly one of `literal` or `regex`",
                    entry.id
                )));
            }
        };
        patterns.push(pattern);
    }
    Ok(PatternSet::new(patterns)?)
}

fn positive_millis(key: &str, value: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid(format!("{key} must be positive"))),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
