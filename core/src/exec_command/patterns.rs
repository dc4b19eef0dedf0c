use regex_lite::Regex;
use serde::Serialize;

use super::errors::ExecError;

/// Interactive console prompt, e.g. `msf6 exploit(...) > `.
pub const CONSOLE_PROMPT_ID: &str = "console-prompt";
/// Notice that a remote shell session was opened.
pub const SHELL_OPENED_ID: &str = "shell-opened";

const CONSOLE_PROMPT_REGEX: &str = r"msf\d*.*>\s";
const SHELL_OPENED_REGEX: &str = r"(?i)shell.*opened";

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// A named text pattern that marks "the process is waiting for input".
#[derive(Debug, Clone)]
pub struct Pattern {
    id: String,
    matcher: Matcher,
}

impl Pattern {
    pub fn literal(id: impl Into<String>, text: impl Into<String>) -> Result<Self, ExecError> {
        let text = text.into();
        if text.is_empty() {
            return Err(ExecError::invalid_request("literal pattern must not be empty"));
        }
        Ok(Self {
            id: id.into(),
            matcher: Matcher::Literal(text),
        })
    }

    pub fn regex(id: impl Into<String>, pattern: &str) -> Result<Self, ExecError> {
        let id = id.into();
        let regex = Regex::new(pattern).map_err(|err| {
            ExecError::invalid_request(format!("pattern `{id}` is not a valid regex: {err}"))
        })?;
        Ok(Self {
            id,
            matcher: Matcher::Regex(regex),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match &self.matcher {
            Matcher::Literal(text) => haystack
                .find(text.as_str())
                .map(|start| (start, start + text.len())),
            Matcher::Regex(regex) => regex
                .find_iter(haystack)
                .find(|m| !m.is_empty())
                .map(|m| (m.start(), m.end())),
        }
    }
}

/// Which pattern matched, and where in the searched text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub text: String,
    #[serde(skip)]
    pub start: usize,
    #[serde(skip)]
    pub end: usize,
}

/// Ordered collection of patterns searched against sanitized output.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new(patterns: Vec<Pattern>) -> Result<Self, ExecError> {
        for (idx, pattern) in patterns.iter().enumerate() {
            if patterns[..idx].iter().any(|p| p.id == pattern.id) {
                return Err(ExecError::invalid_request(format!(
                    "duplicate pattern id `{}`",
                    pattern.id
                )));
            }
        }
        Ok(Self { patterns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Console prompt followed by the shell-opened notice.
    pub fn defaults() -> Self {
        let patterns = [
            (CONSOLE_PROMPT_ID, CONSOLE_PROMPT_REGEX),
            (SHELL_OPENED_ID, SHELL_OPENED_REGEX),
        ]
        .into_iter()
        .filter_map(|(id, re)| Regex::new(re).ok().map(|regex| (id, regex)))
        .map(|(id, regex)| Pattern {
            id: id.to_string(),
            matcher: Matcher::Regex(regex),
        })
        .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::id)
    }

    /// Finds the match that starts earliest in `haystack`. When several
    /// patterns start at the same offset the one listed first wins.
    pub fn find(&self, haystack: &str) -> Option<PatternMatch> {
        let mut best: Option<(&Pattern, usize, usize)> = None;
        for pattern in &self.patterns {
            let Some((start, end)) = pattern.find(haystack) else {
                continue;
            };
            match best {
                Some((_, best_start, _)) if best_start <= start => {}
                _ => best = Some((pattern, start, end)),
            }
        }
        best.map(|(pattern, start, end)| PatternMatch {
            pattern_id: pattern.id.clone(),
            text: haystack[start..end].to_string(),
            start,
            end,
        })
    }
}
