const FENCE: &str = "```";
const LEGACY_COMPLETION: &str = "done";

/// Pulls a single command line out of an assistant reply.
///
/// The first fenced block wins when present (its language tag line is
/// dropped); otherwise surrounding single backticks are removed. A leading
/// `bash` word and literal `\n` escapes are discarded and whitespace runs are
/// collapsed. Returns `None` when nothing is left.
pub fn extract_command(reply: &str) -> Option<String> {
    let body = match fenced_block(reply) {
        Some(block) => block.to_string(),
        None => strip_single_backticks(reply.trim()).trim().to_string(),
    };
    let body = strip_bash_prefix(body.trim());
    let body = body.replace("\\n", " ");
    let command = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        None
    } else {
        Some(command)
    }
}

/// True when `command` is the completion phrase (or the legacy `done`).
pub fn is_completion(command: &str, phrase: &str) -> bool {
    let normalize = |text: &str| text.trim().trim_end_matches('.').trim().to_lowercase();
    let command = normalize(command);
    !command.is_empty() && (command == normalize(phrase) || command == LEGACY_COMPLETION)
}

fn fenced_block(reply: &str) -> Option<&str> {
    let open = reply.find(FENCE)?;
    let after_open = &reply[open + FENCE.len()..];
    let close = after_open.find(FENCE)?;
    let inner = &after_open[..close];
    Some(drop_language_tag(inner))
}

fn drop_language_tag(inner: &str) -> &str {
    let Some((first, rest)) = inner.split_once('\n') else {
        return inner;
    };
    let tag = first.trim();
    let is_tag = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'));
    let shell_tag = matches!(tag, "bash" | "sh" | "shell" | "zsh" | "console");
    if shell_tag || (is_tag && !rest.trim().is_empty()) {
        rest
    } else {
        inner
    }
}

fn strip_single_backticks(text: &str) -> &str {
    let text = text.strip_prefix('`').unwrap_or(text);
    text.strip_suffix('`').unwrap_or(text)
}

fn strip_bash_prefix(text: &str) -> &str {
    match text.strip_prefix("bash") {
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn takes_first_fenced_block_and_drops_language_tag() {
        let reply = "Let's scan first.\n```bash\nnmap -sV 10.0.0.5\n```\nthen\n```\nid\n```";
        assert_eq!(extract_command(reply).as_deref(), Some("nmap -sV 10.0.0.5"));
    }

    #[test]
    fn single_word_fence_body_is_not_mistaken_for_a_tag() {
        assert_eq!(extract_command("```\nwhoami\n```").as_deref(), Some("whoami"));
        assert_eq!(extract_command("```whoami```").as_deref(), Some("whoami"));
    }

    #[test]
    fn strips_single_backticks_and_bash_prefix() {
        assert_eq!(
            extract_command("`bash nc -nv 10.0.0.5 6200`").as_deref(),
            Some("nc -nv 10.0.0.5 6200")
        );
        assert_eq!(extract_command("bashful --help").as_deref(), Some("bashful --help"));
    }

    #[test]
    fn flattens_escaped_newlines_and_whitespace() {
        assert_eq!(
            extract_command(r#"msfconsole -q -x "use exploit/unix/ftp/vsftpd_234_backdoor;\nset RHOSTS 10.0.0.5;\nrun""#)
                .as_deref(),
            Some(r#"msfconsole -q -x "use exploit/unix/ftp/vsftpd_234_backdoor; set RHOSTS 10.0.0.5; run""#)
        );
        assert_eq!(extract_command("ls    -la\n  /tmp").as_deref(), Some("ls -la /tmp"));
    }

    #[test]
    fn empty_replies_yield_nothing() {
        assert_eq!(extract_command(""), None);
        assert_eq!(extract_command("``"), None);
        assert_eq!(extract_command("```bash\n```"), None);
    }

    #[test]
    fn completion_phrase_matching() {
        let phrase = "Penetration test is complete.";
        assert!(is_completion("Penetration test is complete.", phrase));
        assert!(is_completion("  penetration TEST is complete ", phrase));
        assert!(is_completion("done", phrase));
        assert!(is_completion("Done.", phrase));
        assert!(!is_completion("nmap 10.0.0.5", phrase));
        assert!(!is_completion("", phrase));
    }
}
