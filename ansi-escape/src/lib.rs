//! Removal of terminal escape sequences from captured pseudo-terminal output.
//!
//! Two entry points are provided: [`strip_ansi`] for text that is already
//! complete, and [`StreamSanitizer`] for output that arrives in arbitrary
//! chunks. The streaming form keeps the escape parser state between chunks so
//! a sequence split across two reads is still removed as a whole.

/// Strips escape sequences and control characters other than newline and tab.
///
/// The result never contains `ESC`, so applying it twice is the same as
/// applying it once.
pub fn strip_ansi(text: &str) -> String {
    strip_ansi_bytes(text.as_bytes())
}

/// Byte-oriented variant of [`strip_ansi`]; invalid UTF-8 becomes `U+FFFD`.
pub fn strip_ansi_bytes(raw: &[u8]) -> String {
    StreamSanitizer::new().push(raw)
}

/// Incremental sanitizer for chunked terminal output.
pub struct StreamSanitizer {
    parser: vte::Parser,
    text: PlainText,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self {
            parser: vte::Parser::new(),
            text: PlainText::default(),
        }
    }

    /// Feeds one raw chunk and returns the printable text it completed.
    ///
    /// Bytes belonging to an unfinished escape sequence (or an unfinished
    /// UTF-8 character) are held back until a later chunk completes them.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.parser.advance(&mut self.text, chunk);
        std::mem::take(&mut self.text.0)
    }
}

impl Default for StreamSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamSanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSanitizer").finish_non_exhaustive()
    }
}

/// Collects printable characters; every dispatched sequence is dropped.
#[derive(Default)]
struct PlainText(String);

impl vte::Perform for PlainText {
    fn print(&mut self, c: char) {
        self.0.push(c);
    }

    fn execute(&mut self, byte: u8) {
        if matches!(byte, b'\n' | b'\t') {
            self.0.push(char::from(byte));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SEQUENCES: &[&str] = &[
        "\x1b[31m",
        "\x1b[0m",
        "\x1b[1;32m",
        "\x1b[2K",
        "\x1b[10;5H",
        "\x1b[?25l",
        "\x1b]0;msfconsole\x07",
        "\x1b(B",
        "\x1b7",
    ];

    #[test]
    fn removes_colors_and_cursor_movement() {
        let raw = "\x1b[4mmsf6\x1b[0m exploit(\x1b[1m\x1b[31munix/ftp/vsftpd_234_backdoor\x1b[0m) > ";
        assert_eq!(
            strip_ansi(raw),
            "msf6 exploit(unix/ftp/vsftpd_234_backdoor) > "
        );
    }

    #[test]
    fn drops_carriage_returns_but_keeps_newlines() {
        assert_eq!(strip_ansi("line one\r\nline two\r\n"), "line one\nline two\n");
    }

    #[test]
    fn keeps_tab_separated_columns() {
        let raw = "127.0.0.1\tlocalhost\n\x1b[31mPORT\x1b[0m\tSTATE\n";
        assert_eq!(strip_ansi(raw), "127.0.0.1\tlocalhost\nPORT\tSTATE\n");

        let mut sanitizer = StreamSanitizer::new();
        let streamed: String = raw
            .as_bytes()
            .chunks(3)
            .map(|chunk| sanitizer.push(chunk))
            .collect();
        assert_eq!(streamed, "127.0.0.1\tlocalhost\nPORT\tSTATE\n");
    }

    #[test]
    fn plain_text_is_untouched() {
        let text = "PORT   STATE SERVICE VERSION\n21/tcp open  ftp     vsftpd 2.3.4\n";
        assert_eq!(strip_ansi(text), text);
    }

    #[test]
    fn stream_handles_sequence_split_across_chunks() {
        let mut sanitizer = StreamSanitizer::new();
        let mut out = String::new();
        out.push_str(&sanitizer.push(b"ready\x1b["));
        out.push_str(&sanitizer.push(b"1;3"));
        out.push_str(&sanitizer.push(b"2mgo\x1b[0m!"));
        assert_eq!(out, "readygo!");
    }

    #[test]
    fn stream_holds_partial_utf8() {
        let bytes = "héllo".as_bytes();
        let mut sanitizer = StreamSanitizer::new();
        let first = sanitizer.push(&bytes[..2]);
        let second = sanitizer.push(&bytes[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
        assert!(!first.contains('\u{fffd}'));
    }

    fn segment() -> impl Strategy<Value = (String, String)> {
        prop_oneof![
            "[a-zA-Z0-9 \t.,:;!?<>/=_-]{0,16}\n?".prop_map(|text| (text.clone(), text)),
            proptest::sample::select(SEQUENCES).prop_map(|seq| (seq.to_string(), String::new())),
        ]
    }

    proptest! {
        #[test]
        fn preserves_plain_text_and_is_idempotent(segments in proptest::collection::vec(segment(), 0..24)) {
            let raw: String = segments.iter().map(|(raw, _)| raw.as_str()).collect();
            let plain: String = segments.iter().map(|(_, plain)| plain.as_str()).collect();

            let once = strip_ansi(&raw);
            prop_assert_eq!(&once, &plain);
            prop_assert!(!once.contains('\x1b'));
            prop_assert_eq!(strip_ansi(&once), once);
        }

        #[test]
        fn streaming_matches_one_shot(
            segments in proptest::collection::vec(segment(), 0..24),
            split in 1usize..7,
        ) {
            let raw: String = segments.iter().map(|(raw, _)| raw.as_str()).collect();
            let mut sanitizer = StreamSanitizer::new();
            let mut streamed = String::new();
            for chunk in raw.as_bytes().chunks(split) {
                streamed.push_str(&sanitizer.push(chunk));
            }
            prop_assert_eq!(streamed, strip_ansi(&raw));
        }
    }
}
