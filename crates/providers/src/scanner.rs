//! Incremental extraction of one string field from streaming JSON.
//!
//! [`JsonFieldScanner`] is a small stateful scanner — not a JSON parser —
//! that tracks object depth, string/escape state, and the key currently
//! being decoded. As bytes of a structured-output completion accumulate,
//! it yields newly available decoded characters of a single named top-level
//! string field. The HTML providers use it to surface `htmlContent` while
//! the response is still streaming; the decider layers [`WordChunker`] on
//! top of it to inject `voiceOverText` one complete word at a time.

/// What the string currently being lexed is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringRole {
    Key,
    Value,
}

/// Streams the decoded value of one top-level string field out of a JSON
/// document arriving in arbitrary chunks.
pub struct JsonFieldScanner {
    field: String,
    depth: i32,
    in_string: bool,
    escape: bool,
    /// Pending hex digits of a `\uXXXX` escape.
    unicode: Option<String>,
    pending_high_surrogate: Option<u16>,
    string_role: StringRole,
    /// Decoded content of the in-flight string.
    current: String,
    /// Last completed key at depth 1, awaiting its `:`.
    last_key: Option<String>,
    /// Set when `last_key` matched the target field.
    matched_key: bool,
    /// Set while the target value is being lexed.
    capturing: bool,
    expect_value: bool,
    done: bool,
    value: String,
}

impl JsonFieldScanner {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            depth: 0,
            in_string: false,
            escape: false,
            unicode: None,
            pending_high_surrogate: None,
            string_role: StringRole::Key,
            current: String::new(),
            last_key: None,
            matched_key: false,
            capturing: false,
            expect_value: false,
            done: false,
            value: String::new(),
        }
    }

    /// Feed a chunk; returns the newly decoded portion of the target value.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut emitted = String::new();
        for c in chunk.chars() {
            if self.done {
                break;
            }
            self.step(c, &mut emitted);
        }
        emitted
    }

    /// The full decoded value seen so far.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// True once the target value's closing quote has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn step(&mut self, c: char, emitted: &mut String) {
        if self.in_string {
            self.step_in_string(c, emitted);
            return;
        }

        match c {
            '"' => {
                self.in_string = true;
                self.current.clear();
                if self.expect_value {
                    self.string_role = StringRole::Value;
                    if self.matched_key && self.depth == 1 {
                        self.capturing = true;
                    }
                    self.expect_value = false;
                    self.matched_key = false;
                } else {
                    self.string_role = StringRole::Key;
                }
            }
            '{' => {
                self.depth += 1;
                self.expect_value = false;
            }
            '}' => self.depth -= 1,
            '[' => self.expect_value = false,
            ']' | ',' => {}
            ':' => {
                if self.depth == 1 {
                    self.matched_key = self.last_key.as_deref() == Some(self.field.as_str());
                }
                self.last_key = None;
                self.expect_value = true;
            }
            c if c.is_whitespace() => {}
            _ => {
                // A non-string value (number, bool, null) begins.
                self.matched_key = false;
                self.expect_value = false;
            }
        }
    }

    fn step_in_string(&mut self, c: char, emitted: &mut String) {
        if let Some(hex) = &mut self.unicode {
            hex.push(c);
            if hex.len() == 4 {
                let hex = self.unicode.take().unwrap();
                self.decode_unicode(&hex, emitted);
            }
            return;
        }

        if self.escape {
            self.escape = false;
            let decoded = match c {
                'n' => Some('\n'),
                't' => Some('\t'),
                'r' => Some('\r'),
                'b' => Some('\u{0008}'),
                'f' => Some('\u{000C}'),
                '"' => Some('"'),
                '\\' => Some('\\'),
                '/' => Some('/'),
                'u' => {
                    self.unicode = Some(String::new());
                    None
                }
                other => Some(other),
            };
            if let Some(ch) = decoded {
                self.push_char(ch, emitted);
            }
            return;
        }

        match c {
            '\\' => self.escape = true,
            '"' => {
                self.in_string = false;
                if self.capturing {
                    self.capturing = false;
                    self.done = true;
                } else if self.string_role == StringRole::Key && self.depth == 1 {
                    self.last_key = Some(self.current.clone());
                }
            }
            _ => self.push_char(c, emitted),
        }
    }

    fn decode_unicode(&mut self, hex: &str, emitted: &mut String) {
        let Ok(unit) = u16::from_str_radix(hex, 16) else {
            return;
        };
        match self.pending_high_surrogate.take() {
            Some(high) if (0xDC00..=0xDFFF).contains(&unit) => {
                let combined =
                    0x10000 + (((high as u32) - 0xD800) << 10) + ((unit as u32) - 0xDC00);
                if let Some(ch) = char::from_u32(combined) {
                    self.push_char(ch, emitted);
                }
            }
            _ => {
                if (0xD800..=0xDBFF).contains(&unit) {
                    self.pending_high_surrogate = Some(unit);
                } else if let Some(ch) = char::from_u32(unit as u32) {
                    self.push_char(ch, emitted);
                }
            }
        }
    }

    fn push_char(&mut self, c: char, emitted: &mut String) {
        self.current.push(c);
        if self.capturing {
            self.value.push(c);
            emitted.push(c);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Word chunker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates streamed text and releases it only at word boundaries
/// (whitespace or sentence-terminal punctuation), so partially decoded
/// words are never spoken.
#[derive(Default)]
pub struct WordChunker {
    buffer: String,
}

impl WordChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text; returns everything up to the last word boundary, if any
    /// complete word is available.
    pub fn feed(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);

        let mut boundary = None;
        for (i, c) in self.buffer.char_indices() {
            if c.is_whitespace() || matches!(c, '.' | '!' | '?') {
                boundary = Some(i + c.len_utf8());
            }
        }

        let boundary = boundary?;
        let chunk: String = self.buffer.drain(..boundary).collect();
        (!chunk.trim().is_empty()).then_some(chunk)
    }

    /// Release whatever remains once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed every chunk and collect the emitted capture.
    fn scan(field: &str, chunks: &[&str]) -> (String, String) {
        let mut scanner = JsonFieldScanner::new(field);
        let mut emitted = String::new();
        for chunk in chunks {
            emitted.push_str(&scanner.feed(chunk));
        }
        (emitted, scanner.value().to_string())
    }

    #[test]
    fn extracts_field_split_across_chunks() {
        let chunks = [
            "{\"display",
            "Enhancement\":",
            " true,",
            " \"displayEnhanced",
            "Text\": \"Here is a",
            " table\"",
            ", \"voiceOver",
            "Text\": \"I calculated",
            " the values for",
            " you.\"",
            "}",
        ];
        let (emitted, value) = scan("voiceOverText", &chunks);
        assert_eq!(value, "I calculated the values for you.");
        assert_eq!(emitted, value);
    }

    #[test]
    fn ignores_other_string_fields_with_escapes() {
        let chunks = [
            r#"{"displayEnhancedText": "line\n| a | b |\n\"quoted\"", "#,
            r#""voiceOverText": "short answer"}"#,
        ];
        let (_, value) = scan("voiceOverText", &chunks);
        assert_eq!(value, "short answer");
    }

    #[test]
    fn decodes_escapes_inside_target() {
        let (_, value) = scan(
            "voiceOverText",
            &[r#"{"voiceOverText": "a\nb \"c\" A"}"#],
        );
        assert_eq!(value, "a\nb \"c\" A");
    }

    #[test]
    fn decodes_surrogate_pairs() {
        let (_, value) = scan("voiceOverText", &[r#"{"voiceOverText": "ok 😀"}"#]);
        assert_eq!(value, "ok \u{1F600}");
    }

    #[test]
    fn nested_fields_with_same_name_are_ignored() {
        let (_, value) = scan(
            "voiceOverText",
            &[r#"{"meta": {"voiceOverText": "inner"}, "voiceOverText": "outer"}"#],
        );
        assert_eq!(value, "outer");
    }

    #[test]
    fn non_string_value_for_target_yields_nothing() {
        let (_, value) = scan("voiceOverText", &[r#"{"voiceOverText": null}"#]);
        assert_eq!(value, "");
    }

    #[test]
    fn escape_split_across_chunks() {
        let (_, value) = scan("voiceOverText", &[r#"{"voiceOverText": "a\"#, r#"nb"}"#]);
        assert_eq!(value, "a\nb");
    }

    #[test]
    fn html_content_extraction() {
        let chunks = [
            r#"{"htmlContent": "<div class=\"p-4\">"#,
            "Hello",
            r#"</div>"}"#,
        ];
        let (emitted, value) = scan("htmlContent", &chunks);
        assert_eq!(value, "<div class=\"p-4\">Hello</div>");
        assert_eq!(emitted, value);
    }

    #[test]
    fn done_after_closing_quote() {
        let mut scanner = JsonFieldScanner::new("voiceOverText");
        scanner.feed(r#"{"voiceOverText": "done now", "more": "x"}"#);
        assert!(scanner.is_done());
        assert_eq!(scanner.value(), "done now");
    }

    // ── WordChunker ───────────────────────────────────────────────

    #[test]
    fn chunker_holds_partial_words() {
        let mut chunker = WordChunker::new();
        assert_eq!(chunker.feed("I calc").as_deref(), Some("I "));
        assert_eq!(chunker.feed("ulated the").as_deref(), Some("calculated "));
        assert_eq!(chunker.feed(" result.").as_deref(), Some("the result."));
        assert_eq!(chunker.flush(), None);
    }

    #[test]
    fn chunker_flushes_trailing_word() {
        let mut chunker = WordChunker::new();
        assert_eq!(chunker.feed("hello "), Some("hello ".to_string()));
        assert_eq!(chunker.feed("world"), None);
        assert_eq!(chunker.flush(), Some("world".to_string()));
    }

    #[test]
    fn chunker_skips_pure_whitespace() {
        let mut chunker = WordChunker::new();
        assert_eq!(chunker.feed("   "), None);
        assert_eq!(chunker.flush(), None);
    }
}
