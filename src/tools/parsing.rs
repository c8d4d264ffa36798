//! Incremental extraction of one string field from a JSON object that
//! arrives in fragments.
//!
//! In single-field mode the service streams the arguments of the
//! `terminal_output` call as raw JSON text.  [`FieldExtractor`] finds the
//! opening of `"<field>": "` and from then on hands back decoded characters
//! as soon as they arrive, so the operator sees output while the call is
//! still being generated.

/// Streaming decoder for a single JSON string field.
#[derive(Debug)]
pub struct FieldExtractor {
    field: String,
    raw: String,
    /// Byte offset into `raw` of the first unprocessed byte.
    cursor: usize,
    phase: Phase,
    text: String,
    escape: Escape,
    high_surrogate: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Seeking,
    InString,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

/// Result of matching the field opener at some offset.
enum Opener {
    Found(usize),
    NeedMore,
    Mismatch,
}

impl FieldExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            raw: String::new(),
            cursor: 0,
            phase: Phase::Seeking,
            text: String::new(),
            escape: Escape::None,
            high_surrogate: None,
        }
    }

    /// Append a fragment and return the characters of the field value it
    /// completed.  Returns an empty string while still seeking the field
    /// or after the closing quote.
    pub fn feed(&mut self, fragment: &str) -> String {
        self.raw.push_str(fragment);
        if self.phase == Phase::Seeking {
            self.seek();
        }
        if self.phase != Phase::InString {
            return String::new();
        }
        let start = self.text.len();
        self.scan_string();
        self.text[start..].to_string()
    }

    /// Everything decoded from the field so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// All raw argument text fed so far.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the opening of the field has been located.
    pub fn found(&self) -> bool {
        self.phase != Phase::Seeking
    }

    /// Whether the closing quote of the field has been seen.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    fn seek(&mut self) {
        let needle = format!("\"{}\"", self.field);
        while let Some(rel) = self.raw[self.cursor..].find(&needle) {
            let at = self.cursor + rel;
            match self.match_opener(at + needle.len()) {
                Opener::Found(body) => {
                    self.cursor = body;
                    self.phase = Phase::InString;
                    return;
                }
                // Keep the cursor on the candidate so the next fragment
                // can finish matching it.
                Opener::NeedMore => {
                    self.cursor = at;
                    return;
                }
                Opener::Mismatch => self.cursor = at + 1,
            }
        }
        // No full candidate; keep enough tail to match a split key.
        let keep = needle.len().saturating_sub(1);
        let mut floor = self.raw.len().saturating_sub(keep).max(self.cursor);
        while !self.raw.is_char_boundary(floor) {
            floor -= 1;
        }
        self.cursor = floor;
    }

    /// `\s*:\s*"` starting at `pos`.
    fn match_opener(&self, pos: usize) -> Opener {
        let rest = &self.raw[pos..];
        let mut chars = rest.char_indices().skip_while(|(_, c)| c.is_whitespace());
        match chars.next() {
            None => return Opener::NeedMore,
            Some((_, ':')) => {}
            Some(_) => return Opener::Mismatch,
        }
        let mut chars = chars.skip_while(|(_, c)| c.is_whitespace());
        match chars.next() {
            None => Opener::NeedMore,
            Some((i, '"')) => Opener::Found(pos + i + 1),
            Some(_) => Opener::Mismatch,
        }
    }

    fn scan_string(&mut self) {
        let rest = &self.raw[self.cursor..];
        let mut consumed = 0;
        let mut decoded = String::new();
        let mut closed = false;
        for c in rest.chars() {
            consumed += c.len_utf8();
            match std::mem::replace(&mut self.escape, Escape::None) {
                Escape::None => match c {
                    '\\' => self.escape = Escape::Backslash,
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => push_char(&mut decoded, &mut self.high_surrogate, other),
                },
                Escape::Backslash => {
                    let simple = match c {
                        'n' => Some('\n'),
                        't' => Some('\t'),
                        'r' => Some('\r'),
                        'b' => Some('\u{8}'),
                        'f' => Some('\u{c}'),
                        '"' => Some('"'),
                        '\\' => Some('\\'),
                        '/' => Some('/'),
                        'u' => None,
                        other => Some(other),
                    };
                    match simple {
                        Some(ch) => push_char(&mut decoded, &mut self.high_surrogate, ch),
                        None => self.escape = Escape::Unicode(String::new()),
                    }
                }
                Escape::Unicode(mut digits) => {
                    digits.push(c);
                    if digits.len() < 4 {
                        self.escape = Escape::Unicode(digits);
                        continue;
                    }
                    match u16::from_str_radix(&digits, 16) {
                        Ok(unit) => push_unit(&mut decoded, &mut self.high_surrogate, unit),
                        Err(_) => {
                            decoded.push_str("\\u");
                            decoded.push_str(&digits);
                        }
                    }
                }
            }
        }
        self.cursor += consumed;
        self.text.push_str(&decoded);
        if closed {
            if self.high_surrogate.take().is_some() {
                self.text.push(char::REPLACEMENT_CHARACTER);
            }
            self.phase = Phase::Done;
        }
    }
}

fn push_char(out: &mut String, high: &mut Option<u16>, c: char) {
    if high.take().is_some() {
        out.push(char::REPLACEMENT_CHARACTER);
    }
    out.push(c);
}

fn push_unit(out: &mut String, high: &mut Option<u16>, unit: u16) {
    match (high.take(), unit) {
        (None, 0xD800..=0xDBFF) => *high = Some(unit),
        (Some(h), 0xDC00..=0xDFFF) => {
            let code = 0x10000 + ((u32::from(h) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
            out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        (prev, _) => {
            if prev.is_some() {
                out.push(char::REPLACEMENT_CHARACTER);
            }
            if (0xD800..=0xDBFF).contains(&unit) {
                *high = Some(unit);
            } else {
                out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(ex: &mut FieldExtractor, parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| ex.feed(p)).collect()
    }

    #[test]
    fn streams_as_fragments_arrive() {
        let mut ex = FieldExtractor::new("output");
        let out = feed_all(&mut ex, &["{\"out", "put\": \"hel", "lo\\nwor", "ld\"}"]);
        assert_eq!(out, vec!["", "hel", "lo\nwor", "ld"]);
        assert!(ex.is_complete());
        assert_eq!(ex.text(), "hello\nworld");
    }

    #[test]
    fn escape_split_across_fragments() {
        let mut ex = FieldExtractor::new("output");
        let out = feed_all(&mut ex, &["{\"output\":\"a\\", "\"b\\u00", "e9\"}"]);
        assert_eq!(out.concat(), "a\"bé");
    }

    #[test]
    fn surrogate_pairs_join() {
        let mut ex = FieldExtractor::new("output");
        ex.feed(r#"{"output":"\ud83d\ude00!"}"#);
        assert_eq!(ex.text(), "😀!");
    }

    #[test]
    fn other_keys_are_skipped() {
        let mut ex = FieldExtractor::new("output");
        let out = ex.feed(r#"{"note":"output","output" : "x"}"#);
        assert_eq!(out, "x");
    }

    #[test]
    fn opener_split_between_colon_and_quote() {
        let mut ex = FieldExtractor::new("output");
        assert_eq!(ex.feed("{\"output\" :"), "");
        assert!(!ex.found());
        assert_eq!(ex.feed(" \"ok\"}"), "ok");
    }

    #[test]
    fn escaped_slash_and_hex_text_survive() {
        let mut ex = FieldExtractor::new("output");
        ex.feed(r#"{"output":"\\x1b[32m\/ok"}"#);
        assert_eq!(ex.text(), "\\x1b[32m/ok");
    }

    #[test]
    fn unterminated_value_is_not_complete() {
        let mut ex = FieldExtractor::new("output");
        ex.feed(r#"{"output":"partial"#);
        assert!(ex.found());
        assert!(!ex.is_complete());
        assert_eq!(ex.text(), "partial");
    }
}
