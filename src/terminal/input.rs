//! Operator-side line editing.
//!
//! Works on the byte stream after telnet commands are stripped.  Echo is
//! produced here because clients are told the server echoes.

use unicode_width::UnicodeWidthChar;

const ETX: u8 = 0x03;
const EOT: u8 = 0x04;
const BS: u8 = 0x08;
const LF: u8 = b'\n';
const CR: u8 = b'\r';
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Something the operator did that the session must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// A submitted line, without its terminator.
    Line(String),
    /// Ctrl-C: the partial line was discarded.
    Interrupt,
    /// Ctrl-D: the operator is leaving.
    Eof,
}

/// Echo bytes and events produced by one [`LineEditor::feed`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Edit {
    pub echo: Vec<u8>,
    pub events: Vec<InputEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Escape {
    #[default]
    None,
    Start,
    Csi,
}

#[derive(Debug, Default)]
pub struct LineEditor {
    line: String,
    utf8: Vec<u8>,
    after_cr: bool,
    escape: Escape,
    closed: bool,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The line typed so far.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Edit {
        let mut edit = Edit::default();
        for &b in bytes {
            if self.closed {
                break;
            }
            self.byte(b, &mut edit);
        }
        edit
    }

    fn byte(&mut self, b: u8, edit: &mut Edit) {
        let after_cr = std::mem::take(&mut self.after_cr);

        match self.escape {
            // Editing keys end an unfinished sequence and keep their meaning.
            Escape::Start | Escape::Csi if matches!(b, CR | LF | ETX | EOT | BS | DEL) => {
                self.escape = Escape::None;
            }
            Escape::Start => {
                self.escape = if b == b'[' || b == b'O' {
                    Escape::Csi
                } else {
                    Escape::None
                };
                return;
            }
            Escape::Csi => {
                if (0x40..=0x7e).contains(&b) {
                    self.escape = Escape::None;
                }
                return;
            }
            Escape::None => {}
        }

        match b {
            CR => {
                self.after_cr = true;
                self.submit(edit);
            }
            LF | 0 if after_cr => {}
            LF => self.submit(edit),
            ETX => {
                self.line.clear();
                self.utf8.clear();
                edit.echo.extend_from_slice(b"^C\r\n");
                edit.events.push(InputEvent::Interrupt);
            }
            EOT => {
                self.closed = true;
                edit.events.push(InputEvent::Eof);
            }
            BS | DEL => {
                self.utf8.clear();
                if let Some(c) = self.line.pop() {
                    let cols = c.width().unwrap_or(1).max(1);
                    for _ in 0..cols {
                        edit.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
            }
            ESC => self.escape = Escape::Start,
            0x00..=0x1f => {}
            0x20..=0x7e => {
                self.utf8.clear();
                self.line.push(b as char);
                edit.echo.push(b);
            }
            _ => self.multibyte(b, edit),
        }
    }

    fn multibyte(&mut self, b: u8, edit: &mut Edit) {
        let is_lead = b >= 0xC0;
        if is_lead {
            self.utf8.clear();
        } else if self.utf8.is_empty() {
            return;
        }
        self.utf8.push(b);
        let expected = match self.utf8[0] {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => {
                self.utf8.clear();
                return;
            }
        };
        if self.utf8.len() < expected {
            return;
        }
        let bytes = std::mem::take(&mut self.utf8);
        if let Ok(s) = std::str::from_utf8(&bytes) {
            self.line.push_str(s);
            edit.echo.extend_from_slice(&bytes);
        }
    }

    fn submit(&mut self, edit: &mut Edit) {
        self.utf8.clear();
        edit.echo.extend_from_slice(b"\r\n");
        edit.events.push(InputEvent::Line(std::mem::take(&mut self.line)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(edit: &Edit) -> Vec<&str> {
        edit.events
            .iter()
            .filter_map(|e| match e {
                InputEvent::Line(l) => Some(l.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn crlf_and_crnul_submit_once() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"ls\r\npwd\r\0whoami\n");
        assert_eq!(lines(&edit), vec!["ls", "pwd", "whoami"]);
    }

    #[test]
    fn cr_then_lf_in_next_read() {
        let mut ed = LineEditor::new();
        assert_eq!(lines(&ed.feed(b"a\r")), vec!["a"]);
        assert!(ed.feed(b"\n").events.is_empty());
    }

    #[test]
    fn backspace_erases_and_echoes() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"lx\x7fs");
        assert_eq!(edit.echo, b"lx\x08 \x08s");
        assert_eq!(ed.line(), "ls");
    }

    #[test]
    fn backspace_on_empty_line_is_silent() {
        let mut ed = LineEditor::new();
        assert!(ed.feed(b"\x08").echo.is_empty());
    }

    #[test]
    fn interrupt_clears_line() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"rm -rf\x03");
        assert_eq!(edit.events, vec![InputEvent::Interrupt]);
        assert_eq!(ed.line(), "");
        assert!(edit.echo.ends_with(b"^C\r\n"));
    }

    #[test]
    fn eot_stops_processing() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"\x04ls\r");
        assert_eq!(edit.events, vec![InputEvent::Eof]);
    }

    #[test]
    fn control_bytes_and_arrow_keys_are_dropped() {
        let mut ed = LineEditor::new();
        ed.feed(b"a\x01\x1b[Ab\x1bOB\x07");
        assert_eq!(ed.line(), "ab");
    }

    #[test]
    fn utf8_assembled_across_reads_and_erased_whole() {
        let mut ed = LineEditor::new();
        let bytes = "é".as_bytes();
        assert!(ed.feed(&bytes[..1]).echo.is_empty());
        assert_eq!(ed.feed(&bytes[1..]).echo, bytes);
        assert_eq!(ed.line(), "é");
        ed.feed(b"\x7f");
        assert_eq!(ed.line(), "");
    }

    #[test]
    fn lone_escape_does_not_eat_editing_keys() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"ls\x1b\r\n");
        assert_eq!(lines(&edit), vec!["ls"]);
        assert_eq!(edit.echo, b"ls\r\n");

        let edit = ed.feed(b"rm\x1b[\x03");
        assert_eq!(edit.events, vec![InputEvent::Interrupt]);

        ed.feed(b"ab\x1b\x7f");
        assert_eq!(ed.line(), "a");

        let edit = ed.feed(b"\x1b\x04");
        assert_eq!(edit.events, vec![InputEvent::Eof]);
    }

    #[test]
    fn escape_sequences_are_still_swallowed() {
        let mut ed = LineEditor::new();
        let edit = ed.feed(b"x\x1b[A\x1bOBy\x1bz\r");
        assert_eq!(lines(&edit), vec!["xy"]);
    }
}
