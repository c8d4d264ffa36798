//! Model text → transport bytes.
//!
//! Models write escapes as the four characters `\x1b`; this translator
//! turns every `\xNN` into the byte `NN` and bare `\n` into `\r\n`.
//! Input may be split anywhere, so a trailing `\`, `\x` or `\xN` is held
//! back until the next chunk or [`OutputTranslator::flush`].

#[derive(Debug, Default)]
pub struct OutputTranslator {
    pending: String,
    last_cr: bool,
}

impl OutputTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> Vec<u8> {
        self.pending.push_str(text);
        let hold = held_suffix_len(&self.pending);
        let ready_len = self.pending.len() - hold;
        let ready: String = self.pending.drain(..ready_len).collect();
        self.translate(&ready)
    }

    /// Emit anything held back, untranslated.
    pub fn flush(&mut self) -> Vec<u8> {
        let rest = std::mem::take(&mut self.pending);
        self.translate(&rest)
    }

    fn translate(&mut self, text: &str) -> Vec<u8> {
        let bytes = text.as_bytes();
        let mut out = Vec::with_capacity(bytes.len() + 8);
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\\' && bytes.get(i + 1) == Some(&b'x') {
                if let Some(v) = hex_pair(bytes.get(i + 2..i + 4)) {
                    out.push(v);
                    self.last_cr = v == b'\r';
                    i += 4;
                    continue;
                }
            }
            if b == b'\n' && !self.last_cr {
                out.push(b'\r');
            }
            out.push(b);
            self.last_cr = b == b'\r';
            i += 1;
        }
        out
    }
}

fn hex_pair(digits: Option<&[u8]>) -> Option<u8> {
    let digits = std::str::from_utf8(digits?).ok()?;
    if !digits.bytes().all(|d| d.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

/// Length of a suffix that could still become a `\xNN` token.
fn held_suffix_len(s: &str) -> usize {
    let b = s.as_bytes();
    let n = b.len();
    if n >= 3 && b[n - 3] == b'\\' && b[n - 2] == b'x' && b[n - 1].is_ascii_hexdigit() {
        3
    } else if n >= 2 && b[n - 2] == b'\\' && b[n - 1] == b'x' {
        2
    } else if n >= 1 && b[n - 1] == b'\\' {
        1
    } else {
        0
    }
}
