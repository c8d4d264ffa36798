//! ANSI escape constants and width helpers.

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const ITALIC: &str = "\x1b[3m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const BRIGHT_GREEN: &str = "\x1b[92m";
pub const BRIGHT_BLUE: &str = "\x1b[94m";
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Strip CSI escape sequences, returning only visible text.
pub fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\x1b' {
            result.push(ch);
            continue;
        }
        if let Some(&'[') = chars.peek() {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        }
    }
    result
}

/// Visible column width, ignoring escapes and counting wide characters.
pub fn visible_width(s: &str) -> usize {
    use unicode_width::UnicodeWidthStr;
    UnicodeWidthStr::width(strip_ansi(s).as_str())
}

/// Left-align `s` in `width` visible columns.
pub fn pad_end(s: &str, width: usize) -> String {
    let pad = width.saturating_sub(visible_width(s));
    format!("{s}{}", " ".repeat(pad))
}

/// Right-align `s` in `width` visible columns.
pub fn pad_start(s: &str, width: usize) -> String {
    let pad = width.saturating_sub(visible_width(s));
    format!("{}{s}", " ".repeat(pad))
}

/// Center `s` in `width` columns, extra space going to the right.
pub fn center(s: &str, width: usize) -> String {
    let pad = width.saturating_sub(visible_width(s));
    let left = pad / 2;
    format!("{}{s}{}", " ".repeat(left), " ".repeat(pad - left))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_csi() {
        assert_eq!(strip_ansi("\x1b[1m\x1b[94metc/\x1b[0m"), "etc/");
    }

    #[test]
    fn padding_ignores_escapes() {
        assert_eq!(pad_end("\x1b[32mok\x1b[0m", 4), "\x1b[32mok\x1b[0m  ");
        assert_eq!(pad_start("7", 3), "  7");
        assert_eq!(center("ab", 5), " ab  ");
    }

    #[test]
    fn wide_characters_take_two_columns() {
        assert_eq!(visible_width("日本"), 4);
    }
}
