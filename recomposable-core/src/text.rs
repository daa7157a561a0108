//! Terminal text helpers
//!
//! Output from docker and from containers is full of escape sequences. The
//! tokenizer splits text into literal runs and escape sequences so callers can
//! strip, measure or truncate without ever cutting a sequence in half.

/// A piece of terminal text
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token<'a> {
    Literal(&'a str),
    Escape(&'a str),
}

/// Split `s` into literal runs and escape sequences (CSI, OSC and two-byte ESC forms)
pub fn tokenize(s: &str) -> Vec<Token<'_>> {
    let bytes = s.as_bytes();
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != 0x1b {
            i += 1;
            continue;
        }
        if literal_start < i {
            tokens.push(Token::Literal(&s[literal_start..i]));
        }
        let end = escape_end(bytes, i);
        tokens.push(Token::Escape(&s[i..end]));
        i = end;
        literal_start = end;
    }

    if literal_start < bytes.len() {
        tokens.push(Token::Literal(&s[literal_start..]));
    }
    tokens
}

/// Index one past the end of the escape sequence starting at `start`
fn escape_end(bytes: &[u8], start: usize) -> usize {
    let len = bytes.len();
    let Some(&kind) = bytes.get(start + 1) else {
        return len;
    };
    match kind {
        // CSI: parameters and intermediates, then a final byte in 0x40..=0x7e
        b'[' => {
            let mut j = start + 2;
            while j < len {
                if (0x40..=0x7e).contains(&bytes[j]) {
                    return j + 1;
                }
                j += 1;
            }
            len
        }
        // OSC: terminated by BEL or ST (ESC \)
        b']' => {
            let mut j = start + 2;
            while j < len {
                if bytes[j] == 0x07 {
                    return j + 1;
                }
                if bytes[j] == 0x1b && bytes.get(j + 1) == Some(&b'\\') {
                    return j + 2;
                }
                j += 1;
            }
            len
        }
        // Two-byte sequences; only consume ASCII so we stay on a char boundary
        b if b.is_ascii() => start + 2,
        _ => start + 1,
    }
}

/// Remove every escape sequence and stray control character (tabs become spaces)
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for token in tokenize(s) {
        if let Token::Literal(text) = token {
            for c in text.chars() {
                match c {
                    '\t' => out.push_str("    "),
                    c if c.is_control() => {}
                    c => out.push(c),
                }
            }
        }
    }
    out
}

/// Number of visible characters, ignoring escape sequences
pub fn visible_width(s: &str) -> usize {
    tokenize(s)
        .into_iter()
        .map(|t| match t {
            Token::Literal(text) => text.chars().count(),
            Token::Escape(_) => 0,
        })
        .sum()
}

/// Truncate to `max` visible characters, appending `…` when cut.
/// Escape sequences are kept intact.
pub fn truncate(s: &str, max: usize) -> String {
    if visible_width(s) <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let budget = max - 1;
    let mut used = 0;
    let mut out = String::with_capacity(s.len());
    for token in tokenize(s) {
        match token {
            Token::Escape(seq) => out.push_str(seq),
            Token::Literal(text) => {
                for c in text.chars() {
                    if used == budget {
                        break;
                    }
                    out.push(c);
                    used += 1;
                }
            }
        }
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed() {
        let s = "\x1b[31mred\x1b[0m plain";
        assert_eq!(
            tokenize(s),
            vec![
                Token::Escape("\x1b[31m"),
                Token::Literal("red"),
                Token::Escape("\x1b[0m"),
                Token::Literal(" plain"),
            ]
        );
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32m#5 DONE\x1b[0m 0.3s"), "#5 DONE 0.3s");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("a\tb"), "a    b");
        assert_eq!(strip_ansi("bell\x07"), "bell");
        assert_eq!(strip_ansi("naïve ✓"), "naïve ✓");
    }

    #[test]
    fn test_unterminated_escape_is_dropped() {
        assert_eq!(strip_ansi("ok\x1b[12"), "ok");
    }

    #[test]
    fn test_visible_width_and_truncate() {
        let s = "\x1b[32mhello world\x1b[0m";
        assert_eq!(visible_width(s), 11);
        assert_eq!(truncate(s, 20), s);
        assert_eq!(strip_ansi(&truncate(s, 6)), "hello…");
        assert_eq!(truncate("abc", 0), "");
    }
}
