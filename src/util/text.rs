use std::borrow::Cow;

/// Strips control characters and ANSI escape sequences from upstream text.
///
/// Feed titles and descriptions flow into chat messages and log lines, so
/// anything that could drive a terminal or break message formatting goes:
///
/// - C0 controls except tab, newline and carriage return, plus DEL
/// - CSI sequences (`ESC [` ... final byte 0x40-0x7E)
/// - OSC sequences (`ESC ]` ... BEL or `ESC \`)
/// - any other bare ESC
///
/// Returns `Cow::Borrowed` when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            c if is_stripped_control(c) => {}
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}

fn is_stripped_control(c: char) -> bool {
    c == '\x1b' || c == '\x7f' || (c < '\x20' && !matches!(c, '\t' | '\n' | '\r'))
}

/// Truncates to at most `max_chars` characters, ending with `…` when cut.
///
/// Chat platforms count message limits in characters, not bytes.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }
    if max_chars == 0 {
        return Cow::Owned(String::new());
    }

    let mut out: String = s.chars().take(max_chars - 1).collect();
    out.push('…');
    Cow::Owned(out)
}
