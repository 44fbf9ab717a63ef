//! Terminal control-sequence stripping.
//!
//! Agent TUIs paint their screens with colors, cursor motion and window
//! title updates. Classification works on plain text, so every chunk is
//! normalized here before it reaches an adapter.

/// Strip escape sequences and control characters from terminal output.
///
/// - CSI (`ESC [` … final byte, or bare `0x9B`) is removed; cursor-forward
///   (`CSI n C`) becomes a single space since TUIs use it in place of spaces
/// - OSC (`ESC ]` … BEL or ST) and DCS/PM/APC (`ESC P|^|_` … ST) are removed
/// - other two-byte escapes (`ESC 7`, `ESC M`, …) are removed
/// - `\r`, BEL, backspace and remaining C0 controls are dropped; `\n` and
///   `\t` are kept
pub fn strip(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => skip_csi(&mut chars, &mut out),
                Some(']') => skip_string(&mut chars, true),
                Some('P') | Some('^') | Some('_') | Some('X') => skip_string(&mut chars, false),
                // Charset designation takes one more byte: ESC ( B
                Some('(') | Some(')') | Some('*') | Some('+') => {
                    chars.next();
                }
                Some(_) | None => {}
            },
            '\u{9b}' => skip_csi(&mut chars, &mut out),
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

/// Strip a chunk and report whether anything other than whitespace survived.
pub fn has_visible_text(input: &str) -> bool {
    strip(input).chars().any(|c| !c.is_whitespace())
}

/// Longest escape sequence held back waiting for the rest of it.
const MAX_PENDING_ESCAPE: usize = 256;

/// Incremental stripper that holds back an escape sequence split across
/// PTY reads so its tail does not leak into the text of the next chunk.
#[derive(Debug, Default)]
pub struct Normalizer {
    pending: String,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip `chunk`, prefixed by whatever was held back last time.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        if let Some(start) = incomplete_escape_start(&text) {
            if text.len() - start <= MAX_PENDING_ESCAPE {
                self.pending = text.split_off(start);
            }
        }
        strip(&text)
    }
}

/// Byte offset of a trailing escape sequence that has not been terminated yet.
fn incomplete_escape_start(text: &str) -> Option<usize> {
    let start = text.rfind('\x1b')?;
    let rest = &text[start + 1..];
    let mut chars = rest.chars();
    let complete = match chars.next() {
        None => false,
        Some('[') => chars.any(|c| ('\x40'..='\x7e').contains(&c)),
        Some(']') => rest.contains('\x07') || rest.contains("\x1b\\"),
        Some('P') | Some('^') | Some('_') | Some('X') => rest.contains("\x1b\\"),
        Some('(') | Some(')') | Some('*') | Some('+') => chars.next().is_some(),
        Some(_) => true,
    };
    (!complete).then_some(start)
}

fn skip_csi<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>, out: &mut String) {
    // Parameter bytes 0x30-0x3F, intermediate bytes 0x20-0x2F, final byte 0x40-0x7E
    while let Some(&c) = chars.peek() {
        if ('\x20'..='\x3f').contains(&c) {
            chars.next();
        } else {
            break;
        }
    }
    if let Some(&c) = chars.peek() {
        if ('\x40'..='\x7e').contains(&c) {
            chars.next();
            if c == 'C' {
                out.push(' ');
            }
        }
    }
}

fn skip_string<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>, bel_terminates: bool) {
    while let Some(c) = chars.next() {
        if bel_terminates && c == '\x07' {
            return;
        }
        if c == '\x1b' && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}
