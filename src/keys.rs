//! Named keys and their terminal encodings.

/// Start and end markers for bracketed paste mode.
pub const PASTE_START: &str = "\x1b[200~";
pub const PASTE_END: &str = "\x1b[201~";

/// Byte sequence a terminal sends for a named key.
///
/// Names are case-insensitive. `ctrl-<letter>` (or `c-<letter>`) maps to
/// the corresponding control character. A single character that is not a
/// known name is sent as itself.
pub fn encode(name: &str) -> Option<String> {
    let lower = name.trim().to_ascii_lowercase();
    let seq = match lower.as_str() {
        "enter" | "return" | "cr" => "\r",
        "newline" | "lf" => "\n",
        "tab" => "\t",
        "shift-tab" | "backtab" => "\x1b[Z",
        "esc" | "escape" => "\x1b",
        "space" => " ",
        "backspace" | "bs" => "\x7f",
        "delete" | "del" => "\x1b[3~",
        "up" => "\x1b[A",
        "down" => "\x1b[B",
        "right" => "\x1b[C",
        "left" => "\x1b[D",
        "home" => "\x1b[H",
        "end" => "\x1b[F",
        "pageup" | "pgup" => "\x1b[5~",
        "pagedown" | "pgdn" => "\x1b[6~",
        _ => return encode_ctrl(&lower).or_else(|| single_char(name)),
    };
    Some(seq.to_string())
}

/// Encode a whole key sequence, failing on the first unknown name.
pub fn encode_all<S: AsRef<str>>(names: &[S]) -> crate::Result<String> {
    let mut out = String::new();
    for name in names {
        let name = name.as_ref();
        let seq = encode(name)
            .ok_or_else(|| crate::Error::Config(format!("Unknown key name: {}", name)))?;
        out.push_str(&seq);
    }
    Ok(out)
}

/// Wrap text in bracketed paste markers.
pub fn bracketed_paste(text: &str) -> String {
    format!("{}{}{}", PASTE_START, text, PASTE_END)
}

fn encode_ctrl(lower: &str) -> Option<String> {
    let letter = lower
        .strip_prefix("ctrl-")
        .or_else(|| lower.strip_prefix("ctrl+"))
        .or_else(|| lower.strip_prefix("c-"))?;
    let mut chars = letter.chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_lowercase() {
        return None;
    }
    Some(((c as u8 - b'a' + 1) as char).to_string())
}

fn single_char(name: &str) -> Option<String> {
    let mut chars = name.chars();
    let c = chars.next()?;
    chars.next().is_none().then(|| c.to_string())
}
