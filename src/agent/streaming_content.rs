//! Live preview of a `content` string inside tool-call arguments that are still streaming.

const KEY: &str = "\"content\"";

/// Returns the decoded value of the first `"content"` key in a possibly
/// truncated JSON text, as far as it has arrived.
///
/// `None` until the key, its colon and the value's opening quote are all
/// present. Escapes decode once complete; a partial trailing escape is held
/// back. The first occurrence wins even when it sits in a nested object, so
/// this is a preview heuristic, not a JSON-path lookup.
pub fn extract_streaming_content(partial: &str) -> Option<String> {
    let key_at = partial.find(KEY)?;
    let rest = partial[key_at + KEY.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let body = rest.strip_prefix('"')?;

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => {
                let Some(esc) = chars.next() else { break };
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{0008}'),
                    'f' => out.push('\u{000C}'),
                    'u' => {
                        let hex: String = chars.by_ref().take(4).collect();
                        if hex.chars().count() < 4 {
                            break;
                        }
                        match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                            Some(decoded) => out.push(decoded),
                            None => out.push(char::REPLACEMENT_CHARACTER),
                        }
                    }
                    other => out.push(other),
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}
