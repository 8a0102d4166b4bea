//! Splitting long text into parts that fit the chat message limit.

/// Split `text` into parts of at most `limit` characters.
///
/// Parts break on line boundaries where possible; a single line longer than
/// `limit` is cut mid-line. Joining the parts with `\n` at line-boundary
/// breaks and with nothing at mid-line cuts gives back the input.
pub fn split_content(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    // (text, char count) of the part being filled.
    let mut current: Option<(String, usize)> = None;

    for line in text.split('\n') {
        let line_len = line.chars().count();

        if line_len > limit {
            if let Some((part, _)) = current.take() {
                parts.push(part);
            }
            let chars: Vec<char> = line.chars().collect();
            parts.extend(chars.chunks(limit).map(|chunk| chunk.iter().collect::<String>()));
            continue;
        }

        current = match current.take() {
            None => Some((line.to_string(), line_len)),
            Some((part, len)) if len + 1 + line_len > limit => {
                parts.push(part);
                Some((line.to_string(), line_len))
            }
            Some((mut part, len)) => {
                part.push('\n');
                part.push_str(line);
                Some((part, len + 1 + line_len))
            }
        };
    }

    if let Some((part, _)) = current {
        parts.push(part);
    }
    parts
}
