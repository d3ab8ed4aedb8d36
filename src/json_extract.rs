//! Recover a JSON object from noisy model output.
//!
//! Models wrap JSON in markdown fences, lead with prose ("Here's my
//! assessment:"), or trail commentary. Every provider response goes through
//! [`extract_json_object`] before parsing.

/// Return the first balanced `{...}` object in `raw`, or `None`.
///
/// String literals are respected, so braces inside `"..."` (and escaped quotes)
/// never affect nesting depth. Markdown fences are stripped first; if a fenced
/// block exists its content wins over any braces in surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if let Some(fenced) = fenced_block(trimmed) {
        if let Some(obj) = first_balanced_object(fenced) {
            return Some(obj);
        }
    }
    first_balanced_object(trimmed)
}

/// Parse the first JSON object found in `raw` into a `serde_json::Value`.
///
/// Scans forward past candidate objects that fail to parse (e.g. `{placeholder}`
/// prose before the real payload).
pub fn parse_json_object(raw: &str) -> Option<serde_json::Value> {
    let candidate = extract_json_object(raw)?;
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(candidate) {
        return Some(value);
    }

    let mut rest = raw;
    while let Some(start) = rest.find('{') {
        rest = &rest[start..];
        if let Some(obj) = first_balanced_object(rest) {
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(obj) {
                return Some(value);
            }
        }
        rest = &rest[1..];
    }
    None
}

/// Content of the first ``` fenced block (language tag dropped).
fn fenced_block(s: &str) -> Option<&str> {
    let open = s.find("```")?;
    let after_open = &s[open + 3..];
    let body_start = match after_open.find('\n') {
        Some(i) if !after_open[..i].contains('{') => i + 1,
        _ => 0,
    };
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn first_balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let remainder = &s[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
