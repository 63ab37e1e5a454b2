//! Tolerant parsing for "return only JSON" model responses.
//!
//! Models wrap JSON in code fences, add prose around it, leave trailing
//! commas, and drop raw newlines or unescaped quotes into string values.
//! Strict parsing is always tried first; the repair pass only runs on failure,
//! so well-formed output is never rewritten.

use serde::de::DeserializeOwned;

/// Cut a response down to the JSON object it (hopefully) contains:
/// strip a markdown code fence if present, then slice to the outermost
/// `{...}` span.
pub fn extract_json_block(raw: &str) -> &str {
    let mut s = raw.trim();

    if let Some(start) = s.find("```") {
        let after = &s[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            s = &after[..end];
        } else {
            s = after;
        }
    }

    match (s.find('{'), s.rfind('}')) {
        (Some(open), Some(close)) if close > open => &s[open..=close],
        _ => s.trim(),
    }
}

/// Best-effort repair of almost-JSON. Three fixes, all inside one pass:
/// unescaped quotes inside string values get escaped (a quote only counts as
/// a terminator when the next non-whitespace char is `,` `:` `}` or `]`),
/// raw newlines inside strings collapse to spaces, and trailing commas
/// before a closing bracket are dropped.
pub fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => {
                    out.push(c);
                    if i + 1 < chars.len() {
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                }
                '"' => {
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    let terminates = match chars.get(j) {
                        None => true,
                        Some(&next) => matches!(next, ',' | ':' | '}' | ']'),
                    };
                    if terminates {
                        in_string = false;
                        out.push('"');
                    } else {
                        out.push('\\');
                        out.push('"');
                    }
                }
                '\r' => {
                    // \r\n counts as one newline
                    if chars.get(i + 1) != Some(&'\n') {
                        out.push(' ');
                    }
                }
                '\n' => out.push(' '),
                _ => out.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                ',' => {
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    if !matches!(chars.get(j), Some(&'}') | Some(&']')) {
                        out.push(',');
                    }
                }
                _ => out.push(c),
            }
        }
        i += 1;
    }

    out
}

/// Strict parse of the extracted block, falling back to parsing the repaired
/// text. The error from the repaired attempt is the one reported.
pub fn parse_with_repair<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let block = extract_json_block(raw);
    match serde_json::from_str(block) {
        Ok(value) => Ok(value),
        Err(_) => {
            let repaired = repair_json(block);
            serde_json::from_str(&repaired)
        }
    }
}
