//! Best-effort repair of near-JSON emitted by agents.
//!
//! This is a single linear pass, not an alternate parser. It handles exactly
//! these defect classes:
//!
//! - unescaped `"` inside a string value: a quote is treated as closing only
//!   when the next non-whitespace character is `,` `}` `]` `:` or end of
//!   input; otherwise it is escaped;
//! - invalid backslash escapes (`\x` where `x` is not a JSON escape) become
//!   a literal backslash;
//! - raw control characters inside strings (newline, CR, tab, others as
//!   `\u00XX`);
//! - trailing commas before `}` or `]`.
//!
//! A quote immediately followed by one of the closing characters inside a
//! value (e.g. `"say "hi", then"`) is indistinguishable from a real string end
//! and is left as is.

/// Rewrite `input` fixing the defect classes listed in the module docs.
pub fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                ',' if next_significant(&chars, i + 1).is_some_and(|n| n == '}' || n == ']') => {}
                _ => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => match chars.get(i + 1) {
                Some(&next) if is_json_escape(next) => {
                    out.push('\\');
                    out.push(next);
                    i += 2;
                    continue;
                }
                _ => out.push_str("\\\\"),
            },
            '"' => {
                if closes_string(&chars, i + 1) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
        i += 1;
    }

    out
}

fn is_json_escape(c: char) -> bool {
    matches!(c, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u')
}

fn closes_string(chars: &[char], from: usize) -> bool {
    match next_significant(chars, from) {
        None => true,
        Some(c) => matches!(c, ',' | '}' | ']' | ':'),
    }
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parses(text: &str) -> Value {
        serde_json::from_str(text).expect("repaired text should parse")
    }

    #[test]
    fn escapes_stray_quotes_inside_values() {
        let broken = r#"{"evidence": "calls "unsafe" code", "id": 1}"#;
        assert!(serde_json::from_str::<Value>(broken).is_err());
        let value = parses(&repair_json(broken));
        assert_eq!(value["evidence"], "calls \"unsafe\" code");
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn escapes_invalid_backslashes() {
        let broken = r#"{"path": "C:\Users\dev\src"}"#;
        let value = parses(&repair_json(broken));
        assert_eq!(value["path"], r"C:\Users\dev\src");
    }

    #[test]
    fn keeps_valid_escapes_intact() {
        let valid = r#"{"text": "line\nnext \"quoted\" \u00e9"}"#;
        assert_eq!(repair_json(valid), valid);
    }

    #[test]
    fn escapes_raw_newlines_and_tabs() {
        let broken = "{\"body\": \"first\n\tsecond\"}";
        let value = parses(&repair_json(broken));
        assert_eq!(value["body"], "first\n\tsecond");
    }

    #[test]
    fn drops_trailing_commas() {
        let broken = "{\"fixes\": [1, 2, ], \"skipped\": [],\n}";
        let value = parses(&repair_json(broken));
        assert_eq!(value["fixes"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn commas_inside_strings_are_untouched() {
        let valid = r#"{"reason": "a, }b"}"#;
        assert_eq!(repair_json(valid), valid);
    }
}
