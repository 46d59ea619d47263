//! Per-token escaping of raw user queries.
//!
//! Users type things like `folder/job c:something`; the path separator is
//! reserved in the query grammar, so every unquoted value is escaped before
//! parsing. Field prefixes, boolean keywords, quoted phrases, range
//! expressions and grouping parentheses pass through untouched.

const SPECIAL: &[char] = &[
    '\\', '+', '-', '!', '(', ')', ':', '^', '[', ']', '"', '{', '}', '~', '*', '?', '|', '&',
    '/',
];

const KEYWORDS: &[&str] = &["AND", "OR", "NOT", "&&", "||"];

/// Escape every reserved character of a bare value. Existing `\x` escapes are
/// kept as they are.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push_str("\\\\"),
            }
        } else {
            if SPECIAL.contains(&c) {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Escape a whole query, token by token.
pub fn escape_query(raw: &str) -> String {
    split_tokens(raw)
        .iter()
        .map(|t| escape_token(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split on whitespace, keeping quoted phrases and bracketed ranges whole.
pub fn split_tokens(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut range_close: Option<char> = None;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
            continue;
        }
        if in_quote {
            current.push(c);
            if c == '"' {
                in_quote = false;
            }
            continue;
        }
        if let Some(close) = range_close {
            current.push(c);
            if c == close {
                range_close = None;
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                current.push(c);
            }
            '[' | '{' if is_range_start(&current) => {
                range_close = Some(if c == '[' { ']' } else { '}' });
                current.push(c);
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A range may open a token or follow a field prefix.
fn is_range_start(current: &str) -> bool {
    let body = current.trim_start_matches(['(', '+', '-', '!']);
    body.is_empty() || field_prefix_len(body) == Some(body.len())
}

fn escape_token(token: &str) -> String {
    if KEYWORDS.contains(&token) {
        return token.to_string();
    }

    let open = token.len() - token.trim_start_matches('(').len();
    let (open_parens, rest) = token.split_at(open);

    let (prefix, rest) = match rest.chars().next() {
        Some(c @ ('+' | '-' | '!')) if rest.len() > 1 => rest.split_at(c.len_utf8()),
        _ => ("", rest),
    };

    let (body, close_parens) = split_closing(rest);

    let escaped = match field_prefix_len(body) {
        Some(n) => {
            let (field, value) = body.split_at(n);
            format!("{}{}", field, escape_field_value(value))
        }
        None => escape_field_value(body),
    };

    format!("{}{}{}{}", open_parens, prefix, escaped, close_parens)
}

fn escape_field_value(value: &str) -> String {
    if is_quoted(value) || is_range(value) {
        value.to_string()
    } else {
        escape_value(value)
    }
}

/// Trailing `)` are grouping unless they close a quote or range.
fn split_closing(rest: &str) -> (&str, &str) {
    if is_quoted(rest) || is_range(rest) {
        return (rest, "");
    }
    let trimmed = rest.trim_end_matches(')');
    let mut body_len = trimmed.len();
    // an escaped `\)` belongs to the value
    if trimmed.ends_with('\\') && body_len < rest.len() {
        body_len += 1;
    }
    rest.split_at(body_len)
}

/// Length of a leading `field:` prefix, colon included.
pub(crate) fn field_prefix_len(s: &str) -> Option<usize> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return None,
    }
    for (i, c) in chars {
        if c == ':' {
            return Some(i + 1);
        }
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
            return None;
        }
    }
    None
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('"') && s.ends_with('"')
}

fn is_range(s: &str) -> bool {
    (s.starts_with('[') || s.starts_with('{'))
        && (s.ends_with(']') || s.ends_with('}'))
        && s.contains(" TO ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_path_separator_but_keeps_field_prefix() {
        assert_eq!(escape_query("folder/job c:job"), "folder\\/job c:job");
        assert_eq!(
            escape_query("j:folder/job AND c:something"),
            "j:folder\\/job AND c:something"
        );
        assert_eq!(escape_query("folder/job c:some/thing"), "folder\\/job c:some\\/thing");
    }

    #[test]
    fn test_quoted_phrase_passes_verbatim() {
        assert_eq!(escape_query("\"a/b c\" d/e"), "\"a/b c\" d\\/e");
        assert_eq!(escape_query("c:\"x/y z\""), "c:\"x/y z\"");
    }

    #[test]
    fn test_range_passes_verbatim() {
        assert_eq!(escape_query("n:[1 TO 5] echo"), "n:[1 TO 5] echo");
        assert_eq!(escape_query("starttime:{* TO 100}"), "starttime:{* TO 100}");
    }

    #[test]
    fn test_grouping_and_prefix_operators() {
        assert_eq!(escape_query("(a/b OR c)"), "(a\\/b OR c)");
        assert_eq!(escape_query("-j:x/y +echo"), "-j:x\\/y +echo");
    }

    #[test]
    fn test_wildcard_and_fuzzy_characters_are_literal() {
        assert_eq!(escape_query("build*"), "build\\*");
        assert_eq!(escape_query("c:te?t~2^3"), "c:te\\?t\\~2\\^3");
    }

    #[test]
    fn test_existing_escapes_not_doubled() {
        assert_eq!(escape_value("a\\/b"), "a\\/b");
        assert_eq!(escape_value("trailing\\"), "trailing\\\\");
    }

    #[test]
    fn test_lowercase_keywords_are_values() {
        assert_eq!(escape_query("this and that"), "this and that");
        assert_eq!(escape_query("a && b"), "a && b");
    }

    #[test]
    fn test_colon_handling() {
        assert_eq!(escape_query("http://host"), "http:\\/\\/host");
        assert_eq!(escape_query("12:30"), "12\\:30");
    }

    #[test]
    fn test_split_tokens_keeps_phrases_and_ranges() {
        assert_eq!(
            split_tokens("  c:\"hello  world\" n:[1 TO 2]  x "),
            vec!["c:\"hello  world\"", "n:[1 TO 2]", "x"]
        );
    }
}
