use crate::index::schema::SchemaView;
use crate::query::escape::escape_value;
use crate::query::parser::QueryNode;

/// Render a [`QueryNode`] as a Lucene query string for the remote server.
///
/// Unqualified terms stay unqualified; the server's `df` points at the
/// composite text field that every default-searchable field is copied into.
pub fn to_query_string(node: &QueryNode, view: &SchemaView) -> String {
    match node {
        QueryNode::Term { field, text } => qualify(field.as_deref(), &escape_value(text)),
        QueryNode::Phrase { field, text } => qualify(field.as_deref(), &quote(text)),
        QueryNode::Range {
            field,
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
            raw,
        } => match field.as_deref() {
            Some(name) if view.is_numeric(name) => {
                let bound = |v: &Option<String>| {
                    v.as_deref()
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "*".to_string())
                };
                format!(
                    "{}:{}{} TO {}{}",
                    name,
                    if *lower_inclusive { '[' } else { '{' },
                    bound(lower),
                    bound(upper),
                    if *upper_inclusive { ']' } else { '}' },
                )
            }
            other => qualify(other, &quote(raw)),
        },
        QueryNode::And(children) => {
            let mut positives = Vec::new();
            let mut negatives = Vec::new();
            for child in children {
                match child {
                    QueryNode::Not(inner) => negatives.push(to_query_string(inner, view)),
                    other => positives.push(to_query_string(other, view)),
                }
            }
            if positives.is_empty() {
                positives.push("*:*".to_string());
            }
            let mut parts = positives;
            parts.extend(negatives.into_iter().map(|n| format!("NOT {}", n)));
            format!("({})", parts.join(" AND "))
        }
        QueryNode::Or(children) => {
            let parts: Vec<String> = children.iter().map(|c| to_query_string(c, view)).collect();
            format!("({})", parts.join(" OR "))
        }
        QueryNode::Not(inner) => format!("(*:* AND NOT {})", to_query_string(inner, view)),
    }
}

fn qualify(field: Option<&str>, value: &str) -> String {
    match field {
        Some(f) => format!("{}:{}", f, value),
        None => value.to_string(),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::QueryBuilder;

    fn render(q: &str) -> String {
        to_query_string(&QueryBuilder::parse(q).unwrap(), &SchemaView::static_only())
    }

    #[test]
    fn test_escapes_values_keeps_fields() {
        assert_eq!(render("folder/job c:something"), "(folder\\/job AND c:something)");
    }

    #[test]
    fn test_numeric_and_text_ranges() {
        assert_eq!(render("n:[1 TO *]"), "n:[1 TO *]");
        assert_eq!(render("starttime:{10 TO 20}"), "starttime:{10 TO 20}");
        assert_eq!(render("j:[a TO b]"), "j:\"[a TO b]\"");
    }

    #[test]
    fn test_negation() {
        assert_eq!(render("NOT echo"), "(*:* AND NOT echo)");
        assert_eq!(render("echo -cat"), "(echo AND NOT cat)");
    }

    #[test]
    fn test_phrase_and_or() {
        assert_eq!(
            render("c:\"build failed\" OR r:unstable"),
            "(c:\"build failed\" OR r:unstable)"
        );
    }
}
