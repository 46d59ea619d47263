//! Query grammar using nom combinators.
//!
//! Lucene-style syntax:
//! - Terms and phrases: `echo`, `"build failed"`
//! - Field qualifiers: `c:echo`, `j:(app OR lib)`, `n:[1 TO 10]`, `starttime:{* TO 500}`
//! - Logical: `AND`, `OR`, `NOT`, `&&`, `||`, leading `+`/`-`/`!`
//! - Whitespace between clauses is an implicit AND
//!
//! Keywords are uppercase only; `and` is an ordinary term. A backslash escapes
//! the next character.

use crate::error::{BuildSearchError, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, multispace1, one_of, satisfy},
    combinator::{cut, map, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// `field = None` fans out over the default-searchable fields.
    Term { field: Option<String>, text: String },
    Phrase { field: Option<String>, text: String },
    Range {
        field: Option<String>,
        lower: Option<String>,
        upper: Option<String>,
        lower_inclusive: bool,
        upper_inclusive: bool,
        /// The bracketed expression as written, used when the field is not numeric.
        raw: String,
    },
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

impl QueryNode {
    pub fn term(field: Option<&str>, text: &str) -> Self {
        QueryNode::Term {
            field: field.map(str::to_string),
            text: text.to_string(),
        }
    }

    /// Qualify every unqualified leaf with `name`.
    pub fn with_field(self, name: &str) -> Self {
        match self {
            QueryNode::Term { field: None, text } => QueryNode::Term {
                field: Some(name.to_string()),
                text,
            },
            QueryNode::Phrase { field: None, text } => QueryNode::Phrase {
                field: Some(name.to_string()),
                text,
            },
            QueryNode::Range {
                field: None,
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
                raw,
            } => QueryNode::Range {
                field: Some(name.to_string()),
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
                raw,
            },
            QueryNode::And(children) => {
                QueryNode::And(children.into_iter().map(|c| c.with_field(name)).collect())
            }
            QueryNode::Or(children) => {
                QueryNode::Or(children.into_iter().map(|c| c.with_field(name)).collect())
            }
            QueryNode::Not(inner) => QueryNode::Not(Box::new(inner.with_field(name))),
            other => other,
        }
    }

    /// Text of every non-negated term or phrase that targets `field` or fans out.
    pub fn positive_texts(&self, field: &str) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_positive(field, &mut out);
        out
    }

    fn collect_positive<'a>(&'a self, target: &str, out: &mut Vec<&'a str>) {
        match self {
            QueryNode::Term { field, text } | QueryNode::Phrase { field, text } => {
                if field.as_deref().map_or(true, |f| f == target) {
                    out.push(text);
                }
            }
            QueryNode::And(children) | QueryNode::Or(children) => {
                for c in children {
                    c.collect_positive(target, out);
                }
            }
            QueryNode::Range { .. } | QueryNode::Not(_) => {}
        }
    }
}

/// Parse an (already escaped) query string.
pub fn parse_query(input: &str) -> Result<QueryNode> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BuildSearchError::InvalidQuery("empty query".to_string()));
    }
    match or_expr(trimmed) {
        Ok(("", node)) => Ok(node),
        Ok((remaining, _)) => Err(BuildSearchError::InvalidQuery(format!(
            "Unexpected input after query: '{}'",
            remaining
        ))),
        Err(e) => Err(BuildSearchError::InvalidQuery(format!("Parse error: {}", e))),
    }
}

fn or_expr(input: &str) -> IResult<&str, QueryNode> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, alt((keyword("OR"), tag("||"))), multispace0),
        cut(and_expr),
    ))(input)?;

    if rest.is_empty() {
        Ok((input, first))
    } else {
        let mut nodes = vec![first];
        nodes.extend(rest);
        Ok((input, QueryNode::Or(nodes)))
    }
}

fn and_expr(input: &str) -> IResult<&str, QueryNode> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(alt((
        preceded(
            delimited(multispace0, alt((keyword("AND"), tag("&&"))), multispace0),
            cut(unary),
        ),
        preceded(multispace1, unary),
    )))(input)?;

    if rest.is_empty() {
        Ok((input, first))
    } else {
        let mut nodes = vec![first];
        nodes.extend(rest);
        Ok((input, QueryNode::And(nodes)))
    }
}

fn keyword<'a>(kw: &'static str) -> impl Fn(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (remaining, matched) = tag(kw)(input)?;

        if remaining
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace() && c != '(' && c != ')')
        {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }

        Ok((remaining, matched))
    }
}

fn unary(input: &str) -> IResult<&str, QueryNode> {
    alt((
        map(
            preceded(pair(keyword("NOT"), multispace1), cut(unary)),
            |n| QueryNode::Not(Box::new(n)),
        ),
        map(preceded(one_of("-!"), primary), |n| QueryNode::Not(Box::new(n))),
        preceded(char('+'), primary),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, QueryNode> {
    alt((
        group,
        field_clause,
        map(phrase, |text| QueryNode::Phrase { field: None, text }),
        range,
        map(word, |text| QueryNode::Term { field: None, text }),
    ))(input)
}

fn group(input: &str) -> IResult<&str, QueryNode> {
    delimited(
        pair(char('('), multispace0),
        cut(or_expr),
        cut(pair(multispace0, char(')'))),
    )(input)
}

fn field_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'),
    ))(input)
}

fn field_clause(input: &str) -> IResult<&str, QueryNode> {
    let (input, name) = terminated(field_name, char(':'))(input)?;
    let (input, node) = cut(alt((
        group,
        map(phrase, |text| QueryNode::Phrase { field: None, text }),
        range,
        map(word, |text| QueryNode::Term { field: None, text }),
    )))(input)?;
    Ok((input, node.with_field(name)))
}

fn phrase(input: &str) -> IResult<&str, String> {
    let (rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, next)) = chars.next() {
                    out.push(next);
                }
            }
            '"' => return Ok((&rest[i + 1..], out)),
            _ => out.push(c),
        }
    }
    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn range_bound(input: &str) -> IResult<&str, Option<String>> {
    map(
        take_while1(|c: char| !c.is_whitespace() && c != ']' && c != '}'),
        |s: &str| {
            if s == "*" {
                None
            } else {
                Some(s.replace('\\', ""))
            }
        },
    )(input)
}

fn range(input: &str) -> IResult<&str, QueryNode> {
    let start = input;
    let (input, open) = one_of("[{")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, lower) = range_bound(input)?;
    let (input, _) = delimited(multispace1, tag("TO"), multispace1)(input)?;
    let (input, upper) = cut(range_bound)(input)?;
    let (input, _) = multispace0(input)?;
    let (input, close) = cut(one_of("]}"))(input)?;
    let raw = &start[..start.len() - input.len()];
    Ok((
        input,
        QueryNode::Range {
            field: None,
            lower,
            upper,
            lower_inclusive: open == '[',
            upper_inclusive: close == ']',
            raw: raw.to_string(),
        },
    ))
}

const WORD_STOP: &[char] = &['(', ')', '"', ':', '[', ']', '{', '}'];

fn word(input: &str) -> IResult<&str, String> {
    let mut out = String::new();
    let mut consumed = 0;
    let mut escaped_any = false;
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            escaped_any = true;
            match chars.next() {
                Some((j, next)) => {
                    out.push(next);
                    consumed = j + next.len_utf8();
                }
                None => consumed = i + 1,
            }
            continue;
        }
        if c.is_whitespace() || WORD_STOP.contains(&c) {
            break;
        }
        out.push(c);
        consumed = i + c.len_utf8();
    }

    let is_keyword = matches!(out.as_str(), "AND" | "OR" | "NOT" | "&&" | "||");
    if consumed == 0 || (is_keyword && !escaped_any) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alpha,
        )));
    }
    Ok((&input[consumed..], out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(field: Option<&str>, text: &str) -> QueryNode {
        QueryNode::term(field, text)
    }

    #[test]
    fn test_single_term() {
        assert_eq!(parse_query("echo").unwrap(), t(None, "echo"));
    }

    #[test]
    fn test_implicit_and() {
        assert_eq!(
            parse_query("echo  cat").unwrap(),
            QueryNode::And(vec![t(None, "echo"), t(None, "cat")])
        );
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        assert_eq!(
            parse_query("a OR b AND c").unwrap(),
            QueryNode::Or(vec![
                t(None, "a"),
                QueryNode::And(vec![t(None, "b"), t(None, "c")])
            ])
        );
        assert_eq!(
            parse_query("a || b").unwrap(),
            QueryNode::Or(vec![t(None, "a"), t(None, "b")])
        );
    }

    #[test]
    fn test_lowercase_keywords_are_terms() {
        assert_eq!(
            parse_query("this and that").unwrap(),
            QueryNode::And(vec![t(None, "this"), t(None, "and"), t(None, "that")])
        );
    }

    #[test]
    fn test_field_term_and_escapes() {
        assert_eq!(parse_query("c:echo").unwrap(), t(Some("c"), "echo"));
        assert_eq!(
            parse_query("j:folder\\/job").unwrap(),
            t(Some("j"), "folder/job")
        );
        assert_eq!(parse_query("12\\:30").unwrap(), t(None, "12:30"));
    }

    #[test]
    fn test_field_group() {
        assert_eq!(
            parse_query("j:(app OR lib)").unwrap(),
            QueryNode::Or(vec![t(Some("j"), "app"), t(Some("j"), "lib")])
        );
    }

    #[test]
    fn test_phrase() {
        assert_eq!(
            parse_query("c:\"build failed\"").unwrap(),
            QueryNode::Phrase {
                field: Some("c".into()),
                text: "build failed".into()
            }
        );
        assert!(parse_query("\"unterminated").is_err());
    }

    #[test]
    fn test_range() {
        assert_eq!(
            parse_query("n:[1 TO *}").unwrap(),
            QueryNode::Range {
                field: Some("n".into()),
                lower: Some("1".into()),
                upper: None,
                lower_inclusive: true,
                upper_inclusive: false,
                raw: "[1 TO *}".into(),
            }
        );
    }

    #[test]
    fn test_negation_forms() {
        let expected = QueryNode::And(vec![
            t(None, "a"),
            QueryNode::Not(Box::new(t(None, "b"))),
        ]);
        assert_eq!(parse_query("a NOT b").unwrap(), expected);
        assert_eq!(parse_query("a -b").unwrap(), expected);
        assert_eq!(parse_query("a AND !b").unwrap(), expected);
        assert_eq!(parse_query("+a -b").unwrap(), expected);
    }

    #[test]
    fn test_malformed() {
        assert!(parse_query("").is_err());
        assert!(parse_query("   ").is_err());
        assert!(parse_query("a AND").is_err());
        assert!(parse_query("(a OR b").is_err());
        assert!(parse_query("a)").is_err());
    }

    #[test]
    fn test_positive_texts() {
        let node = parse_query("echo j:app c:\"x y\" NOT c:secret n:[1 TO 2]").unwrap();
        assert_eq!(node.positive_texts("c"), vec!["echo", "x y"]);
    }
}
