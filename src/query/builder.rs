use crate::error::Result;
use crate::index::schema;
use crate::query::escape::{escape_query, escape_value, field_prefix_len};
use crate::query::parser::{parse_query, QueryNode};

/// A parsed query plus the part of it whose terms get highlighted.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub query: QueryNode,
    pub highlight: QueryNode,
    /// Set when the two-token rewrite applied.
    pub job_filter: Option<QueryNode>,
}

impl BuiltQuery {
    /// Terms to mark in the console text.
    pub fn highlight_texts(&self) -> Vec<&str> {
        self.highlight.positive_texts(schema::CONSOLE)
    }
}

/// Turns raw user input into a [`QueryNode`].
///
/// Default operator is AND; unqualified terms fan out over the
/// default-searchable fields at compile time.
pub struct QueryBuilder;

impl QueryBuilder {
    /// Escape and parse `raw` as one query.
    pub fn parse(raw: &str) -> Result<QueryNode> {
        parse_query(&escape_query(raw))
    }

    /// Build `raw`, trying the two-token rewrite first.
    ///
    /// When `raw` is exactly two whitespace-separated parts and `job_exists`
    /// reports a match for the first part as a job-name filter, the result is
    /// `(job filter) AND (second part)` with only the second part highlighted.
    /// Otherwise the whole string is one query and highlighting covers all of it.
    pub fn build<F>(raw: &str, job_exists: F) -> Result<BuiltQuery>
    where
        F: FnOnce(&QueryNode) -> Result<bool>,
    {
        if let Some((job, rest)) = Self::two_token_split(raw) {
            let filter = parse_query(&format!("{}:{}", schema::PROJECT_NAME, escape_value(job)))?;
            let matches = match job_exists(&filter) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("Job filter lookup for '{}' failed: {}", job, e);
                    false
                }
            };
            if matches {
                let highlight = Self::parse(rest)?;
                tracing::debug!("Query '{}' rewritten as job '{}' + '{}'", raw, job, rest);
                return Ok(BuiltQuery {
                    query: QueryNode::And(vec![filter.clone(), highlight.clone()]),
                    highlight,
                    job_filter: Some(filter),
                });
            }
        }

        let query = Self::parse(raw)?;
        Ok(BuiltQuery {
            highlight: query.clone(),
            query,
            job_filter: None,
        })
    }

    /// Validation message for `raw`, `Ok(())` when it parses.
    pub fn validate(raw: &str) -> Result<()> {
        Self::parse(raw).map(|_| ())
    }

    fn two_token_split(raw: &str) -> Option<(&str, &str)> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        if parts.len() != 2 {
            return None;
        }
        let (first, second) = (parts[0], parts[1]);
        let plain = |p: &str| {
            !matches!(p, "AND" | "OR" | "NOT" | "&&" | "||")
                && !p.starts_with(['"', '(', '[', '{', '+', '-', '!'])
        };
        if !plain(first) || !plain(second) || field_prefix_len(first).is_some() {
            return None;
        }
        Some((first, second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildSearchError;

    #[test]
    fn test_single_query_highlights_everything() {
        let built = QueryBuilder::build("echo hello world", |_| Ok(true)).unwrap();
        assert!(built.job_filter.is_none());
        assert_eq!(built.query, built.highlight);
        assert_eq!(built.highlight_texts(), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn test_two_token_rewrite_when_job_exists() {
        let mut looked_up = None;
        let built = QueryBuilder::build("folder/app failed", |filter| {
            looked_up = Some(filter.clone());
            Ok(true)
        })
        .unwrap();
        let filter = QueryNode::term(Some("j"), "folder/app");
        assert_eq!(looked_up, Some(filter.clone()));
        assert_eq!(built.job_filter, Some(filter.clone()));
        assert_eq!(built.highlight, QueryNode::term(None, "failed"));
        assert_eq!(
            built.query,
            QueryNode::And(vec![filter, QueryNode::term(None, "failed")])
        );
        assert_eq!(built.highlight_texts(), vec!["failed"]);
    }

    #[test]
    fn test_two_token_falls_back_when_no_job() {
        let built = QueryBuilder::build("folder/app failed", |_| Ok(false)).unwrap();
        assert!(built.job_filter.is_none());
        assert_eq!(
            built.query,
            QueryNode::And(vec![
                QueryNode::term(None, "folder/app"),
                QueryNode::term(None, "failed")
            ])
        );
    }

    #[test]
    fn test_job_filter_error_falls_back() {
        let built =
            QueryBuilder::build("app failed", |_| Err(BuildSearchError::EngineClosed)).unwrap();
        assert!(built.job_filter.is_none());
    }

    #[test]
    fn test_qualified_first_token_skips_job_lookup() {
        let built = QueryBuilder::build("c:echo x", |_| panic!("must not look up jobs")).unwrap();
        assert!(built.job_filter.is_none());
        let built = QueryBuilder::build("NOT x", |_| panic!("must not look up jobs")).unwrap();
        assert_eq!(built.query, QueryNode::Not(Box::new(QueryNode::term(None, "x"))));
    }

    #[test]
    fn test_escaped_path_and_field_prefix() {
        let node = QueryBuilder::parse("folder/job c:some/thing").unwrap();
        assert_eq!(
            node,
            QueryNode::And(vec![
                QueryNode::term(None, "folder/job"),
                QueryNode::term(Some("c"), "some/thing"),
            ])
        );
    }

    #[test]
    fn test_validate() {
        assert!(QueryBuilder::validate("echo AND (a OR b)").is_ok());
        assert!(matches!(
            QueryBuilder::validate("echo AND"),
            Err(BuildSearchError::InvalidQuery(_))
        ));
        assert!(QueryBuilder::validate("   ").is_err());
    }
}
