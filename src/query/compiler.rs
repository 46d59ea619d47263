use crate::error::{BuildSearchError, Result};
use crate::index::schema::{self, FieldInfo, FieldKind, SchemaView};
use crate::query::parser::QueryNode;
use std::collections::HashSet;
use tantivy::query::{
    AllQuery, BooleanQuery, EmptyQuery, Occur, PhraseQuery, Query, QueryParser, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Schema as TantivySchema};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, Term};

/// Compiles [`QueryNode`]s into tantivy queries for the embedded engine.
pub struct QueryCompiler<'a> {
    index: &'a Index,
    schema: TantivySchema,
    view: &'a SchemaView,
    parser: QueryParser,
}

impl<'a> QueryCompiler<'a> {
    const MAX_BOOLEAN_CLAUSES: usize = 1000;

    pub fn new(index: &'a Index, view: &'a SchemaView) -> Self {
        let schema = index.schema();
        let parser = QueryParser::for_index(index, vec![]);
        QueryCompiler {
            index,
            schema,
            view,
            parser,
        }
    }

    pub fn compile(&self, node: &QueryNode) -> Result<Box<dyn Query>> {
        let clauses = count_clauses(node);
        if clauses > Self::MAX_BOOLEAN_CLAUSES {
            return Err(BuildSearchError::InvalidQuery(format!(
                "Query has {} clauses, exceeds maximum {}",
                clauses,
                Self::MAX_BOOLEAN_CLAUSES
            )));
        }
        Ok(self
            .compile_node(node)?
            .unwrap_or_else(|| Box::new(EmptyQuery)))
    }

    /// `None` means the clause analyzed to nothing and drops out of its parent.
    fn compile_node(&self, node: &QueryNode) -> Result<Option<Box<dyn Query>>> {
        match node {
            QueryNode::Term { field, text } | QueryNode::Phrase { field, text } => match field {
                None => self.fan_out(text),
                Some(name) => match self.view.lookup(name) {
                    Some(info) => self.compile_field(info, text),
                    None => {
                        tracing::debug!("Unknown field '{}' in query", name);
                        Ok(Some(Box::new(EmptyQuery)))
                    }
                },
            },
            QueryNode::Range {
                field,
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
                raw,
            } => {
                let Some(info) = field.as_deref().and_then(|f| self.view.lookup(f)) else {
                    return Ok(Some(Box::new(EmptyQuery)));
                };
                if info.is_numeric() {
                    self.numeric_range(
                        &info.name,
                        lower.as_deref(),
                        upper.as_deref(),
                        *lower_inclusive,
                        *upper_inclusive,
                    )
                    .map(Some)
                } else {
                    self.literal_term(info, raw).map(Some)
                }
            }
            QueryNode::And(children) => {
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                for child in children {
                    match child {
                        QueryNode::Not(inner) => {
                            if let Some(q) = self.compile_node(inner)? {
                                clauses.push((Occur::MustNot, q));
                            }
                        }
                        other => {
                            if let Some(q) = self.compile_node(other)? {
                                clauses.push((Occur::Must, q));
                            }
                        }
                    }
                }
                Ok(finish_boolean(clauses))
            }
            QueryNode::Or(children) => {
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                for child in children {
                    if let Some(q) = self.compile_node(child)? {
                        clauses.push((Occur::Should, q));
                    }
                }
                Ok(finish_boolean(clauses))
            }
            QueryNode::Not(inner) => {
                let clauses = match self.compile_node(inner)? {
                    Some(q) => vec![(Occur::MustNot, q)],
                    None => Vec::new(),
                };
                Ok(finish_boolean(clauses))
            }
        }
    }

    fn fan_out(&self, text: &str) -> Result<Option<Box<dyn Query>>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for name in self.view.default_searchable() {
            if let Some(info) = self.view.lookup(name) {
                if let Some(q) = self.compile_field(info, text)? {
                    clauses.push((Occur::Should, q));
                }
            }
        }
        Ok(finish_boolean(clauses))
    }

    fn compile_field(&self, info: &FieldInfo, text: &str) -> Result<Option<Box<dyn Query>>> {
        if info.extension {
            return self.extension_query(info, text);
        }
        let field = self.field(&info.name)?;
        match info.kind {
            FieldKind::Long => match text.trim().parse::<i64>() {
                Ok(v) => Ok(Some(Box::new(TermQuery::new(
                    Term::from_field_i64(field, v),
                    IndexRecordOption::Basic,
                )))),
                Err(_) => Ok(Some(Box::new(EmptyQuery))),
            },
            FieldKind::Keyword => Ok(Some(Box::new(TermQuery::new(
                Term::from_field_text(field, text),
                IndexRecordOption::Basic,
            )))),
            FieldKind::Text => {
                let tokens = self.tokenize(field, text)?;
                Ok(text_query(field, tokens))
            }
        }
    }

    /// Extension values live under a JSON path; the tantivy parser handles
    /// path terms and phrase positions for us.
    fn extension_query(&self, info: &FieldInfo, text: &str) -> Result<Option<Box<dyn Query>>> {
        let json_field = if info.persist {
            schema::EXT_STORED
        } else {
            schema::EXT_HIDDEN
        };
        // extension values are indexed with the console analyzer
        let tokens = self.tokenize(self.field(schema::CONSOLE)?, text)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        let query_string = format!("{}.{}:\"{}\"", json_field, info.name, tokens.join(" "));
        self.parser
            .parse_query(&query_string)
            .map(Some)
            .map_err(|e| BuildSearchError::InvalidQuery(e.to_string()))
    }

    fn numeric_range(
        &self,
        name: &str,
        lower: Option<&str>,
        upper: Option<&str>,
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Result<Box<dyn Query>> {
        let bound = |v: Option<&str>| {
            v.and_then(|s| s.trim().parse::<i64>().ok())
                .map(|n| n.to_string())
                .unwrap_or_else(|| "*".to_string())
        };
        let query_string = format!(
            "{}:{}{} TO {}{}",
            name,
            if lower_inclusive { '[' } else { '{' },
            bound(lower),
            bound(upper),
            if upper_inclusive { ']' } else { '}' },
        );
        self.parser
            .parse_query(&query_string)
            .map_err(|e| BuildSearchError::InvalidQuery(e.to_string()))
    }

    fn literal_term(&self, info: &FieldInfo, raw: &str) -> Result<Box<dyn Query>> {
        if info.extension {
            return Ok(Box::new(EmptyQuery));
        }
        let field = self.field(&info.name)?;
        Ok(Box::new(TermQuery::new(
            Term::from_field_text(field, raw),
            IndexRecordOption::Basic,
        )))
    }

    fn field(&self, name: &str) -> Result<Field> {
        self.schema
            .get_field(name)
            .map_err(|_| BuildSearchError::FieldNotFound(name.to_string()))
    }

    pub fn tokenize(&self, field: Field, text: &str) -> Result<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(field)?;
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        Ok(tokens)
    }

    /// Console-analyzed tokens of every positive console or fan-out term.
    pub fn highlight_tokens(&self, texts: &[&str]) -> Result<HashSet<String>> {
        let console = self.field(schema::CONSOLE)?;
        let mut out = HashSet::new();
        for text in texts {
            out.extend(self.tokenize(console, text)?);
        }
        Ok(out)
    }
}

fn text_query(field: Field, tokens: Vec<String>) -> Option<Box<dyn Query>> {
    match tokens.len() {
        0 => None,
        1 => Some(Box::new(TermQuery::new(
            Term::from_field_text(field, &tokens[0]),
            IndexRecordOption::WithFreqs,
        ))),
        _ => {
            let terms = tokens
                .iter()
                .map(|t| Term::from_field_text(field, t))
                .collect();
            Some(Box::new(PhraseQuery::new(terms)))
        }
    }
}

fn finish_boolean(mut clauses: Vec<(Occur, Box<dyn Query>)>) -> Option<Box<dyn Query>> {
    if clauses.is_empty() {
        return None;
    }
    if clauses.iter().all(|(occur, _)| *occur == Occur::MustNot) {
        clauses.push((Occur::Must, Box::new(AllQuery)));
    } else if clauses.len() == 1 {
        return clauses.pop().map(|(_, q)| q);
    }
    Some(Box::new(BooleanQuery::new(clauses)))
}

fn count_clauses(node: &QueryNode) -> usize {
    match node {
        QueryNode::And(children) | QueryNode::Or(children) => {
            children.iter().map(count_clauses).sum::<usize>() + 1
        }
        QueryNode::Not(inner) => count_clauses(inner) + 1,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::extension::ExtensionField;
    use crate::query::builder::QueryBuilder;
    use crate::types::BuildRecord;
    use std::sync::Arc;

    struct Junit;

    impl ExtensionField for Junit {
        fn keyword(&self) -> &str {
            "junit"
        }
        fn text_result(&self, _record: &dyn BuildRecord) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn index() -> Index {
        Index::create_in_ram(schema::build_tantivy_schema())
    }

    #[test]
    fn test_compiles_common_shapes() {
        let index = index();
        let exts: Vec<Arc<dyn ExtensionField>> = vec![Arc::new(Junit)];
        let view = SchemaView::new(&exts);
        let compiler = QueryCompiler::new(&index, &view);
        for q in [
            "echo",
            "c:\"build failed\"",
            "n:[1 TO 5]",
            "starttime:{* TO 100}",
            "j:[a TO b]",
            "junit:testcase",
            "unknown:x",
            "NOT echo",
            "a OR b -c",
        ] {
            let node = QueryBuilder::parse(q).unwrap();
            assert!(compiler.compile(&node).is_ok(), "failed to compile {}", q);
        }
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        let index = index();
        let view = SchemaView::static_only();
        let compiler = QueryCompiler::new(&index, &view);
        let field = index.schema().get_field(schema::CONSOLE).unwrap();
        assert_eq!(
            compiler.tokenize(field, "Folder/Job-Name").unwrap(),
            vec!["folder", "job", "name"]
        );
    }

    #[test]
    fn test_highlight_tokens() {
        let index = index();
        let view = SchemaView::static_only();
        let compiler = QueryCompiler::new(&index, &view);
        let tokens = compiler.highlight_tokens(&["Echo", "hello world"]).unwrap();
        assert!(tokens.contains("echo"));
        assert!(tokens.contains("hello"));
        assert!(tokens.contains("world"));
    }

    #[test]
    fn test_too_many_clauses() {
        let index = index();
        let view = SchemaView::static_only();
        let compiler = QueryCompiler::new(&index, &view);
        let node = QueryNode::Or((0..1001).map(|i| QueryNode::term(None, &i.to_string())).collect());
        assert!(matches!(
            compiler.compile(&node),
            Err(BuildSearchError::InvalidQuery(_))
        ));
    }
}
